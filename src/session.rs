//! The unlocked key, held only in memory.

use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use crate::crypto::{DerivedKey, derive_key, verify_passphrase};
use crate::error::VaultError;
use crate::record::Account;

/// The unlocked key and the account key revision it belongs to.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub key: Arc<DerivedKey>,
    pub revision: u64,
}

/// Holds the active [`DerivedKey`] between unlock and lock.
///
/// The key is swapped in and out as a whole; readers get an `Arc` to either
/// the previous key or the new one. Dropping the session drops the key.
#[derive(Debug, Default)]
pub struct KeySession {
    active: RwLock<Option<ActiveKey>>,
}

impl KeySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a key from `passphrase` and installs it if it opens the
    /// account verifier. On a wrong passphrase the session is left as it was.
    pub fn unlock(&self, passphrase: &str, account: &Account) -> Result<(), VaultError> {
        let keys = account.keys();
        let key = derive_key(passphrase, &keys.salt, keys.kdf)?;
        if !verify_passphrase(&key, &keys.verifier) {
            debug!("unlock rejected");
            return Err(VaultError::InvalidPassphrase);
        }
        self.install(key, account.revision());
        info!(revision = account.revision(), "vault unlocked");
        Ok(())
    }

    pub fn lock(&self) {
        let previous = self.slot_mut().take();
        if previous.is_some() {
            info!("vault locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.active.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// The active key, or [`VaultError::Locked`].
    pub fn key(&self) -> Result<Arc<DerivedKey>, VaultError> {
        Ok(self.active()?.key)
    }

    /// The active key with its revision, for writes.
    pub fn active(&self) -> Result<ActiveKey, VaultError> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(VaultError::Locked)
    }

    pub(crate) fn install(&self, key: DerivedKey, revision: u64) {
        *self.slot_mut() = Some(ActiveKey {
            key: Arc::new(key),
            revision,
        });
    }

    fn slot_mut(&self) -> RwLockWriteGuard<'_, Option<ActiveKey>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}
