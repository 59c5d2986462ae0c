use aes_gcm::{Aes256Gcm, Key, aead::KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{KEY_LEN, SALT_LEN, aead::secure_random};
use crate::error::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self, CryptoError> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        let invalid = |msg: &str| Err(CryptoError::InvalidKdfParams(msg.to_string()));
        if self.mem_cost_kib < 8 {
            return invalid("argon2 memory cost too low");
        }
        if self.time_cost < 1 {
            return invalid("argon2 time cost must be >= 1");
        }
        if self.parallelism < 1 {
            return invalid("argon2 parallelism must be >= 1");
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return invalid("argon2 memory cost must be at least 8 * parallelism");
        }
        Ok(())
    }
}

/// A symmetric key derived from a passphrase.
///
/// Holds only the initialized cipher. The raw key bytes are wiped right after
/// the cipher is built and there is no way to read them back, so the key can
/// encrypt and decrypt but never be exported or serialized.
#[derive(Clone)]
pub struct DerivedKey {
    cipher: Aes256Gcm,
}

impl DerivedKey {
    fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(bytes)),
        }
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }

    #[cfg(test)]
    pub(crate) fn for_tests(seed: u8) -> Self {
        Self::from_bytes(&[seed; KEY_LEN])
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh base64-encoded salt.
pub fn generate_salt() -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    secure_random(&mut salt)?;
    Ok(B64.encode(salt))
}

fn decode_salt(salt: &str) -> Result<[u8; SALT_LEN], CryptoError> {
    let bytes = B64.decode(salt).map_err(|_| CryptoError::Malformed("salt"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSalt {
            expected: SALT_LEN,
            actual: bytes.len(),
        })
}

/// Derive the vault key from a passphrase and a base64 salt with Argon2id.
///
/// The passphrase is used byte for byte; no normalization or case folding.
pub fn derive_key(passphrase: &str, salt: &str, kdf: KdfParams) -> Result<DerivedKey, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let salt = decode_salt(salt)?;
    kdf.validate()?;

    let params = Params::new(
        kdf.mem_cost_kib,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::InvalidKdfParams(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut *key)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(DerivedKey::from_bytes(&key))
}

#[cfg(test)]
pub(crate) fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
