//! Error types for the vault.
//!
//! Messages shown to users stay generic ("Invalid passphrase",
//! "Decryption failed", "Failed to change passphrase"); the detailed cause
//! travels as the error source and in the logs.

use thiserror::Error;

/// Failures of the cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("invalid salt: expected {expected} bytes, got {actual}")]
    InvalidSalt { expected: usize, actual: usize },

    #[error("invalid key derivation parameters: {0}")]
    InvalidKdfParams(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("OS random generator unavailable")]
    RandomUnavailable,

    #[error("encryption failed")]
    Encryption,

    /// Authentication tag mismatch: wrong key or tampered ciphertext.
    #[error("Decryption failed")]
    Decryption,

    /// Bad base64, wrong IV length or non UTF-8 plaintext.
    #[error("Decryption failed: malformed {0}")]
    Malformed(&'static str),
}

/// Writes the backend refuses because they raced another client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Conflict {
    /// The write was sealed under a key the account no longer uses.
    #[error("vault key changed since unlock (expected revision {expected}, found {found})")]
    StaleKey { expected: u64, found: u64 },

    /// The vault was written to after the rotation fetched its corpus.
    #[error("vault changed while the passphrase was being rotated")]
    CorpusChanged,
}

/// Why a rotation stopped before anything was submitted.
#[derive(Debug, Error)]
pub enum RotationAbort {
    #[error("could not fetch the encrypted corpus: {0}")]
    Fetch(String),

    #[error("{kind} '{id}' could not be decrypted with the current key")]
    Undecryptable { kind: &'static str, id: String },

    #[error("could not derive the new key")]
    Derivation(#[source] CryptoError),

    #[error("could not re-encrypt the corpus")]
    Reencrypt(#[source] CryptoError),
}

/// Errors returned by [`crate::Vault`] operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("vault is locked")]
    Locked,

    #[error("the passphrase was changed by another client; unlock again")]
    StaleKey,

    #[error("passphrase rotation in progress; encrypted content is read-only")]
    RotationInProgress,

    #[error("post '{0}' not found")]
    PostNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to change passphrase; nothing changed")]
    RotationAborted(#[source] RotationAbort),

    #[error("Failed to change passphrase; nothing changed, please retry ({0})")]
    RotationSubmissionFailed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for VaultError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(Conflict::StaleKey { .. }) = err.downcast_ref::<Conflict>() {
            return VaultError::StaleKey;
        }
        VaultError::Backend(format!("{err:#}"))
    }
}

impl From<RotationAbort> for VaultError {
    fn from(err: RotationAbort) -> Self {
        VaultError::RotationAborted(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_key_conflict_maps_to_its_own_variant() {
        let err = anyhow::Error::new(Conflict::StaleKey {
            expected: 0,
            found: 1,
        })
        .context("failed to insert post");

        assert!(matches!(VaultError::from(err), VaultError::StaleKey));
    }

    #[test]
    fn other_backend_errors_keep_their_message() {
        let err = anyhow::anyhow!("disk full");
        match VaultError::from(err) {
            VaultError::Backend(msg) => assert_eq!(msg, "disk full"),
            other => panic!("expected Backend, got: {other:?}"),
        }
    }
}
