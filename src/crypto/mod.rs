//! Cryptographic primitives for the vault.
//!
//! Provides passphrase key derivation, per-field authenticated encryption
//! and the passphrase verifier.
//!
//! The constants below are shared by setup, unlock and rotation. Changing
//! any of them makes every existing ciphertext undecryptable, so they only
//! move together with a full re-encryption.

pub mod aead;
pub mod kdf;
pub mod verifier;

pub use aead::{Sealed, decrypt, encrypt};
pub use kdf::{DerivedKey, KdfParams, derive_key, generate_salt};
pub use verifier::{Verifier, create_verifier, verify_passphrase};

/// Authenticated cipher used for every encrypted field.
pub const CIPHER: &str = "AES-256-GCM";
/// Passphrase key derivation function (version 0x13).
pub const KDF: &str = "Argon2id";
/// Length of the salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of the AES-GCM nonce (12 bytes).
pub const IV_LEN: usize = 12;
/// Length of the GCM authentication tag appended to each ciphertext.
pub const TAG_LEN: usize = 16;
/// Length of the encryption key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
/// Known marker sealed into the verifier. Not secret.
pub const VERIFIER_PLAINTEXT: &str = "sealpost:passphrase-verifier:v1";
