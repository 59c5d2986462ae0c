use aes_gcm::{Nonce, aead::Aead};
use base64::{Engine, engine::general_purpose::STANDARD as B64};
use getrandom::fill;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::{IV_LEN, kdf::DerivedKey};
use crate::error::CryptoError;

/// One encrypted field as persisted: base64 ciphertext (tag included) and
/// the base64 IV it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

impl Sealed {
    pub fn open(&self, key: &DerivedKey) -> Result<Zeroizing<String>, CryptoError> {
        decrypt(key, &self.ciphertext, &self.iv)
    }
}

/// Fill buffer with cryptographically secure random bytes
pub(crate) fn secure_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    fill(buf).map_err(|_| CryptoError::RandomUnavailable)
}

/// Encrypt plaintext under a fresh random IV.
pub fn encrypt(key: &DerivedKey, plaintext: &str) -> Result<Sealed, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    secure_random(&mut iv)?;

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    Ok(Sealed {
        ciphertext: B64.encode(ciphertext),
        iv: B64.encode(iv),
    })
}

/// Decrypt and authenticate a base64 ciphertext/IV pair.
pub fn decrypt(key: &DerivedKey, ciphertext: &str, iv: &str) -> Result<Zeroizing<String>, CryptoError> {
    let iv = B64.decode(iv).map_err(|_| CryptoError::Malformed("iv"))?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::Malformed("iv"));
    }
    let ciphertext = B64
        .decode(ciphertext)
        .map_err(|_| CryptoError::Malformed("ciphertext"))?;

    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption)?;

    String::from_utf8(plaintext).map(Zeroizing::new).map_err(|e| {
        e.into_bytes().zeroize();
        CryptoError::Malformed("plaintext")
    })
}
