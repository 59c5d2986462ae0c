use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{VERIFIER_PLAINTEXT, aead, kdf::DerivedKey};
use crate::error::CryptoError;

/// The known marker sealed under the account key.
///
/// Lets an unlock attempt check a freshly derived key without touching real
/// content. Carries no secret of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verifier {
    pub verifier: String,
    pub verifier_iv: String,
}

pub fn create_verifier(key: &DerivedKey) -> Result<Verifier, CryptoError> {
    let sealed = aead::encrypt(key, VERIFIER_PLAINTEXT)?;
    Ok(Verifier {
        verifier: sealed.ciphertext,
        verifier_iv: sealed.iv,
    })
}

/// Returns `true` only if the verifier opens under `key` and holds the exact
/// marker. A wrong passphrase and a corrupted verifier both yield `false`;
/// the latter is logged.
pub fn verify_passphrase(key: &DerivedKey, verifier: &Verifier) -> bool {
    match aead::decrypt(key, &verifier.verifier, &verifier.verifier_iv) {
        Ok(marker) if marker.as_str() == VERIFIER_PLAINTEXT => true,
        Ok(_) => {
            warn!("verifier opened but does not hold the expected marker; record may be corrupted");
            false
        }
        Err(CryptoError::Decryption) => {
            debug!("verifier did not authenticate under the candidate key");
            false
        }
        Err(e) => {
            warn!(error = %e, "verifier record is malformed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, encrypt, generate_salt, kdf::fast_kdf};

    #[test]
    fn correct_passphrase_verifies() {
        let salt = generate_salt().unwrap();
        let key = derive_key("correct horse battery staple", &salt, fast_kdf()).unwrap();
        let verifier = create_verifier(&key).unwrap();

        let again = derive_key("correct horse battery staple", &salt, fast_kdf()).unwrap();
        assert!(verify_passphrase(&again, &verifier));
    }

    #[test]
    fn wrong_passphrase_does_not_verify() {
        let salt = generate_salt().unwrap();
        let key = derive_key("correct horse battery staple", &salt, fast_kdf()).unwrap();
        let verifier = create_verifier(&key).unwrap();

        let wrong = derive_key("tr0ub4dor&3", &salt, fast_kdf()).unwrap();
        assert!(!verify_passphrase(&wrong, &verifier));
    }

    #[test]
    fn passphrase_is_case_sensitive() {
        let salt = generate_salt().unwrap();
        let key = derive_key("correct horse battery staple", &salt, fast_kdf()).unwrap();
        let verifier = create_verifier(&key).unwrap();

        let cased = derive_key("Correct horse battery staple", &salt, fast_kdf()).unwrap();
        assert!(!verify_passphrase(&cased, &verifier));
    }

    #[test]
    fn corrupted_verifier_is_false_not_error() {
        let key = DerivedKey::for_tests(4);
        let mut verifier = create_verifier(&key).unwrap();
        verifier.verifier_iv = "not-base64!".to_string();
        assert!(!verify_passphrase(&key, &verifier));

        let mut verifier = create_verifier(&key).unwrap();
        verifier.verifier.clear();
        assert!(!verify_passphrase(&key, &verifier));
    }

    #[test]
    fn unexpected_marker_is_rejected() {
        let key = DerivedKey::for_tests(4);
        let sealed = encrypt(&key, "some other text").unwrap();
        let verifier = Verifier {
            verifier: sealed.ciphertext,
            verifier_iv: sealed.iv,
        };
        assert!(!verify_passphrase(&key, &verifier));
    }

    #[test]
    fn verifiers_use_fresh_ivs() {
        let key = DerivedKey::for_tests(4);
        let a = create_verifier(&key).unwrap();
        let b = create_verifier(&key).unwrap();
        assert_ne!(a.verifier_iv, b.verifier_iv);
    }
}
