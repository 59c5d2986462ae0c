//! Vault file format v1.
//!
//! ```text
//! MAGIC (4) | VERSION (1) | JSON DOCUMENT
//! ```

use anyhow::{Context, Result};

use super::{MAGIC, MAGIC_LEN, VER_LEN, VaultDocument};

pub const VERSION_V1: u8 = 1;

const HEADER_LEN: usize = MAGIC_LEN + VER_LEN;

/// Parses a v1 vault file. The caller has already checked magic and version.
pub fn parse(data: &[u8]) -> Result<VaultDocument> {
    serde_json::from_slice(&data[HEADER_LEN..]).context("vault document is corrupted")
}

pub fn serialize(doc: &VaultDocument) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(doc).context("failed to encode vault document")?;

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);
    buf.extend_from_slice(&body);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfParams, Verifier};
    use crate::format;
    use crate::record::{Account, AccountKeys};

    fn document() -> VaultDocument {
        VaultDocument::new(Account::new(AccountKeys {
            salt: "c2FsdHNhbHRzYWx0c2FsdA==".to_string(),
            kdf: KdfParams::new(65536, 3, 2).unwrap(),
            verifier: Verifier {
                verifier: "dmVyaWZpZXI=".to_string(),
                verifier_iv: "aXY=".to_string(),
            },
        }))
    }

    #[test]
    fn document_roundtrip_keeps_account_keys() {
        let doc = document();

        let bytes = format::serialize(&doc).unwrap();
        assert_eq!(&bytes[..4], b"SLPT");
        assert_eq!(bytes[4], VERSION_V1);

        let parsed = format::parse(&bytes).unwrap();
        assert_eq!(parsed.account.id(), doc.account.id());
        assert_eq!(parsed.account.keys(), doc.account.keys());
        assert_eq!(parsed.account.keys().kdf.parallelism(), 2);
        assert!(parsed.posts.is_empty());
    }

    #[test]
    fn invalid_magic_fails() {
        let mut data = format::serialize(&document()).unwrap();
        data[..4].copy_from_slice(b"FAIL");

        assert!(format::parse(&data).is_err());
    }

    #[test]
    fn unsupported_version_fails() {
        let mut data = format::serialize(&document()).unwrap();
        data[4] = 99;

        let err = format::parse(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported vault version"));
    }

    #[test]
    fn too_short_fails() {
        assert!(format::parse(b"SLP").is_err());
    }

    #[test]
    fn truncated_body_fails() {
        let data = format::serialize(&document()).unwrap();
        assert!(format::parse(&data[..data.len() / 2]).is_err());
    }
}
