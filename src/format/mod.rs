//! File format handling for the vault file.
//!
//! Provides version-aware parsing and serialization of the document the file
//! backend persists.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::record::{Account, MediaRecord, Post};

pub mod v1;

/// Magic bytes identifying a sealpost vault file ("SLPT").
pub const MAGIC: &[u8; 4] = b"SLPT";
/// Length of magic bytes.
pub const MAGIC_LEN: usize = 4;
/// Length of version field.
pub const VER_LEN: usize = 1;
/// Latest format version
pub const CURRENT_VERSION: u8 = v1::VERSION_V1;

/// Everything the backend stores. Every encrypted field is an opaque
/// `Sealed` pair; only public mirrors hold plaintext.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct VaultDocument {
    pub account: Account,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub media: Vec<MediaRecord>,
    /// Incremented on every saved change.
    #[serde(default)]
    pub generation: u64,
}

impl VaultDocument {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            posts: Vec::new(),
            media: Vec::new(),
            generation: 0,
        }
    }
}

/// Parses a vault file.
///
/// Dispatches to the parser of the version found after the magic bytes.
///
/// # Errors
///
/// Returns an error if the file is too short, the magic bytes are wrong, the
/// version is unsupported or the body is not a valid document.
pub(crate) fn parse(data: &[u8]) -> Result<VaultDocument> {
    if data.len() < MAGIC_LEN + VER_LEN {
        bail!("vault file too short");
    }

    if &data[..MAGIC_LEN] != MAGIC {
        bail!("not a sealpost vault file");
    }

    match data[MAGIC_LEN] {
        v1::VERSION_V1 => v1::parse(data),
        version => bail!("unsupported vault version: {version}"),
    }
}

/// Serializes a document with the current format version.
pub(crate) fn serialize(doc: &VaultDocument) -> Result<Vec<u8>> {
    match CURRENT_VERSION {
        v1::VERSION_V1 => v1::serialize(doc),
        version => bail!("unsupported vault version: {version}"),
    }
}
