//! Client-side encrypted micro-blogging vault.
//!
//! Post content, titles and media filenames are sealed with a key derived
//! from the user's passphrase before they reach a [`Backend`]. The backend
//! only ever stores ciphertext, the salt and a verifier; public posts
//! additionally carry a plaintext mirror.

pub mod backend;
pub mod crypto;
mod error;
mod format;
pub mod record;
pub mod rotation;
pub mod session;
mod storage;

pub use crate::backend::{Backend, FileBackend};
pub use crate::crypto::KdfParams;
pub use crate::error::{Conflict, CryptoError, RotationAbort, VaultError};
pub use crate::record::{
    ContentType, DecryptedPost, MediaEntry, PostDraft, PostEdit, PublicPost, TagCount,
};
pub use crate::rotation::RotationReport;
pub use crate::storage::Storage;

use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

use crate::crypto::{DerivedKey, Sealed, create_verifier, derive_key, encrypt, generate_salt};
use crate::record::{
    AccountKeys, MediaRecord, PlainMirror, Post, new_id, normalize_tag, normalize_tags, text_stats,
};
use crate::rotation::RotationGate;
use crate::session::KeySession;

/// Shortest passphrase accepted at setup and rotation.
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// One feed item. Records that fail to decrypt are flagged, not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Readable(DecryptedPost),
    Unreadable { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaListing {
    Readable(MediaEntry),
    Unreadable { id: String },
}

/// Decrypted dump of the whole vault.
#[derive(Serialize, Debug)]
pub struct Export {
    pub exported_at: DateTime<Utc>,
    pub posts: Vec<DecryptedPost>,
    pub media: Vec<MediaEntry>,
}

#[derive(Debug, Clone)]
pub struct VaultInfo {
    pub account_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub kdf: KdfParams,
    pub posts: usize,
    pub public_posts: usize,
    pub media: usize,
}

impl fmt::Display for VaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "account:      {}", self.account_id)?;
        writeln!(f, "created:      {}", self.created.to_rfc3339())?;
        writeln!(f, "keys updated: {}", self.updated.to_rfc3339())?;
        writeln!(f, "cipher:       {}", crypto::CIPHER)?;
        writeln!(
            f,
            "kdf:          {} (memory {} KiB, time {}, parallelism {})",
            crypto::KDF,
            self.kdf.mem_cost_kib(),
            self.kdf.time_cost(),
            self.kdf.parallelism()
        )?;
        writeln!(f, "posts:        {} ({} public)", self.posts, self.public_posts)?;
        write!(f, "media:        {}", self.media)
    }
}

/// An account's encrypted corpus, seen from the client.
///
/// Owns the [`KeySession`] holding the unlocked key and the
/// [`RotationGate`] that keeps content writes out of a running rotation.
/// Other clients sharing the backend are kept apart by the backend itself:
/// a write sealed under a key that another client has since rotated away
/// fails with [`VaultError::StaleKey`] and locks this vault.
pub struct Vault<B: Backend> {
    backend: B,
    session: KeySession,
    gate: RotationGate,
}

impl<B: Backend> Vault<B> {
    /// Wraps an existing account. The vault starts locked.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            session: KeySession::new(),
            gate: RotationGate::new(),
        }
    }

    /// Creates the account: fresh salt, derived key, verifier. The returned
    /// vault is unlocked.
    pub fn setup(backend: B, passphrase: &str, kdf: KdfParams) -> Result<Self, VaultError> {
        check_new_passphrase(passphrase)?;

        let salt = generate_salt()?;
        let key = derive_key(passphrase, &salt, kdf)?;
        let verifier = create_verifier(&key)?;

        let account = backend.create_account(AccountKeys {
            salt,
            kdf,
            verifier,
        })?;
        info!(account = account.id(), "account set up");

        let vault = Self::new(backend);
        vault.session.install(key, account.revision());
        Ok(vault)
    }

    pub fn unlock(&self, passphrase: &str) -> Result<(), VaultError> {
        let account = self.backend.account()?;
        self.session.unlock(passphrase, &account)
    }

    pub fn lock(&self) {
        self.session.lock();
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn create_post(&self, draft: PostDraft) -> Result<String, VaultError> {
        let _write = self.gate.write_access()?;
        let active = self.session.active()?;
        let key = &active.key;

        let title = draft.title.filter(|t| !t.is_empty());
        let (char_count, word_count) = text_stats(&draft.content);
        let now = Utc::now();
        let post = Post {
            id: new_id(),
            content: encrypt(key, &draft.content)?,
            title: seal_title(key, title.as_deref())?,
            content_type: draft.content_type,
            mirror: draft.public.then(|| PlainMirror {
                content: draft.content.clone(),
                title: title.clone(),
            }),
            char_count,
            word_count,
            tags: normalize_tags(&draft.tags),
            created: now,
            updated: now,
        };
        let id = post.id.clone();
        self.backend
            .insert_post(active.revision, post)
            .map_err(|e| self.write_failed(e))?;
        Ok(id)
    }

    /// Applies `edit`, re-encrypting changed fields with fresh IVs. The
    /// mirror of a public post follows the new content and title.
    pub fn edit_post(&self, id: &str, edit: PostEdit) -> Result<(), VaultError> {
        let _write = self.gate.write_access()?;
        let active = self.session.active()?;
        let key = &active.key;
        let mut post = self.find_post(id)?;
        let title = edit.title.map(|t| t.filter(|t| !t.is_empty()));

        if let Some(content) = &edit.content {
            let (char_count, word_count) = text_stats(content);
            post.content = encrypt(key, content)?;
            post.char_count = char_count;
            post.word_count = word_count;
        }
        if let Some(title) = &title {
            post.title = seal_title(key, title.as_deref())?;
        }
        if let Some(content_type) = edit.content_type {
            post.content_type = content_type;
        }
        if let Some(tags) = edit.tags {
            post.tags = normalize_tags(&tags);
        }
        if let Some(mirror) = post.mirror.as_mut() {
            if let Some(content) = edit.content {
                mirror.content = content;
            }
            if let Some(title) = title {
                mirror.title = title;
            }
        }

        post.touch();
        self.backend
            .update_post(active.revision, post)
            .map_err(|e| self.write_failed(e))?;
        Ok(())
    }

    /// Publishing writes a plaintext mirror of the current content and
    /// title; unpublishing removes it.
    pub fn set_public(&self, id: &str, public: bool) -> Result<(), VaultError> {
        let _write = self.gate.write_access()?;
        let active = self.session.active()?;
        let mut post = self.find_post(id)?;

        post.mirror = if public {
            let content = post.content.open(&active.key)?;
            let title = post.title.as_ref().map(|t| t.open(&active.key)).transpose()?;
            Some(PlainMirror {
                content: content.to_string(),
                title: title.map(|t| t.to_string()),
            })
        } else {
            None
        };

        post.touch();
        self.backend
            .update_post(active.revision, post)
            .map_err(|e| self.write_failed(e))?;
        Ok(())
    }

    pub fn delete_post(&self, id: &str) -> Result<(), VaultError> {
        let _write = self.gate.write_access()?;
        self.find_post(id)?;
        self.backend.delete_post(id)?;
        Ok(())
    }

    pub fn read_post(&self, id: &str) -> Result<DecryptedPost, VaultError> {
        let key = self.session.key()?;
        let post = self.find_post(id)?;
        Ok(open_post(&key, &post)?)
    }

    /// A page of the feed, newest first, optionally only posts tagged `tag`.
    pub fn feed(
        &self,
        offset: usize,
        limit: usize,
        tag: Option<&str>,
    ) -> Result<Vec<FeedEntry>, VaultError> {
        let key = self.session.key()?;
        let tag = tag.map(normalize_tag);
        let posts = self.backend.posts(offset, limit, tag.as_deref())?;

        Ok(posts
            .iter()
            .map(|post| match open_post(&key, post) {
                Ok(post) => FeedEntry::Readable(post),
                Err(e) => {
                    warn!(id = post.id(), error = %e, "post failed to decrypt");
                    FeedEntry::Unreadable {
                        id: post.id.clone(),
                    }
                }
            })
            .collect())
    }

    /// Every tag in use with its post count, by name. Tags are plaintext
    /// labels, so no key is needed.
    pub fn tags(&self) -> Result<Vec<TagCount>, VaultError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for post in self.backend.corpus()?.posts {
            for tag in post.tags {
                *counts.entry(tag).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(name, posts)| TagCount { name, posts })
            .collect())
    }

    /// Case-insensitive search over decrypted content and titles of every
    /// post. Posts that fail to decrypt are skipped.
    pub fn search(&self, query: &str) -> Result<Vec<DecryptedPost>, VaultError> {
        let key = self.session.key()?;
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut posts = self.backend.corpus()?.posts;
        posts.sort_by(|a, b| b.created.cmp(&a.created));

        let mut hits = Vec::new();
        for post in &posts {
            let post = match open_post(&key, post) {
                Ok(post) => post,
                Err(e) => {
                    warn!(id = post.id(), error = %e, "skipping post that failed to decrypt");
                    continue;
                }
            };
            let in_title = post
                .title
                .as_ref()
                .is_some_and(|t| t.to_lowercase().contains(&needle));
            if in_title || post.content.to_lowercase().contains(&needle) {
                hits.push(post);
            }
        }
        Ok(hits)
    }

    /// Records a media attachment with an encrypted filename.
    pub fn attach_media(
        &self,
        post_id: Option<&str>,
        filename: &str,
        mime_type: &str,
        size: u64,
    ) -> Result<String, VaultError> {
        let _write = self.gate.write_access()?;
        let active = self.session.active()?;
        if filename.is_empty() {
            return Err(VaultError::InvalidInput("filename must not be empty".into()));
        }
        if let Some(post_id) = post_id {
            self.find_post(post_id)?;
        }

        let record = MediaRecord {
            id: new_id(),
            post_id: post_id.map(str::to_string),
            filename: encrypt(&active.key, filename)?,
            mime_type: mime_type.to_string(),
            size,
            created: Utc::now(),
        };
        let id = record.id.clone();
        self.backend
            .insert_media(active.revision, record)
            .map_err(|e| self.write_failed(e))?;
        Ok(id)
    }

    pub fn media(&self) -> Result<Vec<MediaListing>, VaultError> {
        let key = self.session.key()?;
        Ok(self
            .backend
            .media()?
            .iter()
            .map(|record| match open_media(&key, record) {
                Ok(entry) => MediaListing::Readable(entry),
                Err(e) => {
                    warn!(id = record.id(), error = %e, "media filename failed to decrypt");
                    MediaListing::Unreadable {
                        id: record.id.clone(),
                    }
                }
            })
            .collect())
    }

    /// Public posts rendered from their mirrors. Needs no key.
    pub fn public_posts(&self) -> Result<Vec<PublicPost>, VaultError> {
        let mut posts: Vec<PublicPost> = self
            .backend
            .corpus()?
            .posts
            .iter()
            .filter_map(PublicPost::from_post)
            .collect();
        posts.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(posts)
    }

    /// Decrypts everything. Fails if any record cannot be decrypted.
    pub fn export(&self) -> Result<Export, VaultError> {
        let key = self.session.key()?;
        let corpus = self.backend.corpus()?;

        let posts = corpus
            .posts
            .iter()
            .map(|post| open_post(&key, post))
            .collect::<Result<Vec<_>, _>>()?;
        let media = corpus
            .media
            .iter()
            .map(|record| open_media(&key, record))
            .collect::<Result<Vec<_>, _>>()?;

        info!(posts = posts.len(), media = media.len(), "vault exported");
        Ok(Export {
            exported_at: Utc::now(),
            posts,
            media,
        })
    }

    /// Rotates to `new_passphrase`, keeping the current KDF parameters.
    pub fn change_passphrase(&self, new_passphrase: &str) -> Result<RotationReport, VaultError> {
        let kdf = self.backend.account()?.keys().kdf;
        self.change_passphrase_with_kdf(new_passphrase, kdf)
    }

    pub fn change_passphrase_with_kdf(
        &self,
        new_passphrase: &str,
        kdf: KdfParams,
    ) -> Result<RotationReport, VaultError> {
        check_new_passphrase(new_passphrase)?;
        rotation::rotate(&self.session, &self.gate, &self.backend, new_passphrase, kdf)
    }

    pub fn info(&self) -> Result<VaultInfo, VaultError> {
        let account = self.backend.account()?;
        let corpus = self.backend.corpus()?;
        Ok(VaultInfo {
            account_id: account.id().to_string(),
            created: account.created(),
            updated: account.updated(),
            kdf: account.keys().kdf,
            posts: corpus.posts.len(),
            public_posts: corpus.posts.iter().filter(|p| p.is_public()).count(),
            media: corpus.media.len(),
        })
    }

    /// A stale key locks the session so the next attempt starts from an
    /// unlock with the current passphrase.
    fn write_failed(&self, err: anyhow::Error) -> VaultError {
        let err = VaultError::from(err);
        if matches!(err, VaultError::StaleKey) {
            warn!("vault key was rotated by another client; locking");
            self.session.lock();
        }
        err
    }

    fn find_post(&self, id: &str) -> Result<Post, VaultError> {
        self.backend
            .post(id)?
            .ok_or_else(|| VaultError::PostNotFound(id.to_string()))
    }
}

fn check_new_passphrase(passphrase: &str) -> Result<(), VaultError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(VaultError::InvalidInput(format!(
            "passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
        )));
    }
    Ok(())
}

fn seal_title(key: &DerivedKey, title: Option<&str>) -> Result<Option<Sealed>, CryptoError> {
    title.map(|t| encrypt(key, t)).transpose()
}

fn open_post(key: &DerivedKey, post: &Post) -> Result<DecryptedPost, CryptoError> {
    let content = post.content.open(key)?;
    let title = post.title.as_ref().map(|t| t.open(key)).transpose()?;
    Ok(DecryptedPost {
        id: post.id.clone(),
        content: content.to_string(),
        title: title.map(|t| t.to_string()),
        content_type: post.content_type,
        is_public: post.is_public(),
        char_count: post.char_count,
        word_count: post.word_count,
        tags: post.tags.clone(),
        created: post.created,
        updated: post.updated,
    })
}

fn open_media(key: &DerivedKey, record: &MediaRecord) -> Result<MediaEntry, CryptoError> {
    Ok(MediaEntry {
        id: record.id.clone(),
        post_id: record.post_id.clone(),
        filename: record.filename.open(key)?.to_string(),
        mime_type: record.mime_type.clone(),
        size: record.size,
        created: record.created,
    })
}

/// `<platform data dir>/sealpost.vault`
pub fn default_storage() -> anyhow::Result<Storage> {
    let project_dirs =
        ProjectDirs::from("", "", "sealpost").context("could not determine platform directories")?;

    Ok(Storage::new(project_dirs.data_dir().join("sealpost.vault")))
}
