//! The persistence collaborator.
//!
//! A [`Backend`] stores the account's salt, KDF parameters and verifier and
//! every encrypted record, verbatim. It never sees a passphrase, a key or
//! (outside public mirrors) any plaintext.
//!
//! Several clients may share one account. Every write of ciphertext names
//! the key revision it was sealed under and is refused once the account has
//! moved on, and a rotation commit is refused if anything was written after
//! its corpus was fetched.

use anyhow::{Context, Result, bail, ensure};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::crypto::Sealed;
use crate::error::Conflict;
use crate::format::{self, VaultDocument};
use crate::record::{Account, AccountKeys, MediaRecord, Post};
use crate::storage::Storage;

/// Every encrypted record of the account, unpaginated.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub posts: Vec<Post>,
    pub media: Vec<MediaRecord>,
    /// Write counter of the vault when the corpus was read.
    pub generation: u64,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.posts.len() + self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PostCipher {
    pub id: String,
    pub content: Sealed,
    pub title: Option<Sealed>,
}

#[derive(Debug, Clone)]
pub struct MediaCipher {
    pub id: String,
    pub filename: Sealed,
}

/// The new key material and the full re-encrypted corpus, applied as one
/// unit by [`Backend::commit_rotation`].
#[derive(Debug, Clone)]
pub struct RotationCommit {
    /// [`Corpus::generation`] the re-encrypted records were read at.
    pub base_generation: u64,
    pub keys: AccountKeys,
    pub posts: Vec<PostCipher>,
    pub media: Vec<MediaCipher>,
}

pub trait Backend: Send + Sync {
    /// Creates the account. Fails if one already exists.
    fn create_account(&self, keys: AccountKeys) -> Result<Account>;

    fn account(&self) -> Result<Account>;

    /// Stores a post sealed under key `revision`. Fails with
    /// [`Conflict::StaleKey`] if the account has moved to another key.
    fn insert_post(&self, revision: u64, post: Post) -> Result<()>;

    /// Replaces a stored post with the same id; same revision check as
    /// [`Backend::insert_post`].
    fn update_post(&self, revision: u64, post: Post) -> Result<()>;

    fn delete_post(&self, id: &str) -> Result<()>;

    fn post(&self, id: &str) -> Result<Option<Post>>;

    /// Newest first, optionally only posts carrying `tag`.
    fn posts(&self, offset: usize, limit: usize, tag: Option<&str>) -> Result<Vec<Post>>;

    /// Every post and media record, without pagination.
    fn corpus(&self) -> Result<Corpus>;

    fn insert_media(&self, revision: u64, media: MediaRecord) -> Result<()>;

    fn media(&self) -> Result<Vec<MediaRecord>>;

    /// Replaces the account keys and every record ciphertext, or nothing,
    /// and returns the new key revision.
    ///
    /// Implementations must reject a commit that does not cover exactly the
    /// records currently stored, or whose corpus was read before a later
    /// write ([`Conflict::CorpusChanged`]): a record left out would stay
    /// sealed under a key nobody can derive anymore.
    fn commit_rotation(&self, commit: RotationCommit) -> Result<u64>;
}

/// A [`Backend`] persisting one document in a single vault file.
///
/// Each mutation takes the vault's file lock, loads the document, applies
/// the change in memory and replaces the file atomically, so concurrent
/// processes never lose each other's writes and readers only ever observe
/// whole documents.
#[derive(Debug)]
pub struct FileBackend {
    storage: Storage,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn load(&self) -> Result<VaultDocument> {
        if !self.storage.exists() {
            bail!("sealpost vault does not exist");
        }
        format::parse(&self.storage.load()?)
    }

    fn save(&self, doc: &VaultDocument) -> Result<()> {
        self.storage.save(&format::serialize(doc)?)
    }

    fn read<T>(&self, f: impl FnOnce(&VaultDocument) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        f(&self.load()?)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut VaultDocument) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.storage.exists() {
            bail!("sealpost vault does not exist");
        }
        let _file_lock = self.storage.lock()?;
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        doc.generation += 1;
        self.save(&doc)?;
        Ok(out)
    }

    /// [`FileBackend::modify`] for writes sealed under key `revision`.
    fn modify_sealed<T>(
        &self,
        revision: u64,
        f: impl FnOnce(&mut VaultDocument) -> Result<T>,
    ) -> Result<T> {
        self.modify(|doc| {
            let found = doc.account.revision();
            if found != revision {
                bail!(Conflict::StaleKey {
                    expected: revision,
                    found,
                });
            }
            f(doc)
        })
    }
}

impl Backend for FileBackend {
    fn create_account(&self, keys: AccountKeys) -> Result<Account> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.storage.lock()?;
        if self.storage.exists() {
            bail!("sealpost vault already exists");
        }
        let account = Account::new(keys);
        self.save(&VaultDocument::new(account.clone()))?;
        info!(path = %self.storage.path().display(), "vault created");
        Ok(account)
    }

    fn account(&self) -> Result<Account> {
        self.read(|doc| Ok(doc.account.clone()))
    }

    fn insert_post(&self, revision: u64, post: Post) -> Result<()> {
        self.modify_sealed(revision, |doc| {
            ensure!(
                doc.posts.iter().all(|p| p.id != post.id),
                "post '{}' already exists",
                post.id
            );
            doc.posts.push(post);
            Ok(())
        })
    }

    fn update_post(&self, revision: u64, post: Post) -> Result<()> {
        self.modify_sealed(revision, |doc| {
            let slot = doc
                .posts
                .iter_mut()
                .find(|p| p.id == post.id)
                .with_context(|| format!("post '{}' not found", post.id))?;
            *slot = post;
            Ok(())
        })
    }

    fn delete_post(&self, id: &str) -> Result<()> {
        self.modify(|doc| {
            let before = doc.posts.len();
            doc.posts.retain(|p| p.id != id);
            ensure!(doc.posts.len() < before, "post '{id}' not found");
            for media in doc.media.iter_mut().filter(|m| m.post_id.as_deref() == Some(id)) {
                media.post_id = None;
            }
            Ok(())
        })
    }

    fn post(&self, id: &str) -> Result<Option<Post>> {
        self.read(|doc| Ok(doc.posts.iter().find(|p| p.id == id).cloned()))
    }

    fn posts(&self, offset: usize, limit: usize, tag: Option<&str>) -> Result<Vec<Post>> {
        self.read(|doc| {
            let mut posts: Vec<&Post> = doc
                .posts
                .iter()
                .filter(|p| tag.is_none_or(|tag| p.has_tag(tag)))
                .collect();
            posts.sort_by(|a, b| b.created.cmp(&a.created));
            Ok(posts.into_iter().skip(offset).take(limit).cloned().collect())
        })
    }

    fn corpus(&self) -> Result<Corpus> {
        self.read(|doc| {
            Ok(Corpus {
                posts: doc.posts.clone(),
                media: doc.media.clone(),
                generation: doc.generation,
            })
        })
    }

    fn insert_media(&self, revision: u64, media: MediaRecord) -> Result<()> {
        self.modify_sealed(revision, |doc| {
            if let Some(post_id) = media.post_id.as_deref() {
                ensure!(
                    doc.posts.iter().any(|p| p.id == post_id),
                    "post '{post_id}' not found"
                );
            }
            doc.media.push(media);
            Ok(())
        })
    }

    fn media(&self) -> Result<Vec<MediaRecord>> {
        self.read(|doc| Ok(doc.media.clone()))
    }

    fn commit_rotation(&self, commit: RotationCommit) -> Result<u64> {
        self.modify(|doc| {
            if doc.generation != commit.base_generation {
                bail!(Conflict::CorpusChanged);
            }

            let mut posts: HashMap<&str, &PostCipher> = HashMap::new();
            for p in &commit.posts {
                ensure!(
                    posts.insert(p.id.as_str(), p).is_none(),
                    "post '{}' appears twice in rotation",
                    p.id
                );
            }
            let mut media: HashMap<&str, &MediaCipher> = HashMap::new();
            for m in &commit.media {
                ensure!(
                    media.insert(m.id.as_str(), m).is_none(),
                    "media '{}' appears twice in rotation",
                    m.id
                );
            }

            let stored_posts: HashSet<&str> = doc.posts.iter().map(|p| p.id.as_str()).collect();
            let stored_media: HashSet<&str> = doc.media.iter().map(|m| m.id.as_str()).collect();
            let committed_posts: HashSet<&str> = posts.keys().copied().collect();
            let committed_media: HashSet<&str> = media.keys().copied().collect();
            ensure!(
                stored_posts == committed_posts,
                "rotation does not cover exactly the stored posts"
            );
            ensure!(
                stored_media == committed_media,
                "rotation does not cover exactly the stored media"
            );

            // The document is only written back if this closure returns Ok.
            for post in &mut doc.posts {
                let new = posts[post.id.as_str()];
                post.content = new.content.clone();
                post.title = new.title.clone();
                post.touch();
            }
            for record in &mut doc.media {
                record.filename = media[record.id.as_str()].filename.clone();
            }
            doc.account.replace_keys(commit.keys.clone());
            debug!(
                posts = doc.posts.len(),
                media = doc.media.len(),
                revision = doc.account.revision(),
                "rotation applied to vault document"
            );
            Ok(doc.account.revision())
        })
    }
}
