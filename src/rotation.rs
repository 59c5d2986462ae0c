//! Passphrase rotation: re-encrypt the whole corpus under a new key and
//! swap it in with one atomic backend commit.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::backend::{Backend, Corpus, MediaCipher, PostCipher, RotationCommit};
use crate::crypto::{DerivedKey, KdfParams, create_verifier, derive_key, encrypt, generate_salt};
use crate::error::{CryptoError, RotationAbort, VaultError};
use crate::record::AccountKeys;
use crate::session::KeySession;

/// Serializes writes to the encrypted corpus against a running rotation.
///
/// Content writes share the gate and fail fast while a rotation holds it
/// exclusively, so no record can be written under the old key after the
/// corpus was fetched.
#[derive(Debug, Default)]
pub struct RotationGate {
    lock: RwLock<()>,
}

impl RotationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard for a single create/edit/publish/media write.
    pub fn write_access(&self) -> Result<RwLockReadGuard<'_, ()>, VaultError> {
        match self.lock.try_read() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(VaultError::RotationInProgress),
        }
    }

    /// Exclusive guard for a rotation. Waits for in-flight writes to finish.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationReport {
    pub posts: usize,
    pub media: usize,
}

struct PlainPost {
    id: String,
    content: Zeroizing<String>,
    title: Option<Zeroizing<String>>,
}

struct PlainMedia {
    id: String,
    filename: Zeroizing<String>,
}

/// Decrypts every record under `key`. The first failure aborts.
fn decrypt_corpus(
    key: &DerivedKey,
    corpus: &Corpus,
) -> Result<(Vec<PlainPost>, Vec<PlainMedia>), RotationAbort> {
    let undecryptable = |kind: &'static str, id: &str| {
        warn!(kind, id, "record failed to decrypt; rotation aborted");
        RotationAbort::Undecryptable {
            kind,
            id: id.to_string(),
        }
    };

    let mut posts = Vec::with_capacity(corpus.posts.len());
    for post in &corpus.posts {
        let content = post
            .content()
            .open(key)
            .map_err(|_| undecryptable("post", post.id()))?;
        let title = match post.title() {
            Some(title) => Some(title.open(key).map_err(|_| undecryptable("post title", post.id()))?),
            None => None,
        };
        posts.push(PlainPost {
            id: post.id().to_string(),
            content,
            title,
        });
    }

    let mut media = Vec::with_capacity(corpus.media.len());
    for record in &corpus.media {
        let filename = record
            .filename()
            .open(key)
            .map_err(|_| undecryptable("media", record.id()))?;
        media.push(PlainMedia {
            id: record.id().to_string(),
            filename,
        });
    }

    Ok((posts, media))
}

fn reencrypt(
    key: &DerivedKey,
    posts: &[PlainPost],
    media: &[PlainMedia],
) -> Result<(Vec<PostCipher>, Vec<MediaCipher>), RotationAbort> {
    let posts = posts
        .iter()
        .map(|post| -> Result<PostCipher, CryptoError> {
            Ok(PostCipher {
                id: post.id.clone(),
                content: encrypt(key, &post.content)?,
                title: post.title.as_ref().map(|t| encrypt(key, t)).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(RotationAbort::Reencrypt)?;

    let media = media
        .iter()
        .map(|record| -> Result<MediaCipher, CryptoError> {
            Ok(MediaCipher {
                id: record.id.clone(),
                filename: encrypt(key, &record.filename)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(RotationAbort::Reencrypt)?;

    Ok((posts, media))
}

/// Replaces the passphrase of an unlocked vault.
///
/// Runs strictly in order: fetch the whole corpus, decrypt all of it with
/// the active key, derive the new key under a fresh salt, re-encrypt every
/// field with fresh IVs, submit one atomic commit, and only then install
/// the new key. Anything failing before the submit leaves the backend
/// untouched; a rejected submit leaves the old key active.
pub fn rotate<B: Backend + ?Sized>(
    session: &KeySession,
    gate: &RotationGate,
    backend: &B,
    new_passphrase: &str,
    kdf: KdfParams,
) -> Result<RotationReport, VaultError> {
    let _exclusive = gate.exclusive();
    let active = session.active()?;
    info!(revision = active.revision, "passphrase rotation started");

    let account = backend
        .account()
        .map_err(|e| RotationAbort::Fetch(format!("{e:#}")))?;
    if account.revision() != active.revision {
        warn!(
            session = active.revision,
            account = account.revision(),
            "passphrase was rotated by another client"
        );
        return Err(VaultError::StaleKey);
    }

    let corpus = backend
        .corpus()
        .map_err(|e| RotationAbort::Fetch(format!("{e:#}")))?;
    debug!(records = corpus.len(), "corpus fetched");

    let (posts, media) = decrypt_corpus(&active.key, &corpus)?;
    debug!("corpus decrypted with the current key");

    let salt = generate_salt().map_err(RotationAbort::Derivation)?;
    let new_key = derive_key(new_passphrase, &salt, kdf).map_err(RotationAbort::Derivation)?;
    let verifier = create_verifier(&new_key).map_err(RotationAbort::Derivation)?;

    let (post_ciphers, media_ciphers) = reencrypt(&new_key, &posts, &media)?;
    drop(posts);
    drop(media);

    let report = RotationReport {
        posts: post_ciphers.len(),
        media: media_ciphers.len(),
    };
    let commit = RotationCommit {
        base_generation: corpus.generation,
        keys: AccountKeys {
            salt,
            kdf,
            verifier,
        },
        posts: post_ciphers,
        media: media_ciphers,
    };

    let revision = match backend.commit_rotation(commit) {
        Ok(revision) => revision,
        Err(e) => {
            error!(error = %format!("{e:#}"), "rotation commit rejected; keeping the current key");
            return Err(VaultError::RotationSubmissionFailed(format!("{e:#}")));
        }
    };

    session.install(new_key, revision);
    info!(
        posts = report.posts,
        media = report.media,
        revision,
        "passphrase rotated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Corpus;
    use crate::crypto::{Sealed, kdf::fast_kdf};
    use crate::record::{Account, MediaRecord, Post};
    use anyhow::{Result, bail};
    use chrono::Utc;
    use std::sync::Mutex;

    /// In-memory backend recording every commit it receives.
    struct MemoryBackend {
        account: Account,
        corpus: Corpus,
        commits: Mutex<Vec<RotationCommit>>,
        reject_commits: bool,
    }

    impl MemoryBackend {
        fn new(keys: AccountKeys, corpus: Corpus) -> Self {
            Self {
                account: Account::new(keys),
                corpus,
                commits: Mutex::new(Vec::new()),
                reject_commits: false,
            }
        }

        fn commits(&self) -> usize {
            self.commits.lock().unwrap().len()
        }
    }

    impl Backend for MemoryBackend {
        fn create_account(&self, _keys: AccountKeys) -> Result<Account> {
            bail!("unused")
        }
        fn account(&self) -> Result<Account> {
            Ok(self.account.clone())
        }
        fn insert_post(&self, _revision: u64, _post: Post) -> Result<()> {
            bail!("unused")
        }
        fn update_post(&self, _revision: u64, _post: Post) -> Result<()> {
            bail!("unused")
        }
        fn delete_post(&self, _id: &str) -> Result<()> {
            bail!("unused")
        }
        fn post(&self, _id: &str) -> Result<Option<Post>> {
            Ok(None)
        }
        fn posts(&self, _offset: usize, _limit: usize, _tag: Option<&str>) -> Result<Vec<Post>> {
            Ok(self.corpus.posts.clone())
        }
        fn corpus(&self) -> Result<Corpus> {
            Ok(self.corpus.clone())
        }
        fn insert_media(&self, _revision: u64, _media: MediaRecord) -> Result<()> {
            bail!("unused")
        }
        fn media(&self) -> Result<Vec<MediaRecord>> {
            Ok(self.corpus.media.clone())
        }
        fn commit_rotation(&self, commit: RotationCommit) -> Result<u64> {
            if self.reject_commits {
                bail!("connection reset");
            }
            self.commits.lock().unwrap().push(commit);
            Ok(self.account.revision() + 1)
        }
    }

    fn post(key: &DerivedKey, id: &str, content: &str, title: Option<&str>) -> Post {
        Post {
            id: id.to_string(),
            content: encrypt(key, content).unwrap(),
            title: title.map(|t| encrypt(key, t).unwrap()),
            content_type: Default::default(),
            mirror: None,
            char_count: 0,
            word_count: 0,
            tags: Vec::new(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn media(key: &DerivedKey, id: &str, filename: &str) -> MediaRecord {
        MediaRecord {
            id: id.to_string(),
            post_id: None,
            filename: encrypt(key, filename).unwrap(),
            mime_type: "image/png".to_string(),
            size: 1,
            created: Utc::now(),
        }
    }

    /// Session unlocked with "old passphrase" plus a corpus sealed under it.
    fn setup(records: usize) -> (KeySession, MemoryBackend) {
        let salt = generate_salt().unwrap();
        let key = derive_key("old passphrase", &salt, fast_kdf()).unwrap();
        let keys = AccountKeys {
            verifier: create_verifier(&key).unwrap(),
            salt,
            kdf: fast_kdf(),
        };

        let corpus = Corpus {
            posts: (0..records)
                .map(|i| post(&key, &format!("p{i}"), &format!("content {i}"), Some("title")))
                .collect(),
            media: vec![media(&key, "m0", "holiday.jpg")],
            generation: 0,
        };

        let session = KeySession::new();
        let backend = MemoryBackend::new(keys, corpus);
        session.unlock("old passphrase", &backend.account).unwrap();
        (session, backend)
    }

    #[test]
    fn rotation_reencrypts_everything_under_the_new_key() {
        let (session, backend) = setup(5);
        let old_key = session.key().unwrap();

        let report = rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf())
            .unwrap();
        assert_eq!(report, RotationReport { posts: 5, media: 1 });

        let commits = backend.commits.lock().unwrap();
        let commit = &commits[0];
        let new_key = session.key().unwrap();

        for (i, p) in commit.posts.iter().enumerate() {
            assert_eq!(*p.content.open(&new_key).unwrap(), format!("content {i}"));
            assert_eq!(*p.title.as_ref().unwrap().open(&new_key).unwrap(), "title");
            assert!(p.content.open(&old_key).is_err());
        }
        assert_eq!(*commit.media[0].filename.open(&new_key).unwrap(), "holiday.jpg");
        assert!(commit.media[0].filename.open(&old_key).is_err());
    }

    #[test]
    fn rotation_uses_fresh_salt_and_ivs() {
        let (session, backend) = setup(3);
        let old_salt = backend.account.keys().salt.clone();
        let old_ivs: Vec<String> = backend.corpus.posts.iter().map(|p| p.content().iv.clone()).collect();

        rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()).unwrap();

        let commits = backend.commits.lock().unwrap();
        assert_ne!(commits[0].keys.salt, old_salt);
        for p in &commits[0].posts {
            assert!(!old_ivs.contains(&p.content.iv));
        }
    }

    #[test]
    fn new_verifier_accepts_only_the_new_passphrase() {
        let (session, backend) = setup(1);
        rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()).unwrap();

        let keys = backend.commits.lock().unwrap()[0].keys.clone();
        let fresh = KeySession::new();
        let account = Account::new(keys);
        assert!(fresh.unlock("old passphrase", &account).is_err());
        fresh.unlock("new passphrase", &account).unwrap();
    }

    #[test]
    fn undecryptable_record_aborts_before_any_submit() {
        let (session, mut backend) = setup(4);
        backend.corpus.posts[2].content = Sealed {
            ciphertext: backend.corpus.posts[1].content.ciphertext.clone(),
            iv: backend.corpus.posts[2].content.iv.clone(),
        };

        let err = rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf())
            .unwrap_err();

        match err {
            VaultError::RotationAborted(RotationAbort::Undecryptable { kind, id }) => {
                assert_eq!(kind, "post");
                assert_eq!(id, "p2");
            }
            other => panic!("expected RotationAborted, got: {other:?}"),
        }
        assert_eq!(backend.commits(), 0);
    }

    #[test]
    fn undecryptable_media_aborts_before_any_submit() {
        let (session, mut backend) = setup(1);
        backend.corpus.media[0].filename = encrypt(&DerivedKey::for_tests(9), "x").unwrap();

        assert!(matches!(
            rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()),
            Err(VaultError::RotationAborted(_))
        ));
        assert_eq!(backend.commits(), 0);
    }

    #[test]
    fn empty_new_passphrase_aborts() {
        let (session, backend) = setup(1);

        assert!(matches!(
            rotate(&session, &RotationGate::new(), &backend, "", fast_kdf()),
            Err(VaultError::RotationAborted(RotationAbort::Derivation(_)))
        ));
        assert_eq!(backend.commits(), 0);
    }

    #[test]
    fn rejected_submit_keeps_the_old_key() {
        let (session, mut backend) = setup(2);
        backend.reject_commits = true;
        let old_key = session.key().unwrap();
        let sealed = encrypt(&old_key, "still readable").unwrap();

        let err = rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf())
            .unwrap_err();
        assert!(matches!(err, VaultError::RotationSubmissionFailed(_)));
        assert!(err.to_string().starts_with("Failed to change passphrase"));

        let active = session.key().unwrap();
        assert_eq!(*sealed.open(&active).unwrap(), "still readable");
        assert_eq!(*backend.corpus.posts[0].content().open(&active).unwrap(), "content 0");
    }

    #[test]
    fn locked_session_cannot_rotate() {
        let (session, backend) = setup(1);
        session.lock();

        assert!(matches!(
            rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()),
            Err(VaultError::Locked)
        ));
    }

    #[test]
    fn writes_are_refused_while_rotation_holds_the_gate() {
        let gate = RotationGate::new();
        {
            let _rotation = gate.exclusive();
            assert!(matches!(gate.write_access(), Err(VaultError::RotationInProgress)));
        }
        assert!(gate.write_access().is_ok());
    }

    #[test]
    fn successful_rotation_installs_the_committed_revision() {
        let (session, backend) = setup(1);
        assert_eq!(session.active().unwrap().revision, 0);

        rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()).unwrap();

        assert_eq!(session.active().unwrap().revision, 1);
    }

    #[test]
    fn session_behind_the_account_cannot_rotate() {
        let (session, mut backend) = setup(1);
        let keys = backend.account.keys().clone();
        backend.account.replace_keys(keys);

        assert!(matches!(
            rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()),
            Err(VaultError::StaleKey)
        ));
        assert_eq!(backend.commits(), 0);
    }

    #[test]
    fn commit_carries_the_fetched_generation() {
        let (session, mut backend) = setup(1);
        backend.corpus.generation = 7;

        rotate(&session, &RotationGate::new(), &backend, "new passphrase", fast_kdf()).unwrap();

        assert_eq!(backend.commits.lock().unwrap()[0].base_generation, 7);
    }
}
