//! Records as the persistence layer sees them, and their decrypted views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{KdfParams, Sealed, Verifier};

/// Everything needed to re-derive and check the account key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountKeys {
    pub salt: String,
    pub kdf: KdfParams,
    pub verifier: Verifier,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Account {
    id: String,
    keys: AccountKeys,
    /// Bumped on every key change; writes sealed under an older revision
    /// are refused.
    #[serde(default)]
    revision: u64,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl Account {
    pub(crate) fn new(keys: AccountKeys) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            keys,
            revision: 0,
            created: now,
            updated: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keys(&self) -> &AccountKeys {
        &self.keys
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub(crate) fn replace_keys(&mut self, keys: AccountKeys) {
        self.keys = keys;
        self.revision += 1;
        self.updated = Utc::now();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Thought,
    Longform,
}

/// Plaintext copy kept on public posts for unauthenticated reading.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlainMirror {
    pub content: String,
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Post {
    pub(crate) id: String,
    pub(crate) content: Sealed,
    pub(crate) title: Option<Sealed>,
    pub(crate) content_type: ContentType,
    pub(crate) mirror: Option<PlainMirror>,
    pub(crate) char_count: usize,
    pub(crate) word_count: usize,
    pub(crate) tags: Vec<String>,
    pub(crate) created: DateTime<Utc>,
    pub(crate) updated: DateTime<Utc>,
}

impl Post {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &Sealed {
        &self.content
    }

    pub fn title(&self) -> Option<&Sealed> {
        self.title.as_ref()
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn mirror(&self) -> Option<&PlainMirror> {
        self.mirror.as_ref()
    }

    pub fn is_public(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub(crate) fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

/// A media attachment. Only the filename is encrypted here; the file bytes
/// live elsewhere.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MediaRecord {
    pub(crate) id: String,
    pub(crate) post_id: Option<String>,
    pub(crate) filename: Sealed,
    pub(crate) mime_type: String,
    pub(crate) size: u64,
    pub(crate) created: DateTime<Utc>,
}

impl MediaRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn post_id(&self) -> Option<&str> {
        self.post_id.as_deref()
    }

    pub fn filename(&self) -> &Sealed {
        &self.filename
    }
}

/// Input for a new post.
#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub content: String,
    pub title: Option<String>,
    pub content_type: ContentType,
    pub tags: Vec<String>,
    pub public: bool,
}

/// Changes to an existing post. `None` leaves a field untouched;
/// `title: Some(None)` removes the title.
#[derive(Debug, Clone, Default)]
pub struct PostEdit {
    pub content: Option<String>,
    pub title: Option<Option<String>>,
    pub content_type: Option<ContentType>,
    pub tags: Option<Vec<String>>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPost {
    pub id: String,
    pub content: String,
    pub title: Option<String>,
    pub content_type: ContentType,
    pub is_public: bool,
    pub char_count: usize,
    pub word_count: usize,
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A public post rendered from its plaintext mirror.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicPost {
    pub id: String,
    pub content: String,
    pub title: Option<String>,
    pub content_type: ContentType,
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
}

impl PublicPost {
    pub(crate) fn from_post(post: &Post) -> Option<Self> {
        let mirror = post.mirror.as_ref()?;
        Some(Self {
            id: post.id.clone(),
            content: mirror.content.clone(),
            title: mirror.title.clone(),
            content_type: post.content_type,
            tags: post.tags.clone(),
            created: post.created,
        })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub id: String,
    pub post_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// A tag and the number of posts carrying it.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    pub name: String,
    pub posts: usize,
}

/// Tags are stored trimmed and lowercased, without blanks or duplicates.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = normalize_tag(tag.as_ref());
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Character and word counts of post content.
pub fn text_stats(content: &str) -> (usize, usize) {
    (content.chars().count(), content.split_whitespace().count())
}
