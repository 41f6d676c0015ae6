//! Core types for the feed generator.

use crate::error::{FeedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Collection NSID of the records this crate indexes.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Separator between the two halves of a pagination cursor.
pub const CURSOR_SEPARATOR: &str = "::";

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        let millis = i64::try_from(rhs.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identifier of a job within one queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- Stream records ---

/// Reference to a specific version of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: String,
}

/// Reply pointers of a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

/// A single self-applied label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfLabel {
    pub val: String,
}

/// Labels the author applied to their own record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfLabels {
    #[serde(default)]
    pub values: Vec<SelfLabel>,
}

/// Decoded post record payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub text: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub labels: Option<SelfLabels>,
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<String>,
}

impl PostRecord {
    /// A plain top-level post with no labels.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply: None,
            labels: None,
            created_at: None,
        }
    }

    pub fn with_reply(mut self, parent: &str, root: &str) -> Self {
        self.reply = Some(ReplyRef {
            parent: StrongRef {
                uri: parent.to_string(),
                cid: String::new(),
            },
            root: StrongRef {
                uri: root.to_string(),
                cid: String::new(),
            },
        });
        self
    }

    pub fn with_labels(mut self, values: &[&str]) -> Self {
        self.labels = Some(SelfLabels {
            values: values
                .iter()
                .map(|v| SelfLabel { val: v.to_string() })
                .collect(),
        });
        self
    }

    /// Iterate the self-applied label values.
    pub fn label_values(&self) -> impl Iterator<Item = &str> {
        self.labels
            .iter()
            .flat_map(|labels| labels.values.iter().map(|l| l.val.as_str()))
    }
}

/// A record creation extracted from a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOp {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub record: PostRecord,
}

/// A record deletion extracted from a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOp {
    pub uri: String,
}

/// Per-record operations of a commit, grouped by action.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Operations {
    pub creates: Vec<CreateOp>,
    pub deletes: Vec<DeleteOp>,
}

impl Operations {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// One commit from the stream, reduced to post operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitEvent {
    pub seq: u64,
    pub repo: String,
    pub operations: Operations,
}

// --- Queue payloads ---

/// Work item for the `creates` queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJob {
    pub uri: String,
    pub cid: String,
    pub feed: String,
    pub text: String,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
}

impl CreateJob {
    /// Build the row this job persists.
    pub fn into_post(self, indexed_at: Timestamp) -> Post {
        Post {
            uri: self.uri,
            cid: self.cid,
            feed: self.feed,
            reply_parent: self.reply_parent,
            reply_root: self.reply_root,
            indexed_at,
        }
    }
}

/// Work item for the `deletes` queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteJob {
    pub uri: String,
}

// --- Persisted rows ---

/// A matched post in the index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub uri: String,
    pub cid: String,
    pub feed: String,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
    pub indexed_at: Timestamp,
}

/// Position in a feed's `indexedAt desc, cid desc` order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub indexed_at: Timestamp,
    pub cid: String,
}

impl Cursor {
    /// Cursor pointing just past `post`.
    pub fn after(post: &Post) -> Self {
        Self {
            indexed_at: post.indexed_at,
            cid: post.cid.clone(),
        }
    }

    /// Parse `"<indexedAtMillis>::<cid>"`.
    ///
    /// Only the first two `::`-separated segments are read.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split(CURSOR_SEPARATOR);
        let indexed_at = parts.next().filter(|s| !s.is_empty());
        let cid = parts.next().filter(|s| !s.is_empty());

        match (indexed_at, cid) {
            (Some(indexed_at), Some(cid)) => {
                let millis = indexed_at
                    .parse::<i64>()
                    .map_err(|_| FeedError::InvalidCursor("malformed cursor".into()))?;
                Ok(Self {
                    indexed_at: Timestamp(millis),
                    cid: cid.to_string(),
                })
            }
            _ => Err(FeedError::InvalidCursor("malformed cursor".into())),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.indexed_at.0, CURSOR_SEPARATOR, self.cid)
    }
}
