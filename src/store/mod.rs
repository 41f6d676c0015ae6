//! Storage for matched posts.
//!
//! Workers write through [`PostStore`]; the feed reader pages through it.
//! [`PostTable`] is the durable implementation.

mod index;
mod table;

pub use table::PostTable;

use crate::error::Result;
use crate::types::{Cursor, Post};

/// Result of an insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for this `(feed, uri)` already existed and was left untouched.
    AlreadyPresent,
}

/// Idempotent post storage.
///
/// Rows are keyed by `(feed, uri)`: a uri appears at most once per feed, and
/// once in each feed that accepted it. Deletes are by uri and span all feeds.
pub trait PostStore: Send + Sync {
    /// Insert a post; an existing `(feed, uri)` row wins.
    fn insert_post(&self, post: Post) -> Result<InsertOutcome>;

    /// Delete every row for `uri`. Returns the number removed.
    fn delete_post(&self, uri: &str) -> Result<usize>;

    /// Up to `limit` posts of `feed` after `after`, ordered
    /// `indexedAt desc, cid desc`.
    fn page(&self, feed: &str, limit: usize, after: Option<&Cursor>) -> Result<Vec<Post>>;

    /// Number of rows in `feed`.
    fn count(&self, feed: &str) -> Result<usize>;
}
