//! In-memory ordering of a feed's posts.

use crate::types::{Cursor, Post, Timestamp};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Sort key ordering posts newest first, ties broken by descending cid.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SortKey {
    indexed_at: Timestamp,
    cid: String,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .indexed_at
            .cmp(&self.indexed_at)
            .then_with(|| other.cid.cmp(&self.cid))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&Post> for SortKey {
    fn from(post: &Post) -> Self {
        Self {
            indexed_at: post.indexed_at,
            cid: post.cid.clone(),
        }
    }
}

impl From<&Cursor> for SortKey {
    fn from(cursor: &Cursor) -> Self {
        Self {
            indexed_at: cursor.indexed_at,
            cid: cursor.cid.clone(),
        }
    }
}

/// Posts of one feed, keyed by uri and ordered for pagination.
#[derive(Default)]
pub(crate) struct FeedIndex {
    by_uri: HashMap<String, Post>,
    /// Uris sharing a sort key are kept in uri order.
    order: BTreeMap<SortKey, BTreeSet<String>>,
}

impl FeedIndex {
    pub fn contains(&self, uri: &str) -> bool {
        self.by_uri.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.by_uri.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uri.is_empty()
    }

    /// Insert unless the uri is already present. Returns whether it was added.
    pub fn insert(&mut self, post: Post) -> bool {
        if self.by_uri.contains_key(&post.uri) {
            return false;
        }
        self.order
            .entry(SortKey::from(&post))
            .or_default()
            .insert(post.uri.clone());
        self.by_uri.insert(post.uri.clone(), post);
        true
    }

    pub fn remove(&mut self, uri: &str) -> Option<Post> {
        let post = self.by_uri.remove(uri)?;
        let key = SortKey::from(&post);
        if let Some(uris) = self.order.get_mut(&key) {
            uris.remove(uri);
            if uris.is_empty() {
                self.order.remove(&key);
            }
        }
        Some(post)
    }

    /// Up to `limit` posts strictly after `after` in feed order.
    pub fn page(&self, limit: usize, after: Option<&Cursor>) -> Vec<Post> {
        let lower = match after {
            Some(cursor) => Bound::Excluded(SortKey::from(cursor)),
            None => Bound::Unbounded,
        };

        self.order
            .range((lower, Bound::Unbounded))
            .flat_map(|(_, uris)| uris.iter())
            .filter_map(|uri| self.by_uri.get(uri))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn posts(&self) -> impl Iterator<Item = &Post> {
        self.by_uri.values()
    }
}
