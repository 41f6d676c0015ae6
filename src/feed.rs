//! Paginated feed skeleton queries.

use crate::classifier::FeedRegistry;
use crate::error::{FeedError, Result};
use crate::store::PostStore;
use crate::types::Cursor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Page size limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Used when a request names no limit.
    pub default_limit: usize,
    /// Larger requested limits are capped to this.
    pub max_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 100,
        }
    }
}

/// A `getFeedSkeleton` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FeedQuery {
    pub feed: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl FeedQuery {
    pub fn new(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// One entry of a skeleton.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkeletonItem {
    pub post: String,
}

/// A page of post uris plus the cursor for the next page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FeedSkeleton {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub feed: Vec<SkeletonItem>,
}

/// Collection that feed generator records are published under.
pub const FEED_GENERATOR_COLLECTION: &str = "app.bsky.feed.generator";

/// `at://` uri of the feed record `shortname` published by `publisher_did`.
pub fn feed_uri(publisher_did: &str, shortname: &str) -> String {
    format!("at://{publisher_did}/{FEED_GENERATOR_COLLECTION}/{shortname}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeedDescriptor {
    pub uri: String,
}

/// `describeFeedGenerator` response: the service DID and every feed it serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GeneratorDescription {
    pub did: String,
    pub feeds: Vec<FeedDescriptor>,
}

impl GeneratorDescription {
    pub fn new(registry: &FeedRegistry, service_did: &str, publisher_did: &str) -> Self {
        Self {
            did: service_did.to_string(),
            feeds: registry
                .names()
                .into_iter()
                .map(|name| FeedDescriptor {
                    uri: feed_uri(publisher_did, name),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_endpoint: String,
}

/// The `did:web` document served at `/.well-known/did.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    pub service: Vec<DidService>,
}

impl DidDocument {
    /// Only a service DID that resolves to `hostname` gets a document.
    pub fn for_host(service_did: &str, hostname: &str) -> Option<Self> {
        if !service_did.ends_with(hostname) {
            return None;
        }
        Some(Self {
            context: vec!["https://www.w3.org/ns/did/v1".to_string()],
            id: service_did.to_string(),
            service: vec![DidService {
                id: "#bsky_fg".to_string(),
                kind: "BskyFeedGenerator".to_string(),
                service_endpoint: format!("https://{hostname}"),
            }],
        })
    }
}

/// Serves feed skeletons from the post store.
pub struct FeedReader {
    registry: FeedRegistry,
    store: Arc<dyn PostStore>,
    config: FeedConfig,
}

impl FeedReader {
    pub fn new(registry: FeedRegistry, store: Arc<dyn PostStore>, config: FeedConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn get_feed_skeleton(&self, query: &FeedQuery) -> Result<FeedSkeleton> {
        if !self.registry.contains(&query.feed) {
            return Err(FeedError::UnsupportedFeed(query.feed.clone()));
        }

        let limit = match query.limit {
            Some(0) => return Err(FeedError::InvalidLimit(0)),
            Some(limit) => limit.min(self.config.max_limit),
            None => self.config.default_limit,
        };

        let after = query.cursor.as_deref().map(Cursor::parse).transpose()?;
        let posts = self.store.page(&query.feed, limit, after.as_ref())?;

        let cursor = posts.last().map(|post| Cursor::after(post).to_string());
        let feed = posts
            .into_iter()
            .map(|post| SkeletonItem { post: post.uri })
            .collect();

        Ok(FeedSkeleton { cursor, feed })
    }
}
