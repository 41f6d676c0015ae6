//! Feed policies deciding which created posts belong to which feed.
//!
//! A [`FeedPolicy`] is a deterministic predicate over a create operation plus
//! the projection of an accepted create into a [`CreateJob`]. The
//! [`FeedRegistry`] holds every policy the generator serves; the router asks
//! each of them about every create, the creates worker and the feed reader
//! resolve feeds through it by shortname.

mod alphabetical;

pub use alphabetical::{
    words_in_order, AlphabeticalWords, Charset, ClassifierConfig, SHORTNAME as ALPHABETIC_WORDS,
};

use crate::error::{FeedError, Result};
use crate::types::{CreateJob, CreateOp};
use std::sync::Arc;

/// Longest shortname a feed may use.
pub const MAX_SHORTNAME_LEN: usize = 15;

/// A swappable feed classification policy.
pub trait FeedPolicy: Send + Sync {
    /// Shortname of the feed this policy fills.
    fn name(&self) -> &str;

    /// Whether `op` belongs in the feed.
    fn accept(&self, op: &CreateOp) -> bool;

    /// The text-only part of [`FeedPolicy::accept`], re-run by workers.
    fn accept_text(&self, text: &str) -> bool;

    /// Build the job that persists an accepted create.
    fn project(&self, op: &CreateOp) -> CreateJob {
        let reply = op.record.reply.as_ref();
        CreateJob {
            uri: op.uri.clone(),
            cid: op.cid.clone(),
            feed: self.name().to_string(),
            text: op.record.text.clone(),
            reply_parent: reply.map(|r| r.parent.uri.clone()),
            reply_root: reply.map(|r| r.root.uri.clone()),
        }
    }
}

/// Policies served by this generator, in registration order.
#[derive(Clone, Default)]
pub struct FeedRegistry {
    policies: Vec<Arc<dyn FeedPolicy>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the alphabetical-words feed.
    pub fn with_default_policy(config: ClassifierConfig) -> Self {
        Self {
            policies: vec![Arc::new(AlphabeticalWords::new(config))],
        }
    }

    /// Add a policy. Shortnames must be unique and at most 15 characters.
    pub fn register(&mut self, policy: Arc<dyn FeedPolicy>) -> Result<()> {
        let name = policy.name();
        if name.is_empty() || name.chars().count() > MAX_SHORTNAME_LEN {
            return Err(FeedError::Config(format!(
                "feed shortname must be 1-{MAX_SHORTNAME_LEN} characters: {name:?}"
            )));
        }
        if self.get(name).is_some() {
            return Err(FeedError::Config(format!(
                "feed already registered: {name}"
            )));
        }
        self.policies.push(policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FeedPolicy>> {
        self.policies.iter().find(|p| p.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FeedPolicy>> {
        self.policies.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
