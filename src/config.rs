//! Generator configuration.
//!
//! Settings come from a TOML file, from `FEEDGEN_*` environment variables,
//! or both (environment applied last). Every section has working defaults,
//! so an empty file is a valid configuration.
//!
//! ```toml
//! data_dir = "/var/lib/feedgen"
//! hostname = "feeds.example.com"
//!
//! [subscription]
//! endpoint = "wss://bsky.network"
//! reconnect_delay_ms = 3000
//!
//! [queue]
//! max_attempts = 5
//!
//! [classifier]
//! reject_replies = false
//! charset = "ascii"
//! ```

use crate::classifier::ClassifierConfig;
use crate::error::{FeedError, Result};
use crate::feed::FeedConfig;
use crate::queue::QueueConfig;
use crate::stream::SubscriptionConfig;
use crate::workers::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration of a feed generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedgenConfig {
    /// Root for the post table (`posts/`) and queue journals (`queues/`).
    pub data_dir: PathBuf,

    /// Public hostname the feed is served under.
    pub hostname: String,

    /// DID of this service. Defaults to `did:web:<hostname>`.
    pub service_did: Option<String>,

    /// DID of the account publishing the feed.
    pub publisher_did: String,

    pub subscription: SubscriptionConfig,
    pub classifier: ClassifierConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub feed: FeedConfig,
}

impl Default for FeedgenConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hostname: "example.com".to_string(),
            service_did: None,
            publisher_did: "did:example:alice".to_string(),
            subscription: SubscriptionConfig::default(),
            classifier: ClassifierConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl FeedgenConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FeedError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_vars(std::env::vars());
        config
    }

    /// Overlay `FEEDGEN_*` variables. Empty values are ignored, as are
    /// values that fail to parse (logged at `warn`).
    pub fn apply_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            if value.is_empty() {
                continue;
            }
            match key {
                "FEEDGEN_DATA_DIR" => self.data_dir = PathBuf::from(value),
                "FEEDGEN_HOSTNAME" => self.hostname = value.to_string(),
                "FEEDGEN_SERVICE_DID" => self.service_did = Some(value.to_string()),
                "FEEDGEN_PUBLISHER_DID" => self.publisher_did = value.to_string(),
                "FEEDGEN_SUBSCRIPTION_ENDPOINT" => self.subscription.endpoint = value.to_string(),
                "FEEDGEN_SUBSCRIPTION_RECONNECT_DELAY" => {
                    set_parsed(key, value, &mut self.subscription.reconnect_delay_ms);
                }
                "FEEDGEN_MAX_RECONNECT_ATTEMPTS" => {
                    let mut attempts = 0u32;
                    if set_parsed(key, value, &mut attempts) {
                        self.subscription.max_reconnect_attempts = Some(attempts);
                    }
                }
                "FEEDGEN_QUEUE_MAX_ATTEMPTS" => {
                    set_parsed(key, value, &mut self.queue.max_attempts);
                }
                "FEEDGEN_QUEUE_FSYNC" => self.queue.fsync = parse_bool(value),
                "FEEDGEN_CREATES_CONCURRENCY" => {
                    set_parsed(key, value, &mut self.workers.creates_concurrency);
                }
                "FEEDGEN_DELETES_CONCURRENCY" => {
                    set_parsed(key, value, &mut self.workers.deletes_concurrency);
                }
                "FEEDGEN_REJECT_REPLIES" => self.classifier.reject_replies = parse_bool(value),
                "FEEDGEN_REJECT_NSFW" => self.classifier.reject_nsfw = parse_bool(value),
                _ => {}
            }
        }
    }

    /// The configured service DID, or `did:web:<hostname>`.
    pub fn service_did(&self) -> String {
        self.service_did
            .clone()
            .unwrap_or_else(|| format!("did:web:{}", self.hostname))
    }

    pub fn posts_dir(&self) -> PathBuf {
        self.data_dir.join("posts")
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.data_dir.join("queues")
    }

    /// Reject settings the generator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(FeedError::Config(msg.to_string()));

        if self.data_dir.as_os_str().is_empty() {
            return fail("data_dir must not be empty");
        }
        if self.hostname.is_empty() {
            return fail("hostname must not be empty");
        }
        if !self.publisher_did.starts_with("did:") {
            return fail("publisher_did must be a DID");
        }
        if self.subscription.endpoint.is_empty() {
            return fail("subscription.endpoint must not be empty");
        }
        if self.queue.max_attempts == 0 {
            return fail("queue.max_attempts must be at least 1");
        }
        if self.queue.lease_ms == 0 {
            return fail("queue.lease_ms must be positive");
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            return fail("queue.backoff_base_ms must not exceed queue.backoff_max_ms");
        }
        if self.workers.creates_concurrency == 0 || self.workers.deletes_concurrency == 0 {
            return fail("each queue needs at least one worker");
        }
        if self.feed.max_limit == 0 {
            return fail("feed.max_limit must be positive");
        }
        if self.feed.default_limit == 0 || self.feed.default_limit > self.feed.max_limit {
            return fail("feed.default_limit must be between 1 and feed.max_limit");
        }
        Ok(())
    }
}

fn set_parsed<T: FromStr>(key: &str, value: &str, target: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *target = parsed;
            true
        }
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable setting");
            false
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "true" || value == "1"
}
