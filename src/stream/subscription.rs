//! The long-running stream consumer.

use crate::error::{FeedError, Result};
use crate::router::EventRouter;
use crate::shutdown::Shutdown;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A connectable source of raw frames.
///
/// The network transport lives behind this trait. Each call to `connect`
/// opens a fresh session resuming after `cursor` when one is given; the
/// returned iterator ends when the session drops.
pub trait EventSource: Send {
    type Frames: Iterator<Item = Result<Vec<u8>>>;

    fn connect(&mut self, cursor: Option<u64>) -> Result<Self::Frames>;
}

/// Stream connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Upstream service URL handed to the transport.
    pub endpoint: String,

    /// Pause between a dropped session and the next connect.
    /// Default: 3s
    pub reconnect_delay_ms: u64,

    /// Give up after this many consecutive failed connects. Unset retries
    /// forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://bsky.network".to_string(),
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Counters kept by a running subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Commit events routed.
    pub events: u64,
    /// Frames that failed to decode.
    pub skipped: u64,
    /// Individual enqueues that failed.
    pub enqueue_failures: u64,
    /// Sessions opened after the first.
    pub reconnects: u64,
    /// Sequence number of the last routed commit.
    pub cursor: Option<u64>,
}

/// Consumes an [`EventSource`] and feeds the router until shut down.
pub struct FirehoseSubscription<S> {
    source: S,
    router: Arc<EventRouter>,
    config: SubscriptionConfig,
    shutdown: Shutdown,
    stats: SubscriptionStats,
}

impl<S: EventSource> FirehoseSubscription<S> {
    pub fn new(
        source: S,
        router: Arc<EventRouter>,
        config: SubscriptionConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            router,
            config,
            shutdown,
            stats: SubscriptionStats::default(),
        }
    }

    /// Resume from `cursor` on the first connect.
    pub fn with_cursor(mut self, cursor: u64) -> Self {
        self.stats.cursor = Some(cursor);
        self
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Run until shutdown or until reconnect attempts are exhausted.
    ///
    /// Undecodable frames are logged and skipped. A frame error or the end
    /// of the session triggers a reconnect from the last routed sequence.
    pub fn run(&mut self) -> Result<SubscriptionStats> {
        let mut failed_connects: u32 = 0;
        let mut sessions: u64 = 0;

        while !self.shutdown.is_triggered() {
            let frames = match self.source.connect(self.stats.cursor) {
                Ok(frames) => frames,
                Err(e) => {
                    failed_connects += 1;
                    tracing::warn!(
                        endpoint = %self.config.endpoint,
                        attempt = failed_connects,
                        error = %e,
                        "failed to connect to stream"
                    );
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if failed_connects >= max {
                            tracing::error!(attempts = failed_connects, "giving up on stream");
                            return Err(FeedError::ReconnectExhausted {
                                attempts: failed_connects,
                            });
                        }
                    }
                    self.shutdown.wait_timeout(self.config.reconnect_delay());
                    continue;
                }
            };

            failed_connects = 0;
            if sessions > 0 {
                self.stats.reconnects += 1;
            }
            sessions += 1;
            tracing::info!(
                endpoint = %self.config.endpoint,
                cursor = ?self.stats.cursor,
                "connected to stream"
            );

            for frame in frames {
                if self.shutdown.is_triggered() {
                    break;
                }
                match frame {
                    Ok(bytes) => self.handle(&bytes),
                    Err(e) => {
                        tracing::warn!(error = %e, "stream session failed");
                        break;
                    }
                }
            }

            if self.shutdown.is_triggered() {
                break;
            }
            tracing::info!(
                delay_ms = self.config.reconnect_delay_ms,
                "stream disconnected, reconnecting"
            );
            self.shutdown.wait_timeout(self.config.reconnect_delay());
        }

        tracing::info!(
            events = self.stats.events,
            skipped = self.stats.skipped,
            "stream subscription stopped"
        );
        Ok(self.stats.clone())
    }

    fn handle(&mut self, bytes: &[u8]) {
        match self.router.handle_frame(bytes) {
            Ok(Some(report)) => {
                self.stats.events += 1;
                self.stats.enqueue_failures += report.failures.len() as u64;
                self.stats.cursor = Some(report.seq);
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.skipped += 1;
                tracing::error!(error = %e, "repo subscription could not handle message");
            }
        }
    }
}
