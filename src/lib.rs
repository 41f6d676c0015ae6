//! # Feed Generator
//!
//! Consumes a stream of repository commits, keeps the posts that match one
//! of its feed policies, and serves them as cursor-paginated feed skeletons.
//!
//! ## Pipeline
//!
//! - **Stream**: frames from an [`EventSource`] are decoded into commit events
//! - **Router**: deletes and accepted creates become jobs on two durable queues
//! - **Queues**: journaled, leased, retried with backoff, pruned by retention
//! - **Workers**: apply jobs to the post table idempotently
//! - **Feed**: pages through the table by `(indexedAt desc, cid desc)`
//!
//! ## Example
//!
//! ```ignore
//! use feedgen::{FeedGenerator, FeedQuery, FeedgenConfig};
//!
//! let config = FeedgenConfig::from_env();
//! let mut generator = FeedGenerator::create(config)?;
//! generator.start(my_firehose_source)?;
//!
//! let page = generator
//!     .reader()
//!     .get_feed_skeleton(&FeedQuery::new("alphabeticwords").limit(30))?;
//! println!("{}", serde_json::to_string(&page)?);
//!
//! generator.shutdown()?;
//! ```

pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod generator;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod types;
pub mod wal;
pub mod workers;

// Re-exports
pub use classifier::{
    words_in_order, AlphabeticalWords, Charset, ClassifierConfig, FeedPolicy, FeedRegistry,
    ALPHABETIC_WORDS,
};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::FeedgenConfig;
pub use error::{FeedError, Result};
pub use feed::{
    feed_uri, DidDocument, FeedConfig, FeedDescriptor, FeedQuery, FeedReader, FeedSkeleton,
    GeneratorDescription, SkeletonItem,
};
pub use generator::{AppContext, FeedGenerator, HealthReport};
pub use queue::{
    ClaimedJob, DurableQueue, FailureDisposition, FailureKind, JobFailure, JobRecord, JobSink,
    JobState, QueueConfig, QueueCounts, CREATES_QUEUE, DELETES_QUEUE,
};
pub use router::{EventRouter, RouteReport};
pub use shutdown::Shutdown;
pub use store::{InsertOutcome, PostStore, PostTable};
pub use stream::{
    decode_frame, EventSource, FirehoseSubscription, SubscriptionConfig, SubscriptionStats,
};
pub use types::*;
pub use wal::WriteAheadLog;
pub use workers::{
    process_one, CreatesHandler, DeletesHandler, JobHandler, WorkerConfig, WorkerPool,
};
