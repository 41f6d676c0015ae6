//! Wiring of the pipeline: context construction and lifecycle.

use crate::classifier::FeedRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::FeedgenConfig;
use crate::error::{FeedError, Result};
use crate::feed::{DidDocument, FeedReader, GeneratorDescription};
use crate::queue::{DurableQueue, JobFailure, QueueCounts, CREATES_QUEUE, DELETES_QUEUE};
use crate::router::EventRouter;
use crate::shutdown::Shutdown;
use crate::store::{PostStore, PostTable};
use crate::stream::{EventSource, FirehoseSubscription, SubscriptionStats};
use crate::types::{CreateJob, DeleteJob};
use crate::workers::{CreatesHandler, DeletesHandler, WorkerPool};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Everything the router, workers and reader share.
///
/// Built explicitly and handed to each component; nothing here is global.
pub struct AppContext {
    pub config: FeedgenConfig,
    pub registry: FeedRegistry,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<PostTable>,
    pub creates: Arc<DurableQueue<CreateJob>>,
    pub deletes: Arc<DurableQueue<DeleteJob>>,
}

impl AppContext {
    /// Open storage with the default feed and the system clock.
    pub fn open(config: FeedgenConfig) -> Result<Self> {
        let registry = FeedRegistry::with_default_policy(config.classifier.clone());
        Self::open_with(config, registry, Arc::new(SystemClock))
    }

    pub fn open_with(
        config: FeedgenConfig,
        registry: FeedRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(FeedError::Config("no feeds registered".into()));
        }

        let store = Arc::new(PostTable::open(config.posts_dir(), config.queue.fsync)?);
        let queues_dir = config.queues_dir();
        let creates = DurableQueue::open(
            &queues_dir,
            CREATES_QUEUE,
            config.queue.clone(),
            Arc::clone(&clock),
        )?;
        let deletes = DurableQueue::open(
            &queues_dir,
            DELETES_QUEUE,
            config.queue.clone(),
            Arc::clone(&clock),
        )?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            feeds = ?registry.names(),
            service_did = %config.service_did(),
            "opened feed generator context"
        );

        Ok(Self {
            config,
            registry,
            clock,
            store,
            creates: Arc::new(creates),
            deletes: Arc::new(deletes),
        })
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::new(
            self.registry.clone(),
            self.creates.clone(),
            self.deletes.clone(),
        )
    }

    /// The service DID and the `at://` uri of every registered feed.
    pub fn describe(&self) -> GeneratorDescription {
        GeneratorDescription::new(
            &self.registry,
            &self.config.service_did(),
            &self.config.publisher_did,
        )
    }

    /// `did:web` document for the configured host, if the service DID is hosted there.
    pub fn did_document(&self) -> Option<DidDocument> {
        DidDocument::for_host(&self.config.service_did(), &self.config.hostname)
    }

    pub fn reader(&self) -> FeedReader {
        FeedReader::new(
            self.registry.clone(),
            self.store.clone(),
            self.config.feed.clone(),
        )
    }

    pub fn creates_handler(&self) -> CreatesHandler {
        CreatesHandler::new(
            self.registry.clone(),
            self.store.clone(),
            Arc::clone(&self.clock),
        )
    }

    pub fn deletes_handler(&self) -> DeletesHandler {
        DeletesHandler::new(self.store.clone())
    }

    pub fn health(&self) -> Result<HealthReport> {
        let mut posts = BTreeMap::new();
        for name in self.registry.names() {
            posts.insert(name.to_string(), self.store.count(name)?);
        }

        let mut failures = self.creates.failed_jobs();
        failures.extend(self.deletes.failed_jobs());
        failures.sort_by_key(|f| f.failed_at);

        Ok(HealthReport {
            creates: self.creates.counts(),
            deletes: self.deletes.counts(),
            posts,
            failures,
        })
    }
}

/// Queue and store state for operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub creates: QueueCounts,
    pub deletes: QueueCounts,
    /// Indexed posts per feed.
    pub posts: BTreeMap<String, usize>,
    /// Retained permanent failures of both queues, oldest first.
    pub failures: Vec<JobFailure>,
}

impl HealthReport {
    pub fn pending(&self) -> usize {
        self.creates.pending() + self.deletes.pending()
    }

    pub fn failed(&self) -> usize {
        self.creates.failed + self.deletes.failed
    }
}

/// A running feed generator: one stream consumer plus the worker pool.
pub struct FeedGenerator {
    ctx: Arc<AppContext>,
    router: Arc<EventRouter>,
    shutdown: Shutdown,
    workers: Option<WorkerPool>,
    subscription: Option<JoinHandle<Result<SubscriptionStats>>>,
}

impl FeedGenerator {
    pub fn create(config: FeedgenConfig) -> Result<Self> {
        Ok(Self::from_context(AppContext::open(config)?))
    }

    pub fn from_context(ctx: AppContext) -> Self {
        let router = Arc::new(ctx.router());
        Self {
            ctx: Arc::new(ctx),
            router,
            shutdown: Shutdown::new(),
            workers: None,
            subscription: None,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn reader(&self) -> FeedReader {
        self.ctx.reader()
    }

    pub fn describe(&self) -> GeneratorDescription {
        self.ctx.describe()
    }

    pub fn health(&self) -> Result<HealthReport> {
        self.ctx.health()
    }

    /// Start the worker pool without a stream consumer.
    pub fn start_workers(&mut self) -> Result<()> {
        if self.workers.is_some() {
            return Ok(());
        }
        let pool = WorkerPool::start(
            &self.ctx.config.workers,
            Arc::clone(&self.ctx.creates),
            Arc::new(self.ctx.creates_handler()),
            Arc::clone(&self.ctx.deletes),
            Arc::new(self.ctx.deletes_handler()),
            self.shutdown.clone(),
        )?;
        self.workers = Some(pool);
        Ok(())
    }

    /// Start the workers and consume `source` on a background thread.
    pub fn start<S: EventSource + 'static>(&mut self, source: S) -> Result<()> {
        if self.subscription.is_some() {
            return Err(FeedError::Config("subscription already started".into()));
        }
        self.start_workers()?;

        let mut subscription = FirehoseSubscription::new(
            source,
            Arc::clone(&self.router),
            self.ctx.config.subscription.clone(),
            self.shutdown.clone(),
        );
        let handle = thread::Builder::new()
            .name("firehose".into())
            .spawn(move || subscription.run())?;
        self.subscription = Some(handle);
        Ok(())
    }

    /// Whether the stream consumer thread has exited on its own.
    pub fn subscription_finished(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Stop consuming, drain in-flight jobs, and flush the store.
    ///
    /// Returns the subscription's final stats, or its error if it gave up.
    pub fn shutdown(mut self) -> Result<Option<SubscriptionStats>> {
        tracing::info!("shutting down feed generator");
        self.shutdown.trigger();

        let stats = match self.subscription.take() {
            Some(handle) => match handle.join() {
                Ok(result) => Some(result?),
                Err(_) => {
                    return Err(FeedError::Connection(
                        "subscription thread panicked".into(),
                    ))
                }
            },
            None => None,
        };

        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        self.ctx.store.sync()?;
        Ok(stats)
    }
}

impl Drop for FeedGenerator {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
