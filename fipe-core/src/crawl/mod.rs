mod engine;
mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::checkpoint::{CheckpointError, JsonCheckpointStore};
use crate::config::CrawlerConfig;
use crate::driver::DriverError;
use crate::retry::{Pacer, RetryPolicy};
use crate::sink::{RecordSink, SinkError};

pub use engine::{EntryOutcome, TraversalEngine};
pub use scheduler::{CrawlSummary, EntryFailure, Scheduler, SessionFactory};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

pub type CrawlResult<T> = Result<T, CrawlError>;

/// Cooperative cancellation: workers and engines finish the unit they are
/// on and stop dequeuing. Already-persisted work is never affected.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a crawl shares across workers, built once and passed into
/// the scheduler. The checkpoint store and the sink are the only mutable
/// shared state; both serialize their own writes.
pub struct RunContext {
    pub checkpoint: Arc<JsonCheckpointStore>,
    pub sink: Arc<dyn RecordSink>,
    pub retry: RetryPolicy,
    pub pacer: Pacer,
    pub stop: StopHandle,
    pub max_models: Option<usize>,
    pub max_years: Option<usize>,
    pub result_timeout: Duration,
}

impl RunContext {
    pub fn new(
        config: &CrawlerConfig,
        checkpoint: Arc<JsonCheckpointStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            checkpoint,
            sink,
            retry: RetryPolicy::new(config.retry.clone()),
            pacer: Pacer::new(&config.pacing),
            stop: StopHandle::new(),
            max_models: config.crawl.max_models,
            max_years: config.crawl.max_years,
            result_timeout: Duration::from_secs(config.portal.result_timeout_secs),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}
