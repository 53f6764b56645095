use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::driver::{DriverResult, PortalSessionFactory, UiDriver};

use super::engine::{EntryOutcome, TraversalEngine};
use super::RunContext;

/// A worker that cannot obtain a session this many times in a row stops
/// pulling work; the remaining workers drain the queue.
const MAX_SESSION_FAILURES: usize = 3;

/// Produces one isolated UI session per request. Sessions must not share
/// mutable UI state: a selection in one must never affect another.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> DriverResult<Box<dyn UiDriver>>;
}

#[async_trait]
impl SessionFactory for PortalSessionFactory {
    async fn create(&self) -> DriverResult<Box<dyn UiDriver>> {
        Ok(Box::new(self.open_session().await?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub brand: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CrawlSummary {
    pub entries_total: usize,
    pub entries_completed: usize,
    pub entries_fast_skipped: usize,
    pub entries_failed: usize,
    pub entries_remaining: usize,
    pub records_appended: usize,
    pub duplicates: usize,
    pub models_skipped: usize,
    pub leaves_skipped: usize,
    pub catalog_drifts: usize,
    pub stopped: bool,
    pub duration_secs: u64,
    pub failures: Vec<EntryFailure>,
    pub outcomes: Vec<EntryOutcome>,
}

/// Distributes top-level entries across a bounded pool of workers through
/// one shared FIFO queue. No static partitioning: an idle worker picks up
/// whatever is next, so slow entries do not strand work.
pub struct Scheduler {
    factory: Arc<dyn SessionFactory>,
    ctx: Arc<RunContext>,
}

struct WorkerShared {
    queue: Mutex<VecDeque<String>>,
    outcomes: Mutex<Vec<EntryOutcome>>,
    failures: Mutex<Vec<EntryFailure>>,
}

impl Scheduler {
    pub fn new(factory: Arc<dyn SessionFactory>, ctx: Arc<RunContext>) -> Self {
        Self { factory, ctx }
    }

    pub async fn run(&self, entries: Vec<String>, concurrency: usize) -> CrawlSummary {
        let started = Instant::now();
        let entries_total = entries.len();
        let concurrency = concurrency.max(1).min(entries_total.max(1));
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(VecDeque::from(entries)),
            outcomes: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        });

        info!(entries = entries_total, concurrency, "starting crawl");
        let mut handles = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let factory = Arc::clone(&self.factory);
            let ctx = Arc::clone(&self.ctx);
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, factory, ctx, shared).await;
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task join error");
            }
        }

        let stopped = self.ctx.stop.is_stop_requested();
        let entries_remaining = shared.queue.lock().unwrap().len();
        let outcomes = std::mem::take(&mut *shared.outcomes.lock().unwrap());
        let failures = std::mem::take(&mut *shared.failures.lock().unwrap());

        let mut summary = CrawlSummary {
            entries_total,
            entries_remaining,
            entries_failed: failures.len(),
            stopped,
            duration_secs: started.elapsed().as_secs(),
            failures,
            ..Default::default()
        };
        for outcome in &outcomes {
            if outcome.fast_skipped {
                summary.entries_fast_skipped += 1;
            } else if outcome.entry_done {
                summary.entries_completed += 1;
            }
            summary.records_appended += outcome.records_appended;
            summary.duplicates += outcome.duplicates;
            summary.models_skipped += outcome.models_skipped;
            summary.leaves_skipped += outcome.leaves_skipped;
            if outcome.catalog_drift {
                summary.catalog_drifts += 1;
            }
        }
        summary.outcomes = outcomes;
        info!(
            completed = summary.entries_completed,
            fast_skipped = summary.entries_fast_skipped,
            failed = summary.entries_failed,
            remaining = summary.entries_remaining,
            records = summary.records_appended,
            stopped = summary.stopped,
            duration = summary.duration_secs,
            "crawl finished"
        );
        summary
    }
}

async fn worker_loop(
    worker_id: usize,
    factory: Arc<dyn SessionFactory>,
    ctx: Arc<RunContext>,
    shared: Arc<WorkerShared>,
) {
    let mut session_failures = 0usize;
    loop {
        if ctx.stop.is_stop_requested() {
            info!(worker_id, "stop requested, worker exiting");
            break;
        }
        // Non-blocking dequeue: an empty queue ends the worker.
        let Some(brand) = shared.queue.lock().unwrap().pop_front() else {
            break;
        };

        let driver = match factory.create().await {
            Ok(driver) => {
                session_failures = 0;
                driver
            }
            Err(err) => {
                session_failures += 1;
                if session_failures >= MAX_SESSION_FAILURES {
                    // Put the entry back for a healthier worker.
                    shared.queue.lock().unwrap().push_front(brand);
                    error!(
                        worker_id,
                        failures = session_failures,
                        error = %err,
                        "retiring worker after repeated session failures"
                    );
                    break;
                }
                warn!(worker_id, brand = %brand, error = %err, "session creation failed, entry abandoned");
                shared.failures.lock().unwrap().push(EntryFailure {
                    brand,
                    error: err.to_string(),
                });
                continue;
            }
        };

        let mut engine = TraversalEngine::new(driver, Arc::clone(&ctx));
        match engine.run_entry(&brand).await {
            Ok(outcome) => {
                shared.outcomes.lock().unwrap().push(outcome);
            }
            Err(err) => {
                // The entry is abandoned, never marked complete; the
                // worker itself survives and takes the next item.
                warn!(worker_id, brand = %brand, error = %err, "entry failed");
                shared.failures.lock().unwrap().push(EntryFailure {
                    brand,
                    error: err.to_string(),
                });
            }
        }

        ctx.pacer.between_entries().await;
    }
}
