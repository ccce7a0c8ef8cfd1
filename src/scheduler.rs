//! # Periodic Flush Scheduler
//!
//! Runs [`ReinforcementStore::process_batches`] on a fixed interval, for hosts
//! that keep the store in batch mode.
//!
//! ```text
//! ┌──────────────────────┐  FlushNow / Shutdown  ┌───────────────────────────┐
//! │ FlushSchedulerHandle │ ────────────────────► │ citadel-flush thread      │
//! └──────────────────────┘        (mpsc)         │  current-thread runtime   │
//!                                                │  interval tick ──► flush  │
//!                                                │  store.lock()             │
//!                                                └───────────────────────────┘
//! ```
//!
//! The store is shared as `Arc<Mutex<_>>`; the scheduler holds the lock only
//! while a flush runs. Shutdown performs one last flush before the thread
//! exits.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::store::ReinforcementStore;
use crate::writer::FlushReport;

/// Default time between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const REQUEST_CHANNEL_SIZE: usize = 16;

/// A store shared between its owning thread and the scheduler.
pub type SharedStore = Arc<Mutex<ReinforcementStore>>;

/// Settings for [`spawn_flush_scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

enum SchedulerRequest {
    FlushNow(oneshot::Sender<Result<FlushReport>>),
    Shutdown(oneshot::Sender<Result<FlushReport>>),
}

/// Handle to a running flush scheduler.
#[derive(Clone)]
pub struct FlushSchedulerHandle {
    tx: mpsc::Sender<SchedulerRequest>,
}

impl FlushSchedulerHandle {
    /// Flushes right away instead of waiting for the next tick.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerRequest::FlushNow(response_tx))
            .await
            .map_err(|_| Error::Schema("flush scheduler has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Schema("flush scheduler dropped response".to_string()))?
    }

    /// Stops the scheduler after one final flush, returning that flush's result.
    pub async fn shutdown(self) -> Result<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerRequest::Shutdown(response_tx))
            .await
            .map_err(|_| Error::Schema("flush scheduler has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Schema("flush scheduler dropped response".to_string()))?
    }

    /// [`shutdown`](Self::shutdown) for callers outside an async runtime.
    ///
    /// Must not be called from within a tokio runtime.
    pub fn shutdown_blocking(self) -> Result<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .blocking_send(SchedulerRequest::Shutdown(response_tx))
            .map_err(|_| Error::Schema("flush scheduler has shut down".to_string()))?;

        response_rx
            .blocking_recv()
            .map_err(|_| Error::Schema("flush scheduler dropped response".to_string()))?
    }
}

fn flush(store: &SharedStore) -> Result<FlushReport> {
    // A panic elsewhere while holding the lock leaves the queues intact
    let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
    guard.process_batches()
}

/// Runs the scheduler loop until shutdown or until every handle is dropped.
async fn run_flush_scheduler(
    store: SharedStore,
    mut rx: mpsc::Receiver<SchedulerRequest>,
    config: SchedulerConfig,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match flush(&store) {
                    Ok(report) if report.total() > 0 => {
                        debug!(
                            deleted = report.deleted,
                            inserted = report.inserted,
                            updated = report.updated,
                            "periodic flush"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "periodic flush failed, mutations stay queued"),
                }
            }
            request = rx.recv() => match request {
                Some(SchedulerRequest::FlushNow(response)) => {
                    let _ = response.send(flush(&store));
                }
                Some(SchedulerRequest::Shutdown(response)) => {
                    let _ = response.send(flush(&store));
                    break;
                }
                None => {
                    if let Err(e) = flush(&store) {
                        error!(error = %e, "final flush failed");
                    }
                    break;
                }
            },
        }
    }

    info!("flush scheduler stopped");
}

/// Starts a flush scheduler on a dedicated thread.
pub fn spawn_flush_scheduler(store: SharedStore, config: SchedulerConfig) -> Result<FlushSchedulerHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let interval_ms = config.interval.as_millis() as u64;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::Schema(format!("failed to create flush scheduler runtime: {e}")))?;

    std::thread::Builder::new()
        .name("citadel-flush".to_string())
        .spawn(move || runtime.block_on(run_flush_scheduler(store, rx, config)))
        .map_err(|e| Error::Schema(format!("failed to spawn flush scheduler thread: {e}")))?;

    info!(interval_ms, "flush scheduler started");
    Ok(FlushSchedulerHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================
