//! Dispatcher: fires scheduler runs in the background and sweeps for
//! abandoned entries.
//!
//! Dispatch is not exactly-once. The lease makes a duplicate run for the
//! same entry harmless, so both a creation-time dispatch and a later sweep
//! may target the same entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{Entry, EntryId, NewEntry};
use crate::scheduler::{EntryScheduler, RunReport};

/// Configuration for the sweep loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often to look for unfinished entries with no live lease.
    pub sweep_interval: Duration,
    /// Maximum entries re-dispatched per sweep.
    pub sweep_batch: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            sweep_batch: 100,
        }
    }
}

pub struct Dispatcher {
    scheduler: Arc<EntryScheduler>,
    config: DispatchConfig,
    shutdown: Arc<Notify>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Dispatcher {
    pub fn new(scheduler: Arc<EntryScheduler>, config: DispatchConfig) -> Self {
        Self {
            scheduler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Create an entry and start processing it in the background.
    ///
    /// Returns as soon as the entry is stored, along with the handle of its
    /// run. Processing failures are logged, not returned.
    pub async fn create(&self, new: NewEntry) -> Result<(Entry, JoinHandle<Option<RunReport>>)> {
        let entry = self.scheduler.leases().store().insert(new).await?;
        info!(entry_id = %entry.id, title = %entry.title, "entry created");
        let run = self.dispatch(entry.id);
        Ok((entry, run))
    }

    /// Start a scheduler run for `id` without waiting for it.
    ///
    /// A panicking run is logged here and never reaches the caller.
    pub fn dispatch(&self, id: EntryId) -> JoinHandle<Option<RunReport>> {
        let scheduler = Arc::clone(&self.scheduler);
        let run = tokio::spawn(async move { scheduler.run(id).await });

        tokio::spawn(async move {
            match run.await {
                Ok(report) => {
                    if let Some(ref e) = report.error {
                        warn!(entry_id = %id, error = %e, "background processing failed");
                    }
                    Some(report)
                }
                Err(e) => {
                    error!(entry_id = %id, "background processing aborted: {e}");
                    None
                }
            }
        })
    }

    /// Signal the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Dispatch every unfinished entry whose lease is absent or stale.
    /// Returns how many runs were started.
    pub async fn sweep(&self) -> Result<usize> {
        let stale_before = self.scheduler.leases().stale_before(Utc::now())?;
        let ids = self
            .scheduler
            .leases()
            .store()
            .list_unfinished(stale_before, self.config.sweep_batch)
            .await?;

        for id in &ids {
            debug!(entry_id = %id, "re-dispatching unfinished entry");
            self.dispatch(*id);
        }
        Ok(ids.len())
    }

    /// Sweep on an interval until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker = %self.scheduler.leases().worker(),
            interval_secs = self.config.sweep_interval.as_secs(),
            "dispatcher started"
        );

        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "re-dispatched unfinished entries"),
                Err(e) => error!("sweep error: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
        }
    }
}
