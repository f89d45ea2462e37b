//! Lease acquisition and release.
//!
//! A lease is the `(locked_by, locked_at)` pair on an entry. It is acquired
//! with one conditional update whose guard is "unleased or stale", so the
//! staleness check and the acquisition happen in the same atomic write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{EntryId, Lease, Status, WorkerId};
use crate::store::{Assignments, Guard, RecordStore};
use crate::telemetry::metrics;

/// Acquires and releases leases on behalf of one worker.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn RecordStore>,
    worker: WorkerId,
    timeout: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn RecordStore>, worker: WorkerId, timeout: Duration) -> Self {
        Self {
            store,
            worker,
            timeout,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Leases acquired before this instant are stale.
    pub fn stale_before(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| Error::Config(format!("lease timeout out of range: {e}")))?;
        now.checked_sub_signed(timeout).ok_or_else(|| {
            Error::Config(format!("lease timeout {:?} reaches before {now}", self.timeout))
        })
    }

    /// Try to acquire the lease. Returns false if another live lease exists.
    pub async fn claim(&self, id: EntryId, now: DateTime<Utc>) -> Result<bool> {
        let guard = Guard::claimable(self.stale_before(now)?);
        self.try_claim(id, guard, now).await
    }

    /// Like [`claim`](Self::claim), but only while the entry is in `expected`.
    pub async fn claim_from(
        &self,
        id: EntryId,
        expected: Status,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let guard = Guard::claimable(self.stale_before(now)?).with_status(expected);
        self.try_claim(id, guard, now).await
    }

    async fn try_claim(&self, id: EntryId, guard: Guard, now: DateTime<Utc>) -> Result<bool> {
        let set = Assignments::new().lease(Lease::LeasedBy {
            worker: self.worker.clone(),
            since: now,
        });
        let acquired = self.store.conditional_update(id, &guard, &set).await? == 1;

        metrics::lease_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if acquired { "acquired" } else { "contended" },
            )],
        );
        debug!(entry_id = %id, worker = %self.worker, acquired, "lease claim");
        Ok(acquired)
    }

    /// Release the lease if this worker still holds it.
    ///
    /// Losing the lease first (timed out and reclaimed) is expected under
    /// contention and is not an error.
    pub async fn release(&self, id: EntryId) -> Result<()> {
        let changed = self
            .store
            .conditional_update(
                id,
                &Guard::held_by(&self.worker),
                &Assignments::new().lease(Lease::Unleased),
            )
            .await?;
        if changed == 0 {
            debug!(entry_id = %id, worker = %self.worker, "lease already lost before release");
        }
        Ok(())
    }
}
