//! Record store contract.
//!
//! The core needs exactly one mutation primitive from the store: an atomic
//! conditional update that applies a set of assignments to one entry only if
//! a guard over its current fields holds at the instant of the write, and
//! reports how many rows changed. Callers never compose read-decide-write.
//!
//! Guards are data rather than closures so that a SQL backend can render them
//! into the `WHERE` clause of a single `UPDATE`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Entry, EntryId, Lease, NewEntry, Page, Status, WorkerId};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Predicate on the lease columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGuard {
    /// `locked_by IS NULL OR locked_at < stale_before`
    Claimable { stale_before: DateTime<Utc> },
    /// `locked_by = worker`
    HeldBy(WorkerId),
}

/// Predicate evaluated atomically with a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub lease: LeaseGuard,
    /// `status = s`
    pub status: Option<Status>,
    /// `status NOT IN ('COMPLETED', 'FAILED')`
    pub unfinished: bool,
}

impl Guard {
    pub fn claimable(stale_before: DateTime<Utc>) -> Self {
        Self {
            lease: LeaseGuard::Claimable { stale_before },
            status: None,
            unfinished: false,
        }
    }

    pub fn held_by(worker: &WorkerId) -> Self {
        Self {
            lease: LeaseGuard::HeldBy(worker.clone()),
            status: None,
            unfinished: false,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn unfinished(mut self) -> Self {
        self.unfinished = true;
        self
    }

    /// Evaluate against an in-memory entry.
    pub fn matches(&self, entry: &Entry) -> bool {
        let lease_ok = match &self.lease {
            LeaseGuard::Claimable { stale_before } => entry.lease.is_claimable(*stale_before),
            LeaseGuard::HeldBy(worker) => entry.lease.holder() == Some(worker),
        };
        lease_ok
            && self.status.is_none_or(|s| entry.status == s)
            && !(self.unfinished && entry.status.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Field assignments applied by a conditional update. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignments {
    pub status: Option<Status>,
    pub progress: Option<i32>,
    pub result: Option<String>,
    pub lease: Option<Lease>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Apply to an in-memory entry, bumping `updated_at`.
    pub fn apply(&self, entry: &mut Entry, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(progress) = self.progress {
            entry.progress = progress;
        }
        if let Some(ref result) = self.result {
            entry.result = Some(result.clone());
        }
        if let Some(ref lease) = self.lease {
            entry.lease = lease.clone();
        }
        entry.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Durable storage for entries.
///
/// Implementations must make `conditional_update` a single indivisible
/// operation: the guard is evaluated and the assignments applied with no
/// other writer able to interleave.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply `set` to entry `id` iff `guard` holds. Returns rows changed (0 or 1).
    async fn conditional_update(&self, id: EntryId, guard: &Guard, set: &Assignments)
    -> Result<u64>;

    /// Current state of an entry, or `None` if it does not exist.
    async fn read(&self, id: EntryId) -> Result<Option<Entry>>;

    /// Create an entry in `CREATED`, progress 0, unleased.
    async fn insert(&self, new: NewEntry) -> Result<Entry>;

    /// Page through entries, newest first. `limit` is clamped to 1..=100.
    async fn list(&self, limit: Option<i64>, offset: i64) -> Result<Page>;

    /// Non-terminal entries with no lease or a lease acquired before
    /// `stale_before`, oldest first.
    async fn list_unfinished(&self, stale_before: DateTime<Utc>, limit: i64)
    -> Result<Vec<EntryId>>;

    /// Like [`read`](Self::read), but a missing entry is an error.
    async fn get(&self, id: EntryId) -> Result<Entry> {
        self.read(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))
    }
}
