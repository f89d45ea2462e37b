//! Core data model.
//!
//! An entry is a unit of work advanced through a fixed sequence of stages.
//! It carries its lifecycle status, a progress percentage, an optional result,
//! and the lease that arbitrates which worker may mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A tracked work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier, assigned at creation.
    pub id: EntryId,

    /// Display string, immutable after creation.
    pub title: String,

    /// Current lifecycle status.
    pub status: Status,

    /// Percentage complete. Never decreases; frozen on failure.
    pub progress: i32,

    /// Success payload on `COMPLETED`, error description on `FAILED`.
    pub result: Option<String>,

    /// Which worker, if any, currently holds the lease.
    pub lease: Lease,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for entry IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(EntryId)
            .map_err(|e| Error::InvalidInput(format!("bad entry id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Identity of a lease holder. Must be unique per worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh identity for this process: `worker-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created, no stage applied yet.
    Created,
    #[serde(rename = "STAGE_1")]
    Stage1,
    #[serde(rename = "STAGE_2")]
    Stage2,
    /// Done successfully. Terminal.
    Completed,
    /// Stage work or the store failed. Terminal.
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Created,
        Status::Stage1,
        Status::Stage2,
        Status::Completed,
        Status::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Created, Stage1)
                | (Stage1, Stage2)
                | (Stage2, Completed)
                | (Created, Failed)
                | (Stage1, Failed)
                | (Stage2, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Stage1 => "STAGE_1",
            Status::Stage2 => "STAGE_2",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Corrupt(format!("unknown status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive, time-bounded permission to mutate one entry.
///
/// Persisted as two nullable columns (`locked_by`, `locked_at`); this type
/// makes a half-set pair unrepresentable in application code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lease {
    #[default]
    Unleased,
    LeasedBy {
        worker: WorkerId,
        since: DateTime<Utc>,
    },
}

impl Lease {
    /// Rebuild a lease from its persisted column pair.
    pub fn from_columns(
        locked_by: Option<String>,
        locked_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        match (locked_by, locked_at) {
            (None, None) => Ok(Lease::Unleased),
            (Some(worker), Some(since)) => Ok(Lease::LeasedBy {
                worker: WorkerId(worker),
                since,
            }),
            (by, at) => Err(Error::Corrupt(format!(
                "half-set lease: locked_by={by:?}, locked_at={at:?}"
            ))),
        }
    }

    /// Split into the persisted column pair.
    pub fn to_columns(&self) -> (Option<&str>, Option<DateTime<Utc>>) {
        match self {
            Lease::Unleased => (None, None),
            Lease::LeasedBy { worker, since } => (Some(worker.as_str()), Some(*since)),
        }
    }

    pub fn holder(&self) -> Option<&WorkerId> {
        match self {
            Lease::Unleased => None,
            Lease::LeasedBy { worker, .. } => Some(worker),
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self, Lease::LeasedBy { .. })
    }

    /// Absent, or acquired before `stale_before`.
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self {
            Lease::Unleased => true,
            Lease::LeasedBy { since, .. } => *since < stale_before,
        }
    }
}

// ---------------------------------------------------------------------------
// Creation + listing
// ---------------------------------------------------------------------------

/// Validated input for creating an entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub(crate) title: String,
}

impl NewEntry {
    /// Trim the title; reject it if nothing is left.
    pub fn new(title: impl AsRef<str>) -> Result<Self> {
        let title = title.as_ref().trim();
        if title.is_empty() {
            return Err(Error::InvalidInput("title is required".to_string()));
        }
        Ok(Self {
            title: title.to_string(),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// One page of entries, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub entries: Vec<Entry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Apply the default and upper bound to a requested page size.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_and_failure_escape() {
        assert!(Status::Created.can_transition_to(Status::Stage1));
        assert!(Status::Stage1.can_transition_to(Status::Stage2));
        assert!(Status::Stage2.can_transition_to(Status::Completed));
        for from in [Status::Created, Status::Stage1, Status::Stage2] {
            assert!(from.can_transition_to(Status::Failed));
        }
    }

    #[test]
    fn no_skips_backwards_or_exits_from_terminal() {
        assert!(!Status::Created.can_transition_to(Status::Stage2));
        assert!(!Status::Created.can_transition_to(Status::Completed));
        assert!(!Status::Stage2.can_transition_to(Status::Stage1));
        for to in Status::ALL {
            assert!(!Status::Completed.can_transition_to(to));
            assert!(!Status::Failed.can_transition_to(to));
        }
    }

    #[test]
    fn status_round_trips_through_its_column_name() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("stage_1".parse::<Status>().is_err());
        assert_eq!(
            serde_json::to_string(&Status::Stage1).unwrap(),
            "\"STAGE_1\""
        );
    }

    #[test]
    fn half_set_lease_is_rejected() {
        let now = Utc::now();
        assert!(matches!(
            Lease::from_columns(Some("w".into()), None),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            Lease::from_columns(None, Some(now)),
            Err(Error::Corrupt(_))
        ));
        assert_eq!(Lease::from_columns(None, None).unwrap(), Lease::Unleased);
    }

    #[test]
    fn stale_lease_is_claimable() {
        let now = Utc::now();
        let lease = Lease::LeasedBy {
            worker: WorkerId::new("old"),
            since: now - chrono::Duration::seconds(10),
        };
        assert!(lease.is_claimable(now - chrono::Duration::seconds(5)));
        assert!(!lease.is_claimable(now - chrono::Duration::seconds(20)));
    }

    #[test]
    fn title_is_trimmed_and_required() {
        assert_eq!(NewEntry::new("  demo ").unwrap().title(), "demo");
        assert!(NewEntry::new("   ").is_err());
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(500)), 100);
        assert_eq!(clamp_limit(Some(0)), 1);
    }
}
