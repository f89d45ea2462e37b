//! In-process record store.
//!
//! One mutex guards the whole table, so every conditional update is atomic
//! with respect to every other. Used by tests and the in-memory demo.
//! Also keeps a per-entry history of `(status, progress)` after every write
//! that changed a row, and can be switched into an unavailable mode to
//! exercise store-failure paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Assignments, Guard, RecordStore};
use crate::error::{Error, Result};
use crate::model::{Entry, EntryId, Lease, NewEntry, Page, Status, clamp_limit};
use crate::telemetry::metrics;

#[derive(Default)]
struct Table {
    rows: HashMap<EntryId, Entry>,
    history: HashMap<EntryId, Vec<(Status, i32)>>,
}

/// Mutex-backed [`RecordStore`].
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows changed by conditional updates since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every `(status, progress)` the entry has had, starting at creation.
    pub fn history(&self, id: EntryId) -> Vec<(Status, i32)> {
        self.lock()
            .map(|t| t.history.get(&id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// While set, every operation fails with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite an entry's lease directly, bypassing guards.
    ///
    /// Only for simulating crashed workers in tests.
    pub fn force_lease(&self, id: EntryId, lease: Lease) -> Result<()> {
        let mut table = self.lock()?;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        row.lease = lease;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Table>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        self.table
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn conditional_update(
        &self,
        id: EntryId,
        guard: &Guard,
        set: &Assignments,
    ) -> Result<u64> {
        let mut table = self.lock()?;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(0);
        };
        if !guard.matches(row) {
            return Ok(0);
        }

        let before = (row.status, row.progress);
        set.apply(row, Utc::now());
        let after = (row.status, row.progress);
        if before != after {
            table.history.entry(id).or_default().push(after);
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn read(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    async fn insert(&self, new: NewEntry) -> Result<Entry> {
        let now = Utc::now();
        let entry = Entry {
            id: EntryId::new(),
            title: new.title,
            status: Status::Created,
            progress: 0,
            result: None,
            lease: Lease::Unleased,
            created_at: now,
            updated_at: now,
        };

        let mut table = self.lock()?;
        table.rows.insert(entry.id, entry.clone());
        table
            .history
            .insert(entry.id, vec![(entry.status, entry.progress)]);
        metrics::entries_created().add(1, &[]);
        Ok(entry)
    }

    async fn list(&self, limit: Option<i64>, offset: i64) -> Result<Page> {
        let limit = clamp_limit(limit);
        let offset = offset.max(0);
        let table = self.lock()?;

        let mut entries: Vec<Entry> = table.rows.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = entries.len() as i64;
        let entries = entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();

        Ok(Page {
            entries,
            total,
            limit,
            offset,
        })
    }

    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EntryId>> {
        let table = self.lock()?;
        let mut candidates: Vec<&Entry> = table
            .rows
            .values()
            .filter(|e| !e.status.is_terminal() && e.lease.is_claimable(stale_before))
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerId;

    #[tokio::test]
    async fn update_on_missing_entry_changes_nothing() {
        let store = MemoryStore::new();
        let changed = store
            .conditional_update(
                EntryId::new(),
                &Guard::claimable(Utc::now()),
                &Assignments::new().progress(33),
            )
            .await
            .unwrap();
        assert_eq!(changed, 0);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        let entry = store.insert(NewEntry::new("x").unwrap()).await.unwrap();
        store.set_unavailable(true);
        assert!(matches!(
            store.read(entry.id).await,
            Err(Error::StoreUnavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.read(entry.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_unfinished_skips_terminal_and_live_leases() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let free = store.insert(NewEntry::new("free").unwrap()).await.unwrap();
        let live = store.insert(NewEntry::new("live").unwrap()).await.unwrap();
        let done = store.insert(NewEntry::new("done").unwrap()).await.unwrap();

        store
            .force_lease(
                live.id,
                Lease::LeasedBy {
                    worker: WorkerId::new("w"),
                    since: now,
                },
            )
            .unwrap();
        store
            .conditional_update(
                done.id,
                &Guard::claimable(now),
                &Assignments::new().status(Status::Failed),
            )
            .await
            .unwrap();

        let ids = store
            .list_unfinished(now - chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![free.id]);
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .insert(NewEntry::new(format!("e{i}")).unwrap())
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let page = store.list(Some(2), 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].title, "e2");

        let rest = store.list(Some(2), 2).await.unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].title, "e0");
    }
}
