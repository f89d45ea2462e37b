//! Entry operations on Postgres.
//!
//! `conditional_update` renders the guard into the `WHERE` clause of one
//! `UPDATE` statement, so Postgres' row lock makes check-and-write atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Entry, EntryId, Lease, NewEntry, Page, clamp_limit};
use crate::store::{Assignments, Guard, LeaseGuard, RecordStore};
use crate::telemetry::metrics;

const ENTRY_COLUMNS: &str =
    "id, title, status, progress, result, locked_by, locked_at, created_at, updated_at";

/// Append `SET` clauses for every assigned field.
fn push_assignments(qb: &mut QueryBuilder<'_, Postgres>, set: &Assignments) {
    qb.push("UPDATE entries SET updated_at = now()");
    if let Some(status) = set.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(progress) = set.progress {
        qb.push(", progress = ").push_bind(progress);
    }
    if let Some(ref result) = set.result {
        qb.push(", result = ").push_bind(result.clone());
    }
    if let Some(ref lease) = set.lease {
        let (locked_by, locked_at) = lease.to_columns();
        qb.push(", locked_by = ")
            .push_bind(locked_by.map(str::to_string))
            .push(", locked_at = ")
            .push_bind(locked_at);
    }
}

/// Append the guard as `AND` clauses after `WHERE id = ...`.
fn push_guard(qb: &mut QueryBuilder<'_, Postgres>, guard: &Guard) {
    match &guard.lease {
        LeaseGuard::Claimable { stale_before } => {
            qb.push(" AND (locked_by IS NULL OR locked_at < ")
                .push_bind(*stale_before)
                .push(")");
        }
        LeaseGuard::HeldBy(worker) => {
            qb.push(" AND locked_by = ")
                .push_bind(worker.as_str().to_string());
        }
    }
    if let Some(status) = guard.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if guard.unfinished {
        qb.push(" AND status NOT IN ('COMPLETED', 'FAILED')");
    }
}

#[async_trait]
impl RecordStore for super::Db {
    async fn conditional_update(
        &self,
        id: EntryId,
        guard: &Guard,
        set: &Assignments,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_assignments(&mut qb, set);
        qb.push(" WHERE id = ").push_bind(id.0);
        push_guard(&mut qb, guard);

        let rows_affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(rows_affected)
    }

    async fn read(&self, id: EntryId) -> Result<Option<Entry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EntryRow::try_into_entry).transpose()
    }

    async fn insert(&self, new: NewEntry) -> Result<Entry> {
        let row: EntryRow = sqlx::query_as(&format!(
            "INSERT INTO entries (id, title, status, progress, created_at, updated_at)
             VALUES ($1, $2, 'CREATED', 0, now(), now())
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.title)
        .fetch_one(&self.pool)
        .await?;

        metrics::entries_created().add(1, &[]);
        row.try_into_entry()
    }

    async fn list(&self, limit: Option<i64>, offset: i64) -> Result<Page> {
        let limit = clamp_limit(limit);
        let offset = offset.max(0);

        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;

        Ok(Page {
            entries: rows
                .into_iter()
                .map(EntryRow::try_into_entry)
                .collect::<Result<_>>()?,
            total: total.0,
            limit,
            offset,
        })
    }

    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EntryId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM entries
             WHERE status NOT IN ('COMPLETED', 'FAILED')
             AND (locked_by IS NULL OR locked_at < $1)
             ORDER BY created_at ASC
             LIMIT $2",
        )
        .bind(stale_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| EntryId(id)).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    title: String,
    status: String,
    progress: i32,
    result: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntryRow {
    fn try_into_entry(self) -> Result<Entry> {
        Ok(Entry {
            id: EntryId(self.id),
            title: self.title,
            status: self.status.parse()?,
            progress: self.progress,
            result: self.result,
            lease: Lease::from_columns(self.locked_by, self.locked_at)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
