//! # entryflow
//!
//! Lease-based stage advancement for background-processed entries.
//!
//! Workers advance each entry through a fixed plan of stages. Exclusive,
//! time-bounded ownership of an entry is taken with a single atomic
//! conditional update on the record store, so duplicate dispatch, several
//! worker processes, and crashed workers are all safe. Postgres (sqlx) and
//! in-memory stores are provided, with OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod model;
pub mod plan;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod telemetry;
