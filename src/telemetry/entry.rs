//! Entry run span helpers.
//!
//! Provides span creation and state-transition recording for entries
//! flowing through the scheduler.

use tracing::Span;

use crate::model::{EntryId, WorkerId};

/// Start a span for one scheduler run over an entry.
///
/// The `entry.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_entry_span(entry_id: &EntryId, worker: &WorkerId) -> Span {
    tracing::info_span!(
        "entry.run",
        "entry.id" = %entry_id,
        "entry.worker" = %worker,
        "entry.status" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and updates its
/// `entry.status` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("entry.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
