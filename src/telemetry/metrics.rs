//! Metric instrument factories for entryflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"entryflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for entryflow instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("entryflow")
}

/// Counter: number of entries created.
pub fn entries_created() -> Counter<u64> {
    meter()
        .u64_counter("entryflow.entries.created")
        .with_description("Number of entries created")
        .build()
}

/// Counter: lease claim attempts.
/// Labels: `result` ("acquired" | "contended").
pub fn lease_claims() -> Counter<u64> {
    meter()
        .u64_counter("entryflow.lease.claims")
        .with_description("Number of lease claim attempts")
        .build()
}

/// Counter: stage results discarded because the lease was lost mid-execution.
/// Labels: `stage`.
pub fn lease_lost() -> Counter<u64> {
    meter()
        .u64_counter("entryflow.lease.lost")
        .with_description("Stage writes rejected after the lease was lost")
        .build()
}

/// Counter: entry status transitions applied.
/// Labels: `from`, `to`.
pub fn entry_transitions() -> Counter<u64> {
    meter()
        .u64_counter("entryflow.entry.transitions")
        .with_description("Number of entry status transitions")
        .build()
}

/// Bucket bounds for stage durations. Simulated stages default to 2 s; real
/// stages are expected to stay well under the lease timeout.
pub const STAGE_DURATION_BUCKETS_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 30_000.0, 120_000.0,
];

/// Histogram: stage execution duration in milliseconds.
/// Labels: `stage`.
pub fn stage_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("entryflow.stage.duration_ms")
        .with_description("Stage execution duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(STAGE_DURATION_BUCKETS_MS.to_vec())
        .build()
}
