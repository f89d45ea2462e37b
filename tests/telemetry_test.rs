//! Telemetry configuration, resource attributes, and entry span events.

use std::sync::{Arc, Mutex};

use entryflow::config::Config;
use entryflow::error::Error;
use entryflow::model::{EntryId, WorkerId};
use entryflow::telemetry::{TelemetryConfig, WORKER_ATTRIBUTE, entry, init_telemetry, metrics};
use opentelemetry::{Key, Value};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt as _};
use tracing_subscriber::Layer;

fn telemetry_config(log_level: &str) -> TelemetryConfig {
    TelemetryConfig {
        endpoint: None,
        service_name: "entryflow-test".to_string(),
        worker: Some("node-a".to_string()),
        log_level: log_level.to_string(),
    }
}

#[test]
fn config_carries_worker_identity_and_log_level() {
    let config = Config::from_lookup(|name| match name {
        "WORKER_ID" => Some("node-b".to_string()),
        "LOG_LEVEL" => Some("entryflow=debug".to_string()),
        "OTEL_ENDPOINT" => Some("http://collector:4317".to_string()),
        _ => None,
    })
    .unwrap();

    let telemetry = TelemetryConfig::from_config(&config);
    assert_eq!(telemetry.service_name, "entryflow");
    assert_eq!(telemetry.worker.as_deref(), Some("node-b"));
    assert_eq!(telemetry.log_level, "entryflow=debug");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://collector:4317"));
}

#[test]
fn resource_names_service_and_worker() {
    let resource = telemetry_config("info").resource();
    assert_eq!(
        resource.get(&Key::new("service.name")),
        Some(Value::from("entryflow-test"))
    );
    assert_eq!(
        resource.get(&Key::new(WORKER_ATTRIBUTE)),
        Some(Value::from("node-a"))
    );
}

#[test]
fn malformed_log_level_is_a_config_error() {
    assert!(telemetry_config("entryflow=debug,sqlx=warn").log_filter().is_ok());
    let err = telemetry_config("entryflow=loud").log_filter().unwrap_err();
    assert!(matches!(err, Error::Config(ref msg) if msg.contains("LOG_LEVEL")));
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process; this is
    // the only test in this binary that tries.
    let guard = init_telemetry(telemetry_config("info")).unwrap();
    assert!(!guard.is_exporting());
    guard.force_flush();
}

#[test]
fn stage_duration_buckets_are_ascending() {
    let buckets = metrics::STAGE_DURATION_BUCKETS_MS;
    assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    // Default simulated stage (2 s) lands in a bounded bucket.
    assert!(buckets.iter().any(|&b| b >= 2_000.0));
    metrics::stage_duration_ms().record(12.5, &[]);
}

/// Collects `state_transition` events as `(from, to)` pairs.
#[derive(Clone, Default)]
struct Transitions(Arc<Mutex<Vec<(String, String)>>>);

#[derive(Default)]
struct FromTo {
    message: String,
    from: String,
    to: String,
}

impl Visit for FromTo {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "from" => self.from = value.to_string(),
            "to" => self.to = value.to_string(),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for Transitions {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FromTo::default();
        event.record(&mut fields);
        if fields.message == "state_transition" {
            self.0.lock().unwrap().push((fields.from, fields.to));
        }
    }
}

#[test]
fn entry_span_emits_state_transition_events() {
    let seen = Transitions::default();
    let subscriber = tracing_subscriber::registry().with(seen.clone());

    tracing::subscriber::with_default(subscriber, || {
        let span = entry::start_entry_span(&EntryId::new(), &WorkerId::new("w1"));
        entry::record_state_transition(&span, "CREATED", "STAGE_1");
        entry::record_state_transition(&span, "STAGE_1", "FAILED");
    });

    assert_eq!(
        *seen.0.lock().unwrap(),
        vec![
            ("CREATED".to_string(), "STAGE_1".to_string()),
            ("STAGE_1".to_string(), "FAILED".to_string()),
        ]
    );
}
