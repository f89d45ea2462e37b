//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lease::LeaseManager;
use crate::model::WorkerId;
use crate::plan::StagePlan;
use crate::scheduler::{ContentionPolicy, EntryScheduler};
use crate::stage::SimulatedStage;
use crate::store::RecordStore;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Unique per process; generated when `WORKER_ID` is unset.
    pub worker_id: WorkerId,
    pub lease_timeout: Duration,
    pub stage_delay: Duration,
    pub claim_policy: ContentionPolicy,
    pub stage_plan: Option<PathBuf>,
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let claim_poll = Duration::from_millis(parse_var(&var, "CLAIM_POLL_MS", 500)?);
        let claim_policy = match var("CLAIM_POLICY").as_deref() {
            None | Some("skip") => ContentionPolicy::SkipForward,
            Some("retry") => ContentionPolicy::RetryClaim {
                poll_interval: claim_poll,
            },
            Some(other) => {
                return Err(Error::Config(format!(
                    "CLAIM_POLICY must be \"skip\" or \"retry\", got {other:?}"
                )));
            }
        };

        Ok(Self {
            database_url: var("DATABASE_URL").map(SecretString::from),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            worker_id: var("WORKER_ID")
                .map(WorkerId::new)
                .unwrap_or_else(WorkerId::generate),
            lease_timeout: lease_timeout(parse_var(&var, "LEASE_TIMEOUT_SECS", 120)?)?,
            stage_delay: Duration::from_millis(parse_var(&var, "STAGE_DELAY_MS", 2000)?),
            claim_policy,
            stage_plan: var("STAGE_PLAN").map(PathBuf::from),
            sweep_interval: Duration::from_secs(parse_var(&var, "SWEEP_INTERVAL_SECS", 30)?),
        })
    }

    /// The database URL, required by every Postgres-backed command.
    pub fn database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }

    /// The configured stage plan, or the default three-stage plan.
    pub fn stage_plan(&self) -> Result<StagePlan> {
        match self.stage_plan {
            Some(ref path) => StagePlan::load(path),
            None => Ok(StagePlan::default()),
        }
    }

    /// Wire a scheduler over `store` with the simulated stage processor.
    pub fn build_scheduler(&self, store: Arc<dyn RecordStore>) -> Result<EntryScheduler> {
        let leases = LeaseManager::new(store, self.worker_id.clone(), self.lease_timeout);
        let processor = Arc::new(SimulatedStage::new(self.stage_delay));
        Ok(EntryScheduler::new(leases, processor, self.stage_plan()?).with_policy(self.claim_policy))
    }
}

/// Longest accepted lease timeout: one week.
pub const MAX_LEASE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn lease_timeout(secs: u64) -> Result<Duration> {
    if secs == 0 || secs > MAX_LEASE_TIMEOUT_SECS {
        return Err(Error::Config(format!(
            "LEASE_TIMEOUT_SECS must be within 1..={MAX_LEASE_TIMEOUT_SECS}, got {secs}"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
    }
}
