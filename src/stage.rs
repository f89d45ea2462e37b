//! Stage execution.
//!
//! A [`StageProcessor`] performs the work of one stage and reports its
//! payload. It never touches the record store; the scheduler persists the
//! outcome under the lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::Entry;
use crate::plan::Stage;

/// What a successful stage produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    /// Persisted as the entry's `result` when this is the final stage.
    pub payload: Option<String>,
}

/// Default `result` for a completed entry.
pub fn success_payload() -> String {
    format!(
        "Processed successfully at {}",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )
}

#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Run stage `index` of the plan for `entry`. May take bounded time.
    /// An `Err` sends the entry to `FAILED`.
    async fn execute(&self, entry: &Entry, index: usize, stage: &Stage) -> Result<StageOutput>;
}

/// Stand-in for real stage logic: sleeps a fixed delay, optionally fails at
/// one stage index, and reports a timestamped payload on completion.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    pub delay: Duration,
    pub fail_at: Option<usize>,
}

impl SimulatedStage {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_at: None,
        }
    }

    /// Fail when asked to execute stage `index` (0-based).
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl StageProcessor for SimulatedStage {
    async fn execute(&self, _entry: &Entry, index: usize, stage: &Stage) -> Result<StageOutput> {
        tokio::time::sleep(self.delay).await;

        if self.fail_at == Some(index) {
            return Err(Error::Stage(format!("stage {} failed", index + 1)));
        }

        let payload = stage.status.is_terminal().then(success_payload);
        Ok(StageOutput { payload })
    }
}
