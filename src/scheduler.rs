//! Entry scheduler: drives one entry from its current stage to a terminal
//! state.
//!
//! Each stage transition is one `claim → execute → persist → release`
//! cycle. The persist write is guarded by lease ownership and by the
//! expected prior status, so a worker whose lease expired mid-execution
//! cannot overwrite a newer state. Any error ends the run with a
//! best-effort `FAILED` write under the same ownership guard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lease::LeaseManager;
use crate::model::{EntryId, Status};
use crate::plan::{Stage, StagePlan};
use crate::stage::{StageProcessor, success_payload};
use crate::store::{Assignments, Guard};
use crate::telemetry::entry::{record_state_transition, start_entry_span};
use crate::telemetry::metrics;

/// What to do when a stage's lease cannot be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionPolicy {
    /// Assume another live worker owns this transition and move on to the
    /// next one. If that worker later fails its write, the transition is
    /// never applied by this run.
    #[default]
    SkipForward,
    /// Keep polling the claim until the entry moves past the transition or
    /// the lease timeout elapses.
    RetryClaim { poll_interval: Duration },
}

/// Summary of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Transitions this worker applied.
    pub advanced: usize,
    /// Transitions skipped because the claim failed.
    pub skipped: usize,
    /// Transitions executed but discarded because the lease was lost.
    pub lease_lost: usize,
    /// Last status this worker saw while holding the lease.
    pub last_status: Option<Status>,
    /// Error that ended the run, if any.
    pub error: Option<String>,
    /// Whether the `FAILED` marker was written for that error.
    pub failure_recorded: bool,
}

/// Drives entries through a [`StagePlan`].
pub struct EntryScheduler {
    leases: LeaseManager,
    processor: Arc<dyn StageProcessor>,
    plan: StagePlan,
    policy: ContentionPolicy,
}

impl EntryScheduler {
    pub fn new(leases: LeaseManager, processor: Arc<dyn StageProcessor>, plan: StagePlan) -> Self {
        Self {
            leases,
            processor,
            plan,
            policy: ContentionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ContentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run every remaining stage for `id`.
    ///
    /// Never returns an error: failures end as a `FAILED` write on the entry
    /// and are logged.
    pub async fn run(&self, id: EntryId) -> RunReport {
        let span = start_entry_span(&id, self.leases.worker());

        async {
            let mut report = RunReport::default();
            match self.advance(id, &mut report, &span).await {
                Ok(()) => {
                    info!(
                        entry_id = %id,
                        advanced = report.advanced,
                        skipped = report.skipped,
                        lease_lost = report.lease_lost,
                        "scheduler run finished"
                    );
                }
                Err(e) => {
                    error!(entry_id = %id, error = %e, "scheduler run failed");
                    report.failure_recorded = self.mark_failed(id, &e, &report, &span).await;
                    report.error = Some(e.to_string());
                }
            }
            report
        }
        .instrument(span.clone())
        .await
    }

    async fn advance(&self, id: EntryId, report: &mut RunReport, span: &Span) -> Result<()> {
        for (index, from, stage) in self.plan.transitions() {
            if !self.acquire(id, from).await? {
                debug!(entry_id = %id, stage = index + 1, %from, "claim failed, skipping stage");
                report.skipped += 1;
                continue;
            }
            report.last_status = Some(from);

            self.execute_and_persist(id, index, from, stage, report, span)
                .await?;
            self.leases.release(id).await?;
        }
        Ok(())
    }

    /// Execute one stage under a held lease and write its result.
    async fn execute_and_persist(
        &self,
        id: EntryId,
        index: usize,
        from: Status,
        stage: &Stage,
        report: &mut RunReport,
        span: &Span,
    ) -> Result<()> {
        let entry = self.leases.store().get(id).await?;

        let started = Instant::now();
        let output = self.processor.execute(&entry, index, stage).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::stage_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new("stage", stage.status.as_str())],
        );

        let mut set = Assignments::new()
            .status(stage.status)
            .progress(stage.progress);
        if self.plan.is_final(index) {
            set = set.result(output.payload.unwrap_or_else(success_payload));
        }

        let guard = Guard::held_by(self.leases.worker()).with_status(from);
        let changed = self.leases.store().conditional_update(id, &guard, &set).await?;

        if changed == 0 {
            warn!(
                entry_id = %id,
                stage = index + 1,
                worker = %self.leases.worker(),
                "lease lost mid-execution, stage result discarded"
            );
            metrics::lease_lost().add(1, &[KeyValue::new("stage", stage.status.as_str())]);
            report.lease_lost += 1;
            return Ok(());
        }

        metrics::entry_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", stage.status.as_str()),
            ],
        );
        record_state_transition(span, from.as_str(), stage.status.as_str());
        info!(
            entry_id = %id,
            stage = index + 1,
            status = %stage.status,
            progress = stage.progress,
            duration_ms = elapsed_ms as u64,
            "stage completed"
        );
        report.advanced += 1;
        report.last_status = Some(stage.status);
        Ok(())
    }

    /// Claim the lease for the transition out of `from`, per the contention
    /// policy.
    async fn acquire(&self, id: EntryId, from: Status) -> Result<bool> {
        let poll_interval = match self.policy {
            ContentionPolicy::SkipForward => {
                return self.leases.claim_from(id, from, Utc::now()).await;
            }
            ContentionPolicy::RetryClaim { poll_interval } => poll_interval,
        };

        let deadline = Instant::now()
            .checked_add(self.leases.timeout())
            .ok_or_else(|| Error::Config("lease timeout exceeds the monotonic clock".to_string()))?;
        loop {
            if self.leases.claim_from(id, from, Utc::now()).await? {
                return Ok(true);
            }

            let entry = self.leases.store().get(id).await?;
            if entry.status > from {
                // Someone else already applied this transition (or failed it).
                return Ok(false);
            }
            if Instant::now() >= deadline {
                warn!(entry_id = %id, %from, "gave up waiting for lease");
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Best-effort terminal write for a failed run, then release.
    ///
    /// Applied only while this worker still holds the lease. Neither the
    /// write nor the release is retried; an unreleased lease is recovered by
    /// timeout.
    async fn mark_failed(&self, id: EntryId, err: &Error, report: &RunReport, span: &Span) -> bool {
        let guard = Guard::held_by(self.leases.worker()).unfinished();
        let set = Assignments::new()
            .status(Status::Failed)
            .result(format!("Error: {err}"));

        let recorded = match self.leases.store().conditional_update(id, &guard, &set).await {
            Ok(1) => {
                let from = report.last_status.map_or("unknown", Status::as_str);
                metrics::entry_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", from),
                        KeyValue::new("to", Status::Failed.as_str()),
                    ],
                );
                record_state_transition(span, from, Status::Failed.as_str());
                true
            }
            Ok(_) => {
                warn!(entry_id = %id, "lease not held, failure marker not applied");
                false
            }
            Err(e) => {
                error!(entry_id = %id, error = %e, "could not record failure");
                false
            }
        };

        if let Err(e) = self.leases.release(id).await {
            warn!(entry_id = %id, error = %e, "release after failure did not complete");
        }
        recorded
    }
}
