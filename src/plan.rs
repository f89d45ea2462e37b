//! Stage plan: the ordered list of `(status, progress)` targets an entry
//! moves through.
//!
//! The scheduler consumes this as data, so changing the stage sequence is a
//! plan change rather than a code change. Plans can be loaded from TOML:
//!
//! ```toml
//! [[stage]]
//! status = "STAGE_1"
//! progress = 33
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::Status;

/// One stage transition target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Stage {
    pub status: Status,
    pub progress: i32,
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PlanFile {
    stage: Vec<Stage>,
}

/// A validated, non-empty stage sequence starting from `CREATED` and
/// ending at `COMPLETED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl Default for StagePlan {
    fn default() -> Self {
        Self {
            stages: vec![
                Stage {
                    status: Status::Stage1,
                    progress: 33,
                },
                Stage {
                    status: Status::Stage2,
                    progress: 66,
                },
                Stage {
                    status: Status::Completed,
                    progress: 100,
                },
            ],
        }
    }
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let Some(last) = stages.last() else {
            return Err(Error::InvalidInput("stage plan is empty".to_string()));
        };
        if last.status != Status::Completed {
            return Err(Error::InvalidInput(format!(
                "stage plan must end at COMPLETED, ends at {}",
                last.status
            )));
        }

        let mut from = Status::Created;
        let mut progress = 0;
        for stage in &stages {
            if stage.status == Status::Failed || !from.can_transition_to(stage.status) {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    to: stage.status.to_string(),
                });
            }
            if stage.progress < progress || stage.progress > 100 {
                return Err(Error::InvalidInput(format!(
                    "stage {} progress {} must be within {progress}..=100",
                    stage.status, stage.progress
                )));
            }
            from = stage.status;
            progress = stage.progress;
        }

        Ok(Self { stages })
    }

    /// Parse and validate a TOML plan.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: PlanFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad stage plan: {e}")))?;
        Self::new(file.stage)
    }

    /// Load and validate a TOML plan from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Yields `(index, status the entry must be in, target stage)`.
    pub fn transitions(&self) -> impl Iterator<Item = (usize, Status, &Stage)> {
        let froms = std::iter::once(Status::Created).chain(self.stages.iter().map(|s| s.status));
        self.stages
            .iter()
            .zip(froms)
            .enumerate()
            .map(|(index, (stage, from))| (index, from, stage))
    }

    pub fn is_final(&self, index: usize) -> bool {
        index + 1 == self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_walks_every_stage() {
        let plan = StagePlan::default();
        let walk: Vec<_> = plan
            .transitions()
            .map(|(i, from, s)| (i, from, s.status, s.progress))
            .collect();
        assert_eq!(
            walk,
            vec![
                (0, Status::Created, Status::Stage1, 33),
                (1, Status::Stage1, Status::Stage2, 66),
                (2, Status::Stage2, Status::Completed, 100),
            ]
        );
        assert!(plan.is_final(2));
        assert!(!plan.is_final(1));
    }

    #[test]
    fn rejects_skipped_stage() {
        let result = StagePlan::new(vec![
            Stage {
                status: Status::Stage1,
                progress: 50,
            },
            Stage {
                status: Status::Completed,
                progress: 100,
            },
        ]);
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn rejects_decreasing_progress_and_empty_plans() {
        assert!(StagePlan::new(vec![]).is_err());
        let result = StagePlan::new(vec![
            Stage {
                status: Status::Stage1,
                progress: 70,
            },
            Stage {
                status: Status::Stage2,
                progress: 60,
            },
            Stage {
                status: Status::Completed,
                progress: 100,
            },
        ]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn loads_from_toml() {
        let plan = StagePlan::from_toml(
            r#"
            [[stage]]
            status = "STAGE_1"
            progress = 10

            [[stage]]
            status = "STAGE_2"
            progress = 90

            [[stage]]
            status = "COMPLETED"
            progress = 100
            "#,
        )
        .unwrap();
        assert_eq!(plan.stages()[1].progress, 90);
    }

    #[test]
    fn toml_with_unknown_status_is_a_config_error() {
        let result = StagePlan::from_toml(
            r#"
            [[stage]]
            status = "STAGE_9"
            progress = 10
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
