//! Serializable records of a run, written to `scenario_report.json`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::TeardownReport;
use super::scenario::Stage;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Trailing bytes of stdout/stderr kept per step.
const OUTPUT_TAIL: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: String,
    /// Resolved command line, or the edit description for mutation-only steps.
    pub command: String,
    pub expected: String,
    pub exit_code: Option<i32>,
    pub passed: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub edits: Vec<String>,
    pub artifacts: Vec<PathBuf>,
}

impl StepRecord {
    pub(crate) fn tail(text: &str) -> String {
        let trimmed = text.trim_end();
        if trimmed.len() <= OUTPUT_TAIL {
            return trimmed.to_string();
        }
        let mut start = trimmed.len() - OUTPUT_TAIL;
        while !trimmed.is_char_boundary(start) {
            start += 1;
        }
        trimmed[start..].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollRecord {
    pub check: String,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub converged: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub reached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Passed,
    Failed { stage: Stage, error: String },
    Cancelled { stage: Stage },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub schema_version: u32,
    pub suffix: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub steps: Vec<StepRecord>,
    pub polls: Vec<PollRecord>,
    pub teardown: Option<TeardownReport>,
    pub outcome: Outcome,
}

impl Default for ScenarioReport {
    fn default() -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            suffix: None,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            steps: Vec::new(),
            polls: Vec::new(),
            teardown: None,
            outcome: Outcome::Running,
        }
    }
}

impl ScenarioReport {
    pub fn reach(&mut self, stage: Stage) {
        self.stages.push(StageRecord {
            stage,
            reached_at: Utc::now(),
        });
    }

    /// The last stage reached, or [`Stage::Init`] before any.
    pub fn stage(&self) -> Stage {
        self.stages.last().map_or(Stage::Init, |record| record.stage)
    }

    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Passed)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
