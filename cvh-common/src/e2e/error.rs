//! Error taxonomy of a scenario run.

use std::path::PathBuf;

use thiserror::Error;

use super::assertion::AssertionMismatch;
use super::mutator::AnchorError;
use super::poll::PollTimeout;
use super::process::CommandError;
use super::report::StepRecord;
use super::scenario::Stage;

/// Workspace or prerequisite creation failed before any step ran.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no free workspace suffix under {} after {attempts} attempts", root.display())]
    SuffixExhausted { root: PathBuf, attempts: u32 },

    #[error("failed to create workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install {component}: {source}")]
    Prerequisite {
        component: &'static str,
        #[source]
        source: CommandError,
    },
}

#[derive(Debug, Error)]
pub enum StepFailureCause {
    #[error(transparent)]
    Command(CommandError),

    #[error("`{command}` succeeded but was expected to fail")]
    UnexpectedSuccess { command: String },

    #[error(transparent)]
    Edit(AnchorError),

    /// Cancelled before the step started, or its command was killed.
    #[error("cancelled")]
    Cancelled,
}

/// The first failing step of an orchestrated sequence.
#[derive(Debug, Error)]
#[error("step `{step}` failed: {cause}")]
pub struct StepFailure {
    pub step: String,
    #[source]
    pub cause: StepFailureCause,
    /// Records of every step attempted, the failing one last.
    pub records: Vec<StepRecord>,
}

/// Why one attempt of a polled check did not pass.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Assertion(#[from] AssertionMismatch),
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Step(#[from] StepFailure),

    /// An edit of `step` could not locate its anchor.
    #[error("step `{step}`: {source}")]
    Anchor {
        step: String,
        #[source]
        source: AnchorError,
    },

    #[error(transparent)]
    PollTimeout(#[from] PollTimeout<CheckError>),

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl ScenarioError {
    /// Name of the failing step or check, for the summary line.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Step(failure) => Some(&failure.step),
            Self::PollTimeout(timeout) => Some(&timeout.description),
            Self::Anchor { step, .. } => Some(step),
            Self::Setup(_) | Self::Cancelled { .. } => None,
        }
    }
}
