//! End-to-end scenario engine.
//!
//! Leaves first:
//! - [`mutator`]: anchored edits on generated files
//! - [`poll`]: bounded retry for eventually-consistent checks
//! - [`assertion`]: structured verdicts over raw query output
//! - [`process`], [`cluster`], [`tools`]: external process plumbing
//! - [`context`]: per-run isolation and guaranteed teardown
//! - [`orchestrator`]: fail-fast step execution
//! - [`scenario`]: the scaffold → build → deploy → verify driver

pub mod artifacts;
pub mod assertion;
pub mod cancel;
pub mod cluster;
pub mod context;
pub mod error;
pub mod mutator;
pub mod orchestrator;
pub mod poll;
pub mod process;
pub mod report;
pub mod scenario;
pub mod tools;
pub mod webhook;

pub use artifacts::ArtifactSink;
pub use assertion::{AssertionMismatch, NumericOp};
pub use cancel::CancelToken;
pub use cluster::ClusterClient;
pub use context::{
    AdmissionKind, ContextGuard, Lifecycle, SideEffect, TeardownAction, TeardownReport,
    TestContext,
};
pub use error::{CheckError, ScenarioError, SetupError, StepFailure, StepFailureCause};
pub use mutator::{AnchorError, AnchorProblem, Edit};
pub use orchestrator::{Expectation, Orchestrator, PlannedStep, Step};
pub use poll::{Converged, PollError, PollSpec, PollTimeout, Poller};
pub use process::{CommandError, CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use report::{Outcome, PollRecord, ScenarioReport, StageRecord, StepRecord};
pub use scenario::{PlannedStage, Scenario, ScenarioPlan, ScenarioRun, Stage};
pub use tools::Toolchain;
pub use webhook::WebhookSource;
