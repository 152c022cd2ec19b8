//! Shared core for the Convergence Verification Harness.
//!
//! The harness scaffolds a controller project with an external generator,
//! builds and deploys it into a cluster, then waits for the cluster to
//! converge on a list of asserted conditions. Everything that talks to the
//! outside world goes through [`e2e::process::CommandRunner`], so the whole
//! scenario can be exercised against a scripted runner in tests.

pub mod config;
pub mod e2e;

pub use config::{ConfigError, HarnessConfig};
pub use e2e::{
    AdmissionKind, AnchorError, AnchorProblem, ArtifactSink, AssertionMismatch, CancelToken,
    CheckError, ClusterClient, CommandError, CommandOutput, CommandRunner, ContextGuard, Edit,
    Expectation, Invocation, Lifecycle, NumericOp, Orchestrator, PollError, PollSpec, PollTimeout,
    Poller, Scenario, ScenarioError, ScenarioReport, ScenarioRun, SetupError, SideEffect, Stage,
    Step, StepFailure, StepRecord, SystemRunner, TeardownReport, TestContext, Toolchain,
    WebhookSource,
};
