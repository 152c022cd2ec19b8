//! The scaffold → build → deploy → verify scenario.
//!
//! Stages run strictly in order:
//!
//! ```text
//! Init → Prepared → ApiScaffolded → WebhookScaffolded → OverlaysEnabled
//!      → Built → Deployed → Verified → TornDown
//! ```
//!
//! Every stage but `Verified` is a batch of orchestrated steps. `Verified` is
//! a chain of polled checks against the cluster. Teardown runs through a
//! [`ContextGuard`] whatever happens before it.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use super::artifacts::ArtifactSink;
use super::assertion::{
    NumericOp, assert_contains, assert_count_equals, assert_equals, assert_numeric,
    non_empty_lines, parse_integer,
};
use super::cancel::CancelToken;
use super::cluster::ClusterClient;
use super::context::{AdmissionKind, ContextGuard, Lifecycle, TestContext, random_suffix};
use super::error::{CheckError, ScenarioError, StepFailureCause};
use super::mutator::Edit;
use super::orchestrator::{Orchestrator, PlannedStep, Step};
use super::poll::{PollError, PollSpec, Poller};
use super::process::{CommandRunner, SystemRunner};
use super::report::{Outcome, PollRecord, ScenarioReport};
use super::tools::Toolchain;
use super::webhook::{DEFAULT_COUNT, WebhookSource};
use crate::config::HarnessConfig;

/// Field appended to the generated spec struct.
pub const COUNT_FIELD: &str = "\t// +optional\n\tCount int `json:\"count,omitempty\"`\n";

/// Commented overlay entries that wire in the webhook and CA injection.
pub const OVERLAY_ENTRIES: [&str; 4] = [
    "- ../webhook",
    "- ../certmanager",
    "- manager_webhook_patch.yaml",
    "- webhookcainjection_patch.yaml",
];

pub const RECONCILE_MESSAGE: &str = "Successfully Reconciled";

/// Shortest CA bundle accepted as injected; a placeholder can be a lone newline.
pub const MIN_CA_BUNDLE_LEN: i64 = 10;

const CONTROLLER_SELECTOR: &str = "control-plane=controller-manager";
const LIVE_POD_NAMES: &str = "go-template={{ range .items }}{{ if not .metadata.deletionTimestamp }}{{ .metadata.name }}{{ \"\\n\" }}{{ end }}{{ end }}";
const CA_BUNDLES: &str = "go-template={{ range .webhooks }}{{ .clientConfig.caBundle }}{{ end }}";
const CERT_SECRET: &str = "webhook-server-cert";
const MANAGER_CONTAINER: &str = "manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Prepared,
    ApiScaffolded,
    WebhookScaffolded,
    OverlaysEnabled,
    Built,
    Deployed,
    Verified,
    TornDown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Prepared => "prepared",
            Self::ApiScaffolded => "api scaffolded",
            Self::WebhookScaffolded => "webhook scaffolded",
            Self::OverlaysEnabled => "overlays enabled",
            Self::Built => "built",
            Self::Deployed => "deployed",
            Self::Verified => "verified",
            Self::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

/// Values discovered during verification and needed by later checks.
#[derive(Debug, Default)]
struct ScenarioState {
    controller_pod: Option<String>,
}

/// Result of one run. The report is always present; `error` is set when the
/// run did not pass.
#[derive(Debug)]
pub struct ScenarioRun {
    pub report: ScenarioReport,
    pub error: Option<ScenarioError>,
}

impl ScenarioRun {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<ScenarioReport, ScenarioError> {
        match self.error {
            None => Ok(self.report),
            Some(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioPlan {
    pub suffix: String,
    pub workspace: String,
    pub stages: Vec<PlannedStage>,
    pub checks: Vec<&'static str>,
}

pub struct Scenario {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancelToken,
    artifacts: Option<ArtifactSink>,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    pub fn new(config: HarnessConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            cancel: CancelToken::new(),
            artifacts: None,
        }
    }

    /// Real processes, with per-command traces in a fresh run directory
    /// under `artifact_root`. Cancelling the scenario kills the running step.
    pub fn system(config: HarnessConfig) -> Self {
        let sink = ArtifactSink::for_run(&config.paths.artifact_root);
        let cancel = CancelToken::new();
        let runner = SystemRunner::new(config.timing.command_timeout)
            .with_env(config.process_env())
            .with_artifacts(sink.clone())
            .with_cancel(cancel.clone());
        Self::new(config, Arc::new(runner))
            .with_artifacts(sink)
            .with_cancel(cancel)
    }

    /// Replaces the scenario's token. Only checked between steps and poll
    /// attempts unless the runner shares it.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_artifacts(mut self, sink: ArtifactSink) -> Self {
        self.artifacts = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn artifacts(&self) -> Option<&ArtifactSink> {
        self.artifacts.as_ref()
    }

    /// Run the whole scenario with a fresh context and tear it down.
    pub fn run(&self) -> ScenarioRun {
        let lifecycle = Lifecycle::new(self.runner.clone(), self.config.clone());
        match lifecycle.create() {
            Ok(ctx) => self.run_in(&lifecycle, ctx),
            Err(error) => {
                let mut report = ScenarioReport::default();
                let error = ScenarioError::from(error);
                self.conclude(&mut report, Some(&error));
                self.write_report(&report);
                ScenarioRun {
                    report,
                    error: Some(error),
                }
            }
        }
    }

    /// Run against an already-created context. The context is torn down
    /// before this returns.
    pub fn run_in(&self, lifecycle: &Lifecycle, ctx: TestContext) -> ScenarioRun {
        let mut report = ScenarioReport {
            suffix: Some(ctx.suffix.clone()),
            ..ScenarioReport::default()
        };
        info!(suffix = %ctx.suffix, dir = %ctx.dir.display(), "starting scenario");

        let mut guard = ContextGuard::new(lifecycle, ctx);
        let error = self.drive(lifecycle, guard.context_mut(), &mut report).err();
        self.conclude(&mut report, error.as_ref());

        let teardown = guard.finish();
        report.teardown = Some(teardown);
        report.reach(Stage::TornDown);
        report.finished_at = Some(Utc::now());
        self.write_report(&report);

        ScenarioRun { report, error }
    }

    fn conclude(&self, report: &mut ScenarioReport, error: Option<&ScenarioError>) {
        report.outcome = match error {
            None => {
                info!(suffix = ?report.suffix, "scenario passed");
                Outcome::Passed
            }
            Some(ScenarioError::Cancelled { stage }) => {
                warn!(stage = %stage, "scenario cancelled");
                Outcome::Cancelled { stage: *stage }
            }
            Some(error) => {
                error!(stage = %report.stage(), subject = ?error.subject(), %error, "scenario failed");
                Outcome::Failed {
                    stage: report.stage(),
                    error: error.to_string(),
                }
            }
        };
        if report.finished_at.is_none() {
            report.finished_at = Some(Utc::now());
        }
    }

    fn write_report(&self, report: &ScenarioReport) {
        let Some(sink) = &self.artifacts else {
            return;
        };
        match sink.write_named_json("scenario_report", report) {
            Ok(path) => info!(path = %path.display(), "wrote scenario report"),
            Err(error) => warn!(%error, "failed to write scenario report"),
        }
    }

    fn cancelled(&self, report: &ScenarioReport) -> Result<(), ScenarioError> {
        if self.cancel.is_cancelled() {
            return Err(ScenarioError::Cancelled {
                stage: report.stage(),
            });
        }
        Ok(())
    }

    fn drive(
        &self,
        lifecycle: &Lifecycle,
        ctx: &mut TestContext,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        self.cancelled(report)?;
        if let Err(error) = lifecycle.prepare(ctx) {
            self.cancelled(report)?;
            return Err(error.into());
        }
        report.reach(Stage::Prepared);

        let orchestrator = Orchestrator::new(self.runner.clone()).with_cancel(self.cancel.clone());
        for (stage, steps) in stages(lifecycle.toolchain(), ctx) {
            self.cancelled(report)?;
            match orchestrator.run(ctx, &steps) {
                Ok(records) => report.steps.extend(records),
                Err(failure) => {
                    report.steps.extend(failure.records.iter().cloned());
                    return Err(match failure.cause {
                        StepFailureCause::Cancelled => ScenarioError::Cancelled {
                            stage: report.stage(),
                        },
                        StepFailureCause::Edit(anchor) => {
                            error!(step = %failure.step, "generated file did not match the expected anchor");
                            ScenarioError::Anchor {
                                step: failure.step,
                                source: anchor,
                            }
                        }
                        _ => ScenarioError::Step(failure),
                    });
                }
            }
            info!(stage = %stage, "stage reached");
            report.reach(stage);
        }

        self.verify(ctx, report)?;
        report.reach(Stage::Verified);
        Ok(())
    }

    /// Poll the deployed controller until every convergence check holds.
    fn verify(&self, ctx: &TestContext, report: &mut ScenarioReport) -> Result<(), ScenarioError> {
        let poller = Poller::new(PollSpec::new(
            self.config.timing.poll_interval,
            self.config.timing.poll_timeout,
        ))
        .with_cancel(self.cancel.clone());
        let cluster = ClusterClient::for_context(self.runner.clone(), &self.config.tools.kubectl, ctx);
        let mut state = ScenarioState::default();
        let sample = ctx.sample_file();

        let pod = self.poll(&poller, report, "controller pod running", || {
            let output = cluster.get(true, &["pods", "-l", CONTROLLER_SELECTOR, "-o", LIVE_POD_NAMES])?;
            let pods = non_empty_lines(&output);
            assert_count_equals(&pods, 1, "live controller pods")?;
            let pod = pods[0].to_string();
            assert_contains(&pod, "controller-manager", "controller pod name")?;
            let phase = cluster.get(true, &["pods", pod.as_str(), "-o", "jsonpath={.status.phase}"])?;
            assert_equals(&phase.trim(), &"Running", "controller pod phase")?;
            Ok(pod)
        })?;
        state.controller_pod = Some(pod);

        self.poll(&poller, report, "certificate secret present", || {
            cluster.get(true, &["secrets", CERT_SECRET])?;
            Ok(())
        })?;

        self.poll(&poller, report, "ca bundles injected", || {
            for kind in [AdmissionKind::Mutating, AdmissionKind::Validating] {
                let name = ctx.admission_configuration_name(kind);
                let bundles = cluster.get_resource(false, kind.resource(), &name, CA_BUNDLES)?;
                assert_numeric(
                    bundles.len() as i64,
                    NumericOp::Gt,
                    MIN_CA_BUNDLE_LEN,
                    &format!("{name} ca bundle length"),
                )?;
            }
            Ok(())
        })?;

        // Admission webhooks may still be starting, so the apply itself is polled.
        self.poll(&poller, report, "sample applied", || {
            cluster.apply_file(true, &sample)?;
            Ok(())
        })?;

        let pod = state.controller_pod.as_deref().unwrap_or_default();
        self.poll(&poller, report, "sample reconciled", || {
            let logs = cluster.logs(pod, MANAGER_CONTAINER)?;
            assert_contains(&logs, RECONCILE_MESSAGE, "manager logs")?;
            Ok(())
        })?;

        self.poll(&poller, report, "sample defaulted by webhook", || {
            let output = cluster.get(true, &["-f", sample.as_str(), "-o", "go-template={{ .spec.count }}"])?;
            let count = parse_integer(&output, "spec.count")?;
            assert_numeric(count, NumericOp::Eq, DEFAULT_COUNT, "spec.count")?;
            Ok(())
        })?;

        Ok(())
    }

    fn poll<T, F>(
        &self,
        poller: &Poller,
        report: &mut ScenarioReport,
        check: &str,
        attempt: F,
    ) -> Result<T, ScenarioError>
    where
        F: FnMut() -> Result<T, CheckError>,
    {
        match poller.poll(check, attempt) {
            Ok(converged) => {
                report.polls.push(PollRecord {
                    check: check.to_string(),
                    attempts: converged.attempts,
                    elapsed: converged.elapsed,
                    converged: true,
                    last_error: None,
                });
                Ok(converged.value)
            }
            Err(PollError::Timeout(timeout)) => {
                report.polls.push(PollRecord {
                    check: check.to_string(),
                    attempts: timeout.attempts,
                    elapsed: timeout.elapsed,
                    converged: false,
                    last_error: Some(timeout.last_error.to_string()),
                });
                Err(ScenarioError::PollTimeout(timeout))
            }
            Err(PollError::Cancelled { attempts, .. }) => {
                report.polls.push(PollRecord {
                    check: check.to_string(),
                    attempts,
                    elapsed: std::time::Duration::ZERO,
                    converged: false,
                    last_error: Some("cancelled".to_string()),
                });
                Err(ScenarioError::Cancelled {
                    stage: report.stage(),
                })
            }
        }
    }

    /// Resolve every step for a fresh suffix without touching disk or cluster.
    pub fn plan(&self) -> ScenarioPlan {
        let ctx = TestContext::derive(&self.config, &random_suffix());
        let toolchain = Toolchain::new(self.runner.clone(), &self.config);
        let stages = stages(&toolchain, &ctx)
            .into_iter()
            .map(|(stage, steps)| PlannedStage {
                stage,
                steps: Orchestrator::plan(&ctx, &steps),
            })
            .collect();
        ScenarioPlan {
            suffix: ctx.suffix.clone(),
            workspace: ctx.dir.display().to_string(),
            stages,
            checks: vec![
                "controller pod running",
                "certificate secret present",
                "ca bundles injected",
                "sample applied",
                "sample reconciled",
                "sample defaulted by webhook",
            ],
        }
    }
}

/// Orchestrated stages between `Prepared` and `Verified`.
pub fn stages(toolchain: &Toolchain, ctx: &TestContext) -> Vec<(Stage, Vec<Step>)> {
    let kustomization = ctx.kustomization_file();
    let overlays = OVERLAY_ENTRIES
        .iter()
        .fold(Step::edits("enable webhook overlays"), |step, entry| {
            step.after(Edit::Uncomment {
                file: kustomization.to_string(),
                anchor: (*entry).to_string(),
                prefix: "#".to_string(),
            })
        });

    vec![
        (
            Stage::ApiScaffolded,
            vec![
                toolchain.init(),
                toolchain.create_api(),
                Step::edits("implement api").after(Edit::InsertAfter {
                    file: "api/${version}/${kind_lower}_types.go".to_string(),
                    anchor: "type ${kind}Spec struct {\n".to_string(),
                    payload: COUNT_FIELD.to_string(),
                }),
            ],
        ),
        (
            Stage::WebhookScaffolded,
            vec![Step::edits("scaffold webhook").after(Edit::WriteFile {
                file: ctx.webhook_file(),
                contents: WebhookSource::for_context(ctx).render(),
            })],
        ),
        (Stage::OverlaysEnabled, vec![overlays]),
        (
            Stage::Built,
            vec![toolchain.docker_build(), toolchain.load_image_to_cluster()],
        ),
        (Stage::Deployed, vec![toolchain.deploy()]),
    ]
}
