//! Fail-fast execution of named external steps against a [`TestContext`].
//!
//! A step runs its `before` edits, the external command, then its `after`
//! edits. Only the exit status is judged here; output content is the
//! assertion layer's concern. The first step that misses its expectation
//! aborts the sequence. A step's `produces` effect is recorded on the context
//! only after the step has passed; a `registers` effect is recorded just
//! before its command starts, for commands that can fail halfway.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use super::cancel::CancelToken;
use super::context::{SideEffect, TestContext};
use super::error::{StepFailure, StepFailureCause};
use super::mutator::Edit;
use super::process::{CommandError, CommandRunner, Invocation};
use super::report::StepRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    Success,
    /// Passes on a non-zero exit, fails on a zero exit.
    Failure,
}

impl Expectation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// A named external operation with optional file edits around it.
///
/// Arguments, environment values, edit fields and the produced side effect
/// may contain `${placeholder}`s resolved from the context at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    /// `None` for edit-only steps.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub expect: Expectation,
    pub timeout: Option<Duration>,
    pub before: Vec<Edit>,
    pub after: Vec<Edit>,
    pub produces: Option<SideEffect>,
    pub registers: Option<SideEffect>,
}

impl Step {
    pub fn command(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: Some(program.into()),
            ..Self::edits(String::new())
        }
    }

    pub fn edits(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            args: Vec::new(),
            env: Vec::new(),
            expect: Expectation::Success,
            timeout: None,
            before: Vec::new(),
            after: Vec::new(),
            produces: None,
            registers: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn expect_failure(mut self) -> Self {
        self.expect = Expectation::Failure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn before(mut self, edit: Edit) -> Self {
        self.before.push(edit);
        self
    }

    pub fn after(mut self, edit: Edit) -> Self {
        self.after.push(edit);
        self
    }

    pub fn produces(mut self, effect: SideEffect) -> Self {
        self.produces = Some(effect);
        self
    }

    /// Record `effect` before the command runs. Its undo must tolerate
    /// resources that were never created.
    pub fn registers(mut self, effect: SideEffect) -> Self {
        self.registers = Some(effect);
        self
    }

    fn invocation(&self, ctx: &TestContext) -> Option<Invocation> {
        let program = self.program.as_ref()?;
        let mut invocation = Invocation::new(ctx.substitute(program))
            .args(self.args.iter().map(|arg| ctx.substitute(arg)))
            .cwd(ctx.dir.clone());
        for (key, value) in &self.env {
            invocation = invocation.env(key.clone(), ctx.substitute(value));
        }
        if let Some(timeout) = self.timeout {
            invocation = invocation.timeout(timeout);
        }
        Some(invocation)
    }
}

fn resolve_edit(ctx: &TestContext, edit: &Edit) -> Edit {
    match edit {
        Edit::InsertAfter {
            file,
            anchor,
            payload,
        } => Edit::InsertAfter {
            file: ctx.substitute(file),
            anchor: ctx.substitute(anchor),
            payload: ctx.substitute(payload),
        },
        Edit::Uncomment {
            file,
            anchor,
            prefix,
        } => Edit::Uncomment {
            file: ctx.substitute(file),
            anchor: ctx.substitute(anchor),
            prefix: prefix.clone(),
        },
        Edit::WriteFile { file, contents } => Edit::WriteFile {
            file: ctx.substitute(file),
            contents: contents.clone(),
        },
    }
}

/// A step with every placeholder resolved, for dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub name: String,
    pub command: Option<String>,
    pub expect: Expectation,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub produces: Option<SideEffect>,
    pub registers: Option<SideEffect>,
}

#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `steps` in order, stopping at the first failure.
    pub fn run(&self, ctx: &mut TestContext, steps: &[Step]) -> Result<Vec<StepRecord>, StepFailure> {
        let mut records = Vec::with_capacity(steps.len());
        for step in steps {
            if self.cancel.is_cancelled() {
                return Err(StepFailure {
                    step: step.name.clone(),
                    cause: StepFailureCause::Cancelled,
                    records,
                });
            }

            info!(step = %step.name, suffix = %ctx.suffix, "running step");
            match self.run_step(ctx, step) {
                Ok(record) => {
                    info!(
                        step = %step.name,
                        duration_ms = record.duration.as_millis() as u64,
                        "step passed"
                    );
                    records.push(record);
                }
                Err((record, cause)) => {
                    error!(step = %step.name, exit_code = ?record.exit_code, error = %cause, "step failed");
                    records.push(record);
                    return Err(StepFailure {
                        step: step.name.clone(),
                        cause,
                        records,
                    });
                }
            }
        }
        Ok(records)
    }

    fn run_step(
        &self,
        ctx: &mut TestContext,
        step: &Step,
    ) -> Result<StepRecord, (StepRecord, StepFailureCause)> {
        let start = Instant::now();
        let invocation = step.invocation(ctx);
        let before: Vec<Edit> = step.before.iter().map(|edit| resolve_edit(ctx, edit)).collect();
        let after: Vec<Edit> = step.after.iter().map(|edit| resolve_edit(ctx, edit)).collect();

        let mut record = StepRecord {
            step: step.name.clone(),
            command: invocation.as_ref().map_or_else(
                || {
                    before
                        .iter()
                        .chain(&after)
                        .map(Edit::describe)
                        .collect::<Vec<_>>()
                        .join("; ")
                },
                Invocation::command_line,
            ),
            expected: step.expect.as_str().to_string(),
            exit_code: None,
            passed: false,
            duration: Duration::ZERO,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            edits: Vec::new(),
            artifacts: Vec::new(),
        };

        let outcome = self.execute(ctx, step, invocation.as_ref(), &before, &after, &mut record);
        record.duration = start.elapsed();
        match outcome {
            Ok(()) => {
                record.passed = true;
                if let Some(effect) = &step.produces {
                    let effect = effect.resolve(ctx);
                    ctx.record(effect);
                }
                Ok(record)
            }
            Err(cause) => Err((record, cause)),
        }
    }

    fn execute(
        &self,
        ctx: &mut TestContext,
        step: &Step,
        invocation: Option<&Invocation>,
        before: &[Edit],
        after: &[Edit],
        record: &mut StepRecord,
    ) -> Result<(), StepFailureCause> {
        apply_edits(ctx, before, record)?;

        if let Some(invocation) = invocation {
            if let Some(effect) = &step.registers {
                let effect = effect.resolve(ctx);
                ctx.record(effect);
            }
            let output = self.runner.run(invocation).map_err(|error| match error {
                CommandError::Cancelled { .. } => StepFailureCause::Cancelled,
                error => StepFailureCause::Command(error),
            })?;
            record.exit_code = Some(output.exit_code);
            record.stdout_tail = StepRecord::tail(&output.stdout);
            record.stderr_tail = StepRecord::tail(&output.stderr);
            record.artifacts = output.artifacts.clone();

            match step.expect {
                Expectation::Success if !output.success() => {
                    return Err(StepFailureCause::Command(CommandError::from_output(
                        invocation, &output,
                    )));
                }
                Expectation::Failure if output.timed_out => {
                    return Err(StepFailureCause::Command(CommandError::from_output(
                        invocation, &output,
                    )));
                }
                Expectation::Failure if output.success() => {
                    return Err(StepFailureCause::UnexpectedSuccess {
                        command: invocation.command_line(),
                    });
                }
                _ => {}
            }
        }

        apply_edits(ctx, after, record)
    }

    /// Resolve `steps` against `ctx` without running anything.
    pub fn plan(ctx: &TestContext, steps: &[Step]) -> Vec<PlannedStep> {
        steps
            .iter()
            .map(|step| PlannedStep {
                name: step.name.clone(),
                command: step.invocation(ctx).map(|invocation| invocation.command_line()),
                expect: step.expect,
                before: step
                    .before
                    .iter()
                    .map(|edit| resolve_edit(ctx, edit).describe())
                    .collect(),
                after: step
                    .after
                    .iter()
                    .map(|edit| resolve_edit(ctx, edit).describe())
                    .collect(),
                produces: step.produces.as_ref().map(|effect| effect.resolve(ctx)),
                registers: step.registers.as_ref().map(|effect| effect.resolve(ctx)),
            })
            .collect()
    }
}

fn apply_edits(ctx: &TestContext, edits: &[Edit], record: &mut StepRecord) -> Result<(), StepFailureCause> {
    for edit in edits {
        edit.apply(&ctx.resolve(edit.file()))
            .map_err(StepFailureCause::Edit)?;
        record.edits.push(edit.describe());
    }
    Ok(())
}
