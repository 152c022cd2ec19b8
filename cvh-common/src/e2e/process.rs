//! External process execution with timeouts and trace capture.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::artifacts::{ArtifactSink, sanitize_component};
use super::cancel::CancelToken;

/// Exit code reported when a process is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long pipe readers may keep draining after the process was killed.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// A fully-resolved external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Keep running after the runner's cancel token fires. Teardown commands
    /// set this so an interrupted run can still clean up.
    pub survives_cancel: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn survives_cancel(mut self) -> Self {
        self.survives_cancel = true;
        self
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    /// Trace and output files written for this invocation, if any.
    pub artifacts: Vec<PathBuf>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Convenience for fakes and tests.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            artifacts: Vec::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
            timed_out: false,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("i/o error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Map a completed-but-unsuccessful output to an error.
    pub fn from_output(invocation: &Invocation, output: &CommandOutput) -> Self {
        if output.timed_out {
            Self::TimedOut {
                command: invocation.command_line(),
                timeout: output.duration,
            }
        } else {
            Self::Failed {
                command: invocation.command_line(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }
        }
    }
}

/// Runs external commands. `run` returns the output of any process that
/// started, whatever its exit status; only spawn and pipe failures are errors.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;

    /// Like [`run`](Self::run) but a non-zero exit or timeout is an error.
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let output = self.run(invocation)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::from_output(invocation, &output))
        }
    }
}

/// [`CommandRunner`] backed by `std::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    default_timeout: Duration,
    env: Vec<(String, String)>,
    artifacts: Option<ArtifactSink>,
    cancel: Option<CancelToken>,
}

impl SystemRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            env: Vec::new(),
            artifacts: None,
            cancel: None,
        }
    }

    /// Kill running commands when `cancel` fires, unless the invocation
    /// [survives cancellation](Invocation::survives_cancel).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self, invocation: &Invocation) -> bool {
        !invocation.survives_cancel
            && self
                .cancel
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// Variables applied to every process before the invocation's own.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_artifacts(mut self, sink: ArtifactSink) -> Self {
        self.artifacts = Some(sink);
        self
    }

    fn capture(&self, invocation: &Invocation, output: &CommandOutput) -> Vec<PathBuf> {
        let Some(sink) = &self.artifacts else {
            return Vec::new();
        };
        let prefix = sanitize_component(&invocation.program);
        let trace = serde_json::json!({
            "command": invocation.command_line(),
            "program": invocation.program,
            "args": invocation.args,
            "cwd": invocation.cwd,
            "exit_code": output.exit_code,
            "duration_ms": output.duration.as_millis() as u64,
            "timed_out": output.timed_out,
            "stdout_len_bytes": output.stdout.len(),
            "stderr_len_bytes": output.stderr.len(),
        });
        let mut results = vec![sink.capture_json(&format!("{prefix}_trace"), &trace)];
        if !output.stdout.is_empty() {
            results.push(sink.capture_text(&format!("{prefix}_stdout"), &output.stdout));
        }
        if !output.stderr.is_empty() {
            results.push(sink.capture_text(&format!("{prefix}_stderr"), &output.stderr));
        }
        let mut paths = Vec::new();
        for result in results {
            match result {
                Ok(path) => paths.push(path),
                Err(error) => {
                    warn!(command = %invocation.command_line(), %error, "failed to capture command artifact");
                }
            }
        }
        paths
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let command_line = invocation.command_line();
        let timeout = invocation.timeout.unwrap_or(self.default_timeout);
        debug!(command = %command_line, cwd = ?invocation.cwd, timeout_ms = timeout.as_millis() as u64, "executing");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in self.env.iter().chain(&invocation.env) {
            cmd.env(key, value);
        }
        // Own process group, so a kill also reaches grandchildren holding our pipes.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        if self.cancelled(invocation) {
            return Err(CommandError::Cancelled {
                command: command_line,
            });
        }
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let stdin_handle = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
                // The child may exit without reading; a broken pipe is not our failure.
                let _ = pipe.write_all(input.as_bytes());
            })),
            _ => None,
        };
        let stdout_handle = child.stdout.take().map(spawn_reader);
        let stderr_handle = child.stderr.take().map(spawn_reader);

        let io_error = |source| CommandError::Io {
            command: command_line.clone(),
            source,
        };
        let mut timed_out = false;
        let mut cancelled = false;
        let exit_status = loop {
            if let Some(status) = child.try_wait().map_err(io_error)? {
                break Some(status);
            }
            if self.cancelled(invocation) {
                cancelled = true;
                break kill_tree(&mut child);
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                break kill_tree(&mut child);
            }
            thread::sleep(Duration::from_millis(10));
        };

        let duration = start.elapsed();
        let killed = timed_out || cancelled;
        if let Some(handle) = stdin_handle {
            if !killed || handle.is_finished() {
                let _ = handle.join();
            }
        }
        // A background grandchild can hold the pipes open past the exit.
        let drain = if killed {
            OUTPUT_GRACE
        } else {
            timeout.saturating_sub(duration).max(OUTPUT_GRACE)
        };
        let drain_deadline = Instant::now() + drain;
        let stdout = collect_output(stdout_handle, drain_deadline);
        let mut stderr = collect_output(stderr_handle, drain_deadline);
        if cancelled {
            warn!(command = %command_line, duration_ms = duration.as_millis() as u64, "command killed on cancellation");
            return Err(CommandError::Cancelled {
                command: command_line,
            });
        }
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Process timed out after {timeout:?}."));
        }

        let exit_code = exit_status
            .and_then(|status| status.code())
            .unwrap_or(if timed_out { TIMEOUT_EXIT_CODE } else { -1 });
        let mut output = CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
            artifacts: Vec::new(),
        };

        if output.success() {
            debug!(command = %command_line, duration_ms = duration.as_millis() as u64, "command finished");
        } else {
            warn!(
                command = %command_line,
                exit_code,
                timed_out,
                duration_ms = duration.as_millis() as u64,
                "command failed"
            );
        }
        output.artifacts = self.capture(invocation, &output);
        Ok(output)
    }
}

/// Drains one pipe on its own thread into a shared buffer.
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> PipeReader {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&buffer);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => match sink.lock() {
                    Ok(mut buffer) => buffer.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
            }
        }
        let _ = tx.send(());
    });
    PipeReader { buffer, done }
}

/// Whatever was read by `deadline`. A reader still blocked then, because
/// something outside our reach holds the pipe, is abandoned.
fn collect_output(reader: Option<PipeReader>, deadline: Instant) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let wait = deadline.saturating_duration_since(Instant::now());
    if reader.done.recv_timeout(wait).is_err() {
        debug!("pipe still open at the deadline, keeping partial output");
    }
    let bytes = match reader.buffer.lock() {
        Ok(buffer) => buffer.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).to_string()
}

/// Kill the child's whole process group, then the child itself, and reap it.
fn kill_tree(child: &mut Child) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill").args(["-KILL", "--", &group]).output() {
            Ok(output) if !output.status.success() => {
                debug!(pid = child.id(), stderr = %String::from_utf8_lossy(&output.stderr).trim(), "process group kill failed");
            }
            Err(error) => debug!(pid = child.id(), %error, "could not run kill"),
            Ok(_) => {}
        }
    }
    let _ = child.kill();
    child.wait().ok()
}
