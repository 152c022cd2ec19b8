//! Convergence Verification Harness - command-line entry point.
//!
//! `cvh run` scaffolds a controller project, builds and deploys it to the
//! current kind cluster, waits for it to converge, and tears everything down.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cvh_common::config::parse_duration;
use cvh_common::{HarnessConfig, Scenario, ScenarioRun};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "cvh")]
#[command(
    author,
    version,
    about = "Convergence Verification Harness - scaffold, deploy and verify a controller project end to end"
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CVH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scenario against the current cluster
    Run,
    /// Print every resolved step without running anything
    Plan,
    /// Print the effective configuration as TOML
    Config,
}

/// Flags that take precedence over the file and environment.
#[derive(Args, Default)]
struct Overrides {
    /// kind cluster the image is loaded into
    #[arg(long, global = true)]
    kind_cluster: Option<String>,

    /// Parent directory of per-run workspaces
    #[arg(long, global = true)]
    work_root: Option<PathBuf>,

    /// Parent directory of run artifacts
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,

    /// Interval between convergence checks (e.g. "1s")
    #[arg(long, global = true, value_parser = parse_duration)]
    poll_interval: Option<Duration>,

    /// Budget for each convergence check (e.g. "2m")
    #[arg(long, global = true, value_parser = parse_duration)]
    poll_timeout: Option<Duration>,

    /// Assume cert-manager is already installed
    #[arg(long, global = true)]
    skip_cert_manager: bool,
}

impl Overrides {
    fn apply(self, config: &mut HarnessConfig) {
        if let Some(cluster) = self.kind_cluster {
            config.tools.kind_cluster = cluster;
        }
        if let Some(root) = self.work_root {
            config.paths.work_root = root;
        }
        if let Some(root) = self.artifact_root {
            config.paths.artifact_root = root;
        }
        if let Some(interval) = self.poll_interval {
            config.timing.poll_interval = interval;
        }
        if let Some(timeout) = self.poll_timeout {
            config.timing.poll_timeout = timeout;
        }
        if self.skip_cert_manager {
            config.cert_manager.install = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let mut config =
        HarnessConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.overrides.apply(&mut config);
    config.validate()?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Plan => {
            let plan = Scenario::system(config).plan();
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(config: HarnessConfig) -> Result<()> {
    let scenario = Scenario::system(config);
    let cancel = scenario.cancel_token();
    if let Some(sink) = scenario.artifacts() {
        info!(dir = %sink.dir().display(), "writing artifacts");
    }

    let mut handle = tokio::task::spawn_blocking(move || scenario.run());
    let run = tokio::select! {
        joined = &mut handle => joined.context("scenario thread panicked")?,
        signal = shutdown_signal() => {
            warn!(signal, "cancelling and tearing down");
            cancel.cancel();
            handle.await.context("scenario thread panicked")?
        }
    };

    print_summary(&run);
    let stage = run.report.stage();
    match run.error {
        None => Ok(()),
        Some(error) => Err(anyhow::Error::new(error).context(format!("scenario failed after stage `{stage}`"))),
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM. A signal that cannot be
/// listened for never resolves.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    if stream.recv().await.is_none() {
                        std::future::pending::<()>().await;
                    }
                }
                Err(error) => {
                    warn!(%error, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            () = interrupt => "SIGINT",
            () = terminate => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    {
        interrupt.await;
        "interrupt"
    }
}

fn print_summary(run: &ScenarioRun) {
    let report = &run.report;
    println!(
        "suffix: {}",
        report.suffix.as_deref().unwrap_or("<none>")
    );
    for record in &report.steps {
        let verdict = if record.passed { "ok" } else { "FAILED" };
        println!(
            "  step {:<28} {:>6} ms  {}",
            record.step,
            record.duration.as_millis(),
            verdict
        );
    }
    for poll in &report.polls {
        let verdict = if poll.converged { "ok" } else { "TIMED OUT" };
        println!(
            "  check {:<27} {:>3} attempts  {}",
            poll.check, poll.attempts, verdict
        );
        if let Some(error) = &poll.last_error {
            println!("    last error: {error}");
        }
    }
    if let Some(teardown) = &report.teardown {
        for action in teardown.failures() {
            println!(
                "  teardown {} FAILED: {}",
                action.description,
                action.error.as_deref().unwrap_or_default()
            );
        }
    }
    println!("result: {}", if run.passed() { "PASSED" } else { "FAILED" });
}
