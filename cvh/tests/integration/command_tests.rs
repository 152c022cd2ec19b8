use std::fs;
use std::process::Command;

use crate::common::{ConfigFile, assert_contains, assert_path_exists, init_test_logging};

#[test]
fn test_cvh_help_lists_subcommands() {
    init_test_logging();
    crate::test_log!("TEST START: test_cvh_help_lists_subcommands");

    let output = Command::new(env!("CARGO_BIN_EXE_cvh"))
        .arg("--help")
        .output()
        .expect("Failed to run cvh --help");

    assert!(output.status.success(), "cvh --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "Convergence Verification Harness");
    for command in ["run", "plan", "config"] {
        assert_contains(&stdout, command);
    }
    crate::test_log!("TEST PASS: test_cvh_help_lists_subcommands");
}

#[test]
fn test_plan_prints_resolved_steps_without_side_effects() {
    init_test_logging();
    crate::test_log!("TEST START: test_plan_prints_resolved_steps_without_side_effects");

    let config = ConfigFile::new("[tools]\nkind_cluster = \"ci\"\n");
    let output = config.cvh(&["plan"]);
    assert!(
        output.status.success(),
        "cvh plan failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let plan: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("plan output is JSON");
    let suffix = plan["suffix"].as_str().expect("suffix");
    assert_eq!(suffix.len(), 6);
    assert_eq!(plan["stages"].as_array().map(Vec::len), Some(5));
    assert_eq!(plan["checks"].as_array().map(Vec::len), Some(6));

    let load = &plan["stages"][3]["steps"][1]["command"];
    assert_eq!(
        load.as_str(),
        Some(format!("kind load docker-image e2e-test/controller-manager:{suffix} --name ci").as_str())
    );

    assert!(!config.dir.path().join("work").exists());
    assert!(!config.dir.path().join("artifacts").exists());
    crate::test_log!("TEST PASS: test_plan_prints_resolved_steps_without_side_effects");
}

#[test]
fn test_run_with_missing_generator_fails_and_cleans_up() {
    init_test_logging();
    crate::test_log!("TEST START: test_run_with_missing_generator_fails_and_cleans_up");

    let config = ConfigFile::new(
        "[tools]\ngenerator = \"/nonexistent/cvh-generator\"\n\n[cert_manager]\ninstall = false\n",
    );
    let output = config.cvh(&["run"]);
    assert!(!output.status.success(), "cvh run unexpectedly passed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stdout, "result: FAILED");
    assert_contains(&stderr, "scenario failed after stage `prepared`");

    let work = config.dir.path().join("work");
    let leftover: Vec<_> = fs::read_dir(&work)
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftover.is_empty(), "workspace left behind: {leftover:?}");

    let runs: Vec<_> = fs::read_dir(config.dir.path().join("artifacts"))
        .expect("artifact root exists")
        .flatten()
        .collect();
    assert_eq!(runs.len(), 1);
    let report_path = runs[0].path().join("scenario_report.json");
    assert_path_exists(&report_path);
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["outcome"]["status"], "failed");
    assert_eq!(report["outcome"]["stage"], "prepared");
    assert_eq!(report["stages"].as_array().map(Vec::len), Some(2));
    crate::test_log!("TEST PASS: test_run_with_missing_generator_fails_and_cleans_up");
}

/// Start `cvh run` with a generator that hangs, deliver `signal` once the
/// generator is running, and check the run is cancelled and cleaned up.
#[cfg(unix)]
fn interrupt_hanging_run(signal: &str) {
    use std::process::Stdio;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    let config = ConfigFile::new("[cert_manager]\ninstall = false\n");
    let generator = config.script("hanging-generator", "touch started\nsleep 30\ntouch finished");
    config.append(&format!(
        "[tools]\ngenerator = {:?}\n",
        generator.display().to_string()
    ));

    let child = config
        .command(&["run"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn cvh run");
    let pid = child.id();

    let work = config.dir.path().join("work");
    let started = Instant::now();
    let workspace = loop {
        let running = fs::read_dir(&work)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .find(|dir| dir.join("started").exists());
        if let Some(dir) = running {
            break dir;
        }
        assert!(started.elapsed() < Duration::from_secs(20), "generator never started");
        thread::sleep(Duration::from_millis(50));
    };
    crate::test_log!("RUNNING: {} in {}", pid, workspace.display());

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });
    let signalled = Instant::now();
    let kill = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()
        .expect("Failed to run kill");
    assert!(kill.success());

    let output = rx
        .recv_timeout(Duration::from_secs(15))
        .expect("cvh did not exit after the signal")
        .expect("Failed to wait for cvh");
    crate::test_log!("EXITED: after {:?}", signalled.elapsed());
    assert!(!output.status.success());
    assert!(signalled.elapsed() < Duration::from_secs(10));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "cancelling and tearing down");
    assert!(!workspace.exists(), "workspace left behind: {}", workspace.display());

    let runs: Vec<_> = fs::read_dir(config.dir.path().join("artifacts"))
        .expect("artifact root exists")
        .flatten()
        .collect();
    assert_eq!(runs.len(), 1);
    let report_path = runs[0].path().join("scenario_report.json");
    assert_path_exists(&report_path);
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["outcome"]["status"], "cancelled");
    let last_stage = report["stages"]
        .as_array()
        .and_then(|stages| stages.last())
        .and_then(|last| last["stage"].as_str());
    assert_eq!(last_stage, Some("torn_down"));
}

#[cfg(unix)]
#[test]
fn test_sigterm_cancels_run_and_cleans_up() {
    init_test_logging();
    crate::test_log!("TEST START: test_sigterm_cancels_run_and_cleans_up");
    interrupt_hanging_run("TERM");
    crate::test_log!("TEST PASS: test_sigterm_cancels_run_and_cleans_up");
}

#[cfg(unix)]
#[test]
fn test_sigint_kills_running_step_and_cleans_up() {
    init_test_logging();
    crate::test_log!("TEST START: test_sigint_kills_running_step_and_cleans_up");
    interrupt_hanging_run("INT");
    crate::test_log!("TEST PASS: test_sigint_kills_running_step_and_cleans_up");
}
