use cvh_common::HarnessConfig;

use super::common::{ConfigFile, assert_contains, init_test_logging};

#[test]
fn test_config_prints_effective_toml() {
    init_test_logging();
    crate::test_log!("TEST START: test_config_prints_effective_toml");

    let config = ConfigFile::new("[timing]\npoll_timeout = \"2m\"\n");
    let output = config.cvh(&["config", "--poll-interval", "250ms", "--kind-cluster", "ci"]);
    assert!(
        output.status.success(),
        "cvh config failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let printed = HarnessConfig::from_toml_str(&stdout).expect("printed config parses");
    assert_eq!(printed.timing.poll_timeout.as_secs(), 120);
    assert_eq!(printed.timing.poll_interval.as_millis(), 250);
    assert_eq!(printed.tools.kind_cluster, "ci");
    assert_eq!(printed.paths.work_root, config.dir.path().join("work"));
    assert_eq!(printed.env.get("GO111MODULE").map(String::as_str), Some("on"));

    crate::test_log!("TEST PASS: test_config_prints_effective_toml");
}

#[test]
fn test_config_rejects_unreadable_file() {
    init_test_logging();
    crate::test_log!("TEST START: test_config_rejects_unreadable_file");

    let config = ConfigFile::new("[timing\n");
    let output = config.cvh(&["config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "failed to load configuration");
    assert_contains(&stderr, "failed to parse config file");

    crate::test_log!("TEST PASS: test_config_rejects_unreadable_file");
}

#[test]
fn test_config_rejects_zero_poll_interval() {
    init_test_logging();
    crate::test_log!("TEST START: test_config_rejects_zero_poll_interval");

    let config = ConfigFile::new("[timing]\npoll_interval = \"0s\"\n");
    let output = config.cvh(&["config"]);
    assert!(!output.status.success());
    assert_contains(
        &String::from_utf8_lossy(&output.stderr),
        "timing.poll_interval must be greater than zero",
    );

    crate::test_log!("TEST PASS: test_config_rejects_zero_poll_interval");
}

#[test]
fn test_default_config_installs_cert_manager() {
    init_test_logging();
    crate::test_log!("TEST START: test_default_config_installs_cert_manager");

    let config = HarnessConfig::default();
    assert!(config.cert_manager.install);
    assert!(config.cert_manager.manifest_url.starts_with("https://"));
    assert_eq!(config.naming.kind_prefix, "Foo");

    crate::test_log!("TEST PASS: test_default_config_installs_cert_manager");
}
