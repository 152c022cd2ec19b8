use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

/// A scratch directory holding a `cvh.toml`, with work and artifact roots
/// pointed inside it.
pub struct ConfigFile {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl ConfigFile {
    pub fn new(extra: &str) -> Self {
        crate::test_log!("FIXTURE: Writing harness config");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("cvh.toml");
        let work = dir.path().join("work");
        let artifacts = dir.path().join("artifacts");
        fs::write(
            &path,
            format!(
                "[paths]\nwork_root = {:?}\nartifact_root = {:?}\n\n{extra}",
                work.display().to_string(),
                artifacts.display().to_string(),
            ),
        )
        .expect("Failed to write cvh.toml");

        Self { dir, path }
    }

    pub fn append(&self, extra: &str) {
        let mut text = fs::read_to_string(&self.path).expect("Failed to read cvh.toml");
        text.push('\n');
        text.push_str(extra);
        fs::write(&self.path, text).expect("Failed to write cvh.toml");
    }

    /// The binary with this config and no inherited `CVH_*` overrides.
    pub fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_cvh"));
        for (key, _) in std::env::vars() {
            if key.starts_with("CVH_") || key == "KIND_CLUSTER" {
                command.env_remove(key);
            }
        }
        command.arg("--config").arg(&self.path).args(args);
        command
    }

    pub fn cvh(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("Failed to run cvh")
    }

    /// Write an executable shell script into the scratch directory.
    #[cfg(unix)]
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to make script executable");
        path
    }
}
