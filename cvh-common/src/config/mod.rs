//! Configuration system for the harness.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then `CVH_*` environment variables. Command-line flags are applied
//! on top by the binary.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Release manifest installed as the certificate issuer before the scenario runs.
pub const DEFAULT_CERT_MANAGER_URL: &str =
    "https://github.com/jetstack/cert-manager/releases/download/v0.11.0/cert-manager.yaml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// External binaries the harness drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Scaffolding generator (`init`, `create api`).
    pub generator: String,
    pub kubectl: String,
    pub make: String,
    pub docker: String,
    pub kind: String,
    pub kustomize: String,
    /// Name of the kind cluster images are loaded into.
    pub kind_cluster: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            generator: "kubebuilder".to_string(),
            kubectl: "kubectl".to_string(),
            make: "make".to_string(),
            docker: "docker".to_string(),
            kind: "kind".to_string(),
            kustomize: "kustomize".to_string(),
            kind_cluster: "kind".to_string(),
        }
    }
}

/// Seeds for the identifiers of the generated API. The per-run suffix is
/// appended to each of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub domain: String,
    pub group_prefix: String,
    pub version: String,
    pub kind_prefix: String,
    pub image_repository: String,
    pub project_version: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            group_prefix: "bar".to_string(),
            version: "v1alpha1".to_string(),
            kind_prefix: "Foo".to_string(),
            image_repository: "e2e-test/controller-manager".to_string(),
            project_version: "2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound for a single generation/build/deploy command.
    #[serde(with = "humantime_serde_compat")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub poll_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertManagerConfig {
    pub install: bool,
    pub manifest_url: String,
    #[serde(with = "humantime_serde_compat")]
    pub ready_timeout: Duration,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            install: true,
            manifest_url: DEFAULT_CERT_MANAGER_URL.to_string(),
            ready_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent directory of every per-run workspace.
    pub work_root: PathBuf,
    /// Parent directory of run artifacts. Kept outside the workspace so logs
    /// survive teardown.
    pub artifact_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("cvh-e2e"),
            artifact_root: PathBuf::from("target").join("e2e-artifacts"),
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub tools: ToolsConfig,
    pub naming: NamingConfig,
    pub timing: TimingConfig,
    pub cert_manager: CertManagerConfig,
    pub paths: PathsConfig,
    /// Extra environment for every external process.
    pub env: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("GO111MODULE".to_string(), "on".to_string());
        Self {
            tools: ToolsConfig::default(),
            naming: NamingConfig::default(),
            timing: TimingConfig::default(),
            cert_manager: CertManagerConfig::default(),
            paths: PathsConfig::default(),
            env,
        }
    }
}

impl HarnessConfig {
    /// Load defaults, the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `CVH_*` overrides. Invalid values are collected on the parser.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        let tools = &mut self.tools;
        for (name, slot) in [
            ("GENERATOR", &mut tools.generator),
            ("KUBECTL", &mut tools.kubectl),
            ("MAKE", &mut tools.make),
            ("DOCKER", &mut tools.docker),
            ("KIND", &mut tools.kind),
            ("KUSTOMIZE", &mut tools.kustomize),
        ] {
            if let Some(value) = parser.get_string(name, slot).env_override() {
                *slot = value;
            }
        }

        // KIND_CLUSTER is the conventional variable used by kind tooling.
        if let Some(cluster) = parser
            .get_optional_string("KIND_CLUSTER")
            .env_override()
            .flatten()
            .or_else(|| std::env::var("KIND_CLUSTER").ok().filter(|v| !v.is_empty()))
        {
            tools.kind_cluster = cluster;
        }

        if let Some(root) = parser
            .get_path("WORK_ROOT", &self.paths.work_root.to_string_lossy())
            .env_override()
        {
            self.paths.work_root = root;
        }
        if let Some(root) = parser
            .get_path("ARTIFACT_ROOT", &self.paths.artifact_root.to_string_lossy())
            .env_override()
        {
            self.paths.artifact_root = root;
        }

        let timing = &mut self.timing;
        if let Some(d) = parser
            .get_duration_range(
                "POLL_INTERVAL",
                timing.poll_interval,
                Duration::from_millis(1),
                Duration::from_secs(300),
            )
            .env_override()
        {
            timing.poll_interval = d;
        }
        if let Some(d) = parser
            .get_duration_range(
                "POLL_TIMEOUT",
                timing.poll_timeout,
                Duration::ZERO,
                Duration::from_secs(3600),
            )
            .env_override()
        {
            timing.poll_timeout = d;
        }
        if let Some(d) = parser
            .get_duration_range(
                "COMMAND_TIMEOUT",
                timing.command_timeout,
                Duration::from_secs(1),
                Duration::from_secs(4 * 3600),
            )
            .env_override()
        {
            timing.command_timeout = d;
        }

        if let Some(install) = parser
            .get_bool("INSTALL_CERT_MANAGER", self.cert_manager.install)
            .env_override()
        {
            self.cert_manager.install = install;
        }
        if let Some(url) = parser
            .get_optional_string("CERT_MANAGER_URL")
            .env_override()
            .flatten()
        {
            self.cert_manager.manifest_url = url;
        }
    }

    /// Reject settings the scenario cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "timing.poll_interval must be greater than zero".to_string(),
            ));
        }
        let naming = &self.naming;
        for (field, value) in [
            ("naming.domain", &naming.domain),
            ("naming.group_prefix", &naming.group_prefix),
            ("naming.version", &naming.version),
            ("naming.kind_prefix", &naming.kind_prefix),
            ("naming.image_repository", &naming.image_repository),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }
        if self.cert_manager.install && self.cert_manager.manifest_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cert_manager.manifest_url is required when install = true".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Environment applied to every external process, in a stable order.
    pub fn process_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Parse a human-readable duration ("250ms", "90s", "5m").
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw.trim())
}

/// Durations are written as humantime strings in TOML.
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
