//! Per-run isolation: unique naming, workspace, and guaranteed teardown.
//!
//! A [`TestContext`] owns everything one scenario run leaves behind on disk
//! and in the cluster. Every such side effect is recorded as a [`SideEffect`]
//! once the operation that produced it has succeeded, and
//! [`Lifecycle::destroy`] undoes them in reverse order. [`ContextGuard`] makes
//! sure that happens exactly once on every exit path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::SetupError;
use super::process::CommandRunner;
use super::tools::Toolchain;
use crate::config::HarnessConfig;

/// Length of the random lowercase suffix appended to every identifier.
pub const SUFFIX_LEN: usize = 6;

/// Fresh suffixes tried before giving up on a crowded work root.
pub const MAX_SUFFIX_ATTEMPTS: u32 = 8;

/// Something a run did that teardown must reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    WorkspaceCreated { path: PathBuf },
    CertManagerInstalled { manifest_url: String },
    ImageBuilt { image: String },
    /// Manifests built from the kustomize overlay at `overlay` (relative to
    /// the workspace) were applied to the cluster.
    ManifestsDeployed { overlay: String },
}

impl SideEffect {
    /// Substitute context placeholders in the effect's fields.
    pub fn resolve(&self, ctx: &TestContext) -> Self {
        match self {
            Self::WorkspaceCreated { path } => Self::WorkspaceCreated {
                path: PathBuf::from(ctx.substitute(&path.to_string_lossy())),
            },
            Self::CertManagerInstalled { manifest_url } => Self::CertManagerInstalled {
                manifest_url: ctx.substitute(manifest_url),
            },
            Self::ImageBuilt { image } => Self::ImageBuilt {
                image: ctx.substitute(image),
            },
            Self::ManifestsDeployed { overlay } => Self::ManifestsDeployed {
                overlay: ctx.substitute(overlay),
            },
        }
    }

    fn label(&self) -> String {
        match self {
            Self::WorkspaceCreated { path } => format!("remove workspace {}", path.display()),
            Self::CertManagerInstalled { manifest_url } => {
                format!("uninstall cert-manager ({manifest_url})")
            }
            Self::ImageBuilt { image } => format!("remove image {image}"),
            Self::ManifestsDeployed { overlay } => format!("delete manifests from {overlay}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionKind {
    Mutating,
    Validating,
}

impl AdmissionKind {
    pub fn resource(self) -> &'static str {
        match self {
            Self::Mutating => "mutatingwebhookconfigurations.admissionregistration.k8s.io",
            Self::Validating => "validatingwebhookconfigurations.admissionregistration.k8s.io",
        }
    }

    fn word(self) -> &'static str {
        match self {
            Self::Mutating => "mutating",
            Self::Validating => "validating",
        }
    }
}

/// Identifiers and recorded side effects of one isolated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestContext {
    pub suffix: String,
    pub dir: PathBuf,
    pub domain: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resources: String,
    pub image: String,
    pub namespace: String,
    side_effects: Vec<SideEffect>,
    torn_down: bool,
}

impl TestContext {
    /// Derive every identifier from the naming seeds and `suffix`.
    pub fn derive(config: &HarnessConfig, suffix: &str) -> Self {
        let naming = &config.naming;
        let project = format!("e2e-{suffix}");
        Self {
            suffix: suffix.to_string(),
            dir: config.paths.work_root.join(&project),
            domain: format!("{}{suffix}", naming.domain),
            group: format!("{}{suffix}", naming.group_prefix),
            version: naming.version.clone(),
            kind: format!("{}{suffix}", naming.kind_prefix),
            resources: format!("{}{suffix}s", naming.kind_prefix.to_lowercase()),
            image: format!("{}:{suffix}", naming.image_repository),
            namespace: format!("{project}-system"),
            side_effects: Vec::new(),
            torn_down: false,
        }
    }

    pub fn kind_lower(&self) -> String {
        self.kind.to_lowercase()
    }

    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub(crate) fn record(&mut self, effect: SideEffect) {
        debug!(suffix = %self.suffix, ?effect, "recorded side effect");
        self.side_effects.push(effect);
    }

    /// Replace `${name}` placeholders with context values. Unknown names and
    /// unterminated placeholders are left as written.
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            match self.lookup(name) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, name: &str) -> Option<String> {
        let value = match name {
            "dir" => self.dir.to_string_lossy().into_owned(),
            "suffix" => self.suffix.clone(),
            "domain" => self.domain.clone(),
            "group" => self.group.clone(),
            "version" => self.version.clone(),
            "kind" => self.kind.clone(),
            "kind_lower" => self.kind_lower(),
            "resources" => self.resources.clone(),
            "image" => self.image.clone(),
            "namespace" => self.namespace.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Absolute path of a workspace-relative file.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    pub fn types_file(&self) -> String {
        format!("api/{}/{}_types.go", self.version, self.kind_lower())
    }

    pub fn webhook_file(&self) -> String {
        format!("api/{}/{}_webhook.go", self.version, self.kind_lower())
    }

    pub fn kustomization_file(&self) -> &'static str {
        "config/default/kustomization.yaml"
    }

    pub fn sample_file(&self) -> String {
        format!(
            "config/samples/{}_{}_{}.yaml",
            self.group,
            self.version,
            self.kind_lower()
        )
    }

    pub fn admission_configuration_name(&self, kind: AdmissionKind) -> String {
        format!("e2e-{}-{}-webhook-configuration", self.suffix, kind.word())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownAction {
    pub effect: SideEffect,
    pub description: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub actions: Vec<TeardownAction>,
    /// Set when destroy was called on an already torn-down context.
    pub skipped: bool,
}

impl TeardownReport {
    pub fn failures(&self) -> impl Iterator<Item = &TeardownAction> {
        self.actions.iter().filter(|action| action.error.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Creates, prepares and destroys [`TestContext`]s.
#[derive(Clone)]
pub struct Lifecycle {
    config: HarnessConfig,
    toolchain: Toolchain,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("work_root", &self.config.paths.work_root)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(runner: Arc<dyn CommandRunner>, config: HarnessConfig) -> Self {
        let toolchain = Toolchain::new(runner, &config);
        Self { config, toolchain }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Pick a fresh random suffix whose workspace does not exist yet.
    pub fn create(&self) -> Result<TestContext, SetupError> {
        self.create_with(random_suffix)
    }

    /// [`create`](Self::create) with a caller-supplied suffix source.
    pub fn create_with<F>(&self, mut next_suffix: F) -> Result<TestContext, SetupError>
    where
        F: FnMut() -> String,
    {
        for attempt in 1..=MAX_SUFFIX_ATTEMPTS {
            let ctx = TestContext::derive(&self.config, &next_suffix());
            if !ctx.dir.exists() {
                info!(suffix = %ctx.suffix, dir = %ctx.dir.display(), "created test context");
                return Ok(ctx);
            }
            debug!(attempt, dir = %ctx.dir.display(), "workspace exists, retrying suffix");
        }
        Err(SetupError::SuffixExhausted {
            root: self.config.paths.work_root.clone(),
            attempts: MAX_SUFFIX_ATTEMPTS,
        })
    }

    /// Create the workspace and install prerequisite cluster components.
    /// Each effect is recorded as soon as it succeeds so a partial failure
    /// can still be torn down.
    pub fn prepare(&self, ctx: &mut TestContext) -> Result<(), SetupError> {
        let workspace_error = |source| SetupError::Workspace {
            path: ctx.dir.clone(),
            source,
        };
        if let Some(parent) = ctx.dir.parent() {
            fs::create_dir_all(parent).map_err(workspace_error)?;
        }
        fs::create_dir(&ctx.dir).map_err(workspace_error)?;
        let workspace = SideEffect::WorkspaceCreated {
            path: ctx.dir.clone(),
        };
        ctx.record(workspace);

        let cert_manager = &self.config.cert_manager;
        if cert_manager.install {
            info!(suffix = %ctx.suffix, url = %cert_manager.manifest_url, "installing cert-manager");
            self.toolchain
                .apply_cert_manager(&cert_manager.manifest_url, &ctx.dir)
                .map_err(|source| SetupError::Prerequisite {
                    component: "cert-manager",
                    source,
                })?;
            ctx.record(SideEffect::CertManagerInstalled {
                manifest_url: cert_manager.manifest_url.clone(),
            });
            self.toolchain
                .wait_cert_manager(cert_manager.ready_timeout, &ctx.dir)
                .map_err(|source| SetupError::Prerequisite {
                    component: "cert-manager",
                    source,
                })?;
        }
        info!(suffix = %ctx.suffix, "test context prepared");
        Ok(())
    }

    /// Undo recorded side effects newest first. Every action runs even if an
    /// earlier one failed. A second call returns a skipped report.
    pub fn destroy(&self, ctx: &mut TestContext) -> TeardownReport {
        if ctx.torn_down {
            debug!(suffix = %ctx.suffix, "context already torn down");
            return TeardownReport {
                actions: Vec::new(),
                skipped: true,
            };
        }
        ctx.torn_down = true;

        let mut report = TeardownReport::default();
        while let Some(effect) = ctx.side_effects.pop() {
            let description = effect.label();
            let error = self.undo(ctx, &effect).err();
            match &error {
                None => debug!(suffix = %ctx.suffix, action = %description, "teardown action done"),
                Some(error) => {
                    warn!(suffix = %ctx.suffix, action = %description, %error, "teardown action failed");
                }
            }
            report.actions.push(TeardownAction {
                effect,
                description,
                error,
            });
        }

        let failed = report.failures().count();
        if failed == 0 {
            info!(suffix = %ctx.suffix, actions = report.actions.len(), "teardown complete");
        } else {
            warn!(suffix = %ctx.suffix, failed, "teardown finished with failures; leftovers kept for diagnosis");
        }
        report
    }

    fn undo(&self, ctx: &TestContext, effect: &SideEffect) -> Result<(), String> {
        match effect {
            SideEffect::ManifestsDeployed { overlay } => self
                .toolchain
                .cleanup_manifests(overlay, &ctx.dir)
                .map_err(|error| error.to_string()),
            SideEffect::ImageBuilt { image } => self
                .toolchain
                .remove_image(image)
                .map_err(|error| error.to_string()),
            SideEffect::CertManagerInstalled { manifest_url } => self
                .toolchain
                .uninstall_cert_manager(manifest_url)
                .map_err(|error| error.to_string()),
            SideEffect::WorkspaceCreated { path } => {
                remove_workspace(path).map_err(|error| error.to_string())
            }
        }
    }
}

fn remove_workspace(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn random_suffix() -> String {
    (0..SUFFIX_LEN).map(|_| fastrand::lowercase()).collect()
}

/// Owns a [`TestContext`] and tears it down when finished or dropped.
pub struct ContextGuard<'a> {
    lifecycle: &'a Lifecycle,
    ctx: TestContext,
}

impl<'a> ContextGuard<'a> {
    pub fn new(lifecycle: &'a Lifecycle, ctx: TestContext) -> Self {
        Self { lifecycle, ctx }
    }

    pub fn context(&self) -> &TestContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut TestContext {
        &mut self.ctx
    }

    /// Tear down now and return the report.
    pub fn finish(mut self) -> TeardownReport {
        self.lifecycle.destroy(&mut self.ctx)
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if !self.ctx.torn_down {
            warn!(suffix = %self.ctx.suffix, "context dropped without finish; tearing down");
            self.lifecycle.destroy(&mut self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2e::process::{CommandError, CommandOutput, Invocation};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
            let line = invocation.command_line();
            self.seen.lock().unwrap().push(line.clone());
            match self.fail_on {
                Some(pattern) if line.contains(pattern) => Ok(CommandOutput::failed(1, "boom")),
                _ => Ok(CommandOutput::ok("")),
            }
        }
    }

    fn config(root: &Path) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.paths.work_root = root.join("work");
        config
    }

    #[test]
    fn test_derived_identifiers() {
        let ctx = TestContext::derive(&HarnessConfig::default(), "abcdef");
        assert_eq!(ctx.domain, "example.comabcdef");
        assert_eq!(ctx.group, "barabcdef");
        assert_eq!(ctx.kind, "Fooabcdef");
        assert_eq!(ctx.resources, "fooabcdefs");
        assert_eq!(ctx.image, "e2e-test/controller-manager:abcdef");
        assert_eq!(ctx.namespace, "e2e-abcdef-system");
        assert!(ctx.dir.ends_with("e2e-abcdef"));
        assert_eq!(ctx.types_file(), "api/v1alpha1/fooabcdef_types.go");
        assert_eq!(
            ctx.sample_file(),
            "config/samples/barabcdef_v1alpha1_fooabcdef.yaml"
        );
        assert_eq!(
            ctx.admission_configuration_name(AdmissionKind::Validating),
            "e2e-abcdef-validating-webhook-configuration"
        );
    }

    #[test]
    fn test_substitution_leaves_unknown_and_go_templates() {
        let ctx = TestContext::derive(&HarnessConfig::default(), "abcdef");
        assert_eq!(
            ctx.substitute("IMG=${image} ${nope} {{ .spec.count }} ${kind_lower}"),
            "IMG=e2e-test/controller-manager:abcdef ${nope} {{ .spec.count }} fooabcdef"
        );
        assert_eq!(ctx.substitute("tail ${unterminated"), "tail ${unterminated");
        assert_eq!(ctx.substitute("$${suffix}"), "$abcdef");
    }

    #[test]
    fn test_create_retries_taken_suffixes() {
        let temp = TempDir::new().unwrap();
        let lifecycle = Lifecycle::new(Arc::new(Recorder::default()), config(temp.path()));
        fs::create_dir_all(temp.path().join("work/e2e-aaaaaa")).unwrap();

        let mut candidates = vec!["bbbbbb", "aaaaaa"];
        let ctx = lifecycle
            .create_with(|| candidates.pop().unwrap().to_string())
            .unwrap();
        assert_eq!(ctx.suffix, "bbbbbb");

        let err = lifecycle.create_with(|| "aaaaaa".to_string()).unwrap_err();
        assert!(matches!(
            err,
            SetupError::SuffixExhausted {
                attempts: MAX_SUFFIX_ATTEMPTS,
                ..
            }
        ));
    }

    #[test]
    fn test_random_suffix_is_lowercase() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_prepare_failure_is_still_torn_down() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(Recorder {
            fail_on: Some("kubectl wait"),
            ..Recorder::default()
        });
        let lifecycle = Lifecycle::new(runner.clone(), config(temp.path()));
        let mut ctx = lifecycle.create().unwrap();

        let err = lifecycle.prepare(&mut ctx).unwrap_err();
        assert!(matches!(err, SetupError::Prerequisite { .. }));
        assert_eq!(ctx.side_effects().len(), 2);

        let report = lifecycle.destroy(&mut ctx);
        assert!(report.is_clean());
        assert_eq!(report.actions.len(), 2);
        assert!(matches!(
            report.actions[0].effect,
            SideEffect::CertManagerInstalled { .. }
        ));
        assert!(!ctx.dir.exists());
        assert!(
            runner
                .seen
                .lock()
                .unwrap()
                .last()
                .unwrap()
                .starts_with("kubectl delete -f https://")
        );

        assert!(lifecycle.destroy(&mut ctx).skipped);
    }

    #[test]
    fn test_teardown_failures_do_not_stop_later_actions() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(Recorder {
            fail_on: Some("docker rmi"),
            ..Recorder::default()
        });
        let mut config = config(temp.path());
        config.cert_manager.install = false;
        let lifecycle = Lifecycle::new(runner, config);
        let mut ctx = lifecycle.create().unwrap();
        lifecycle.prepare(&mut ctx).unwrap();
        ctx.record(SideEffect::ImageBuilt {
            image: ctx.image.clone(),
        });

        let report = lifecycle.destroy(&mut ctx);
        assert_eq!(report.failures().count(), 1);
        assert!(matches!(
            report.actions[1].effect,
            SideEffect::WorkspaceCreated { .. }
        ));
        assert!(report.actions[1].error.is_none());
        assert!(!ctx.dir.exists());
    }

    #[test]
    fn test_guard_tears_down_on_drop_exactly_once() {
        let temp = TempDir::new().unwrap();
        let mut config = config(temp.path());
        config.cert_manager.install = false;
        let lifecycle = Lifecycle::new(Arc::new(Recorder::default()), config);
        let mut ctx = lifecycle.create().unwrap();
        lifecycle.prepare(&mut ctx).unwrap();
        let dir = ctx.dir.clone();

        {
            let _guard = ContextGuard::new(&lifecycle, ctx.clone());
        }
        assert!(!dir.exists());

        let guard = ContextGuard::new(&lifecycle, ctx);
        fs::create_dir_all(&dir).unwrap();
        let report = guard.finish();
        assert_eq!(report.actions.len(), 1);
        assert!(!dir.exists());
    }
}
