//! Generator, build and cluster-tool commands used by the scenario.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::cluster::ClusterClient;
use super::context::SideEffect;
use super::orchestrator::Step;
use super::process::{CommandError, CommandRunner, Invocation};
use crate::config::{HarnessConfig, ToolsConfig};

/// Deployment whose availability means cert-manager can issue certificates.
const CERT_MANAGER_WEBHOOK: &str = "deployment.apps/cert-manager-webhook";

/// Slack on top of `kubectl wait --timeout` for the process itself.
const WAIT_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Toolchain {
    runner: Arc<dyn CommandRunner>,
    tools: ToolsConfig,
    project_version: String,
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("tools", &self.tools)
            .field("project_version", &self.project_version)
            .finish_non_exhaustive()
    }
}

impl Toolchain {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &HarnessConfig) -> Self {
        Self {
            runner,
            tools: config.tools.clone(),
            project_version: config.naming.project_version.clone(),
        }
    }

    pub fn tools(&self) -> &ToolsConfig {
        &self.tools
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn init(&self) -> Step {
        Step::command("init", &self.tools.generator).args([
            "init".to_string(),
            "--project-version".to_string(),
            self.project_version.clone(),
            "--domain".to_string(),
            "${domain}".to_string(),
            "--dep=false".to_string(),
        ])
    }

    pub fn create_api(&self) -> Step {
        Step::command("create api", &self.tools.generator).args([
            "create",
            "api",
            "--group",
            "${group}",
            "--version",
            "${version}",
            "--kind",
            "${kind}",
            "--namespaced",
            "--resource",
            "--controller",
            "--make=false",
        ])
    }

    /// `make <target> <args...>`.
    pub fn make(&self, target: &str, args: &[&str]) -> Step {
        Step::command(format!("make {target}"), &self.tools.make)
            .arg(target)
            .args(args.iter().copied())
    }

    pub fn docker_build(&self) -> Step {
        self.make("docker-build", &["IMG=${image}"])
            .produces(SideEffect::ImageBuilt {
                image: "${image}".to_string(),
            })
    }

    /// A failed deploy can leave objects behind, so the cleanup is
    /// registered before `make deploy` runs.
    pub fn deploy(&self) -> Step {
        self.make("deploy", &["IMG=${image}"])
            .registers(SideEffect::ManifestsDeployed {
                overlay: "config/default".to_string(),
            })
    }

    /// `kind load docker-image <image> --name <cluster>`.
    pub fn load_image_to_cluster(&self) -> Step {
        Step::command("load image", &self.tools.kind).args([
            "load".to_string(),
            "docker-image".to_string(),
            "${image}".to_string(),
            "--name".to_string(),
            self.tools.kind_cluster.clone(),
        ])
    }

    pub fn apply_cert_manager(&self, manifest_url: &str, dir: &Path) -> Result<(), CommandError> {
        let invocation = Invocation::new(&self.tools.kubectl)
            .args(["apply", "--validate=false", "-f", manifest_url])
            .cwd(dir);
        self.runner.run_checked(&invocation).map(drop)
    }

    pub fn wait_cert_manager(&self, timeout: Duration, dir: &Path) -> Result<(), CommandError> {
        let invocation = Invocation::new(&self.tools.kubectl)
            .args([
                "wait".to_string(),
                CERT_MANAGER_WEBHOOK.to_string(),
                "--for".to_string(),
                "condition=Available".to_string(),
                "--namespace".to_string(),
                "cert-manager".to_string(),
                "--timeout".to_string(),
                humantime::format_duration(timeout).to_string(),
            ])
            .cwd(dir)
            .timeout(timeout + WAIT_GRACE);
        self.runner.run_checked(&invocation).map(drop)
    }

    pub fn uninstall_cert_manager(&self, manifest_url: &str) -> Result<(), CommandError> {
        let invocation = Invocation::new(&self.tools.kubectl)
            .args(["delete", "-f", manifest_url])
            .survives_cancel();
        self.runner.run_checked(&invocation).map(drop)
    }

    /// `kustomize build <overlay> | kubectl delete --ignore-not-found -f -`,
    /// run in `dir`. Safe to run when the deploy never got that far.
    pub fn cleanup_manifests(&self, overlay: &str, dir: &Path) -> Result<(), CommandError> {
        let build = Invocation::new(&self.tools.kustomize)
            .args(["build", overlay])
            .cwd(dir)
            .survives_cancel();
        let manifests = self.runner.run_checked(&build)?.stdout;
        ClusterClient::new(self.runner.clone(), self.tools.kubectl.clone(), "", dir)
            .delete_stdin(&manifests)
            .map(drop)
    }

    /// `docker rmi -f <image>`.
    pub fn remove_image(&self, image: &str) -> Result<(), CommandError> {
        let invocation = Invocation::new(&self.tools.docker)
            .args(["rmi", "-f", image])
            .survives_cancel();
        self.runner.run_checked(&invocation).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2e::context::TestContext;
    use crate::e2e::orchestrator::Orchestrator;
    use crate::e2e::process::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Invocation>>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(CommandOutput::ok("---\nkind: Namespace\n"))
        }
    }

    #[test]
    fn test_generator_steps_resolve_against_context() {
        let config = HarnessConfig::default();
        let toolchain = Toolchain::new(Arc::new(Recorder::default()), &config);
        let ctx = TestContext::derive(&config, "zxcvbn");
        let plan = Orchestrator::plan(
            &ctx,
            &[
                toolchain.init(),
                toolchain.create_api(),
                toolchain.docker_build(),
                toolchain.load_image_to_cluster(),
            ],
        );
        let commands: Vec<_> = plan.iter().filter_map(|step| step.command.clone()).collect();
        assert_eq!(
            commands,
            vec![
                "kubebuilder init --project-version 2 --domain example.comzxcvbn --dep=false",
                "kubebuilder create api --group barzxcvbn --version v1alpha1 --kind Foozxcvbn --namespaced --resource --controller --make=false",
                "make docker-build IMG=e2e-test/controller-manager:zxcvbn",
                "kind load docker-image e2e-test/controller-manager:zxcvbn --name kind",
            ]
        );
        assert_eq!(
            plan[2].produces,
            Some(SideEffect::ImageBuilt {
                image: "e2e-test/controller-manager:zxcvbn".into()
            })
        );
    }

    #[test]
    fn test_deploy_registers_cleanup_before_running() {
        let config = HarnessConfig::default();
        let toolchain = Toolchain::new(Arc::new(Recorder::default()), &config);
        let ctx = TestContext::derive(&config, "zxcvbn");
        let plan = Orchestrator::plan(&ctx, &[toolchain.deploy()]);
        assert_eq!(plan[0].produces, None);
        assert_eq!(
            plan[0].registers,
            Some(SideEffect::ManifestsDeployed {
                overlay: "config/default".into()
            })
        );
    }

    #[test]
    fn test_cleanup_pipes_kustomize_output_into_kubectl() {
        let recorder = Arc::new(Recorder::default());
        let toolchain = Toolchain::new(recorder.clone(), &HarnessConfig::default());
        toolchain
            .cleanup_manifests("config/default", Path::new("/work/e2e-x"))
            .unwrap();
        toolchain
            .wait_cert_manager(Duration::from_secs(300), Path::new("/work"))
            .unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].command_line(), "kustomize build config/default");
        assert_eq!(seen[1].command_line(), "kubectl delete --ignore-not-found -f -");
        assert_eq!(seen[1].cwd.as_deref(), Some(Path::new("/work/e2e-x")));
        assert!(seen[0].survives_cancel && seen[1].survives_cancel);
        assert_eq!(seen[1].stdin.as_deref(), Some("---\nkind: Namespace\n"));
        assert!(seen[2].command_line().ends_with("--timeout 5m"));
        assert_eq!(seen[2].timeout, Some(Duration::from_secs(330)));
    }
}
