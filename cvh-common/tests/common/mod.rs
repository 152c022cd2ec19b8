#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use cvh_common::{CommandError, CommandOutput, CommandRunner, HarnessConfig, Invocation};
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cvh_common=debug".parse().unwrap()),
        )
        .try_init();
}

/// Config pointing every path into `root` with fast polling.
pub fn test_config(root: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.paths.work_root = root.join("work");
    config.paths.artifact_root = root.join("artifacts");
    config.timing.poll_interval = Duration::from_millis(5);
    config.timing.poll_timeout = Duration::from_millis(150);
    config
}

/// Kustomization written by the fake generator, shaped like the real one.
pub const KUSTOMIZATION: &str = "\
namePrefix: e2e-project-

bases:
- ../crd
- ../rbac
- ../manager
# [WEBHOOK] To enable webhook, uncomment all the sections with [WEBHOOK] prefix including the one in crd/kustomization.yaml
#- ../webhook
# [CERTMANAGER] To enable cert-manager, uncomment all sections with 'CERTMANAGER'. 'WEBHOOK' components are required.
#- ../certmanager

patchesStrategicMerge:
- manager_auth_proxy_patch.yaml
# [WEBHOOK] To enable webhook, uncomment all the sections with [WEBHOOK] prefix including the one in crd/kustomization.yaml
#- manager_webhook_patch.yaml
# [CERTMANAGER] To enable cert-manager, uncomment all sections with 'CERTMANAGER'.
#- webhookcainjection_patch.yaml
";

struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

/// Scripted stand-in for the generator, make, kind, docker and kubectl.
///
/// Responses are matched by substring of the command line; the last scripted
/// response for a pattern repeats. Unmatched commands succeed with no output.
/// `kubebuilder init` and `create api` write minimal generated files into the
/// invocation's working directory.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
    omit_spec_struct: bool,
    snapshot_on: Option<String>,
    snapshot: Mutex<BTreeMap<String, String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Healthy cluster answers for every verification query.
    pub fn converging() -> Self {
        let runner = Self::new();
        runner.respond(
            "get pods -l control-plane=controller-manager",
            CommandOutput::ok("e2e-x-controller-manager-7d9f\n"),
        );
        runner.respond("jsonpath={.status.phase}", CommandOutput::ok("Running"));
        runner.respond(
            "webhookconfigurations",
            CommandOutput::ok("LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t"),
        );
        runner.respond(
            "logs",
            CommandOutput::ok("INFO controllers.Foo Successfully Reconciled\n"),
        );
        runner.respond("{{ .spec.count }}", CommandOutput::ok("5"));
        runner.respond("kustomize build", CommandOutput::ok("---\nkind: Namespace\n"));
        runner
    }

    /// `create api` writes a types file without the spec struct.
    pub fn without_spec_struct(mut self) -> Self {
        self.omit_spec_struct = true;
        self
    }

    pub fn snapshot_workspace_on(mut self, pattern: &str) -> Self {
        self.snapshot_on = Some(pattern.to_string());
        self
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.respond_sequence(pattern, vec![output]);
    }

    pub fn respond_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|rule| rule.pattern != pattern);
        rules.insert(
            0,
            Rule {
                pattern: pattern.to_string(),
                responses: outputs.into(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|line| line.contains(pattern))
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.snapshot.lock().unwrap().clone()
    }

    fn generate(&self, invocation: &Invocation) {
        let Some(dir) = &invocation.cwd else {
            return;
        };
        let args = &invocation.args;
        if args.first().map(String::as_str) == Some("init") {
            write(&dir.join("config/default/kustomization.yaml"), KUSTOMIZATION);
            write(&dir.join("main.go"), "package main\n");
        } else if args.starts_with(&["create".to_string(), "api".to_string()]) {
            let version = flag(args, "--version");
            let kind = flag(args, "--kind");
            let group = flag(args, "--group");
            let lower = kind.to_lowercase();
            let spec = if self.omit_spec_struct {
                String::new()
            } else {
                format!(
                    "// {kind}Spec defines the desired state of {kind}\ntype {kind}Spec struct {{\n\t// Foo is an example field\n\tFoo string `json:\"foo,omitempty\"`\n}}\n\n"
                )
            };
            write(
                &dir.join(format!("api/{version}/{lower}_types.go")),
                &format!("package {version}\n\n{spec}type {kind}Status struct {{\n}}\n"),
            );
            write(
                &dir.join(format!("config/samples/{group}_{version}_{lower}.yaml")),
                &format!("apiVersion: {group}/{version}\nkind: {kind}\nspec:\n  foo: bar\n"),
            );
        }
    }

    fn maybe_snapshot(&self, invocation: &Invocation) {
        let (Some(pattern), Some(dir)) = (&self.snapshot_on, &invocation.cwd) else {
            return;
        };
        if !invocation.command_line().contains(pattern.as_str()) {
            return;
        }
        let mut files = BTreeMap::new();
        collect_files(dir, dir, &mut files);
        *self.snapshot.lock().unwrap() = files;
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if invocation.program == "kubebuilder" {
            self.generate(invocation);
        }
        self.maybe_snapshot(invocation);

        let line = invocation.command_line();
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if line.contains(&rule.pattern) {
                let output = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                };
                return Ok(output.unwrap_or_else(|| CommandOutput::ok("")));
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

fn flag(args: &[String], name: &str) -> String {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|at| args.get(at + 1))
        .cloned()
        .unwrap_or_default()
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(contents) = fs::read_to_string(&path) {
            let relative = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            out.insert(relative, contents);
        }
    }
}
