//! Thin kubectl wrapper bound to one test context.

use std::path::PathBuf;
use std::sync::Arc;

use super::context::TestContext;
use super::process::{CommandError, CommandRunner, Invocation};

/// Runs kubectl in the workspace directory so relative manifest paths resolve.
/// `namespaced` calls are scoped with `-n <namespace>`.
#[derive(Clone)]
pub struct ClusterClient {
    runner: Arc<dyn CommandRunner>,
    kubectl: String,
    namespace: String,
    dir: PathBuf,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("kubectl", &self.kubectl)
            .field("namespace", &self.namespace)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        kubectl: impl Into<String>,
        namespace: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            kubectl: kubectl.into(),
            namespace: namespace.into(),
            dir: dir.into(),
        }
    }

    pub fn for_context(runner: Arc<dyn CommandRunner>, kubectl: &str, ctx: &TestContext) -> Self {
        Self::new(runner, kubectl, ctx.namespace.clone(), ctx.dir.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn invocation<I, S>(&self, namespaced: bool, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut invocation = Invocation::new(self.kubectl.clone()).cwd(self.dir.clone());
        if namespaced {
            invocation = invocation.args(["-n".to_string(), self.namespace.clone()]);
        }
        invocation.args(args)
    }

    fn stdout(&self, invocation: Invocation) -> Result<String, CommandError> {
        self.runner
            .run_checked(&invocation)
            .map(|output| output.stdout)
    }

    /// `kubectl [-n ns] get <args...>`; returns stdout.
    pub fn get(&self, namespaced: bool, args: &[&str]) -> Result<String, CommandError> {
        self.stdout(self.invocation(namespaced, ["get"].iter().chain(args).copied()))
    }

    /// `kubectl [-n ns] get <kind> <name> -o <output>`.
    pub fn get_resource(
        &self,
        namespaced: bool,
        kind: &str,
        name: &str,
        output: &str,
    ) -> Result<String, CommandError> {
        self.get(namespaced, &[kind, name, "-o", output])
    }

    pub fn apply(&self, namespaced: bool, args: &[&str]) -> Result<String, CommandError> {
        self.stdout(self.invocation(namespaced, ["apply"].iter().chain(args).copied()))
    }

    pub fn apply_file(&self, namespaced: bool, file: &str) -> Result<String, CommandError> {
        self.apply(namespaced, &["-f", file])
    }

    /// `kubectl delete --ignore-not-found -f -` with `manifests` on stdin.
    /// Runs even after cancellation since it only ever undoes.
    pub fn delete_stdin(&self, manifests: &str) -> Result<String, CommandError> {
        let invocation = self
            .invocation(false, ["delete", "--ignore-not-found", "-f", "-"])
            .stdin(manifests)
            .survives_cancel();
        self.stdout(invocation)
    }

    /// `kubectl -n ns logs <pod> -c <container>`.
    pub fn logs(&self, pod: &str, container: &str) -> Result<String, CommandError> {
        self.stdout(self.invocation(true, ["logs", pod, "-c", container]))
    }
}
