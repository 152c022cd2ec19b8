//! Go source for the defaulting and validating admission webhooks of the
//! generated kind.

use super::context::TestContext;

/// Value the defaulting hook assigns to an unset `spec.count`.
pub const DEFAULT_COUNT: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSource {
    pub domain: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resources: String,
}

impl WebhookSource {
    pub fn for_context(ctx: &TestContext) -> Self {
        Self {
            domain: ctx.domain.clone(),
            group: ctx.group.clone(),
            version: ctx.version.clone(),
            kind: ctx.kind.clone(),
            resources: ctx.resources.clone(),
        }
    }

    /// `<group>.<domain>`, the API group the webhooks are registered for.
    pub fn group_domain(&self) -> String {
        format!("{}.{}", self.group, self.domain)
    }

    /// Admission path for `verb` (`mutate` or `validate`).
    pub fn path(&self, verb: &str) -> String {
        format!(
            "/{verb}-{}-{}-{}",
            self.group_domain().replace('.', "-"),
            self.version,
            self.kind.to_lowercase()
        )
    }

    pub fn render(&self) -> String {
        let kind = &self.kind;
        let lower = self.kind.to_lowercase();
        let version = &self.version;
        let groups = self.group_domain();
        let resources = &self.resources;
        let mutate = self.path("mutate");
        let validate = self.path("validate");

        format!(
            r#"package {version}

import (
	"errors"

	"k8s.io/apimachinery/pkg/runtime"
	ctrl "sigs.k8s.io/controller-runtime"
	logf "sigs.k8s.io/controller-runtime/pkg/log"
	"sigs.k8s.io/controller-runtime/pkg/webhook"
)

// log is for logging in this package.
var {lower}log = logf.Log.WithName("{lower}-resource")

func (r *{kind}) SetupWebhookWithManager(mgr ctrl.Manager) error {{
	return ctrl.NewWebhookManagedBy(mgr).
		For(r).
		Complete()
}}

// +kubebuilder:webhook:path={mutate},mutating=true,failurePolicy=fail,groups={groups},resources={resources},verbs=create;update,versions={version},name=m{lower}.kb.io

var _ webhook.Defaulter = &{kind}{{}}

// Default implements webhook.Defaulter so a webhook will be registered for the type
func (r *{kind}) Default() {{
	{lower}log.Info("default", "name", r.Name)

	if r.Spec.Count == 0 {{
		r.Spec.Count = {DEFAULT_COUNT}
	}}
}}

// +kubebuilder:webhook:verbs=create;update,path={validate},mutating=false,failurePolicy=fail,groups={groups},resources={resources},versions={version},name=v{lower}.kb.io

var _ webhook.Validator = &{kind}{{}}

// ValidateCreate implements webhook.Validator so a webhook will be registered for the type
func (r *{kind}) ValidateCreate() error {{
	{lower}log.Info("validate create", "name", r.Name)

	return r.validateCount()
}}

// ValidateUpdate implements webhook.Validator so a webhook will be registered for the type
func (r *{kind}) ValidateUpdate(old runtime.Object) error {{
	{lower}log.Info("validate update", "name", r.Name)

	return r.validateCount()
}}

// ValidateDelete implements webhook.Validator so a webhook will be registered for the type
func (r *{kind}) ValidateDelete() error {{
	return nil
}}

func (r *{kind}) validateCount() error {{
	if r.Spec.Count < 0 {{
		return errors.New(".spec.count must >= 0")
	}}
	return nil
}}
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    #[test]
    fn test_markers_use_dashed_group_domain() {
        let ctx = TestContext::derive(&HarnessConfig::default(), "abcdef");
        let source = WebhookSource::for_context(&ctx);
        assert_eq!(source.group_domain(), "barabcdef.example.comabcdef");
        assert_eq!(
            source.path("mutate"),
            "/mutate-barabcdef-example-comabcdef-v1alpha1-fooabcdef"
        );

        let go = source.render();
        assert!(go.starts_with("package v1alpha1\n"));
        assert!(go.contains(
            "+kubebuilder:webhook:path=/mutate-barabcdef-example-comabcdef-v1alpha1-fooabcdef,mutating=true"
        ));
        assert!(go.contains("resources=fooabcdefs"));
        assert!(go.contains("var _ webhook.Defaulter = &Fooabcdef{}"));
        assert!(go.contains("r.Spec.Count = 5"));
        assert!(go.contains("func (r *Fooabcdef) validateCount() error {"));
    }
}
