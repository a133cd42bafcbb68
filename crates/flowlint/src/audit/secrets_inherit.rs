//! Blanket secret inheritance into reusable workflows.

use std::sync::Arc;

use indexmap::IndexMap;
use workflow_models::common::Uses;
use yamlpatch::{Op, Patch};

use super::{Audit, AuditLoadError, audit_meta};
use crate::finding::location::{Locatable as _, Routable as _};
use crate::finding::{Confidence, Finding, Fix, Severity};
use crate::models::workflow::{JobExt as _, ReusableWorkflowCallJob};
use crate::state::{AuditState, ReusableWorkflowCache};

pub(crate) struct SecretsInherit {
    reusable_workflows: Arc<ReusableWorkflowCache>,
}

audit_meta!(
    SecretsInherit,
    "secrets-inherit",
    "secrets unconditionally inherited by called workflow",
    "secrets/inherit"
);

/// The secret name used when the callee's declarations can't be
/// resolved; a stand-in the user is expected to replace.
const PLACEHOLDER_SECRET: &str = "SECRET_NAME";

impl SecretsInherit {
    /// Builds the explicit `secrets:` mapping for the fix, preferring
    /// the callee's declared secrets when the callee is a resolvable
    /// local workflow.
    fn explicit_secrets(&self, job: &ReusableWorkflowCallJob<'_>) -> (Vec<String>, bool) {
        if let Uses::Local(local) = &job.uses
            && let Some(metadata) = self.reusable_workflows.lookup(&local.path)
            && !metadata.secrets.is_empty()
        {
            return (metadata.secrets.clone(), true);
        }

        (vec![PLACEHOLDER_SECRET.to_string()], false)
    }
}

impl Audit for SecretsInherit {
    fn new(state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self {
            reusable_workflows: state.reusable_workflows.clone(),
        })
    }

    fn audit_reusable_job<'doc>(
        &self,
        job: &ReusableWorkflowCallJob<'doc>,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        if !job.secrets.as_ref().is_some_and(|s| s.is_inherit()) {
            return Ok(findings);
        }

        let (secret_names, resolved) = self.explicit_secrets(job);

        let mut mapping = serde_yaml::Mapping::new();
        for name in &secret_names {
            mapping.insert(
                serde_yaml::Value::String(name.clone()),
                serde_yaml::Value::String(format!("${{{{ secrets.{name} }}}}")),
            );
        }

        let title = if resolved {
            "declare only the secrets the callee uses".to_string()
        } else {
            format!("replace `inherit` with an explicit map (edit `{PLACEHOLDER_SECRET}`)")
        };

        let fix = Fix {
            title,
            key: job.location().key,
            patches: vec![Patch {
                route: job.route().with_key("secrets"),
                operation: Op::Replace(serde_yaml::Value::Mapping(mapping)),
            }],
        };

        let confidence = if resolved {
            Confidence::High
        } else {
            Confidence::Medium
        };

        findings.push(
            Self::finding()
                .severity(Severity::Medium)
                .confidence(confidence)
                .add_location(
                    job.location()
                        .with_keys(["uses".into()])
                        .annotated("this reusable workflow"),
                )
                .add_location(
                    job.location()
                        .with_keys(["secrets".into()])
                        .primary()
                        .annotated("inherits every secret of the calling workflow"),
                )
                .fix(fix)
                .build(job.parent())?,
        );

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::test_support::{findings_for, fix_applied};

    #[test]
    fn test_secrets_inherit() {
        let findings = findings_for::<super::SecretsInherit>(
            r#"
on: push
jobs:
  deploy:
    uses: org/repo/.github/workflows/deploy.yml@v1
    secrets: inherit
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(
            findings[0]
                .primary_location()
                .symbolic
                .annotation
                .contains("inherits every secret")
        );
    }

    #[test]
    fn test_explicit_secrets_are_ok() {
        let findings = findings_for::<super::SecretsInherit>(
            r#"
on: push
jobs:
  deploy:
    uses: org/repo/.github/workflows/deploy.yml@v1
    secrets:
      token: ${{ secrets.DEPLOY_TOKEN }}
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_fix_uses_placeholder_without_metadata() {
        let fixed = fix_applied::<super::SecretsInherit>(
            r#"on: push
jobs:
  deploy:
    uses: org/repo/.github/workflows/deploy.yml@v1
    secrets: inherit
"#,
        );

        assert!(!fixed.contains("secrets: inherit"), "fixed:\n{fixed}");
        assert!(
            fixed.contains("SECRET_NAME: ${{ secrets.SECRET_NAME }}"),
            "fixed:\n{fixed}"
        );
    }
}
