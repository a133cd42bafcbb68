//! Dependabot coverage for the `github-actions` ecosystem.
//!
//! Workflows that pin third-party actions still rot without an update
//! job; this rule flags repositories whose dependabot configuration
//! doesn't cover the `github-actions` ecosystem at all.

use anyhow::anyhow;
use camino::Utf8PathBuf;
use workflow_models::dependabot::Dependabot;

use super::{Audit, AuditLoadError, audit_meta};
use crate::finding::{Confidence, Finding, Severity};
use crate::models::workflow::{Job, Workflow};
use crate::state::AuditState;

pub(crate) struct DependabotActions {
    /// Whether `.github/dependabot.{yml,yaml}` covers `github-actions`.
    covered: bool,
}

audit_meta!(
    DependabotActions,
    "dependabot-actions",
    "actions not covered by dependabot updates",
    "supply-chain/dependabot"
);

impl DependabotActions {
    fn load_config(root: &Utf8PathBuf) -> Option<Dependabot> {
        for name in ["dependabot.yml", "dependabot.yaml"] {
            let path = root.join(".github").join(name);
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };

            match serde_yaml::from_str(&contents) {
                Ok(config) => return Some(config),
                Err(e) => {
                    tracing::warn!("malformed dependabot config at {path}: {e}");
                    return None;
                }
            }
        }

        None
    }
}

impl Audit for DependabotActions {
    fn new(state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        // Without a repository root there's no config to check against.
        let Some(root) = &state.repo_root else {
            return Err(AuditLoadError::Skip(anyhow!(
                "no repository root; skipping dependabot coverage checks"
            )));
        };

        let covered = Self::load_config(root)
            .map(|config| config.covers_ecosystem("github-actions"))
            .unwrap_or(false);

        Ok(Self { covered })
    }

    fn audit_workflow<'doc>(&self, workflow: &'doc Workflow) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        if self.covered {
            return Ok(findings);
        }

        // Only workflows that actually pull in repository actions have
        // anything for dependabot to update.
        let uses_actions = workflow.jobs().any(|job| match job {
            Job::NormalJob(job) => job.steps().any(|step| {
                matches!(
                    step.uses(),
                    Some(workflow_models::common::Uses::Repository(_))
                )
            }),
            Job::ReusableWorkflowCallJob(job) => {
                matches!(job.uses, workflow_models::common::Uses::Repository(_))
            }
        });

        if !uses_actions {
            return Ok(findings);
        }

        findings.push(
            Self::finding()
                .severity(Severity::Low)
                .confidence(Confidence::High)
                .add_location(
                    workflow
                        .location()
                        .with_keys(["jobs".into()])
                        .primary()
                        .annotated(
                            "actions used here are not covered by a dependabot `github-actions` \
                             update job",
                        ),
                )
                .build(workflow)?,
        );

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::DependabotActions;
    use crate::audit::test_support::workflow;
    use crate::audit::{Audit as _, AuditLoadError};
    use crate::state::AuditState;

    fn state_with_root(dir: &std::path::Path) -> AuditState {
        AuditState::new(
            Some(Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap()),
            vec![],
        )
    }

    fn temp_repo(dependabot: Option<&str>) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flowlint-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let github = dir.join(".github");
        std::fs::create_dir_all(&github).unwrap();

        match dependabot {
            Some(contents) => std::fs::write(github.join("dependabot.yml"), contents).unwrap(),
            None => {
                let _ = std::fs::remove_file(github.join("dependabot.yml"));
            }
        }

        dir
    }

    const WORKFLOW: &str = r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
"#;

    #[test]
    fn test_skips_without_repo_root() {
        let state = AuditState::default();
        assert!(matches!(
            DependabotActions::new(&state),
            Err(AuditLoadError::Skip(_))
        ));
    }

    #[test]
    fn test_missing_config_is_flagged() {
        let dir = temp_repo(None);
        let audit = DependabotActions::new(&state_with_root(&dir)).unwrap();

        let wf = workflow(WORKFLOW);
        let findings = audit.audit_workflow(wf).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_covered_config_is_ok() {
        let dir = temp_repo(Some(
            r#"
version: 2
updates:
  - package-ecosystem: github-actions
    directory: /
    schedule:
      interval: weekly
"#,
        ));
        let audit = DependabotActions::new(&state_with_root(&dir)).unwrap();

        let wf = workflow(WORKFLOW);
        let findings = audit.audit_workflow(wf).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_workflow_without_actions_is_ok() {
        let dir = temp_repo(None);
        let audit = DependabotActions::new(&state_with_root(&dir)).unwrap();

        let wf = workflow("on: push\njobs:\n  t:\n    runs-on: ubuntu-latest\n    steps:\n      - run: make\n");
        let findings = audit.audit_workflow(wf).unwrap();
        assert!(findings.is_empty());
    }
}
