//! Functionality for registering and managing the lifecycles of
//! audits and their findings.

use std::process::ExitCode;

use indexmap::IndexMap;
use tracing::instrument;

use crate::audit::{self, Audit, AuditLoadError, JobAnalysis};
use crate::config::Config;
use crate::finding::{Finding, Severity};
use crate::models::workflow::{Job, Workflow};
use crate::state::AuditState;

pub(crate) mod input;

pub(crate) struct AuditRegistry {
    audits: IndexMap<&'static str, Box<dyn Audit + Send + Sync>>,
}

impl AuditRegistry {
    fn empty() -> Self {
        Self {
            audits: Default::default(),
        }
    }

    /// Constructs a new [`AuditRegistry`] with all default audits
    /// registered. Registration order is also fix-application order.
    pub(crate) fn default_audits(state: &AuditState) -> anyhow::Result<Self> {
        let mut registry = Self::empty();

        macro_rules! register_audit {
            ($rule:path) => {{
                // HACK: https://github.com/rust-lang/rust/issues/48067
                use $rule as base;

                use crate::audit::AuditCore as _;
                match base::new(state) {
                    Ok(audit) => registry.register_audit(base::ident(), Box::new(audit)),
                    Err(AuditLoadError::Skip(e)) => {
                        tracing::debug!("skipping {audit}: {e}", audit = base::ident())
                    }
                    Err(AuditLoadError::Fail(e)) => {
                        return Err(e.context(format!(
                            "failed to load audit {audit}",
                            audit = base::ident()
                        )));
                    }
                }
            }};
        }

        register_audit!(audit::code_injection::CodeInjection);
        register_audit!(audit::argument_injection::ArgumentInjection);
        register_audit!(audit::output_clobbering::OutputClobbering);
        register_audit!(audit::cache_poisoning::CachePoisoning);
        register_audit!(audit::request_forgery::RequestForgery);
        register_audit!(audit::secret_exfiltration::SecretExfiltration);
        register_audit!(audit::dangerous_triggers::DangerousTriggers);
        register_audit!(audit::secrets_inherit::SecretsInherit);
        register_audit!(audit::reusable_workflow_taint::ReusableWorkflowTaint);
        register_audit!(audit::dependabot_actions::DependabotActions);

        Ok(registry)
    }

    pub(crate) fn len(&self) -> usize {
        self.audits.len()
    }

    pub(crate) fn register_audit(
        &mut self,
        ident: &'static str,
        audit: Box<dyn Audit + Send + Sync>,
    ) {
        self.audits.insert(ident, audit);
    }

    /// Runs every registered audit over the given workflow, in visitor
    /// order: workflow hooks first, then each job (with its shared
    /// analysis) and its steps.
    ///
    /// An audit error is treated as fatal for the *current workflow*
    /// only: it's logged with its rule ID and aborts the rest of this
    /// workflow's analysis, returning whatever accumulated.
    #[instrument(skip_all, fields(workflow = %workflow.key))]
    pub(crate) fn audit_workflow<'doc>(&self, workflow: &'doc Workflow) -> Vec<Finding<'doc>> {
        let mut findings = vec![];

        for (ident, audit) in &self.audits {
            match audit.audit_workflow(workflow) {
                Ok(results) => findings.extend(results),
                Err(e) => {
                    tracing::error!("{ident}: aborting analysis of {key}: {e}", key = workflow.key);
                    return findings;
                }
            }
        }

        for job in workflow.jobs() {
            match job {
                Job::NormalJob(job) => {
                    // Per-job analysis (taint, effective triggers) is
                    // computed once and shared by every rule.
                    let analysis = JobAnalysis::new(&job);

                    for (ident, audit) in &self.audits {
                        match audit.audit_normal_job(&job, &analysis) {
                            Ok(results) => findings.extend(results),
                            Err(e) => {
                                tracing::error!(
                                    "{ident}: aborting analysis of {key}: {e}",
                                    key = workflow.key
                                );
                                return findings;
                            }
                        }
                    }
                }
                Job::ReusableWorkflowCallJob(job) => {
                    for (ident, audit) in &self.audits {
                        match audit.audit_reusable_job(&job) {
                            Ok(results) => findings.extend(results),
                            Err(e) => {
                                tracing::error!(
                                    "{ident}: aborting analysis of {key}: {e}",
                                    key = workflow.key
                                );
                                return findings;
                            }
                        }
                    }
                }
            }
        }

        findings
    }
}

impl std::fmt::Debug for AuditRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRegistry")
            .field("audits", &self.audits.len())
            .finish()
    }
}

/// A registry of all findings discovered during a run.
pub(crate) struct FindingRegistry<'a> {
    config: &'a Config,
    minimum_severity: Option<Severity>,
    ignored: Vec<Finding<'a>>,
    findings: Vec<Finding<'a>>,
    highest_seen_severity: Option<Severity>,
}

impl<'a> FindingRegistry<'a> {
    pub(crate) fn new(config: &'a Config, minimum_severity: Option<Severity>) -> Self {
        Self {
            config,
            minimum_severity,
            ignored: Default::default(),
            findings: Default::default(),
            highest_seen_severity: None,
        }
    }

    /// Adds one or more findings to the current findings set, applying
    /// configuration in the process.
    pub(crate) fn extend(&mut self, results: Vec<Finding<'a>>) {
        for mut finding in results {
            if let Some(severity) = self.config.severity_override(finding.ident) {
                finding.determinations.severity = severity;
            }

            if finding.ignored
                || !self.config.rule_enabled(finding.ident)
                || self
                    .minimum_severity
                    .is_some_and(|min| min > finding.determinations.severity)
            {
                self.ignored.push(finding);
            } else {
                if self
                    .highest_seen_severity
                    .is_none_or(|s| finding.determinations.severity > s)
                {
                    self.highest_seen_severity = Some(finding.determinations.severity);
                }

                self.findings.push(finding);
            }
        }
    }

    /// Sorts findings into their emission order:
    /// `(path, line, column, rule)`.
    pub(crate) fn sort(&mut self) {
        self.findings.sort_by(|a, b| {
            let a_loc = &a.primary_location().concrete.location;
            let b_loc = &b.primary_location().concrete.location;

            (
                a.primary_location().symbolic.key,
                a_loc.start_point.row,
                a_loc.start_point.column,
                a.ident,
            )
                .cmp(&(
                    b.primary_location().symbolic.key,
                    b_loc.start_point.row,
                    b_loc.start_point.column,
                    b.ident,
                ))
        });
    }

    /// The total count of all findings, regardless of status.
    pub(crate) fn count(&self) -> usize {
        self.findings.len() + self.ignored.len()
    }

    /// All non-ignored findings.
    pub(crate) fn findings(&self) -> &[Finding<'a>] {
        &self.findings
    }

    /// All ignored findings.
    pub(crate) fn ignored(&self) -> &[Finding<'a>] {
        &self.ignored
    }

    /// Findings that carry at least one fix.
    pub(crate) fn fixable_findings(&self) -> impl Iterator<Item = &Finding<'a>> {
        self.findings.iter().filter(|f| !f.fixes.is_empty())
    }

    /// Returns an appropriate exit code based on the registry's
    /// highest-seen severity.
    pub(crate) fn exit_code(&self) -> ExitCode {
        match self.highest_seen_severity {
            Some(sev) => match sev {
                Severity::Unknown => ExitCode::from(10),
                Severity::Informational => ExitCode::from(11),
                Severity::Low => ExitCode::from(12),
                Severity::Medium => ExitCode::from(13),
                Severity::High => ExitCode::from(14),
                Severity::Critical => ExitCode::from(15),
            },
            None => ExitCode::SUCCESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditRegistry, FindingRegistry};
    use crate::audit::test_support::workflow;
    use crate::config::Config;
    use crate::state::AuditState;

    #[test]
    fn test_default_audits_register() {
        let registry = AuditRegistry::default_audits(&AuditState::default()).unwrap();
        // dependabot-actions skips without a repo root; the other nine
        // register unconditionally.
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_findings_deterministic_order() {
        let registry = AuditRegistry::default_audits(&AuditState::default()).unwrap();
        let wf = workflow(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.pull_request.title }}"
      - run: git diff ${{ github.head_ref }}
"#,
        );

        let config = Config::default();

        let mut first = FindingRegistry::new(&config, None);
        first.extend(registry.audit_workflow(wf));
        first.sort();

        let mut second = FindingRegistry::new(&config, None);
        second.extend(registry.audit_workflow(wf));
        second.sort();

        let order = |reg: &FindingRegistry| {
            reg.findings()
                .iter()
                .map(|f| {
                    (
                        f.ident,
                        f.primary_location().concrete.location.start_point.row,
                        f.primary_location().concrete.location.start_point.column,
                    )
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(order(&first), order(&second));

        // Sorted by position, then rule.
        let rows: Vec<_> = order(&first).iter().map(|(_, row, _)| *row).collect();
        let mut sorted_rows = rows.clone();
        sorted_rows.sort();
        assert_eq!(rows, sorted_rows);
    }

    #[test]
    fn test_fix_idempotence() {
        // Applying a finding's fixes yields output that re-parses and
        // no longer produces the same rule at the same position.
        use crate::models::AsDocument as _;

        let registry = AuditRegistry::default_audits(&AuditState::default()).unwrap();
        let wf = workflow(
            r#"on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.pull_request.title }}"
"#,
        );

        let config = Config::default();
        let mut findings = FindingRegistry::new(&config, None);
        findings.extend(registry.audit_workflow(wf));

        let injection = findings
            .findings()
            .iter()
            .find(|f| f.ident == "code-injection-critical")
            .expect("expected an injection finding");

        let fixed = injection.fixes[0].apply(wf.as_document()).unwrap();
        let refixed = workflow(fixed.source());

        let mut second = FindingRegistry::new(&config, None);
        second.extend(registry.audit_workflow(refixed));

        assert!(
            !second
                .findings()
                .iter()
                .any(|f| f.ident == "code-injection-critical"),
            "fix was not idempotent: {fixed}",
            fixed = fixed.source()
        );
    }

    #[test]
    fn test_min_severity_filters() {
        use crate::finding::Severity;

        let registry = AuditRegistry::default_audits(&AuditState::default()).unwrap();
        let wf = workflow(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.pull_request.title }}"
"#,
        );

        let config = Config::default();
        let mut findings = FindingRegistry::new(&config, Some(Severity::Critical));
        findings.extend(registry.audit_workflow(wf));

        assert!(
            findings
                .findings()
                .iter()
                .all(|f| f.determinations.severity >= Severity::Critical)
        );
        // The dangerous-triggers finding (critical) survives; the
        // medium ones don't.
        assert!(!findings.findings().is_empty());
        assert!(!findings.ignored().is_empty());
    }
}
