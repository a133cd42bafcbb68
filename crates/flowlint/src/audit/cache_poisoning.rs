//! Cache poisoning via unsafe checkouts and untrusted cache keys.
//!
//! Two shapes are covered. The *indirect* shape checks out an
//! attacker-controlled ref under a privileged trigger and then lets a
//! cache-aware action write caches from that tree. The *direct* shape
//! feeds untrusted data into `actions/cache` inputs themselves.

use workflow_expressions::{SpannedExpr, capability};
use yamlpatch::{Op, Patch};

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta};
use crate::finding::location::{Locatable as _, Routable as _};
use crate::finding::{Confidence, Finding, Fix, Severity};
use crate::models::workflow::{Job, JobExt as _, NormalJob, Step, Workflow};
use crate::state::AuditState;
use crate::utils::extract_expressions;
use workflow_models::workflow::event::BareEvent;

pub(crate) struct CachePoisoning;

audit_meta!(
    CachePoisoning,
    "cache-poisoning",
    "runtime artifacts potentially vulnerable to cache poisoning",
    "cache/poisoning"
);

/// Cache actions: a workflow with this many or more cache steps can be
/// abused to evict other branches' caches.
const CACHE_EVICTION_THRESHOLD: usize = 5;

/// Ref values that are safe to check out under a privileged trigger.
const SAFE_REF_EXPRESSIONS: &[&str] = &[
    "github.sha",
    "github.ref",
    "github.base_ref",
    "github.event.pull_request.base.sha",
    "github.event.pull_request.base.ref",
    "github.event.repository.default_branch",
];

impl CachePoisoning {
    /// Whether a checkout `ref:` value can be attacker-controlled.
    ///
    /// Anything carrying an expression that isn't on the known-safe
    /// list is treated as unsafe, conservatively.
    fn checkout_ref_is_unsafe(value: &str) -> bool {
        let exprs = extract_expressions(value);

        if exprs.is_empty() {
            // A literal merge ref re-checks-out the attacker's code.
            return value.trim().starts_with("refs/pull/") && value.trim().ends_with("/merge");
        }

        exprs.iter().any(|(expr, _)| {
            let bare = expr.as_bare().trim();
            !SAFE_REF_EXPRESSIONS
                .iter()
                .any(|safe| bare.eq_ignore_ascii_case(safe))
        })
    }

    /// Whether this step restores or writes a cache.
    fn is_cache_step(step: &Step<'_>) -> bool {
        if step.uses_matches("actions/cache") || step.uses_matches("actions/cache/restore") {
            return true;
        }

        // `actions/setup-*` toolchains opt into caching via a `cache`
        // input that must be neither empty nor "false".
        if let Some(workflow_models::common::Uses::Repository(repo)) = step.uses()
            && repo.owner.eq_ignore_ascii_case("actions")
            && repo.repo.to_ascii_lowercase().starts_with("setup-")
        {
            return step
                .input("cache")
                .is_some_and(|v| !v.trim().is_empty() && v.trim() != "false");
        }

        false
    }

    /// Indirect poisoning: an unsafe checkout earlier in the job, with
    /// a cache-aware step after it.
    fn audit_indirect<'doc>(
        &self,
        job: &NormalJob<'doc>,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];
        let mut unsafe_checkout: Option<Step<'doc>> = None;

        for step in job.steps() {
            if step.uses_matches("actions/checkout") {
                // A safe subsequent checkout resets the working tree.
                unsafe_checkout = match step.input("ref") {
                    Some(ref_value) if Self::checkout_ref_is_unsafe(&ref_value) => Some(step),
                    _ => None,
                };
                continue;
            }

            if !Self::is_cache_step(&step) {
                continue;
            }

            let Some(checkout) = &unsafe_checkout else {
                continue;
            };

            let fix = Fix {
                title: "remove the unsafe `ref` from the checkout".to_string(),
                key: step.location().key,
                patches: vec![Patch {
                    route: checkout.route().with_keys(["with".into(), "ref".into()]),
                    operation: Op::Remove,
                }],
            };

            findings.push(
                Self::finding()
                    .severity(Severity::High)
                    .confidence(Confidence::High)
                    .add_location(
                        checkout
                            .location()
                            .with_keys(["with".into(), "ref".into()])
                            .annotated("attacker-controlled ref checked out here"),
                    )
                    .add_location(
                        step.location()
                            .primary()
                            .with_keys(["uses".into()])
                            .annotated("cache written from the attacker's tree here"),
                    )
                    .fix(fix)
                    .build(job.parent())?,
            );
        }

        Ok(findings)
    }

    /// Direct poisoning: untrusted data in `actions/cache` inputs.
    fn audit_direct<'doc>(
        &self,
        job: &NormalJob<'doc>,
        analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        for step in job.steps() {
            if !step.uses_matches("actions/cache") {
                continue;
            }

            for input in ["key", "restore-keys", "path"] {
                let Some(value) = step.input(input) else {
                    continue;
                };

                for (expr, _) in extract_expressions(&value) {
                    let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                        continue;
                    };

                    let mut paths: Vec<String> = capability::untrusted_contexts(&parsed)
                        .iter()
                        .map(|f| f.context.as_str().to_string())
                        .collect();
                    if let Some(sources) = analysis.taint.is_tainted_before(&parsed, step.index) {
                        paths.extend(sources.into_iter().map(|s| s.path));
                    }

                    if paths.is_empty() {
                        continue;
                    }

                    let mut builder = Self::finding()
                        .severity(Severity::High)
                        .confidence(Confidence::High)
                        .add_location(step.location().hidden())
                        .add_location(
                            step.location()
                                .with_keys(["with".into(), input.into()])
                                .primary()
                                .annotated(format!(
                                    "untrusted `{paths}` controls the cache {input}",
                                    paths = paths.join("`, `")
                                )),
                        );

                    for path in &paths {
                        builder = builder.untrusted_path(path);
                    }

                    // Keys can be pinned to the commit; a poisoned path
                    // has no mechanical fix.
                    if input != "path" {
                        builder = builder.fix(Fix {
                            title: format!("pin the cache {input} to the commit hash"),
                            key: step.location().key,
                            patches: vec![Patch {
                                route: step
                                    .route()
                                    .with_keys(["with".into(), input.into()]),
                                operation: Op::RewriteFragment {
                                    from: subfeature::Subfeature::new(0, expr.as_raw()),
                                    to: "${{ github.sha }}".into(),
                                },
                            }],
                        });
                    }

                    findings.push(builder.build(job.parent())?);
                }

                // A fully derivable key is forgeable by anyone who can
                // see the repository contents.
                if input == "key"
                    && value.contains("hashFiles(")
                    && !["github.sha", "github.run_id", "github.run_number", "github.run_attempt"]
                        .iter()
                        .any(|anchor| value.contains(anchor))
                    && job.parent().has_external_trigger()
                {
                    findings.push(
                        Self::finding()
                            .severity(Severity::Medium)
                            .confidence(Confidence::Medium)
                            .add_location(
                                step.location()
                                    .with_keys(["with".into(), "key".into()])
                                    .primary()
                                    .annotated(
                                        "cache key is fully predictable from repository contents",
                                    ),
                            )
                            .build(job.parent())?,
                    );
                }
            }
        }

        Ok(findings)
    }

    fn cache_steps(workflow: &Workflow) -> usize {
        workflow
            .jobs()
            .filter_map(|job| match job {
                Job::NormalJob(job) => Some(job),
                _ => None,
            })
            .flat_map(|job| job.steps().collect::<Vec<_>>())
            .filter(Self::is_cache_step)
            .count()
    }

    /// Whether the workflow also pushes to a default branch, making its
    /// caches ancestors of every PR cache scope.
    fn pushes_to_default_branch(workflow: &Workflow) -> bool {
        let workflow_models::workflow::Trigger::Events(events) = &workflow.on else {
            return workflow.has_event(BareEvent::Push);
        };

        match &events.push {
            workflow_models::workflow::event::OptionalBody::Body(push) => {
                match &push.branches {
                    Some(branches) => branches
                        .iter()
                        .any(|b| b == "main" || b == "master"),
                    // No branch filter: pushes to the default branch too.
                    None => true,
                }
            }
            workflow_models::workflow::event::OptionalBody::Default => true,
            workflow_models::workflow::event::OptionalBody::Missing => false,
        }
    }
}

impl Audit for CachePoisoning {
    fn new(_state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self)
    }

    fn audit_workflow<'doc>(&self, workflow: &'doc Workflow) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        // Cache-hierarchy exploitation: an externally triggerable
        // workflow that also populates default-branch caches.
        if workflow.has_external_trigger() && Self::pushes_to_default_branch(workflow) {
            let caches = Self::cache_steps(workflow);
            if caches > 0 {
                findings.push(
                    Self::finding()
                        .severity(Severity::Informational)
                        .confidence(Confidence::Low)
                        .add_location(
                            workflow
                                .location()
                                .with_keys(["on".into()])
                                .primary()
                                .annotated(
                                    "default-branch caches seed externally-triggered runs",
                                ),
                        )
                        .build(workflow)?,
                );
            }
        }

        // Cache eviction: enough cache entries to churn the repository
        // cache quota.
        if Self::cache_steps(workflow) >= CACHE_EVICTION_THRESHOLD {
            findings.push(
                Self::finding()
                    .severity(Severity::Informational)
                    .confidence(Confidence::Low)
                    .add_location(
                        workflow
                            .location()
                            .with_keys(["jobs".into()])
                            .primary()
                            .annotated(format!(
                                "{CACHE_EVICTION_THRESHOLD}+ cache actions risk cache eviction abuse"
                            )),
                    )
                    .build(workflow)?,
            );
        }

        Ok(findings)
    }

    fn audit_normal_job<'doc>(
        &self,
        job: &NormalJob<'doc>,
        analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        // The indirect shape requires a trigger whose payload an
        // attacker can steer.
        if analysis
            .effective_triggers
            .iter()
            .any(|t| crate::models::workflow::PRIVILEGED_TRIGGERS.contains(t))
        {
            findings.extend(self.audit_indirect(job)?);
        }

        findings.extend(self.audit_direct(job, analysis)?);

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::test_support::{findings_for, fix_applied};

    #[test]
    fn test_indirect_cache_poisoning() {
        let findings = findings_for::<super::CachePoisoning>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
      - uses: actions/cache@v4
        with:
          path: ~/.cargo
          key: cargo-${{ github.sha }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(
            findings[0]
                .primary_location()
                .symbolic
                .annotation
                .contains("cache written")
        );
    }

    #[test]
    fn test_safe_checkout_resets() {
        let findings = findings_for::<super::CachePoisoning>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
      - uses: actions/checkout@v4
      - uses: actions/cache@v4
        with:
          path: ~/.cargo
          key: cargo-${{ github.sha }}
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_setup_action_cache_opt_in() {
        let findings = findings_for::<super::CachePoisoning>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.ref }}
      - uses: actions/setup-node@v4
        with:
          node-version: 20
          cache: npm
"#,
        );

        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_setup_action_without_cache_is_ok() {
        let findings = findings_for::<super::CachePoisoning>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
      - uses: actions/setup-node@v4
        with:
          node-version: 20
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_direct_cache_key_injection() {
        let findings = findings_for::<super::CachePoisoning>(
            r#"
on: pull_request
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/cache@v4
        with:
          path: ~/.cargo
          key: cache-${{ github.head_ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].untrusted_paths, ["github.head_ref"]);
    }

    #[test]
    fn test_fix_removes_checkout_ref() {
        let fixed = fix_applied::<super::CachePoisoning>(
            r#"on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
      - uses: actions/cache@v4
        with:
          path: ~/.cargo
          key: cargo-${{ github.sha }}
"#,
        );

        assert!(!fixed.contains("ref: ${{ github.head_ref }}"), "fixed:\n{fixed}");
        assert!(fixed.contains("actions/checkout@v4"), "fixed:\n{fixed}");
    }
}
