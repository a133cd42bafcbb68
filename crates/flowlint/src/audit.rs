//! Core namespace for flowlint's audits.

use subfeature::Subfeature;
use thiserror::Error;
use yamlpatch::{Op, Patch};

use crate::conditions;
use crate::finding::location::{Locatable as _, Routable as _};
use crate::finding::{Finding, FindingBuilder, Fix};
use crate::models::workflow::{
    JobExt as _, NormalJob, PRIVILEGED_TRIGGERS, ReusableWorkflowCallJob, ScriptKind, Step,
    Workflow,
};
use crate::state::AuditState;
use crate::taint::TaintTracker;
use crate::utils::env_var_name_for;

pub(crate) mod argument_injection;
pub(crate) mod cache_poisoning;
pub(crate) mod code_injection;
pub(crate) mod dangerous_triggers;
pub(crate) mod dependabot_actions;
pub(crate) mod output_clobbering;
pub(crate) mod request_forgery;
pub(crate) mod reusable_workflow_taint;
pub(crate) mod secret_exfiltration;
pub(crate) mod secrets_inherit;

/// A supertrait for all audits.
pub(crate) trait AuditCore {
    fn ident() -> &'static str
    where
        Self: Sized;

    fn desc() -> &'static str
    where
        Self: Sized;

    fn category() -> &'static str
    where
        Self: Sized;

    fn finding<'doc>() -> FindingBuilder<'doc>
    where
        Self: Sized,
    {
        FindingBuilder::new(Self::ident(), Self::desc(), Self::category())
    }
}

/// A convenience macro for implementing [`AuditCore`] on a type.
///
/// Example use:
///
/// ```no_run
/// struct SomeAudit;
///
/// audit_meta!(SomeAudit, "some-audit", "brief description", "category/path");
/// ```
macro_rules! audit_meta {
    ($t:ty, $id:literal, $desc:expr_2021, $category:literal) => {
        use crate::audit::AuditCore;

        impl AuditCore for $t {
            fn ident() -> &'static str {
                $id
            }

            fn desc() -> &'static str
            where
                Self: Sized,
            {
                $desc
            }

            fn category() -> &'static str {
                $category
            }
        }
    };
}

pub(crate) use audit_meta;

#[derive(Error, Debug)]
pub(crate) enum AuditLoadError {
    /// The audit's initialization failed in a way that suggests it should
    /// be skipped, rather than failing the entire run.
    #[error("{0}")]
    Skip(anyhow::Error),
    /// The audit's initialization failed in a way that suggests that the
    /// entire run should be aborted.
    #[error("{0}")]
    Fail(anyhow::Error),
}

/// Per-job analysis shared by every rule while the job's steps are
/// being visited.
///
/// This is computed once per job by the audit driver and handed to
/// rules by reference; it's immutable for the duration of the visit.
pub(crate) struct JobAnalysis {
    /// Cross-step taint state for the whole job.
    pub(crate) taint: TaintTracker,
    /// The triggers under which this job actually runs, after
    /// interpreting its `if:` condition.
    pub(crate) effective_triggers: Vec<&'static str>,
}

impl JobAnalysis {
    pub(crate) fn new(job: &NormalJob<'_>) -> Self {
        let taint = TaintTracker::analyze_job(job);
        let triggers = job.parent().trigger_names();
        let effective_triggers = conditions::effective_triggers(&triggers, job.r#if.as_ref());

        Self {
            taint,
            effective_triggers,
        }
    }

    /// Whether the job runs under any privileged trigger.
    pub(crate) fn is_privileged(&self) -> bool {
        self.effective_triggers
            .iter()
            .any(|t| PRIVILEGED_TRIGGERS.contains(t))
    }
}

/// Auditing trait.
///
/// Implementors pick the specificity they need: workflow-level hooks
/// run once per workflow, job hooks once per job (with the shared
/// [`JobAnalysis`]), and step hooks once per step. The driver in
/// [`crate::registry`] owns the traversal order, so per-job analysis is
/// computed exactly once across all rules.
pub(crate) trait Audit: AuditCore {
    fn new(state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized;

    fn audit_workflow<'doc>(&self, _workflow: &'doc Workflow) -> anyhow::Result<Vec<Finding<'doc>>> {
        Ok(vec![])
    }

    fn audit_normal_job<'doc>(
        &self,
        job: &NormalJob<'doc>,
        analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut results = vec![];
        for step in job.steps() {
            results.extend(self.audit_step(&step, analysis)?);
        }
        Ok(results)
    }

    fn audit_reusable_job<'doc>(
        &self,
        _job: &ReusableWorkflowCallJob<'doc>,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        Ok(vec![])
    }

    fn audit_step<'doc>(
        &self,
        _step: &Step<'doc>,
        _analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        Ok(vec![])
    }
}

/// How a hoisted environment variable is referenced from a script.
pub(crate) fn hoisted_reference(kind: ScriptKind, var: &str) -> String {
    match kind {
        ScriptKind::Run => format!("${var}"),
        ScriptKind::GithubScript => format!("process.env.{var}"),
    }
}

/// Builds the canonical env-hoisting fix: add an env var bound to the
/// expression, and rewrite the inline occurrence to reference it.
///
/// `replacement` is the text the raw expression is rewritten to; most
/// rules pass [`hoisted_reference`], argument injection adds an
/// end-of-options marker.
pub(crate) fn env_hoist_fix<'doc>(
    step: &Step<'doc>,
    kind: ScriptKind,
    raw_expr: &'doc str,
    path: &str,
    replacement: String,
) -> Fix<'doc> {
    let var = env_var_name_for(path);

    let script_route = match kind {
        ScriptKind::Run => step.route().with_key("run"),
        ScriptKind::GithubScript => step.route().with_keys(["with".into(), "script".into()]),
    };

    let mut patches = vec![];

    // Never clobber an existing env key (compared case-insensitively).
    if !step.env_has_key(&var) {
        patches.push(Patch {
            route: step.route(),
            operation: Op::MergeInto {
                key: "env".to_string(),
                updates: indexmap::IndexMap::from([(
                    var.clone(),
                    serde_yaml::Value::String(raw_expr.to_string()),
                )]),
            },
        });
    }

    patches.push(Patch {
        route: script_route,
        operation: Op::RewriteFragment {
            from: Subfeature::new(0, raw_expr),
            to: replacement.into(),
        },
    });

    Fix {
        title: format!("hoist `{path}` into the `{var}` environment variable"),
        key: step.location().key,
        patches,
    }
}
