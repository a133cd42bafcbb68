//! Dangerous workflow triggers, scored against their mitigations.
//!
//! A privileged trigger is not a finding by itself: restricted
//! permissions, protected environments, and actor/label/fork guards
//! each reduce the blast radius. The rule scores the mitigations it
//! can see and only reports workflows below the threshold.

use workflow_models::common::If;
use yamlpatch::{Op, Patch};

use super::{Audit, AuditLoadError, audit_meta};
use crate::finding::{Confidence, Finding, Fix, Severity};
use crate::models::workflow::{Job, Workflow};
use crate::state::AuditState;

pub(crate) struct DangerousTriggers;

audit_meta!(
    DangerousTriggers,
    "dangerous-triggers",
    "use of a fundamentally dangerous workflow trigger",
    "triggers/dangerous"
);

impl DangerousTriggers {
    /// Scores the workflow's mitigations: permissions restriction +3,
    /// environment protection +2, and +1 each for label conditions,
    /// actor restrictions, and fork checks.
    fn mitigation_score(workflow: &Workflow) -> u32 {
        let mut score = 0;

        if Self::permissions_restricted(workflow) {
            score += 3;
        }

        let mut has_environment = false;
        for job in workflow.jobs() {
            if let Job::NormalJob(job) = &job
                && job.environment.is_some()
            {
                has_environment = true;
            }
        }
        if has_environment {
            score += 2;
        }

        let conditions = Self::all_conditions(workflow);

        if conditions.iter().any(|c| c.contains(".label") || c.contains(".labels")) {
            score += 1;
        }

        if conditions.iter().any(|c| c.contains("github.actor")) {
            score += 1;
        }

        if conditions
            .iter()
            .any(|c| c.contains("head.repo.full_name") || c.contains(".fork"))
        {
            score += 1;
        }

        score
    }

    fn permissions_restricted(workflow: &Workflow) -> bool {
        if workflow
            .permissions
            .as_ref()
            .is_some_and(|p| p.is_restrictive())
        {
            return true;
        }

        // Alternatively, every job can restrict its own permissions.
        let mut jobs = workflow.jobs().peekable();
        if jobs.peek().is_none() {
            return false;
        }

        jobs.all(|job| {
            let permissions = match &job {
                Job::NormalJob(job) => &job.permissions,
                Job::ReusableWorkflowCallJob(job) => &job.permissions,
            };
            permissions.as_ref().is_some_and(|p| p.is_restrictive())
        })
    }

    /// Every `if:` condition in the workflow, jobs and steps included.
    fn all_conditions(workflow: &Workflow) -> Vec<String> {
        let mut conditions = vec![];

        let mut push = |cond: &Option<If>| {
            if let Some(If::Expr(expr)) = cond {
                conditions.push(expr.clone());
            }
        };

        for job in workflow.jobs() {
            match &job {
                Job::NormalJob(job) => {
                    push(&job.r#if);
                    for step in job.steps() {
                        push(&step.r#if);
                    }
                }
                Job::ReusableWorkflowCallJob(job) => push(&job.r#if),
            }
        }

        conditions
    }
}

impl Audit for DangerousTriggers {
    fn new(_state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self)
    }

    fn audit_workflow<'doc>(&self, workflow: &'doc Workflow) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        let privileged = workflow.privileged_triggers();
        if privileged.is_empty() {
            return Ok(findings);
        }

        let score = Self::mitigation_score(workflow);
        let severity = match score {
            0 => Severity::Critical,
            1 | 2 => Severity::Medium,
            _ => return Ok(findings),
        };

        let mut builder = Self::finding()
            .severity(severity)
            .confidence(Confidence::High)
            .add_location(
                workflow
                    .location()
                    .with_keys(["on".into()])
                    .primary()
                    .annotated(format!(
                        "`{triggers}` runs with elevated privileges (mitigation score {score})",
                        triggers = privileged.join("`, `")
                    )),
            );

        // Inserting an empty permissions block is a no-op when the
        // workflow already carries any permissions node.
        if workflow.permissions.is_none() {
            builder = builder.fix(Fix {
                title: "restrict the workflow's default permissions".to_string(),
                key: &workflow.key,
                patches: vec![Patch {
                    route: yamlpath::Route::default(),
                    operation: Op::Add {
                        key: "permissions".to_string(),
                        value: serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
                    },
                }],
            });
        }

        findings.push(builder.build(workflow)?);

        Ok(findings)
    }
}
