//! Caller-controlled inputs expanded inside reusable workflows.
//!
//! A `workflow_call` workflow's string inputs are controlled by its
//! caller, which may itself be feeding them from untrusted context.
//! Expanding them directly into an inline script is injection by
//! proxy; the fix is the same env indirection as for first-party
//! untrusted contexts.

use workflow_expressions::SpannedExpr;
use workflow_models::workflow::Trigger;

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta, env_hoist_fix, hoisted_reference};
use crate::finding::location::Locatable as _;
use crate::finding::{Confidence, Finding, Severity};
use crate::models::workflow::{Step, Workflow};
use crate::state::AuditState;
use crate::utils::{env_var_name_for, extract_expressions};

pub(crate) struct ReusableWorkflowTaint;

audit_meta!(
    ReusableWorkflowTaint,
    "reusable-workflow-taint",
    "caller-controlled input expanded in reusable workflow",
    "injection/reusable-workflow"
);

impl ReusableWorkflowTaint {
    /// Whether the named input can carry free-form caller text.
    ///
    /// Untyped and undeclared inputs are treated as free-form.
    fn input_is_free_form(workflow: &Workflow, name: &str) -> bool {
        let Trigger::Events(events) = &workflow.on else {
            return true;
        };

        let Some(call) = events.workflow_call.body() else {
            return true;
        };

        match call.inputs.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, input)) => input.input_type.map(|t| t.is_free_form()).unwrap_or(true),
            None => true,
        }
    }
}

impl Audit for ReusableWorkflowTaint {
    fn new(_state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self)
    }

    fn audit_step<'doc>(
        &self,
        step: &Step<'doc>,
        _analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        let workflow = step.workflow();
        if !workflow.has_workflow_call() {
            return Ok(findings);
        }

        let Some((kind, script, script_loc)) = step.script_with_location() else {
            return Ok(findings);
        };

        for (expr, _) in extract_expressions(script) {
            let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                continue;
            };

            for ctx in parsed.dataflow_contexts() {
                if ctx.head().is_none_or(|head| !head.eq_ignore_ascii_case("inputs")) {
                    continue;
                }

                let Some(input_name) = ctx.single_tail() else {
                    continue;
                };

                if !Self::input_is_free_form(workflow, input_name) {
                    continue;
                }

                // Already hoisted through the step's env.
                if step.env_binding_for(expr.as_raw()).is_some() {
                    continue;
                }

                let path = ctx.as_str();

                findings.push(
                    Self::finding()
                        .severity(Severity::Medium)
                        .confidence(Confidence::High)
                        .add_location(step.location().hidden())
                        .add_location(
                            script_loc
                                .clone()
                                .primary()
                                .subfeature(subfeature::Subfeature::new(0, expr.as_raw()))
                                .annotated(format!(
                                    "caller-controlled `{path}` expands into this script"
                                )),
                        )
                        .untrusted_path(path)
                        .fix(env_hoist_fix(
                            step,
                            kind,
                            expr.as_raw(),
                            path,
                            hoisted_reference(kind, &env_var_name_for(path)),
                        ))
                        .build(workflow)?,
                );
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::test_support::{findings_for, fix_applied};

    #[test]
    fn test_string_input_in_run() {
        let findings = findings_for::<super::ReusableWorkflowTaint>(
            r#"
on:
  workflow_call:
    inputs:
      version:
        type: string
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "releasing ${{ inputs.version }}"
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].untrusted_paths, ["inputs.version"]);
    }

    #[test]
    fn test_boolean_input_is_ok() {
        let findings = findings_for::<super::ReusableWorkflowTaint>(
            r#"
on:
  workflow_call:
    inputs:
      dry-run:
        type: boolean
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "dry ${{ inputs.dry-run }}"
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_non_reusable_workflow_is_ok() {
        let findings = findings_for::<super::ReusableWorkflowTaint>(
            r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ inputs.version }}"
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_env_indirection_is_ok() {
        let findings = findings_for::<super::ReusableWorkflowTaint>(
            r#"
on:
  workflow_call:
    inputs:
      version:
        type: string
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - env:
          VERSION: ${{ inputs.version }}
        run: echo "releasing $VERSION"
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_fix_hoists_input() {
        let fixed = fix_applied::<super::ReusableWorkflowTaint>(
            r#"on:
  workflow_call:
    inputs:
      version:
        type: string
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "releasing ${{ inputs.version }}"
"#,
        );

        assert!(fixed.contains(r#"echo "releasing $VERSION""#), "fixed:\n{fixed}");
        assert!(fixed.contains("VERSION: ${{ inputs.version }}"), "fixed:\n{fixed}");
    }
}
