//! Argument injection via template expansion.
//!
//! Even a quoted, non-code expansion can change a command's behavior
//! when it lands in argument position: `git diff ${{ github.head_ref }}`
//! lets a branch named `--output=/path` smuggle an option in. An
//! expansion after an end-of-options `--` is inert for commands that
//! honor it.

use workflow_expressions::{SpannedExpr, capability};

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta, env_hoist_fix};
use crate::finding::location::Locatable as _;
use crate::finding::{Confidence, Finding, Severity};
use crate::models::workflow::{ScriptKind, Step};
use crate::shell::ShellScript;
use crate::state::AuditState;
use crate::utils::env_var_name_for;

pub(crate) struct ArgumentInjection;

audit_meta!(
    ArgumentInjection,
    "argument-injection",
    "argument injection via template expansion",
    "injection/argument"
);

/// Commands where an attacker-controlled argument is meaningfully
/// dangerous.
const DANGEROUS_COMMANDS: &[&str] = &[
    "git", "curl", "wget", "tar", "zip", "unzip", "rsync", "scp", "ssh", "npm", "yarn", "pip",
    "python", "python3", "node", "ruby", "perl", "php", "go", "cargo", "docker", "kubectl",
    "helm", "aws", "az", "gcloud", "gh", "jq", "sed", "awk", "grep", "find", "xargs", "env",
    "sh", "bash", "zsh", "pwsh", "make", "cmake", "mvn", "gradle", "ant",
];

/// Commands that do not treat `--` as an end-of-options marker; their
/// fixes substitute a bare quoted variable instead.
const NO_DOUBLE_DASH: &[&str] = &["docker", "python", "python3", "node", "ruby", "perl", "php"];

impl ArgumentInjection {
    fn expression_is_untrusted(
        parsed: &SpannedExpr<'_>,
        analysis: &JobAnalysis,
        step_index: usize,
    ) -> Option<String> {
        if let Some(found) = capability::untrusted_contexts(parsed).into_iter().next() {
            return Some(found.context.as_str().to_string());
        }

        analysis
            .taint
            .is_tainted_before(parsed, step_index)
            .and_then(|sources| sources.into_iter().next())
            .map(|source| source.path)
    }
}

impl Audit for ArgumentInjection {
    fn new(_state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self)
    }

    fn audit_step<'doc>(
        &self,
        step: &Step<'doc>,
        analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        let Some(script) = step.run_body() else {
            return Ok(findings);
        };

        // Argument positions only mean something to the bash walker.
        let shell = step.shell().map(crate::utils::normalize_shell);
        if !matches!(shell, None | Some("bash") | Some("sh")) {
            return Ok(findings);
        }

        // The parser already substituted every template expression with
        // a same-length placeholder, which is what makes the script
        // parseable in the first place.
        let shell = ShellScript::parse(script);

        for placeholder in shell.placeholders() {
            let Ok(parsed) = SpannedExpr::parse(
                placeholder
                    .raw
                    .trim_start_matches("${{")
                    .trim_end_matches("}}"),
            ) else {
                continue;
            };

            let Some(path) = Self::expression_is_untrusted(&parsed, analysis, step.index) else {
                continue;
            };

            for usage in shell.find_var_usage_as_command_arg(&placeholder.token, DANGEROUS_COMMANDS)
            {
                if usage.is_after_double_dash {
                    continue;
                }

                let var = env_var_name_for(&path);
                let replacement = if NO_DOUBLE_DASH.contains(&usage.command.as_str()) {
                    format!("\"${var}\"")
                } else {
                    format!("-- \"${var}\"")
                };

                // The rewrite target is the expression's original text,
                // which still exists verbatim in the document; the
                // annotation anchors the whole offending argument.
                let raw = &script[placeholder.span.clone()];
                let argument = &script[usage.span.clone()];

                findings.push(
                    Self::finding()
                        .severity(Severity::High)
                        .confidence(Confidence::High)
                        .add_location(step.location().hidden())
                        .add_location(
                            step.location()
                                .with_keys(["run".into()])
                                .primary()
                                .subfeature(subfeature::Subfeature::new(0, argument))
                                .annotated(format!(
                                    "`{path}` may inject arguments into `{command}` \
                                     (argument {position})",
                                    command = usage.command,
                                    position = usage.argument_position
                                )),
                        )
                        .untrusted_path(&path)
                        .fix(env_hoist_fix(
                            step,
                            ScriptKind::Run,
                            raw,
                            &path,
                            replacement,
                        ))
                        .build(step.workflow())?,
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
    fn test_argument_injection() {
        let findings = findings_for::<super::ArgumentInjection>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: git diff ${{ github.head_ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].untrusted_paths, ["github.head_ref"]);
        assert!(
            findings[0]
                .primary_location()
                .symbolic
                .annotation
                .contains("`git`")
        );
    }

    #[test]
    fn test_after_double_dash_is_ok() {
        let findings = findings_for::<super::ArgumentInjection>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: git diff -- ${{ github.head_ref }}
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_benign_command_is_ok() {
        let findings = findings_for::<super::ArgumentInjection>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo ${{ github.head_ref }}
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_trusted_expression_is_ok() {
        let findings = findings_for::<super::ArgumentInjection>(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: git checkout ${{ github.sha }}
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_fix_adds_end_of_options() {
        let fixed = fix_applied::<super::ArgumentInjection>(
            r#"on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: git diff ${{ github.head_ref }}
"#,
        );

        assert!(fixed.contains(r#"git diff -- "$HEAD_REF""#), "fixed:\n{fixed}");
        assert!(fixed.contains("HEAD_REF: ${{ github.head_ref }}"), "fixed:\n{fixed}");
    }

    #[test]
    fn test_fix_without_end_of_options() {
        // docker doesn't honor `--`, so the fix substitutes the bare
        // quoted variable.
        let fixed = fix_applied::<super::ArgumentInjection>(
            r#"on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: docker run ${{ github.event.pull_request.title }}
"#,
        );

        assert!(fixed.contains(r#"docker run "$PR_TITLE""#), "fixed:\n{fixed}");
        assert!(!fixed.contains(r#"-- "$PR_TITLE""#), "fixed:\n{fixed}");
    }
}
