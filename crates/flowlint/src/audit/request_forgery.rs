//! Server-side request forgery via untrusted request targets.
//!
//! Flags direct references to cloud metadata endpoints, and untrusted
//! expressions flowing into the arguments of network commands. The
//! severity scales with how much of the URL the attacker controls:
//! the whole URL, the host, or just a path/query component.

use workflow_expressions::{SpannedExpr, capability};

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta, env_hoist_fix, hoisted_reference};
use crate::finding::location::Locatable as _;
use crate::finding::{Confidence, Finding, Severity};
use crate::models::workflow::Step;
use crate::shell::ShellScript;
use crate::state::AuditState;
use crate::utils::env_var_name_for;

pub(crate) struct RequestForgery;

audit_meta!(
    RequestForgery,
    "request-forgery",
    "server-side request forgery via untrusted request target",
    "ssrf/request-forgery"
);

/// Cloud metadata services reachable from hosted and self-hosted
/// runners.
const METADATA_ENDPOINTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google",
    "169.254.170.2",
    "fd00:ec2::254",
    "100.100.100.200",
    "192.0.0.192",
];

/// How much of a request target an expression controls.
enum TargetControl {
    FullUrl,
    Host,
    PathOrQuery,
}

impl TargetControl {
    fn of(value: &str, raw_expr: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == raw_expr {
            return TargetControl::FullUrl;
        }

        match trimmed.find(raw_expr) {
            Some(at) if trimmed[..at].ends_with("://") => TargetControl::Host,
            _ => TargetControl::PathOrQuery,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            TargetControl::FullUrl => Severity::High,
            TargetControl::Host => Severity::Medium,
            TargetControl::PathOrQuery => Severity::Low,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            TargetControl::FullUrl => "the entire request target",
            TargetControl::Host => "the request host",
            TargetControl::PathOrQuery => "part of the request path or query",
        }
    }
}

impl Audit for RequestForgery {
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

        let Some((kind, script, script_loc)) = step.script_with_location() else {
            return Ok(findings);
        };

        // Direct references to a metadata service.
        for endpoint in METADATA_ENDPOINTS {
            if script.contains(endpoint) {
                findings.push(
                    Self::finding()
                        .severity(Severity::High)
                        .confidence(Confidence::High)
                        .add_location(step.location().hidden())
                        .add_location(
                            script_loc
                                .clone()
                                .primary()
                                .subfeature(subfeature::Subfeature::new(0, *endpoint))
                                .annotated(format!(
                                    "cloud metadata endpoint `{endpoint}` referenced here"
                                )),
                        )
                        .build(step.workflow())?,
                );
            }
        }

        // Untrusted expressions in network command arguments. For
        // non-shell scripts, only the lossy runtime-caller pass fires.
        let shell = ShellScript::parse(script);
        for call in shell.find_network_commands() {
            let context_note = if call.in_cmd_subst {
                " inside a command substitution"
            } else if call.in_pipeline {
                " inside a pipeline"
            } else {
                ""
            };

            for arg in &call.args {
                if arg.is_flag {
                    continue;
                }

                for raw in &arg.exprs {
                    let bare = raw.trim_start_matches("${{").trim_end_matches("}}").trim();
                    let Ok(parsed) = SpannedExpr::parse(bare) else {
                        continue;
                    };

                    let mut paths: Vec<String> = capability::untrusted_contexts(&parsed)
                        .iter()
                        .map(|f| f.context.as_str().to_string())
                        .collect();
                    if let Some(sources) = analysis.taint.is_tainted_before(&parsed, step.index) {
                        paths.extend(sources.into_iter().map(|s| s.path));
                    }

                    let Some(path) = paths.first().cloned() else {
                        continue;
                    };

                    let control = TargetControl::of(&arg.value, raw);
                    let confidence = if call.lossy || shell.is_lossy() {
                        Confidence::Low
                    } else {
                        Confidence::High
                    };

                    // The raw expression text exists verbatim in the
                    // document, so it anchors both the location and the
                    // rewrite. If it doesn't (e.g. a reconstructed lossy
                    // argument), there's nothing to point at.
                    let Some(at) = script.find(raw.as_str()) else {
                        continue;
                    };
                    let raw_in_doc = &script[at..at + raw.len()];

                    let mut builder = Self::finding()
                        .severity(control.severity())
                        .confidence(confidence)
                        .add_location(step.location().hidden())
                        .add_location(
                            script_loc
                                .clone()
                                .primary()
                                .subfeature(subfeature::Subfeature::new(0, raw_in_doc))
                                .annotated(format!(
                                    "`{path}` controls {what} of `{command}`{context_note}",
                                    what = control.describe(),
                                    command = call.command
                                )),
                        )
                        .untrusted_path(&path);

                    builder = builder.fix(env_hoist_fix(
                        step,
                        kind,
                        raw_in_doc,
                        &path,
                        hoisted_reference(kind, &env_var_name_for(&path)),
                    ));

                    findings.push(builder.build(step.workflow())?);
                }

                // A target drawn from an env var bound to untrusted
                // input is forgery by indirection.
                for var in &arg.var_names {
                    let Some((_, value)) = step
                        .env_entries()
                        .into_iter()
                        .find(|(name, _)| *name == var.as_str())
                    else {
                        continue;
                    };

                    let tainted = crate::utils::extract_expressions(&value).iter().any(
                        |(expr, _)| match SpannedExpr::parse(expr.as_bare()) {
                            Ok(parsed) => {
                                !capability::untrusted_contexts(&parsed).is_empty()
                                    || analysis
                                        .taint
                                        .is_tainted_before(&parsed, step.index)
                                        .is_some()
                            }
                            Err(_) => false,
                        },
                    );

                    if !tainted {
                        continue;
                    }

                    findings.push(
                        Self::finding()
                            .severity(Severity::Medium)
                            .confidence(Confidence::Medium)
                            .add_location(step.location().hidden())
                            .add_location(
                                script_loc
                                    .clone()
                                    .primary()
                                    .subfeature(subfeature::Subfeature::new(
                                        0,
                                        &script[arg.span.clone()],
                                    ))
                                    .annotated(format!(
                                        "`{var}` carries untrusted input into the target of \
                                         `{command}`{context_note}",
                                        command = call.command
                                    )),
                            )
                            .untrusted_path(format!("env.{var}"))
                            .build(step.workflow())?,
                    );
                }
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::test_support::findings_for;
    use crate::finding::Severity;

    #[test]
    fn test_metadata_endpoint() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl http://169.254.169.254/latest/meta-data/
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::High);
    }

    #[test]
    fn test_full_url_control() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: issue_comment
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl ${{ github.event.comment.body }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::High);
        assert_eq!(findings[0].untrusted_paths, ["github.event.comment.body"]);
    }

    #[test]
    fn test_path_control_is_lower_severity() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: issue_comment
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl https://api.example.com/lookup/${{ github.event.comment.body }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::Low);
    }

    #[test]
    fn test_host_control() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: issue_comment
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl https://${{ github.event.comment.body }}/health
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::Medium);
    }

    #[test]
    fn test_env_indirection() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: issue_comment
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - env:
          TARGET: ${{ github.event.comment.body }}
        run: curl "$TARGET"
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].untrusted_paths, ["env.TARGET"]);
        assert_eq!(findings[0].determinations.severity, Severity::Medium);
    }

    #[test]
    fn test_trusted_target_is_ok() {
        let findings = findings_for::<super::RequestForgery>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl https://api.github.com/repos/${{ github.repository }}
"#,
        );

        assert!(findings.is_empty());
    }
}
