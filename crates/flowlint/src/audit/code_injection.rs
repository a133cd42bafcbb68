//! Code injection via template expansion.
//!
//! Template expressions inside `run:` scripts (and `actions/github-script`
//! bodies) expand *before* the script is parsed, so an untrusted
//! expansion becomes code. Three signals are covered:
//!
//! * untrusted expressions expanded directly into an inline script;
//! * expressions referencing a step output that earlier taint analysis
//!   marked as attacker-controlled;
//! * environment variables carrying untrusted input that the script
//!   then uses in an unsafe shell position.

use workflow_expressions::{SpannedExpr, capability};

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta, env_hoist_fix, hoisted_reference};
use crate::finding::location::Locatable as _;
use crate::finding::{Confidence, Finding, FindingBuilder, Severity};
use crate::models::workflow::{ScriptKind, Step};
use crate::shell::ShellScript;
use crate::state::AuditState;
use crate::utils::extract_expressions;

pub(crate) struct CodeInjection;

audit_meta!(
    CodeInjection,
    "code-injection",
    "code injection via template expansion",
    "injection/code"
);

impl CodeInjection {
    /// The tier a finding lands in depends on whether the job runs
    /// under a privileged trigger.
    fn tier(analysis: &JobAnalysis) -> (&'static str, Severity) {
        if analysis.is_privileged() {
            ("code-injection-critical", Severity::Critical)
        } else {
            ("code-injection-medium", Severity::Medium)
        }
    }

    fn tiered_finding<'doc>(analysis: &JobAnalysis) -> FindingBuilder<'doc> {
        let (ident, severity) = Self::tier(analysis);
        Self::finding().ident(ident).severity(severity)
    }

    /// Untrusted expressions expanded directly into the script, plus
    /// expressions that reference tainted step outputs.
    fn script_findings<'doc>(
        &self,
        step: &Step<'doc>,
        analysis: &JobAnalysis,
        kind: ScriptKind,
        script: &'doc str,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];
        let script_loc = match kind {
            ScriptKind::Run => step.location().with_keys(["run".into()]),
            ScriptKind::GithubScript => step
                .location()
                .with_keys(["with".into(), "script".into()]),
        };

        for (expr, _) in extract_expressions(script) {
            let parsed = match SpannedExpr::parse(expr.as_bare()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    findings.push(
                        Self::finding()
                            .ident("expression-parse-error")
                            .severity(Severity::Informational)
                            .confidence(Confidence::High)
                            .add_location(
                                script_loc
                                    .clone()
                                    .primary()
                                    .subfeature(subfeature::Subfeature::new(0, expr.as_raw()))
                                    .annotated(format!("unparseable expression: {e}")),
                            )
                            .build(step.workflow())?,
                    );
                    continue;
                }
            };

            // github-script bodies that merely repeat an expression
            // already hoisted into the step's env are handled by the
            // env signal below.
            if kind == ScriptKind::GithubScript && step.env_binding_for(expr.as_raw()).is_some() {
                continue;
            }

            for found in capability::untrusted_contexts(&parsed) {
                let path = found.context.as_str();

                findings.push(
                    Self::tiered_finding(analysis)
                        .confidence(Confidence::High)
                        .add_location(step.location().hidden())
                        .add_location(step.location_with_name())
                        .add_location(
                            script_loc
                                .clone()
                                .primary()
                                .subfeature(subfeature::Subfeature::new(0, expr.as_raw()))
                                .annotated(format!(
                                    "`{path}` may expand into attacker-controllable code"
                                )),
                        )
                        .untrusted_path(path)
                        .fix(env_hoist_fix(
                            step,
                            kind,
                            expr.as_raw(),
                            path,
                            hoisted_reference(
                                kind,
                                &crate::utils::env_var_name_for(path),
                            ),
                        ))
                        .build(step.workflow())?,
                );
            }

            if let Some(sources) = analysis.taint.is_tainted_before(&parsed, step.index) {
                let via = expr.as_bare().trim();
                let ultimate = sources
                    .iter()
                    .map(|s| s.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");

                let mut builder = Self::tiered_finding(analysis)
                    .confidence(Confidence::High)
                    .add_location(step.location().hidden())
                    .add_location(
                        script_loc
                            .clone()
                            .primary()
                            .subfeature(subfeature::Subfeature::new(0, expr.as_raw()))
                            .annotated(format!(
                                "`{via}` is tainted via `{ultimate}` and may expand into \
                                 attacker-controllable code"
                            )),
                    );
                for source in &sources {
                    builder = builder.untrusted_path(&source.path);
                }

                findings.push(builder.build(step.workflow())?);
            }
        }

        Ok(findings)
    }

    /// Environment variables carrying untrusted input, used unsafely by
    /// the shell script.
    fn env_findings<'doc>(
        &self,
        step: &Step<'doc>,
        analysis: &JobAnalysis,
        script: &'doc str,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        let mut tainted_env: Vec<(&'doc str, String)> = vec![];
        for (name, value) in step.env_entries() {
            let mut sources = vec![];

            for (expr, _) in extract_expressions(&value) {
                let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                    continue;
                };

                for found in capability::untrusted_contexts(&parsed) {
                    sources.push(found.context.as_str().to_string());
                }

                if let Some(tainted) = analysis.taint.is_tainted_before(&parsed, step.index) {
                    let ultimate = tainted
                        .iter()
                        .map(|s| s.path.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    sources.push(format!(
                        "{bare}, tainted via {ultimate}",
                        bare = expr.as_bare().trim()
                    ));
                }
            }

            if !sources.is_empty() {
                tainted_env.push((name, sources.join("; ")));
            }
        }

        if tainted_env.is_empty() {
            return Ok(findings);
        }

        // The walker speaks POSIX/Bash; other shells only get the
        // direct-expansion signals above. An unknowable shell is
        // assumed to be bash, like the runner default.
        let shell = step.shell().map(crate::utils::normalize_shell);
        if !matches!(shell, None | Some("bash") | Some("sh")) {
            return Ok(findings);
        }

        let parsed = ShellScript::parse(script);
        for (name, source) in tainted_env {
            for usage in parsed.find_env_var_usages(name) {
                if !usage.is_unsafe() {
                    continue;
                }

                let confidence = if usage.lossy {
                    Confidence::Low
                } else {
                    Confidence::High
                };

                let reason = if usage.in_eval {
                    "re-parsed by eval"
                } else if usage.in_shell_cmd {
                    "re-parsed by a nested shell"
                } else if usage.in_cmd_subst {
                    "unquoted inside a command substitution"
                } else if usage.lossy && parsed.has_dangerous_pattern() {
                    // The fallback can't see contexts, but the script
                    // textually contains a re-parsing construct.
                    "used in a script containing a re-parsing construct"
                } else {
                    "unquoted"
                };

                findings.push(
                    Self::tiered_finding(analysis)
                        .confidence(confidence)
                        .add_location(step.location().hidden())
                        .add_location(
                            step.location()
                                .with_keys(["run".into()])
                                .primary()
                                .subfeature(subfeature::Subfeature::new(
                                    0,
                                    &script[usage.span.clone()],
                                ))
                                .annotated(format!(
                                    "`{name}` carries {source} and is {reason} in `{snippet}`",
                                    snippet = usage.snippet.trim()
                                )),
                        )
                        .untrusted_path(source.clone())
                        .build(step.workflow())?,
                );
            }
        }

        Ok(findings)
    }
}

impl Audit for CodeInjection {
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

        let Some((kind, script, _)) = step.script_with_location() else {
            return Ok(findings);
        };

        findings.extend(self.script_findings(step, analysis, kind, script)?);

        // The shell-metacharacter signal only makes sense for shell
        // scripts.
        if kind == ScriptKind::Run {
            findings.extend(self.env_findings(step, analysis, script)?);
        }

        Ok(findings)
    }
}
