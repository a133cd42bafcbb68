//! Output clobbering via `$GITHUB_OUTPUT` writes.
//!
//! A single-line `echo "name=value" >> $GITHUB_OUTPUT` write lets a
//! value containing newlines smuggle additional `name=value` pairs into
//! the step's outputs. The heredoc form is immune, since the delimiter
//! fences the value.

use std::sync::LazyLock;

use regex::Regex;
use workflow_expressions::{SpannedExpr, capability};
use yamlpatch::{Op, Patch};

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta};
use crate::finding::location::{Locatable as _, Routable as _};
use crate::finding::{Confidence, Finding, Fix, Severity};
use crate::models::workflow::Step;
use crate::state::AuditState;
use crate::utils::{env_var_name_for, extract_expressions};

pub(crate) struct OutputClobbering;

audit_meta!(
    OutputClobbering,
    "output-clobbering",
    "untrusted data may clobber step outputs",
    "injection/output"
);

/// The delimiter used by the heredoc rewrite.
const HEREDOC_DELIMITER: &str = "EOF_SISAKULINT";

/// How far back the heredoc guard scans for an opening marker.
///
/// Heredocs longer than this are misclassified as plain lines; the
/// bound is deliberate and matches the write patterns the capture
/// logic understands.
const HEREDOC_LOOKBACK_LINES: usize = 10;

static OUTPUT_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#">>\s*["']?\$\{?GITHUB_OUTPUT\}?["']?"#).unwrap());

static HEREDOC_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<<-?\s*["']?([A-Za-z_][A-Za-z0-9_]*)["']?"#).unwrap());

static ECHO_WRITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\s*)echo\s+(?:-[neE]+\s+)*["']?([A-Za-z_][A-Za-z0-9_-]*)=(.*?)["']?\s*>>\s*["']?\$\{?GITHUB_OUTPUT\}?["']?\s*$"#,
    )
    .unwrap()
});

impl OutputClobbering {
    /// Whether the line at `idx` is inside a heredoc opened on one of
    /// the preceding [`HEREDOC_LOOKBACK_LINES`] lines.
    fn inside_heredoc(lines: &[&str], idx: usize) -> bool {
        let from = idx.saturating_sub(HEREDOC_LOOKBACK_LINES);
        for opener in (from..idx).rev() {
            if let Some(caps) = HEREDOC_START.captures(lines[opener]) {
                let delimiter = &caps[1];
                let closed = lines[opener + 1..idx].iter().any(|l| l.trim() == delimiter);
                if !closed {
                    return true;
                }
            }
        }

        false
    }

    /// The untrusted paths flowing into the given line, if any.
    fn untrusted_paths(line: &str, analysis: &JobAnalysis, step_index: usize) -> Vec<String> {
        let mut paths = vec![];

        for (expr, _) in extract_expressions(line) {
            let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                continue;
            };

            for found in capability::untrusted_contexts(&parsed) {
                paths.push(found.context.as_str().to_string());
            }

            if let Some(sources) = analysis.taint.is_tainted_before(&parsed, step_index) {
                paths.extend(sources.into_iter().map(|s| s.path));
            }
        }

        paths
    }

    /// Converts a single-line `echo "name=value" >> $GITHUB_OUTPUT`
    /// into the delimiter-fenced heredoc form, hoisting the untrusted
    /// expression into an env var.
    fn heredoc_fix<'doc>(step: &Step<'doc>, line: &'doc str) -> Option<Fix<'doc>> {
        let caps = ECHO_WRITE.captures(line)?;
        let indent = caps.get(1).expect("group 1").as_str();
        let name = caps.get(2).expect("group 2").as_str();
        let value = caps.get(3).expect("group 3").as_str();

        let mut patches = vec![];
        let mut rewritten = value.to_string();

        for (expr, _) in extract_expressions(value) {
            let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                continue;
            };
            let Some(found) = capability::untrusted_contexts(&parsed).into_iter().next() else {
                continue;
            };

            let var = env_var_name_for(found.context.as_str());
            rewritten = rewritten.replace(expr.as_raw(), &format!("${var}"));

            if !step.env_has_key(&var) {
                patches.push(Patch {
                    route: step.route(),
                    operation: Op::MergeInto {
                        key: "env".to_string(),
                        updates: indexmap::IndexMap::from([(
                            var,
                            serde_yaml::Value::String(expr.as_raw().to_string()),
                        )]),
                    },
                });
            }
        }

        let block = format!(
            "{indent}{{\n\
             {indent}  echo \"{name}<<{HEREDOC_DELIMITER}\"\n\
             {indent}  echo \"{rewritten}\"\n\
             {indent}  echo \"{HEREDOC_DELIMITER}\"\n\
             {indent}}} >> \"$GITHUB_OUTPUT\""
        );

        patches.push(Patch {
            route: step.route().with_key("run"),
            operation: Op::RewriteFragment {
                from: subfeature::Subfeature::new(0, line),
                to: block.into(),
            },
        });

        Some(Fix {
            title: format!("write `{name}` through a delimited heredoc"),
            key: step.location().key,
            patches,
        })
    }
}

impl Audit for OutputClobbering {
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

        let lines: Vec<&'doc str> = script.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            if !OUTPUT_REDIRECT.is_match(line) {
                continue;
            }

            // Heredoc-fenced writes (and lines inside a heredoc body)
            // are immune to newline injection.
            if HEREDOC_START.is_match(line) || Self::inside_heredoc(&lines, idx) {
                continue;
            }

            let paths = Self::untrusted_paths(line, analysis, step.index);
            if paths.is_empty() {
                continue;
            }

            let mut builder = Self::finding()
                .severity(Severity::High)
                .confidence(Confidence::High)
                .add_location(step.location().hidden())
                .add_location(
                    step.location()
                        .with_keys(["run".into()])
                        .primary()
                        .subfeature(subfeature::Subfeature::new(0, *line))
                        .annotated(format!(
                            "untrusted `{paths}` may clobber step outputs",
                            paths = paths.join("`, `")
                        )),
                );

            for path in &paths {
                builder = builder.untrusted_path(path);
            }

            if let Some(fix) = Self::heredoc_fix(step, line) {
                builder = builder.fix(fix);
            }

            findings.push(builder.build(step.workflow())?);
        }

        Ok(findings)
    }
}
