//! Cross-step taint tracking.
//!
//! Within a job, untrusted data flows from template expressions into
//! shell variables, into `$GITHUB_OUTPUT` writes, and forward into
//! later steps via `steps.<id>.outputs.<name>` references. The tracker
//! walks a job's steps in source order; rules only ever query state for
//! *prior* steps, so taint never moves backward.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use workflow_expressions::{Expr, SpannedExpr, capability};

use crate::models::workflow::{NormalJob, Step};
use crate::utils::extract_expressions;

/// Third-party actions whose outputs carry externally controlled data.
static KNOWN_TAINTING_ACTIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "tj-actions/changed-files",
        &[
            ("all_changed_files", "changed file paths"),
            ("added_files", "changed file paths"),
            ("modified_files", "changed file paths"),
            ("deleted_files", "changed file paths"),
        ],
    ),
    (
        "Ana06/get-changed-files",
        &[
            ("added_modified", "changed file paths"),
            ("all", "changed file paths"),
        ],
    ),
    ("octokit/request-action", &[("data", "API response data")]),
    ("actions/github-script", &[("result", "script result")]),
    ("dorny/paths-filter", &[("changes", "matched filter names")]),
];

static SHELL_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+|local\s+|readonly\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").unwrap()
});

static VAR_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap());

static ECHO_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*echo\s+(?:-[neE]+\s+)*["']?([A-Za-z_][A-Za-z0-9_-]*)=(.*?)["']?\s*>>\s*"?\$\{?GITHUB_OUTPUT\}?"?\s*$"#,
    )
    .unwrap()
});

static PRINTF_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*printf\s+["']?([A-Za-z_][A-Za-z0-9_-]*)=(.*?)["']?\s*>>\s*"?\$\{?GITHUB_OUTPUT\}?"?\s*$"#,
    )
    .unwrap()
});

static CAT_HEREDOC_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"cat\s*<<-?\s*["']?([A-Za-z_][A-Za-z0-9_]*)["']?\s*>>\s*"?\$\{?GITHUB_OUTPUT\}?"?"#)
        .unwrap()
});

// NOTE: the redirect is optional on the start line; in the grouped
// `{ ... } >> "$GITHUB_OUTPUT"` form it appears after the closing brace.
static ECHO_HEREDOC_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*echo\s+["']?([A-Za-z_][A-Za-z0-9_-]*)<<([A-Za-z_][A-Za-z0-9_]*)["']?\s*(?:>>\s*"?\$\{?GITHUB_OUTPUT\}?"?)?\s*$"#,
    )
    .unwrap()
});

static STEP_OUTPUT_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^steps\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)$").unwrap()
});

/// The ultimate origin of a tainted value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TaintSource {
    /// The untrusted context path (or action output description) the
    /// taint derives from.
    pub(crate) path: String,
}

/// Tracks untrusted-data flow across the steps of a single job.
#[derive(Default)]
pub(crate) struct TaintTracker {
    /// Tainted step outputs: step id → output name → sources.
    tainted_outputs: IndexMap<String, IndexMap<String, Vec<TaintSource>>>,
    /// Tainted shell variables. Scoped to a single step; reset on every
    /// `analyze_step` call.
    tainted_vars: IndexMap<String, Vec<TaintSource>>,
    /// Step id → step index, for prior-step-only queries.
    step_indices: IndexMap<String, usize>,
}

impl TaintTracker {
    /// Analyzes a whole job, step by step, in source order.
    pub(crate) fn analyze_job(job: &NormalJob<'_>) -> Self {
        let mut tracker = Self::default();
        for step in job.steps() {
            tracker.analyze_step(&step);
        }
        tracker
    }

    /// The sources for a given step output, if it's tainted.
    pub(crate) fn output_sources(&self, step_id: &str, output: &str) -> Option<&[TaintSource]> {
        self.tainted_outputs
            .get(step_id)
            .and_then(|outputs| outputs.get(output))
            .map(Vec::as_slice)
    }

    /// Recognizes a bare `steps.<id>.outputs.<name>` expression and
    /// returns its sources iff the output is tainted.
    pub(crate) fn tainted_expr_sources(&self, bare_expr: &str) -> Option<&[TaintSource]> {
        let caps = STEP_OUTPUT_EXPR.captures(bare_expr.trim())?;
        self.output_sources(&caps[1], &caps[2])
    }

    /// Like [`Self::is_tainted`], but restricted to outputs written by
    /// steps *before* the given index. Taint never moves backward in
    /// step order, and a reference to a not-yet-run step expands to
    /// nothing at runtime.
    pub(crate) fn is_tainted_before(
        &self,
        expr: &SpannedExpr<'_>,
        before: usize,
    ) -> Option<Vec<TaintSource>> {
        let mut filtered = vec![];
        for ctx in expr.dataflow_contexts() {
            let parts: Vec<&str> = ctx
                .parts
                .iter()
                .filter_map(|p| match &p.inner {
                    Expr::Identifier(ident) => Some(ident.as_str()),
                    _ => None,
                })
                .collect();

            if let ["steps", step_id, "outputs", output] = parts[..]
                && self.step_indices.get(step_id).copied().is_some_and(|i| i < before)
                && let Some(found) = self.output_sources(step_id, output)
            {
                for source in found {
                    if !filtered.contains(source) {
                        filtered.push(source.clone());
                    }
                }
            }
        }

        (!filtered.is_empty()).then_some(filtered)
    }

    /// Like [`Self::tainted_expr_sources`], but over a parsed
    /// expression: any dataflow context of the shape
    /// `steps.<id>.outputs.<name>` referring to a tainted output counts.
    pub(crate) fn is_tainted(&self, expr: &SpannedExpr<'_>) -> Option<Vec<TaintSource>> {
        let mut sources: Vec<TaintSource> = vec![];

        for ctx in expr.dataflow_contexts() {
            let parts: Vec<&str> = ctx
                .parts
                .iter()
                .filter_map(|p| match &p.inner {
                    Expr::Identifier(ident) => Some(ident.as_str()),
                    _ => None,
                })
                .collect();

            if let ["steps", step_id, "outputs", output] = parts[..]
                && let Some(found) = self.output_sources(step_id, output)
            {
                for source in found {
                    if !sources.contains(source) {
                        sources.push(source.clone());
                    }
                }
            }
        }

        (!sources.is_empty()).then_some(sources)
    }

    /// Analyzes a single step, updating output taint.
    pub(crate) fn analyze_step(&mut self, step: &Step<'_>) {
        if let Some(id) = step.id.as_deref() {
            self.step_indices.insert(id.to_string(), step.index);
        }

        // Known-tainting actions seed their declared outputs directly.
        if let Some(uses) = step.uses() {
            if let workflow_models::common::Uses::Repository(repo) = uses
                && let Some(step_id) = step.id.as_deref()
            {
                for (slug, outputs) in KNOWN_TAINTING_ACTIONS {
                    if repo.matches(slug) {
                        let entry = self.tainted_outputs.entry(step_id.to_string()).or_default();
                        for (output, source) in *outputs {
                            entry.insert(
                                output.to_string(),
                                vec![TaintSource {
                                    path: source.to_string(),
                                }],
                            );
                        }
                    }
                }
            }
            return;
        }

        let Some(script) = step.run_body() else {
            return;
        };

        // Fresh per-step variable state.
        self.tainted_vars.clear();

        // Pre-populate from the step's env: an env var whose value
        // carries an untrusted expression (or a previously tainted step
        // output) taints the same-named shell variable.
        for (name, value) in step.env_entries() {
            let sources = self.value_sources(&value);
            if !sources.is_empty() {
                self.tainted_vars.insert(name.to_string(), sources);
            }
        }

        // Propagate through shell variable assignments, then capture
        // `$GITHUB_OUTPUT` writes.
        for line in script.lines() {
            if let Some(caps) = SHELL_ASSIGNMENT.captures(line) {
                let sources = self.value_sources(&caps[2]);
                if !sources.is_empty() {
                    self.tainted_vars.insert(caps[1].to_string(), sources);
                }
            }
        }

        let Some(step_id) = step.id.as_deref() else {
            return;
        };

        for (name, value) in captured_output_writes(script) {
            let sources = self.value_sources(&value);
            if sources.is_empty() {
                continue;
            }

            let entry = self
                .tainted_outputs
                .entry(step_id.to_string())
                .or_default()
                .entry(name)
                .or_default();
            for source in sources {
                if !entry.contains(&source) {
                    entry.push(source);
                }
            }
        }
    }

    /// The taint sources carried by a free-form value: untrusted
    /// template expressions, tainted step-output references, and
    /// references to currently tainted shell variables.
    fn value_sources(&self, value: &str) -> Vec<TaintSource> {
        let mut sources: Vec<TaintSource> = vec![];

        let mut push = |source: TaintSource| {
            if !sources.contains(&source) {
                sources.push(source);
            }
        };

        for (expr, _) in extract_expressions(value) {
            // Fast path for the common whole-expression output
            // reference; compound expressions go through the parser.
            if let Some(step_sources) = self.tainted_expr_sources(expr.as_bare()) {
                for source in step_sources.to_vec() {
                    push(source);
                }
                continue;
            }

            let Ok(parsed) = SpannedExpr::parse(expr.as_bare()) else {
                continue;
            };

            for found in capability::untrusted_contexts(&parsed) {
                push(TaintSource {
                    path: found.pattern.to_string(),
                });
            }

            if let Some(step_sources) = self.is_tainted(&parsed) {
                for source in step_sources {
                    push(source);
                }
            }
        }

        for caps in VAR_REFERENCE.captures_iter(value) {
            if let Some(var_sources) = self.tainted_vars.get(&caps[1]) {
                for source in var_sources.clone() {
                    push(source);
                }
            }
        }

        sources
    }
}

/// Captures `name=value` pairs written to `$GITHUB_OUTPUT`, covering
/// the single-line `echo`/`printf` forms and both heredoc shapes.
fn captured_output_writes(script: &str) -> Vec<(String, String)> {
    let mut writes = vec![];

    for caps in ECHO_OUTPUT.captures_iter(script) {
        writes.push((caps[1].to_string(), caps[2].to_string()));
    }

    for caps in PRINTF_OUTPUT.captures_iter(script) {
        writes.push((caps[1].to_string(), caps[2].to_string()));
    }

    // `cat <<DELIM >> $GITHUB_OUTPUT` with `name=value` body lines,
    // matched manually until a line equal to the delimiter.
    let lines: Vec<&str> = script.lines().collect();
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];

        if let Some(caps) = CAT_HEREDOC_OUTPUT.captures(line) {
            let delimiter = caps[1].to_string();
            idx += 1;
            while idx < lines.len() && lines[idx].trim() != delimiter {
                if let Some(caps) = SHELL_ASSIGNMENT.captures(lines[idx]) {
                    writes.push((caps[1].to_string(), caps[2].to_string()));
                }
                idx += 1;
            }
        } else if let Some(caps) = ECHO_HEREDOC_START.captures(line) {
            // `echo "name<<DELIM"` followed by value lines and a
            // closing `echo "DELIM"`; the `>> $GITHUB_OUTPUT` redirect
            // is either on the start line or on a grouping line nearby.
            let name = caps[1].to_string();
            let delimiter = caps[2].to_string();
            let mut value = String::new();

            let start = idx;
            idx += 1;
            while idx < lines.len() {
                let body = lines[idx].trim();
                if body.contains(&delimiter) {
                    break;
                }
                value.push_str(body);
                value.push('\n');
                idx += 1;
            }

            // Only count the block if it's actually redirected at the
            // output file.
            let redirected = lines[start..(idx + 2).min(lines.len())]
                .iter()
                .any(|l| l.contains("GITHUB_OUTPUT"));
            if redirected {
                writes.push((name, value));
            }
        }

        idx += 1;
    }

    writes
}

#[cfg(test)]
mod tests {
    use super::{TaintTracker, captured_output_writes};
    use crate::models::workflow::{Job, Workflow};
    use crate::registry::input::InputKey;

    fn tracker_for(contents: &str) -> TaintTracker {
        let workflow =
            Workflow::from_string(contents.into(), InputKey::local("test.yml", None).unwrap())
                .unwrap();
        let Some(Job::NormalJob(job)) = workflow.jobs().next() else {
            panic!("expected a normal job");
        };
        TaintTracker::analyze_job(&job)
    }

    #[test]
    fn test_output_taint_via_echo() {
        // The GHSL-2024-325 shape: a step writes an untrusted ref into
        // its outputs, and a later step consumes it.
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: gr
        run: echo "ref=${{ github.head_ref }}" >> $GITHUB_OUTPUT
"#,
        );

        let sources = tracker.output_sources("gr", "ref").unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].path, "github.head_ref");

        assert!(tracker.tainted_expr_sources("steps.gr.outputs.ref").is_some());
        assert!(tracker.tainted_expr_sources("steps.gr.outputs.other").is_none());
        assert!(tracker.tainted_expr_sources("steps.other.outputs.ref").is_none());
    }

    #[test]
    fn test_output_taint_via_shell_var() {
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: meta
        run: |
          TITLE=${{ github.event.pull_request.title }}
          echo "title=$TITLE" >> $GITHUB_OUTPUT
"#,
        );

        let sources = tracker.output_sources("meta", "title").unwrap();
        assert_eq!(sources[0].path, "github.event.pull_request.title");
    }

    #[test]
    fn test_env_prepopulation() {
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: meta
        env:
          BODY: ${{ github.event.issue.body }}
        run: echo "body=$BODY" >> $GITHUB_OUTPUT
"#,
        );

        let sources = tracker.output_sources("meta", "body").unwrap();
        assert_eq!(sources[0].path, "github.event.issue.body");
    }

    #[test]
    fn test_taint_flows_across_steps() {
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: first
        run: echo "ref=${{ github.head_ref }}" >> $GITHUB_OUTPUT
      - id: second
        run: |
          BRANCH=${{ steps.first.outputs.ref }}
          echo "branch=$BRANCH" >> $GITHUB_OUTPUT
"#,
        );

        let sources = tracker.output_sources("second", "branch").unwrap();
        assert_eq!(sources[0].path, "github.head_ref");
    }

    #[test]
    fn test_vars_reset_between_steps() {
        // The tainted variable from the first step must not leak into
        // the second step's analysis.
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: first
        run: TITLE=${{ github.event.pull_request.title }}
      - id: second
        run: echo "out=$TITLE" >> $GITHUB_OUTPUT
"#,
        );

        assert!(tracker.output_sources("second", "out").is_none());
    }

    #[test]
    fn test_trusted_values_not_tainted() {
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: meta
        run: echo "sha=${{ github.sha }}" >> $GITHUB_OUTPUT
"#,
        );

        assert!(tracker.output_sources("meta", "sha").is_none());
    }

    #[test]
    fn test_known_tainting_action() {
        let tracker = tracker_for(
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - id: changed
        uses: tj-actions/changed-files@v44
"#,
        );

        assert!(tracker.output_sources("changed", "all_changed_files").is_some());
        assert!(tracker.output_sources("changed", "nonexistent").is_none());
    }

    #[test]
    fn test_captured_output_writes_heredoc() {
        let script = r#"
cat <<EOF >> $GITHUB_OUTPUT
title=$TITLE
count=3
EOF
"#;
        let writes = captured_output_writes(script);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], ("title".into(), "$TITLE".into()));
        assert_eq!(writes[1], ("count".into(), "3".into()));
    }

    #[test]
    fn test_captured_output_writes_echo_heredoc() {
        let script = r#"
{
  echo "title<<EOF_DELIM"
  echo "$TITLE"
  echo "EOF_DELIM"
} >> "$GITHUB_OUTPUT"
"#;
        let writes = captured_output_writes(script);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "title");
        assert!(writes[0].1.contains("$TITLE"));
    }

    #[test]
    fn test_captured_output_writes_printf() {
        let writes = captured_output_writes(r#"printf "tag=%s" "$TAG" >> $GITHUB_OUTPUT"#);
        assert!(writes.iter().any(|(name, _)| name == "tag"));
    }
}
