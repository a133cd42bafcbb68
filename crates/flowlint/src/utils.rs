//! Helper routines.

use std::ops::Range;

use camino::Utf8Path;

/// Represents a fenced `${{ ... }}` expression that has been extracted
/// from some surrounding text, but has not been parsed yet.
#[derive(Debug)]
pub(crate) struct ExtractedExpr<'a> {
    inner: &'a str,
}

impl<'a> ExtractedExpr<'a> {
    /// Creates a new [`ExtractedExpr`] from a fenced expression.
    fn from_fenced(expr: &'a str) -> Option<Self> {
        expr.strip_prefix("${{")
            .and_then(|e| e.strip_suffix("}}"))
            .map(|_| ExtractedExpr { inner: expr })
    }

    /// Returns the extracted expression as a "bare" expression,
    /// i.e. without its fencing.
    pub(crate) fn as_bare(&self) -> &'a str {
        self.inner
            .strip_prefix("${{")
            .and_then(|e| e.strip_suffix("}}"))
            .expect("invariant violated: not a fenced expression")
    }

    /// Returns the extracted expression exactly as it was extracted,
    /// including its fencing.
    pub(crate) fn as_raw(&self) -> &'a str {
        self.inner
    }
}

/// Parse an expression from the given free-form text, starting
/// at the given offset. The returned span is absolute.
///
/// Returns `None` if no expression is found. The scan is quote-aware:
/// a `}}` inside a single-quoted string doesn't close the expression.
fn extract_expression(text: &str, offset: usize) -> Option<(ExtractedExpr<'_>, Range<usize>)> {
    let view = &text[offset..];
    let start = view.find("${{")?;

    let mut end = None;
    let mut in_string = false;

    for (idx, char) in view.bytes().enumerate().skip(start) {
        if char == b'\'' {
            in_string = !in_string;
        } else if !in_string && view.as_bytes()[idx] == b'}' && view.as_bytes()[idx - 1] == b'}' {
            end = Some(idx);
            break;
        }
    }

    end.map(|end| {
        (
            ExtractedExpr::from_fenced(&view[start..=end]).expect("scan produced unfenced text"),
            start + offset..end + offset + 1,
        )
    })
}

/// Extract zero or more expressions from the given free-form text.
///
/// Spans are byte ranges into `text`. An unparseable fragment is still
/// returned; callers decide whether to surface a parse error or skip it.
pub(crate) fn extract_expressions(text: &str) -> Vec<(ExtractedExpr<'_>, Range<usize>)> {
    let mut exprs = vec![];
    let mut offset = 0;

    while let Some((expr, span)) = extract_expression(text, offset) {
        exprs.push((expr, span.start..span.end));

        if span.end >= text.len() {
            break;
        } else {
            offset = span.end;
        }
    }

    exprs
}

/// Returns the name within the given `shell:` stanza.
///
/// The stanza can contain a path and/or arguments; `/bin/bash -e {0}`
/// normalizes to `bash`.
pub(crate) fn normalize_shell(shell: &str) -> &str {
    let path = match shell.split_once(' ') {
        Some((path, _)) => path,
        None => shell,
    };

    Utf8Path::new(path).file_name().unwrap_or(path)
}

/// Synthesizes an environment variable name for hoisting the given
/// context path out of an inline template expansion.
///
/// `github.event.<category>.<field>` becomes `{CATEGORY}_{FIELD}` (with
/// `pull_request` abbreviated to `PR`); `github.head_ref` becomes
/// `HEAD_REF`; anything else uses its last path segment. The result is
/// sanitized to `[A-Z0-9_]` and never starts with a digit.
pub(crate) fn env_var_name_for(path: &str) -> String {
    let path = path.trim();

    if path.eq_ignore_ascii_case("github.head_ref") {
        return "HEAD_REF".into();
    }

    let segments: Vec<&str> = path
        .split('.')
        .map(|s| s.split('[').next().unwrap_or(s))
        .filter(|s| !s.is_empty() && *s != "*")
        .collect();

    let raw = if segments.len() >= 4 && segments[0] == "github" && segments[1] == "event" {
        let category = match segments[2] {
            "pull_request" => "PR",
            other => other,
        };
        format!("{category}_{field}", field = segments.last().expect("nonempty"))
    } else {
        segments.last().copied().unwrap_or(path).to_string()
    };

    sanitize_env_var_name(&raw)
}

fn sanitize_env_var_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .collect();

    if name.is_empty() {
        name = "VAR".into();
    } else if name.as_bytes()[0].is_ascii_digit() {
        name.insert(0, '_');
    }

    name
}

/// Default runner-provided environment variables whose values are static
/// for the duration of a run. `CI` is excluded since users can override it.
pub(crate) fn is_default_runner_env(name: &str) -> bool {
    let name = name.to_ascii_uppercase();
    matches!(
        name.as_str(),
        "GITHUB_ACTION"
            | "GITHUB_ACTION_PATH"
            | "GITHUB_ACTION_REPOSITORY"
            | "GITHUB_ACTIONS"
            | "GITHUB_ACTOR"
            | "GITHUB_ACTOR_ID"
            | "GITHUB_API_URL"
            | "GITHUB_BASE_REF"
            | "GITHUB_ENV"
            | "GITHUB_EVENT_NAME"
            | "GITHUB_EVENT_PATH"
            | "GITHUB_GRAPHQL_URL"
            | "GITHUB_HEAD_REF"
            | "GITHUB_JOB"
            | "GITHUB_OUTPUT"
            | "GITHUB_PATH"
            | "GITHUB_REF"
            | "GITHUB_REF_NAME"
            | "GITHUB_REF_PROTECTED"
            | "GITHUB_REF_TYPE"
            | "GITHUB_REPOSITORY"
            | "GITHUB_REPOSITORY_ID"
            | "GITHUB_REPOSITORY_OWNER"
            | "GITHUB_REPOSITORY_OWNER_ID"
            | "GITHUB_RUN_ATTEMPT"
            | "GITHUB_RUN_ID"
            | "GITHUB_RUN_NUMBER"
            | "GITHUB_SERVER_URL"
            | "GITHUB_SHA"
            | "GITHUB_TRIGGERING_ACTOR"
            | "GITHUB_WORKFLOW"
            | "GITHUB_WORKFLOW_REF"
            | "GITHUB_WORKFLOW_SHA"
            | "GITHUB_WORKSPACE"
            | "RUNNER_ARCH"
            | "RUNNER_DEBUG"
            | "RUNNER_ENVIRONMENT"
            | "RUNNER_NAME"
            | "RUNNER_OS"
            | "RUNNER_TEMP"
            | "RUNNER_TOOL_CACHE"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{env_var_name_for, extract_expression, extract_expressions, normalize_shell};

    #[test]
    fn test_extract_expression() {
        let exprs = &[
            ("${{ foo }}", " foo ", 0..10),
            ("${{ foo }}${{ bar }}", " foo ", 0..10),
            ("leading ${{ foo }} trailing", " foo ", 8..18),
            (
                "leading ${{ '${{ quoted! }}' }} trailing",
                " '${{ quoted! }}' ",
                8..31,
            ),
            ("${{ 'es''cape' }}", " 'es''cape' ", 0..17),
        ];

        for (text, expected_expr, expected_span) in exprs {
            let (actual_expr, actual_span) = extract_expression(text, 0).unwrap();
            assert_eq!(*expected_expr, actual_expr.as_bare());
            assert_eq!(*expected_span, actual_span);
        }
    }

    #[test]
    fn test_extract_expressions() {
        let multiple = r#"echo "OSSL_PATH=${{ github.workspace }}/osslcache/${{ matrix.PYTHON.OPENSSL.TYPE }}-${{ matrix.PYTHON.OPENSSL.VERSION }}-${OPENSSL_HASH}" >> $GITHUB_ENV"#;

        let exprs = extract_expressions(multiple)
            .into_iter()
            .map(|(e, _)| e.as_raw().to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            exprs,
            [
                "${{ github.workspace }}",
                "${{ matrix.PYTHON.OPENSSL.TYPE }}",
                "${{ matrix.PYTHON.OPENSSL.VERSION }}",
            ]
        );
    }

    #[test]
    fn test_normalize_shell() {
        for (actual, expected) in &[
            ("bash", "bash"),
            ("/bin/bash", "bash"),
            ("./bash", "bash"),
            ("/bin/bash -e {0}", "bash"),
            ("pwsh", "pwsh"),
        ] {
            assert_eq!(normalize_shell(actual), *expected);
        }
    }

    #[test]
    fn test_env_var_name_for() {
        for (path, expected) in &[
            ("github.event.pull_request.title", "PR_TITLE"),
            ("github.event.issue.title", "ISSUE_TITLE"),
            ("github.event.comment.body", "COMMENT_BODY"),
            ("github.head_ref", "HEAD_REF"),
            ("github.event.pages[0].page_name", "PAGES_PAGE_NAME"),
            ("github.event.commits.*.message", "COMMITS_MESSAGE"),
            ("steps.meta.outputs.tag", "TAG"),
            ("inputs.version", "VERSION"),
            ("inputs.123-name", "_123_NAME"),
        ] {
            assert_eq!(env_var_name_for(path), *expected, "for {path}");
        }
    }
}
