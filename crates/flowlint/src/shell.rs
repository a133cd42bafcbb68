//! Shell script analysis for `run:` step bodies.
//!
//! Scripts are parsed with tree-sitter's bash grammar and walked with a
//! context record that is copied by value on every descent, so nothing
//! a subtree sets can leak back out (or across scripts).
//!
//! Template expressions (`${{ ... }}`) are not valid shell; before
//! parsing, each one is replaced by a same-length placeholder token so
//! that byte offsets in the parsed script line up with the original.
//!
//! When the bash parse fails, analysis degrades to a regex pass. The
//! fallback is lossy: it never reports `in_eval`, `in_shell_cmd`, or
//! `in_cmd_subst`, and its usages are marked as such.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tree_sitter::{Node, Parser, Tree};

use crate::utils::extract_expressions;

/// Shells whose `-c` argument re-parses its operand.
const SHELL_COMMANDS: &[&str] = &["sh", "bash", "zsh", "ksh", "dash"];

/// Commands that perform network requests.
pub(crate) const NETWORK_COMMANDS: &[&str] = &["curl", "wget", "nc", "netcat", "http", "https"];

static VAR_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap());

/// Language-runtime network callers, recognized by a lossy line-level
/// pass regardless of parse success.
static RUNTIME_NETWORK_CALLERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<name>fetch|axios\.\w+|requests\.\w+|urllib\.urlopen|
         Invoke-WebRequest|Invoke-RestMethod|\biwr\b|\birm\b|got|node-fetch)
        \s*\(?\s*(?P<arg>[^)\n]*)",
    )
    .unwrap()
});

static DANGEROUS_EVAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)\beval\b").unwrap());

static DANGEROUS_SHELL_C: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?P<shell>sh|bash|zsh|ksh|dash)\b[^\n;|&]*\s-c\b").unwrap()
});

/// The walker's context record.
///
/// This is `Copy` on purpose: every descent copies the parent's record,
/// so restoring on return is automatic.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct WalkContext {
    /// Inside the arguments of an `eval`.
    pub(crate) in_eval: bool,
    /// Inside the `-c` operand region of `sh`/`bash`/etc.
    pub(crate) in_shell_cmd: bool,
    /// Inside `$( ... )` or backticks.
    pub(crate) in_cmd_subst: bool,
    /// Inside a pipeline.
    pub(crate) in_pipeline: bool,
    /// Inside a double-quoted string (or heredoc body).
    pub(crate) quoted: bool,
}

/// A single use of a shell variable.
#[derive(Debug)]
pub(crate) struct VarUsage {
    /// The usage's byte span in the original script.
    pub(crate) span: Range<usize>,
    /// Whether the expansion is double-quoted.
    pub(crate) quoted: bool,
    pub(crate) in_eval: bool,
    pub(crate) in_shell_cmd: bool,
    pub(crate) in_cmd_subst: bool,
    /// The line containing the usage.
    pub(crate) snippet: String,
    /// Whether this usage came from the lossy fallback pass.
    pub(crate) lossy: bool,
}

impl VarUsage {
    /// Whether the usage allows injected data to change execution.
    ///
    /// Unquoted expansions word-split and glob; quoted expansions are
    /// re-parsed inside `eval` and `sh -c`. A quoted expansion that is
    /// merely inside `$( ... )` is safe.
    pub(crate) fn is_unsafe(&self) -> bool {
        !self.quoted || self.in_eval || self.in_shell_cmd
    }
}

/// A variable (or placeholder) occurring in a command's argument list.
#[derive(Debug)]
pub(crate) struct ArgUsage {
    /// The command's name, normalized to its basename.
    pub(crate) command: String,
    /// The argument's 1-based position.
    pub(crate) argument_position: usize,
    /// Whether the argument appears strictly after a literal `--`.
    pub(crate) is_after_double_dash: bool,
    /// The argument's byte span in the original script.
    pub(crate) span: Range<usize>,
}

/// A single argument of a network command.
#[derive(Debug)]
pub(crate) struct NetworkArg {
    /// The argument's raw text, with template expressions restored.
    pub(crate) value: String,
    /// Whether the argument looks like a flag.
    pub(crate) is_flag: bool,
    /// Raw `${{ ... }}` expressions occurring within the argument.
    pub(crate) exprs: Vec<String>,
    /// Shell variable names referenced within the argument.
    pub(crate) var_names: Vec<String>,
    /// The argument's byte span in the original script.
    pub(crate) span: Range<usize>,
}

/// A call to a network-capable command.
#[derive(Debug)]
pub(crate) struct NetworkCall {
    /// The command's name, normalized to its basename.
    pub(crate) command: String,
    /// The call's arguments.
    pub(crate) args: Vec<NetworkArg>,
    pub(crate) in_cmd_subst: bool,
    pub(crate) in_pipeline: bool,
    /// The call's byte span in the original script.
    pub(crate) span: Range<usize>,
    /// Whether this call came from the lossy fallback pass.
    pub(crate) lossy: bool,
}

/// A template expression replaced by a placeholder before parsing.
#[derive(Debug)]
pub(crate) struct Placeholder {
    /// The placeholder's token, e.g. `__E0__`.
    pub(crate) token: String,
    /// The token padded (with underscores) to the expression's exact
    /// length, as it appears in the sanitized script.
    padded: String,
    /// The original expression's byte span in the script.
    pub(crate) span: Range<usize>,
    /// The original raw expression, fences included.
    pub(crate) raw: String,
}

/// A parsed (or unparseable) shell script.
pub(crate) struct ShellScript {
    source: String,
    sanitized: String,
    tree: Option<Tree>,
    placeholders: Vec<Placeholder>,
}

impl ShellScript {
    /// Parses the given script body.
    ///
    /// This never fails: scripts the bash grammar rejects produce a
    /// lossy [`ShellScript`] whose queries fall back to regexes.
    pub(crate) fn parse(source: &str) -> Self {
        let (sanitized, placeholders) = sanitize_expressions(source);

        let mut parser = Parser::new();
        let tree = parser
            .set_language(&tree_sitter_bash::LANGUAGE.into())
            .ok()
            .and_then(|()| parser.parse(&sanitized, None))
            .filter(|tree| !tree.root_node().has_error());

        if tree.is_none() {
            tracing::warn!("bash parse failed; falling back to lossy analysis");
        }

        Self {
            source: source.to_string(),
            sanitized,
            tree,
            placeholders,
        }
    }

    /// Whether analysis is running in the lossy fallback mode.
    pub(crate) fn is_lossy(&self) -> bool {
        self.tree.is_none()
    }

    /// The template-expression placeholders substituted before parsing.
    pub(crate) fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    fn line_of(&self, offset: usize) -> String {
        let start = self.source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let end = self.source[offset..]
            .find('\n')
            .map(|i| offset + i)
            .unwrap_or(self.source.len());
        self.source[start..end].to_string()
    }

    /// Finds every use of `$name` / `${name}` in the script, with
    /// context classification.
    pub(crate) fn find_env_var_usages(&self, name: &str) -> Vec<VarUsage> {
        let Some(tree) = &self.tree else {
            return self.find_env_var_usages_lossy(name);
        };

        let mut usages = vec![];
        self.walk(tree.root_node(), WalkContext::default(), &mut |node, ctx| {
            if !matches!(node.kind(), "simple_expansion" | "expansion") {
                return;
            }

            let is_match = (0..node.named_child_count()).any(|i| {
                node.named_child(i as u32).is_some_and(|child| {
                    child.kind() == "variable_name"
                        && child.utf8_text(self.sanitized.as_bytes()) == Ok(name)
                })
            });

            if is_match {
                let span = node.byte_range();
                usages.push(VarUsage {
                    snippet: self.line_of(span.start),
                    span,
                    quoted: ctx.quoted,
                    in_eval: ctx.in_eval,
                    in_shell_cmd: ctx.in_shell_cmd,
                    in_cmd_subst: ctx.in_cmd_subst,
                    lossy: false,
                });
            }
        });

        usages
    }

    fn find_env_var_usages_lossy(&self, name: &str) -> Vec<VarUsage> {
        VAR_REFERENCE
            .captures_iter(&self.source)
            .filter(|caps| &caps[1] == name)
            .map(|caps| {
                let span = caps.get(0).expect("match has a group 0").range();
                VarUsage {
                    snippet: self.line_of(span.start),
                    span,
                    // The fallback can't see quoting; report the usage
                    // but never any context classification.
                    quoted: false,
                    in_eval: false,
                    in_shell_cmd: false,
                    in_cmd_subst: false,
                    lossy: true,
                }
            })
            .collect()
    }

    /// Finds each occurrence of `name` (a variable name or placeholder
    /// token) inside an argument of a command whose basename is in
    /// `cmd_names`.
    pub(crate) fn find_var_usage_as_command_arg(
        &self,
        name: &str,
        cmd_names: &[&str],
    ) -> Vec<ArgUsage> {
        let mut usages = vec![];

        self.each_command(&mut |cmd| {
            if !cmd_names.contains(&cmd.head.as_str()) {
                return;
            }

            let double_dash = cmd
                .args
                .iter()
                .position(|(_, text)| text == "--")
                .map(|idx| idx + 1);

            for (idx, (node, text)) in cmd.args.iter().enumerate() {
                let position = idx + 1;

                let matched = text.contains(&format!("${name}"))
                    || text.contains(&format!("${{{name}}}"))
                    || (name.starts_with("__") && text.contains(name));

                if matched {
                    usages.push(ArgUsage {
                        command: cmd.head.clone(),
                        argument_position: position,
                        is_after_double_dash: double_dash.is_some_and(|dd| position > dd),
                        span: node.byte_range(),
                    });
                }
            }
        });

        usages
    }

    /// Finds every call to a network-capable command, including a lossy
    /// line-level pass for language-runtime callers.
    pub(crate) fn find_network_commands(&self) -> Vec<NetworkCall> {
        let mut calls = vec![];

        self.each_command(&mut |cmd| {
            if !NETWORK_COMMANDS.contains(&cmd.head.as_str()) {
                return;
            }

            let args = cmd
                .args
                .iter()
                .map(|(node, text)| self.network_arg(node.byte_range(), text))
                .collect();

            calls.push(NetworkCall {
                command: cmd.head.clone(),
                args,
                in_cmd_subst: cmd.ctx.in_cmd_subst,
                in_pipeline: cmd.ctx.in_pipeline,
                span: cmd.span.clone(),
                lossy: false,
            });
        });

        // Language-runtime callers (fetch, requests.get, ...) are
        // recognized textually; these calls are always lossy.
        for caps in RUNTIME_NETWORK_CALLERS.captures_iter(&self.source) {
            let whole = caps.get(0).expect("match has a group 0");
            let name = caps.name("name").expect("match has a name group");
            let arg = caps.name("arg").expect("match has an arg group");

            calls.push(NetworkCall {
                command: name.as_str().to_string(),
                args: vec![self.network_arg(arg.range(), arg.as_str())],
                in_cmd_subst: false,
                in_pipeline: false,
                span: whole.range(),
                lossy: true,
            });
        }

        calls.sort_by_key(|call| call.span.start);
        calls
    }

    fn network_arg(&self, span: Range<usize>, text: &str) -> NetworkArg {
        // Map placeholder tokens back to their original expressions.
        let mut value = text.to_string();
        let mut exprs = vec![];
        for placeholder in &self.placeholders {
            if value.contains(&placeholder.padded) {
                value = value.replace(&placeholder.padded, &placeholder.raw);
                exprs.push(placeholder.raw.clone());
            }
        }

        // Expressions can also appear verbatim (lossy pass inputs).
        for (expr, _) in extract_expressions(&value) {
            let raw = expr.as_raw().to_string();
            if !exprs.contains(&raw) {
                exprs.push(raw);
            }
        }

        let var_names = VAR_REFERENCE
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .collect();

        NetworkArg {
            is_flag: value.starts_with('-'),
            value,
            exprs,
            var_names,
            span,
        }
    }

    /// Whether the script contains a construct that re-parses its input.
    pub(crate) fn has_dangerous_pattern(&self) -> bool {
        self.dangerous_pattern_type().is_some()
    }

    /// The kind of re-parsing construct present, if any.
    pub(crate) fn dangerous_pattern_type(&self) -> Option<&'static str> {
        if DANGEROUS_EVAL.is_match(&self.sanitized) {
            return Some("eval");
        }

        if let Some(caps) = DANGEROUS_SHELL_C.captures(&self.sanitized) {
            return Some(match &caps["shell"] {
                "bash" => "bash -c",
                "zsh" => "zsh -c",
                "ksh" => "ksh -c",
                "dash" => "dash -c",
                _ => "sh -c",
            });
        }

        None
    }

    /// Walks the tree depth-first, handing each node and its context to
    /// `visit`.
    ///
    /// The context is copied before descending into any child, so a
    /// subtree's context changes are invisible to its siblings and
    /// ancestors.
    fn walk<'t>(
        &self,
        node: Node<'t>,
        ctx: WalkContext,
        visit: &mut dyn FnMut(Node<'t>, WalkContext),
    ) {
        visit(node, ctx);

        // The child context starts as a copy of ours.
        let mut child_ctx = ctx;
        match node.kind() {
            "command_substitution" => child_ctx.in_cmd_subst = true,
            "string" | "heredoc_body" => child_ctx.quoted = true,
            "pipeline" => child_ctx.in_pipeline = true,
            _ => (),
        }

        if node.kind() == "command" {
            self.walk_command(node, child_ctx, visit);
            return;
        }

        for i in 0..node.child_count() {
            if let Some(child) = node.child(i as u32) {
                self.walk(child, child_ctx, visit);
            }
        }
    }

    /// Command nodes switch context for their *arguments* based on the
    /// command's head: `eval` re-parses everything, and `sh -c` (and
    /// friends) re-parse the operand after `-c`.
    fn walk_command<'t>(
        &self,
        node: Node<'t>,
        ctx: WalkContext,
        visit: &mut dyn FnMut(Node<'t>, WalkContext),
    ) {
        let head = node
            .child_by_field_name("name")
            .and_then(|name| name.utf8_text(self.sanitized.as_bytes()).ok())
            .map(command_basename)
            .unwrap_or_default();

        let is_eval = head == "eval";
        let is_shell = SHELL_COMMANDS.contains(&head.as_str());

        let mut saw_dash_c = false;
        for i in 0..node.child_count() {
            let Some(child) = node.child(i as u32) else {
                continue;
            };

            // The head itself keeps the surrounding context.
            let is_head = node
                .child_by_field_name("name")
                .is_some_and(|name| name.id() == child.id());

            let mut arg_ctx = ctx;
            if !is_head {
                if is_eval {
                    arg_ctx.in_eval = true;
                } else if is_shell && saw_dash_c {
                    arg_ctx.in_shell_cmd = true;
                }
            }

            self.walk(child, arg_ctx, visit);

            if !is_head
                && is_shell
                && child.utf8_text(self.sanitized.as_bytes()) == Ok("-c")
            {
                saw_dash_c = true;
            }
        }
    }

    /// Visits every command call in the script.
    fn each_command(&self, f: &mut dyn FnMut(&CommandCall<'_>)) {
        let Some(tree) = &self.tree else {
            return;
        };

        self.walk(tree.root_node(), WalkContext::default(), &mut |node, ctx| {
            if node.kind() != "command" {
                return;
            }

            let Some(name) = node.child_by_field_name("name") else {
                return;
            };

            let head = name
                .utf8_text(self.sanitized.as_bytes())
                .map(command_basename)
                .unwrap_or_default();

            let mut args = vec![];
            for i in 0..node.child_count() {
                let Some(child) = node.child(i as u32) else {
                    continue;
                };
                if child.id() == name.id() || child.kind() == "variable_assignment" {
                    continue;
                }

                let text = child
                    .utf8_text(self.sanitized.as_bytes())
                    .unwrap_or_default()
                    .to_string();
                args.push((child, text));
            }

            f(&CommandCall {
                head,
                args,
                ctx,
                span: node.byte_range(),
            });
        });
    }
}

struct CommandCall<'t> {
    head: String,
    args: Vec<(Node<'t>, String)>,
    ctx: WalkContext,
    span: Range<usize>,
}

/// Strips any path components from a command head, so `/usr/bin/git`
/// compares as `git`.
fn command_basename(head: &str) -> String {
    head.rsplit('/').next().unwrap_or(head).to_string()
}

/// Replaces each `${{ ... }}` with a same-length placeholder token so
/// that the result parses as shell while preserving byte offsets.
fn sanitize_expressions(source: &str) -> (String, Vec<Placeholder>) {
    let mut sanitized = source.to_string();
    let mut placeholders = vec![];

    for (idx, (expr, span)) in extract_expressions(source).into_iter().enumerate() {
        let token = format!("__E{idx}__");

        // Pad the token with trailing underscores to the expression's
        // exact length. Expressions are at least 6 bytes (`${{x}}`), and
        // the token is never longer for the handful of expressions a
        // script realistically contains.
        let mut replacement = token.clone();
        while replacement.len() < span.end - span.start {
            replacement.push('_');
        }
        replacement.truncate(span.end - span.start);

        sanitized.replace_range(span.clone(), &replacement);

        placeholders.push(Placeholder {
            token,
            padded: replacement,
            span,
            raw: expr.as_raw().to_string(),
        });
    }

    (sanitized, placeholders)
}

#[cfg(test)]
mod tests {
    use super::ShellScript;

    #[test]
    fn test_var_usage_classification() {
        for (script, expected_unsafe) in &[
            // Unquoted: word splitting and globbing.
            ("echo $FOO", true),
            ("echo ${FOO}", true),
            // Quoted: inert.
            (r#"echo "$FOO""#, false),
            (r#"echo "${FOO}""#, false),
            // Quoted but re-parsed by eval.
            (r#"eval "$FOO""#, true),
            // Quoted but re-parsed by sh -c.
            (r#"sh -c "$FOO""#, true),
            (r#"bash -c "$FOO""#, true),
            // Quoted inside a command substitution only: safe.
            (r#"out=$(echo "$FOO")"#, false),
        ] {
            let script_obj = ShellScript::parse(script);
            assert!(!script_obj.is_lossy(), "unexpected lossy parse: {script}");

            let usages = script_obj.find_env_var_usages("FOO");
            assert_eq!(usages.len(), 1, "expected one usage in {script}");
            assert_eq!(
                usages[0].is_unsafe(),
                *expected_unsafe,
                "wrong classification for {script}"
            );
        }
    }

    #[test]
    fn test_context_isolation_between_scripts() {
        // A script containing eval must not leak `in_eval` into a
        // separately parsed script.
        let first = ShellScript::parse(r#"eval "$X""#);
        assert!(first.find_env_var_usages("X")[0].in_eval);

        let second = ShellScript::parse(r#"echo "$X""#);
        let usages = second.find_env_var_usages("X");
        assert_eq!(usages.len(), 1);
        assert!(!usages[0].in_eval);
    }

    #[test]
    fn test_context_isolation_between_statements() {
        // eval's context applies to its own arguments only.
        let script = ShellScript::parse("eval \"$X\"\necho \"$Y\"");
        assert!(script.find_env_var_usages("X")[0].in_eval);
        assert!(!script.find_env_var_usages("Y")[0].in_eval);
    }

    #[test]
    fn test_template_expression_placeholders() {
        let script = ShellScript::parse(r#"echo "${{ github.event.issue.title }}""#);
        assert!(!script.is_lossy());
        assert_eq!(script.placeholders().len(), 1);
        assert_eq!(
            script.placeholders()[0].raw,
            "${{ github.event.issue.title }}"
        );
    }

    #[test]
    fn test_find_var_usage_as_command_arg() {
        let script = ShellScript::parse("git diff $BRANCH");
        let usages = script.find_var_usage_as_command_arg("BRANCH", &["git"]);
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].command, "git");
        assert!(!usages[0].is_after_double_dash);

        let script = ShellScript::parse("git diff -- $BRANCH");
        let usages = script.find_var_usage_as_command_arg("BRANCH", &["git"]);
        assert_eq!(usages.len(), 1);
        assert!(usages[0].is_after_double_dash);

        // Non-matching command heads are ignored.
        let script = ShellScript::parse("echo $BRANCH");
        assert!(script
            .find_var_usage_as_command_arg("BRANCH", &["git"])
            .is_empty());
    }

    #[test]
    fn test_placeholder_as_command_arg() {
        let script = ShellScript::parse("git diff ${{ github.head_ref }}");
        let token = script.placeholders()[0].token.clone();
        let usages = script.find_var_usage_as_command_arg(&token, &["git"]);
        assert_eq!(usages.len(), 1);
        assert!(!usages[0].is_after_double_dash);
    }

    #[test]
    fn test_find_network_commands() {
        let script = ShellScript::parse("curl -d \"$DATA\" https://example.com/${{ github.head_ref }}");
        let calls = script.find_network_commands();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "curl");

        let url_arg = calls[0]
            .args
            .iter()
            .find(|a| a.value.contains("example.com"))
            .unwrap();
        assert!(!url_arg.is_flag);
        assert_eq!(url_arg.exprs, ["${{ github.head_ref }}"]);

        let data_arg = calls[0].args.iter().find(|a| a.value == "-d").unwrap();
        assert!(data_arg.is_flag);
    }

    #[test]
    fn test_runtime_network_fallback() {
        let script = ShellScript::parse("node -e 'fetch(process.env.URL)'");
        let calls = script.find_network_commands();
        assert!(calls.iter().any(|c| c.command == "fetch" && c.lossy));
    }

    #[test]
    fn test_dangerous_patterns() {
        assert_eq!(
            ShellScript::parse("eval \"$X\"").dangerous_pattern_type(),
            Some("eval")
        );
        assert_eq!(
            ShellScript::parse("sh -c \"$X\"").dangerous_pattern_type(),
            Some("sh -c")
        );
        assert_eq!(
            ShellScript::parse("bash -euo pipefail -c \"$X\"").dangerous_pattern_type(),
            Some("bash -c")
        );
        assert_eq!(ShellScript::parse("echo hi").dangerous_pattern_type(), None);
    }

    #[test]
    fn test_lossy_fallback() {
        // An unclosed quote forces the fallback path.
        let script = ShellScript::parse("echo \"$FOO");
        assert!(script.is_lossy());

        let usages = script.find_env_var_usages("FOO");
        assert_eq!(usages.len(), 1);
        assert!(usages[0].lossy);
        // The fallback never reports context classifications.
        assert!(!usages[0].in_eval);
        assert!(!usages[0].in_cmd_subst);
    }
}
