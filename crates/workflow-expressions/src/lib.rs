//! GitHub Actions expression parsing and trust analysis.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::ops::Deref;

use pest::{Parser, iterators::Pair};

use crate::context::Context;
use crate::parser::{ExprParser, Rule};

pub mod capability;
pub mod context;

// Isolates the ExprParser, Rule and other generated types
// so that we can do `missing_docs` at the top-level.
// See: https://github.com/pest-parser/pest/issues/326
mod parser {
    use pest_derive::Parser;

    /// A parser for GitHub Actions' expression language.
    #[derive(Parser)]
    #[grammar = "expr.pest"]
    pub struct ExprParser;
}

/// Maximum expression nesting depth accepted by [`SpannedExpr::parse`].
///
/// The depth counter is a stack-local parameter of the recursive descent,
/// so nested or interleaved parses can never observe each other's depth.
const MAX_EXPR_DEPTH: usize = 64;

/// Errors produced while parsing an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    /// The expression is syntactically invalid.
    #[error("malformed expression: {0}")]
    Syntax(String),
    /// The expression nests deeper than the parser's bound.
    #[error("expression exceeds maximum nesting depth ({MAX_EXPR_DEPTH})")]
    TooDeep,
}

/// A byte span into the parsed fragment.
///
/// Spans are relative to the fragment handed to [`SpannedExpr::parse`];
/// callers compose them with the fragment's absolute document offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Span {
    /// The span's starting byte offset, inclusive.
    pub start: usize,
    /// The span's ending byte offset, exclusive.
    pub end: usize,
}

impl Span {
    fn from_pest(span: pest::Span<'_>) -> Self {
        Self {
            start: span.start(),
            end: span.end(),
        }
    }

    /// Shifts this span forward by `bias` bytes.
    pub fn adjust(self, bias: usize) -> Self {
        Self {
            start: self.start + bias,
            end: self.end + bias,
        }
    }
}

/// An [`Expr`] together with its span in the source fragment.
#[derive(Debug, PartialEq)]
pub struct SpannedExpr<'src> {
    /// The expression itself.
    pub inner: Expr<'src>,
    /// The expression's span.
    pub span: Span,
}

impl<'src> Deref for SpannedExpr<'src> {
    type Target = Expr<'src>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'src> SpannedExpr<'src> {
    fn new(inner: Expr<'src>, span: Span) -> Self {
        Self { inner, span }
    }
}

/// Represents a function in a GitHub Actions expression.
///
/// Function names are case-insensitive.
#[derive(Debug)]
pub struct Function<'src>(pub(crate) &'src str);

impl PartialEq for Function<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Function<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Represents a single identifier in a GitHub Actions expression,
/// i.e. a single context component.
///
/// Identifiers are case-insensitive.
#[derive(Debug)]
pub struct Identifier<'src>(pub(crate) &'src str);

impl Identifier<'_> {
    /// The identifier's raw text.
    pub fn as_str(&self) -> &str {
        self.0
    }
}

impl PartialEq for Identifier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Identifier<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// A literal value in an expression.
#[derive(Debug, PartialEq)]
pub enum Literal {
    /// A single-quoted string, with `''` escapes resolved.
    String(String),
    /// A number literal.
    Number(f64),
    /// A boolean literal.
    Boolean(bool),
    /// The `null` literal.
    Null,
}

/// Binary operations allowed in an expression.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinOp {
    /// `expr && expr`
    And,
    /// `expr || expr`
    Or,
    /// `expr == expr`
    Eq,
    /// `expr != expr`
    Neq,
    /// `expr > expr`
    Gt,
    /// `expr >= expr`
    Ge,
    /// `expr < expr`
    Lt,
    /// `expr <= expr`
    Le,
}

/// Unary operations allowed in an expression.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnOp {
    /// `!expr`
    Not,
}

/// Represents a GitHub Actions expression.
#[derive(Debug, PartialEq)]
pub enum Expr<'src> {
    /// A literal value.
    Literal(Literal),
    /// The `*` literal within an index or context.
    Star,
    /// A function call.
    Call {
        /// The function name, e.g. `foo` in `foo()`.
        func: Function<'src>,
        /// The function's arguments.
        args: Vec<SpannedExpr<'src>>,
    },
    /// A context identifier component, e.g. `github` in `github.actor`.
    Identifier(Identifier<'src>),
    /// A context index component, e.g. `[0]` in `foo[0]`.
    Index(Box<SpannedExpr<'src>>),
    /// A full context reference.
    Context(Context<'src>),
    /// A binary operation.
    BinOp {
        /// The LHS of the binop.
        lhs: Box<SpannedExpr<'src>>,
        /// The binary operator.
        op: BinOp,
        /// The RHS of the binop.
        rhs: Box<SpannedExpr<'src>>,
    },
    /// A unary operation. Negation (`!`) is currently the only `UnOp`.
    UnOp {
        /// The unary operator.
        op: UnOp,
        /// The expression to apply the operator to.
        expr: Box<SpannedExpr<'src>>,
    },
}

impl<'src> Expr<'src> {
    /// Returns the contexts in this expression that directly flow into the
    /// expression's evaluation.
    ///
    /// For example `${{ foo.bar }}` returns `foo.bar` since the value
    /// of `foo.bar` flows into the evaluation. On the other hand,
    /// `${{ foo.bar == 'abc' }}` returns no expanded contexts,
    /// since the value of `foo.bar` flows into a boolean evaluation.
    pub fn dataflow_contexts(&self) -> Vec<&Context<'src>> {
        let mut contexts = vec![];
        self.collect_dataflow_contexts(&mut contexts);
        contexts
    }

    fn collect_dataflow_contexts<'a>(&'a self, contexts: &mut Vec<&'a Context<'src>>) {
        match self {
            Expr::Call { func, args } => {
                // These functions, when evaluated, produce an evaluation
                // that includes some or all of the contexts listed in
                // their arguments.
                if func == "toJSON" || func == "format" || func == "join" {
                    for arg in args {
                        arg.collect_dataflow_contexts(contexts);
                    }
                }
            }
            Expr::Context(ctx) => contexts.push(ctx),
            Expr::BinOp { lhs, op, rhs } => match op {
                // With && only the RHS can flow into the evaluation as a
                // context (rather than a boolean).
                BinOp::And => rhs.collect_dataflow_contexts(contexts),
                // With || either side can flow into the evaluation.
                BinOp::Or => {
                    lhs.collect_dataflow_contexts(contexts);
                    rhs.collect_dataflow_contexts(contexts);
                }
                _ => (),
            },
            _ => (),
        }
    }
}

impl<'src> SpannedExpr<'src> {
    /// Parses the given string into an expression.
    pub fn parse(expr: &'src str) -> Result<SpannedExpr<'src>, ExprError> {
        // Top level `expression` is a single `or_expr`.
        let or_expr = ExprParser::parse(Rule::expression, expr)
            .map_err(|e| ExprError::Syntax(e.to_string()))?
            .next()
            .expect("pest: expression rule produced no pairs")
            .into_inner()
            .next()
            .expect("pest: expression rule is empty");

        parse_pair(or_expr, 0).map(|e| *e)
    }
}

/// Folds a pest pair into an expression.
///
/// The grammar isn't left-recursive, so binop levels arrive as flat
/// "one or many-headed" sequences; we refold them into left-associative
/// trees here. `depth` is the current recursion depth; it bounds
/// pathological nesting.
fn parse_pair<'src>(
    pair: Pair<'src, Rule>,
    depth: usize,
) -> Result<Box<SpannedExpr<'src>>, ExprError> {
    if depth > MAX_EXPR_DEPTH {
        return Err(ExprError::TooDeep);
    }
    let depth = depth + 1;

    let span = Span::from_pest(pair.as_span());

    match pair.as_rule() {
        Rule::or_expr => {
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().expect("or_expr: missing lhs"), depth)?;
            pairs.try_fold(lhs, |expr, next| {
                let rhs = parse_pair(next, depth)?;
                let span = Span {
                    start: expr.span.start,
                    end: rhs.span.end,
                };
                Ok(SpannedExpr::new(
                    Expr::BinOp {
                        lhs: expr,
                        op: BinOp::Or,
                        rhs,
                    },
                    span,
                )
                .into())
            })
        }
        Rule::and_expr => {
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().expect("and_expr: missing lhs"), depth)?;
            pairs.try_fold(lhs, |expr, next| {
                let rhs = parse_pair(next, depth)?;
                let span = Span {
                    start: expr.span.start,
                    end: rhs.span.end,
                };
                Ok(SpannedExpr::new(
                    Expr::BinOp {
                        lhs: expr,
                        op: BinOp::And,
                        rhs,
                    },
                    span,
                )
                .into())
            })
        }
        Rule::eq_expr | Rule::comp_expr => {
            // These levels capture their operator as a separate pair,
            // so we fold over (op, operand) two-tuples.
            let mut pairs = pair.into_inner();
            let mut expr = parse_pair(pairs.next().expect("binop: missing lhs"), depth)?;

            while let Some(op_pair) = pairs.next() {
                let op = match op_pair.as_str() {
                    "==" => BinOp::Eq,
                    "!=" => BinOp::Neq,
                    ">" => BinOp::Gt,
                    ">=" => BinOp::Ge,
                    "<" => BinOp::Lt,
                    "<=" => BinOp::Le,
                    other => unreachable!("unexpected operator: {other}"),
                };
                let rhs = parse_pair(pairs.next().expect("binop: missing rhs"), depth)?;
                let span = Span {
                    start: expr.span.start,
                    end: rhs.span.end,
                };
                expr = SpannedExpr::new(Expr::BinOp { lhs: expr, op, rhs }, span).into();
            }

            Ok(expr)
        }
        Rule::unary_expr => {
            let mut pairs = pair.into_inner();
            let first = pairs.next().expect("unary_expr is empty");

            match first.as_rule() {
                Rule::unary_op => {
                    let operand =
                        parse_pair(pairs.next().expect("unary_expr: missing operand"), depth)?;
                    Ok(SpannedExpr::new(
                        Expr::UnOp {
                            op: UnOp::Not,
                            expr: operand,
                        },
                        span,
                    )
                    .into())
                }
                Rule::primary_expr => parse_pair(first, depth),
                r => unreachable!("unexpected rule in unary_expr: {r:?}"),
            }
        }
        Rule::primary_expr => {
            // Punt back to the top level match to keep things simple.
            parse_pair(
                pair.into_inner().next().expect("primary_expr is empty"),
                depth,
            )
        }
        Rule::number => {
            let number = pair
                .as_str()
                .parse()
                .map_err(|e| ExprError::Syntax(format!("invalid number: {e}")))?;
            Ok(SpannedExpr::new(Expr::Literal(Literal::Number(number)), span).into())
        }
        Rule::string => {
            // string -> string_inner
            let inner = pair
                .into_inner()
                .next()
                .expect("string: missing string_inner")
                .as_str()
                .replace("''", "'");
            Ok(SpannedExpr::new(Expr::Literal(Literal::String(inner)), span).into())
        }
        Rule::boolean => {
            let boolean = pair
                .as_str()
                .parse()
                .expect("pest: boolean rule matched a non-boolean");
            Ok(SpannedExpr::new(Expr::Literal(Literal::Boolean(boolean)), span).into())
        }
        Rule::null => Ok(SpannedExpr::new(Expr::Literal(Literal::Null), span).into()),
        Rule::star => Ok(SpannedExpr::new(Expr::Star, span).into()),
        Rule::function_call => {
            let mut pairs = pair.into_inner();

            let identifier = pairs.next().expect("function_call: missing name");
            let args = pairs
                .map(|pair| parse_pair(pair, depth).map(|e| *e))
                .collect::<Result<_, _>>()?;

            Ok(SpannedExpr::new(
                Expr::Call {
                    func: Function(identifier.as_str()),
                    args,
                },
                span,
            )
            .into())
        }
        Rule::identifier => {
            Ok(SpannedExpr::new(Expr::Identifier(Identifier(pair.as_str())), span).into())
        }
        Rule::index => {
            let inner = parse_pair(pair.into_inner().next().expect("index is empty"), depth)?;
            Ok(SpannedExpr::new(Expr::Index(inner), span).into())
        }
        Rule::context => {
            let raw = pair.as_str();
            let pairs = pair.into_inner();

            let mut parts: Vec<SpannedExpr<'src>> = pairs
                .map(|pair| parse_pair(pair, depth).map(|e| *e))
                .collect::<Result<_, _>>()?;

            // The `context` rule wholly encloses the `function_call` rule,
            // so we clean up the AST slightly to turn a single-call context
            // back into just the call.
            if parts.len() == 1 && matches!(parts[0].inner, Expr::Call { .. }) {
                Ok(parts.remove(0).into())
            } else {
                Ok(SpannedExpr::new(Expr::Context(Context::new(raw, parts)), span).into())
            }
        }
        r => unreachable!("unrecognized rule: {r:?}"),
    }
}

#[cfg(test)]
mod tests {
    use pest::Parser as _;
    use pretty_assertions::assert_eq;

    use super::parser::{ExprParser, Rule};
    use super::{BinOp, Expr, ExprError, Function, Literal, SpannedExpr, UnOp};

    #[test]
    fn test_function_eq() {
        let func = Function("foo");
        assert_eq!(&func, "foo");
        assert_eq!(&func, "FOO");
        assert_eq!(&func, "Foo");

        assert_eq!(func, Function("FOO"));
    }

    #[test]
    fn test_parse_string_rule() {
        let cases = &[
            ("''", ""),
            ("' '", " "),
            ("''''", "''"),
            ("'test'", "test"),
            ("'spaces are ok'", "spaces are ok"),
            ("'escaping '' works'", "escaping '' works"),
        ];

        for (case, expected) in cases {
            let s = ExprParser::parse(Rule::string, case)
                .unwrap()
                .next()
                .unwrap();

            assert_eq!(s.into_inner().next().unwrap().as_str(), *expected);
        }
    }

    #[test]
    fn test_parse_context_rule() {
        let cases = &[
            "foo.bar",
            "github.action_path",
            "inputs.foo-bar",
            "inputs.also--valid",
            "inputs.this__too",
            "secrets.GH_TOKEN",
            "foo.*.bar",
            "github.event.issue.labels.*.name",
        ];

        for case in cases {
            assert_eq!(
                ExprParser::parse(Rule::context, case)
                    .unwrap()
                    .next()
                    .unwrap()
                    .as_str(),
                *case
            );
        }
    }

    #[test]
    fn test_parse_call_rule() {
        let cases = &[
            "foo()",
            "foo(bar)",
            "foo(bar())",
            "foo(1.23)",
            "foo(1,2)",
            "foo(1, 2)",
            "foo(1, 2, secret.GH_TOKEN)",
            "foo(   )",
            "fromJSON(inputs.free-threading)",
        ];

        for case in cases {
            assert_eq!(
                ExprParser::parse(Rule::function_call, case)
                    .unwrap()
                    .next()
                    .unwrap()
                    .as_str(),
                *case
            );
        }
    }

    #[test]
    fn test_parse_expr_rule() -> anyhow::Result<()> {
        // Ensures that we parse multi-line expressions correctly.
        let multiline = "github.repository_owner == 'someorg' &&
        ((github.event_name == 'pull_request_review' && github.event.review.state == 'approved') ||
        (github.event_name == 'pull_request_target' &&
        (github.event.action == 'ready_for_review' || github.event.label.name == 'automerge-skip')))";

        let cases = &[
            "fromJSON(inputs.free-threading) && '--disable-gil' || ''",
            "foo || bar || baz",
            "foo || bar && baz || foo && 1 && 2 && 3 || 4",
            "(github.actor != 'github-actions[bot]' && github.actor) || 'fallback'",
            "(true || false) == true",
            "!(!true || false)",
            "!(!true || false) == true",
            "(true == (false || true && (true || false))) == true",
            "foo()[0]",
            "fromJson(steps.runs.outputs.data).workflow_runs[0].id",
            multiline,
            "'a' == 'b' && 'c' || 'd'",
            "github.event['a']",
            "github.event['a' == 'b' && 'c' || 'd']",
            "github['event']['inputs']['dry-run']",
            "github[format('{0}', 'event')]",
            "github['event']['inputs'].*",
        ];

        for case in cases {
            assert_eq!(
                ExprParser::parse(Rule::expression, case)?
                    .next()
                    .unwrap()
                    .as_str(),
                *case
            );
        }

        Ok(())
    }

    #[test]
    fn test_parse_literals() -> anyhow::Result<()> {
        for (case, expected) in [
            ("'foo '' bar'", Literal::String("foo ' bar".into())),
            ("('foo '' bar')", Literal::String("foo ' bar".into())),
            ("1.23", Literal::Number(1.23)),
            ("true", Literal::Boolean(true)),
            ("null", Literal::Null),
        ] {
            let expr = SpannedExpr::parse(case)?;
            assert_eq!(expr.inner, Expr::Literal(expected), "for {case}");
        }

        Ok(())
    }

    #[test]
    fn test_parse_associativity() -> anyhow::Result<()> {
        // Sanity check for our associativity: the top level expression
        // here should be `BinOp::Or`.
        let expr =
            SpannedExpr::parse("github.ref == 'refs/heads/main' && 'for_main' || 'for_others'")?;

        let Expr::BinOp { lhs, op, rhs } = &expr.inner else {
            panic!("expected a binop, got {expr:?}");
        };
        assert_eq!(*op, BinOp::Or);
        assert_eq!(rhs.inner, Expr::Literal(Literal::String("for_others".into())));

        let Expr::BinOp { op, .. } = &lhs.inner else {
            panic!("expected a nested binop");
        };
        assert_eq!(*op, BinOp::And);

        Ok(())
    }

    #[test]
    fn test_parse_unary() -> anyhow::Result<()> {
        let expr = SpannedExpr::parse("!(!true || false)")?;
        let Expr::UnOp { op, expr } = &expr.inner else {
            panic!("expected a unop");
        };
        assert_eq!(*op, UnOp::Not);
        assert!(matches!(expr.inner, Expr::BinOp { .. }));

        Ok(())
    }

    #[test]
    fn test_parse_context_parts() -> anyhow::Result<()> {
        let expr = SpannedExpr::parse("vegetables.*.ediblePortions")?;
        let Expr::Context(ctx) = &expr.inner else {
            panic!("expected a context");
        };

        assert_eq!(ctx.as_str(), "vegetables.*.ediblePortions");
        assert_eq!(ctx.parts.len(), 3);
        assert!(matches!(ctx.parts[1].inner, Expr::Star));

        let expr = SpannedExpr::parse("foo.bar.baz[1][2]")?;
        let Expr::Context(ctx) = &expr.inner else {
            panic!("expected a context");
        };
        assert_eq!(ctx.parts.len(), 5);
        assert!(matches!(ctx.parts[3].inner, Expr::Index(_)));

        Ok(())
    }

    #[test]
    fn test_parse_call_context_collapses() -> anyhow::Result<()> {
        // A bare call is a call, not a single-element context.
        let expr = SpannedExpr::parse("foo(1, 2, 3)")?;
        let Expr::Call { func, args } = &expr.inner else {
            panic!("expected a call");
        };
        assert_eq!(func, &Function("foo"));
        assert_eq!(args.len(), 3);

        // A call heading a context chain stays a context.
        let expr = SpannedExpr::parse("fromJson(steps.runs.outputs.data).workflow_runs[0].id")?;
        assert!(matches!(expr.inner, Expr::Context(_)));

        Ok(())
    }

    #[test]
    fn test_parse_spans() -> anyhow::Result<()> {
        let src = "foo.bar == 'abc'";
        let expr = SpannedExpr::parse(src)?;

        assert_eq!(expr.span.start, 0);
        assert_eq!(expr.span.end, src.len());

        let Expr::BinOp { lhs, .. } = &expr.inner else {
            panic!("expected a binop");
        };
        assert_eq!(&src[lhs.span.start..lhs.span.end], "foo.bar");

        Ok(())
    }

    #[test]
    fn test_parse_depth_bound() {
        let mut expr = "1".to_string();
        for _ in 0..256 {
            expr = format!("({expr})");
        }

        assert!(matches!(
            SpannedExpr::parse(&expr),
            Err(ExprError::TooDeep) | Err(ExprError::Syntax(_))
        ));
    }

    #[test]
    fn test_expr_dataflow_contexts() -> anyhow::Result<()> {
        fn paths(expr: &SpannedExpr) -> Vec<String> {
            expr.dataflow_contexts()
                .into_iter()
                .map(|c| c.as_str().to_string())
                .collect()
        }

        // Trivial cases.
        let expr = SpannedExpr::parse("foo.bar")?;
        assert_eq!(paths(&expr), ["foo.bar"]);

        // No dataflow due to a boolean expression.
        let expr = SpannedExpr::parse("foo.bar == 'bar'")?;
        assert!(paths(&expr).is_empty());

        // ||: all contexts potentially expand into the evaluation.
        let expr = SpannedExpr::parse("foo.bar || abc || d.e.f")?;
        assert_eq!(paths(&expr), ["foo.bar", "abc", "d.e.f"]);

        // &&: only the RHS context(s) expand into the evaluation.
        let expr = SpannedExpr::parse("foo.bar && abc && d.e.f")?;
        assert_eq!(paths(&expr), ["d.e.f"]);

        let expr = SpannedExpr::parse("foo.bar == 'bar' && foo.bar || foo.baz")?;
        assert_eq!(paths(&expr), ["foo.bar", "foo.baz"]);

        let expr =
            SpannedExpr::parse("format('{0} {1} {2}', foo.bar, tojson(github), toJSON(github))")?;
        assert_eq!(paths(&expr), ["foo.bar", "github", "github"]);

        Ok(())
    }
}
