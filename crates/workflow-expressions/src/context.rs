//! Matching APIs for GitHub Actions expression contexts
//! (e.g. `github.event.pull_request.title`).

use crate::{Expr, Literal, SpannedExpr};

/// Represents a context in a GitHub Actions expression.
///
/// These typically look something like `github.actor` or `inputs.foo`,
/// although they can also be a "call" context like `fromJSON(...).foo.bar`,
/// i.e. where the head of the context is a function call rather than an
/// identifier.
#[derive(Debug, PartialEq)]
pub struct Context<'src> {
    raw: &'src str,
    /// The individual parts of the context.
    pub parts: Vec<SpannedExpr<'src>>,
}

impl<'src> Context<'src> {
    pub(crate) fn new(raw: &'src str, parts: Vec<SpannedExpr<'src>>) -> Self {
        Self { raw, parts }
    }

    /// The context exactly as it appeared in the source.
    pub fn as_str(&self) -> &'src str {
        self.raw
    }

    /// The context's head identifier, if it has one.
    ///
    /// Returns `None` when the context is headed by a call.
    pub fn head(&self) -> Option<&'src str> {
        match self.parts.first().map(|p| &p.inner) {
            Some(Expr::Identifier(ident)) => Some(ident.0),
            _ => None,
        }
    }

    /// Returns whether the context matches the given pattern exactly.
    pub fn matches(&self, pattern: &str) -> bool {
        let Some(pattern) = ContextPattern::try_new(pattern) else {
            return false;
        };

        pattern.matches(self)
    }

    /// Returns whether the context is a child of the given pattern.
    ///
    /// A context is considered its own child, i.e. `foo.bar` is a child of
    /// `foo.bar`.
    pub fn child_of(&self, parent: &str) -> bool {
        let Some(parent) = ContextPattern::try_new(parent) else {
            return false;
        };

        parent.parent_of(self)
    }

    /// Return this context's "single tail," if it has one.
    ///
    /// This is useful primarily for contexts under `env` and `inputs`,
    /// where we expect only a single tail part, e.g. `env.FOO` or
    /// `inputs['bar']`.
    ///
    /// Returns `None` if the context has more than one tail part,
    /// or if the context's head part is not an identifier.
    pub fn single_tail(&self) -> Option<&str> {
        if self.parts.len() != 2 || !matches!(self.parts[0].inner, Expr::Identifier(_)) {
            return None;
        }

        part_as_str(&self.parts[1].inner)
    }
}

/// Extracts the "name" of a context part: an identifier's text, or a
/// string-literal index's contents.
fn part_as_str<'src, 'a>(part: &'a Expr<'src>) -> Option<&'a str> {
    match part {
        Expr::Identifier(ident) => Some(ident.0),
        Expr::Index(idx) => match &idx.inner {
            Expr::Literal(Literal::String(idx)) => Some(idx),
            _ => None,
        },
        _ => None,
    }
}

/// A `ContextPattern` matches one or more contexts.
///
/// Patterns are always in dotted form and can only contain identifiers
/// and `*` wildcards, e.g. `github.event.commits.*.message`. Contexts
/// that contain indices can still be matched: `foo[0].bar` and
/// `foo['x'].bar` are treated as `foo.*.bar` and `foo.x.bar`
/// respectively. All matching is case-insensitive.
#[derive(Copy, Clone, Debug)]
pub struct ContextPattern<'src>(&'src str);

enum Comparison {
    /// The context is deeper than (or exactly as deep as) the pattern,
    /// and the overlapping parts match.
    Child,
    /// The pattern and context match exactly.
    Match,
    /// The pattern is deeper than the context, and the overlapping
    /// parts match; the context *contains* everything the pattern names.
    Contains,
}

impl<'src> ContextPattern<'src> {
    /// Creates a new [`ContextPattern`], panicking if the pattern
    /// is invalid. Intended for static pattern tables.
    pub fn new(pattern: &'src str) -> Self {
        Self::try_new(pattern).expect("invalid context pattern")
    }

    /// Creates a new [`ContextPattern`] from the given string,
    /// returning `None` if the pattern is invalid.
    pub fn try_new(pattern: &'src str) -> Option<Self> {
        if pattern.is_empty() {
            return None;
        }

        for (idx, part) in pattern.split('.').enumerate() {
            match part {
                // A leading wildcard matches everything, which makes
                // the pattern meaningless.
                "*" if idx == 0 => return None,
                "*" => continue,
                "" => return None,
                part if part
                    .bytes()
                    .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_') => {}
                _ => return None,
            }
        }

        Some(Self(pattern))
    }

    /// The pattern's raw text.
    pub fn as_str(&self) -> &'src str {
        self.0
    }

    fn compare_part(pattern: &str, part: &Expr<'_>) -> bool {
        if pattern == "*" {
            // A wildcard matches any part, including computed indices.
            !matches!(part, Expr::Call { .. })
        } else {
            match part {
                Expr::Star => false,
                _ => part_as_str(part).is_some_and(|part| pattern.eq_ignore_ascii_case(part)),
            }
        }
    }

    fn compare(&self, ctx: &Context<'_>) -> Option<Comparison> {
        let mut pattern_parts = self.0.split('.').peekable();
        let mut ctx_parts = ctx.parts.iter().peekable();

        while let (Some(pattern), Some(part)) = (pattern_parts.peek(), ctx_parts.peek()) {
            // A `*` part in the *context* (e.g. `commits.*.message`)
            // matches a `*` in the pattern but nothing else.
            if matches!(part.inner, Expr::Star) {
                if *pattern != "*" {
                    return None;
                }
            } else if !Self::compare_part(pattern, &part.inner) {
                return None;
            }

            pattern_parts.next();
            ctx_parts.next();
        }

        match (pattern_parts.next(), ctx_parts.next()) {
            (None, None) => Some(Comparison::Match),
            (None, Some(_)) => Some(Comparison::Child),
            (Some(_), None) => Some(Comparison::Contains),
            _ => None,
        }
    }

    /// Returns true if the given context is a child of the pattern.
    ///
    /// This is a loose parent-child relationship: `foo` is its own parent,
    /// as well as the parent of `foo.bar` and `foo.bar.baz`.
    pub fn parent_of(&self, ctx: &Context<'_>) -> bool {
        matches!(
            self.compare(ctx),
            Some(Comparison::Child | Comparison::Match)
        )
    }

    /// Returns true if the given context exactly matches the pattern.
    pub fn matches(&self, ctx: &Context<'_>) -> bool {
        matches!(self.compare(ctx), Some(Comparison::Match))
    }

    /// Returns true if the given context *contains* whatever this pattern
    /// names, i.e. the pattern is strictly deeper than the context and
    /// the overlapping parts match.
    ///
    /// For example, the pattern `github.event.issue.title` is contained
    /// by the context `github.event.issue`: expanding the whole object
    /// (e.g. via `toJSON`) transitively includes the patterned field.
    pub fn contained_by(&self, ctx: &Context<'_>) -> bool {
        matches!(self.compare(ctx), Some(Comparison::Contains))
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, ContextPattern};
    use crate::{Expr, SpannedExpr};

    fn context(raw: &str) -> SpannedExpr<'_> {
        let expr = SpannedExpr::parse(raw).unwrap();
        assert!(matches!(expr.inner, Expr::Context(_)), "not a context: {raw}");
        expr
    }

    fn as_context<'a, 'src>(expr: &'a SpannedExpr<'src>) -> &'a Context<'src> {
        match &expr.inner {
            Expr::Context(ctx) => ctx,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_context_child_of() {
        let expr = context("foo.bar.baz");
        let ctx = as_context(&expr);

        for (case, child) in &[
            // Trivial child cases.
            ("foo", true),
            ("foo.bar", true),
            // Case-insensitive cases.
            ("FOO", true),
            ("FOO.BAR", true),
            // We consider a context to be a child of itself.
            ("foo.bar.baz", true),
            // Trivial non-child cases.
            ("foo.bar.baz.qux", false),
            ("foo.bar.qux", false),
            ("qux", false),
            // Invalid patterns never match.
            ("foo.", false),
            (".", false),
            ("", false),
        ] {
            assert_eq!(ctx.child_of(case), *child, "for {case}");
        }
    }

    #[test]
    fn test_single_tail() {
        for (case, expected) in &[
            ("foo.bar", Some("bar")),
            ("foo['bar']", Some("bar")),
            ("inputs.test", Some("test")),
            ("foo.bar.baz", None),
            ("foo['bar']['baz']", None),
        ] {
            let expr = context(case);
            assert_eq!(as_context(&expr).single_tail(), *expected, "for {case}");
        }
    }

    #[test]
    fn test_contextpattern_try_new() {
        for (case, valid) in &[
            ("foo", true),
            ("foo.bar", true),
            ("foo.bar.baz_baz", true),
            ("foo.bar.baz-baz", true),
            ("foo.*", true),
            ("foo.*.baz", true),
            ("", false),
            ("*", false),
            ("*.foo", false),
            (".foo", false),
            ("foo.", false),
            ("foo..bar", false),
            ("foo.bar[0]", false),
            ("❤", false),
        ] {
            assert_eq!(
                ContextPattern::try_new(case).is_some(),
                *valid,
                "for {case}"
            );
        }
    }

    #[test]
    fn test_contextpattern_matches() {
        for (pattern, ctx, expected) in &[
            ("foo", "foo", true),
            ("foo.bar", "foo.bar", true),
            ("foo.*", "foo.bar", true),
            ("foo.*.baz", "foo.bar.baz", true),
            // Case-insensitive matches.
            ("foo.bar", "FOO.BAR", true),
            ("FOO.*", "foo.bar", true),
            // Indices also match correctly.
            ("foo.bar.baz.*", "foo.bar.baz[0]", true),
            ("foo.bar.baz.*", "foo.bar.baz['abc']", true),
            ("foo.bar.baz.abc", "foo['bar']['baz']['abc']", true),
            // Star parts in the context match star patterns only.
            ("foo.bar.*.name", "foo.bar.*.name", true),
            ("foo.bar.qux.name", "foo.bar.*.name", false),
            // False matches.
            ("foo", "bar", false),
            ("foo.bar", "foo.baz", false),
            ("foo.bar.baz", "foo.bar", false),
            ("foo.bar", "foo.bar.baz", false),
            ("foo.*.qux", "foo.bar.baz.qux", false),
        ] {
            let pattern = ContextPattern::try_new(pattern).unwrap();
            let expr = context(ctx);
            assert_eq!(pattern.matches(as_context(&expr)), *expected, "for {ctx}");
        }
    }

    #[test]
    fn test_contextpattern_contained_by() {
        for (pattern, ctx, expected) in &[
            // The pattern is deeper than the context: expanding the
            // context's object reaches the patterned field.
            ("github.event.issue.title", "github.event.issue", true),
            ("github.event.issue.title", "github.event", true),
            ("github.event.issue.title", "github", true),
            // Exact match is not containment.
            ("github.event.issue.title", "github.event.issue.title", false),
            // Diverging paths never contain.
            ("github.event.issue.title", "github.event.comment", false),
        ] {
            let pattern = ContextPattern::try_new(pattern).unwrap();
            let expr = context(ctx);
            assert_eq!(
                pattern.contained_by(as_context(&expr)),
                *expected,
                "for {pattern:?} / {ctx}"
            );
        }
    }
}
