//! A trust model for expression contexts.
//!
//! Each context an expression expands is classified by *capability*:
//! how much control an external actor has over its expansion. The
//! always-untrusted set is a closed list of context patterns whose
//! values are writable by anyone who can open a PR, issue, comment,
//! or discussion against the repository.

use std::sync::LazyLock;

use crate::context::{Context, ContextPattern};
use crate::{BinOp, Expr, SpannedExpr};

/// How much control an external actor has over a context's expansion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    /// The expansion is fully attacker-controllable.
    Arbitrary,
    /// The expansion has attacker-controllable structure, but is
    /// constrained to a restricted character set or shape.
    Structured,
    /// The expansion is fixed by the platform or repository and carries
    /// no meaningful injectable structure.
    Fixed,
}

/// Contexts whose expansions are writable by external actors.
static UNTRUSTED_CONTEXTS: LazyLock<Vec<ContextPattern<'static>>> = LazyLock::new(|| {
    [
        "github.event.issue.title",
        "github.event.issue.body",
        "github.event.pull_request.title",
        "github.event.pull_request.body",
        "github.event.pull_request.head.ref",
        "github.event.pull_request.head.label",
        "github.event.pull_request.head.repo.name",
        "github.event.pull_request.head.repo.description",
        "github.event.pull_request.head.repo.homepage",
        "github.event.comment.body",
        "github.event.review.body",
        "github.event.review_comment.body",
        "github.event.pages.*.page_name",
        "github.event.commits.*.message",
        "github.event.commits.*.author.email",
        "github.event.commits.*.author.name",
        "github.event.head_commit.message",
        "github.event.head_commit.author.*",
        "github.head_ref",
        "github.event.discussion.title",
        "github.event.discussion.body",
        "github.event.workflow_run.head_branch",
        "github.event.workflow_run.pull_requests.*.head.ref",
    ]
    .into_iter()
    .map(ContextPattern::new)
    .collect()
});

/// Contexts that are fixed by the platform or by repository maintainers.
///
/// This includes content-addressed values (`*.sha`) nested inside
/// otherwise-untrusted objects: a commit hash is attacker-*chosen* but
/// cannot carry shell or code structure.
static FIXED_CONTEXTS: LazyLock<Vec<ContextPattern<'static>>> = LazyLock::new(|| {
    [
        "github.sha",
        "github.run_id",
        "github.run_number",
        "github.run_attempt",
        "github.repository",
        "github.repository_id",
        "github.repository_owner",
        "github.repository_owner_id",
        "github.actor_id",
        "github.event_name",
        "github.job",
        "github.workflow",
        "github.workspace",
        "github.action",
        "github.action_path",
        "github.server_url",
        "github.api_url",
        "github.graphql_url",
        "github.ref_protected",
        "github.ref_type",
        "github.event.number",
        "github.event.before",
        "github.event.after",
        "github.event.pull_request.number",
        "github.event.pull_request.head.sha",
        "github.event.pull_request.base.sha",
        "github.event.commits.*.sha",
        "github.event.commits.*.id",
        "github.event.head_commit.id",
        "github.event.workflow_run.id",
        "github.event.workflow_run.head_sha",
        "runner.os",
        "runner.arch",
        "runner.name",
        "runner.environment",
        "runner.temp",
        "runner.tool_cache",
        "runner.debug",
    ]
    .into_iter()
    .map(ContextPattern::new)
    .collect()
});

/// Contexts with attacker-influenced but charset-restricted expansions.
static STRUCTURED_CONTEXTS: LazyLock<Vec<ContextPattern<'static>>> = LazyLock::new(|| {
    [
        "github.actor",
        "github.triggering_actor",
        "github.ref",
        "github.ref_name",
        "github.base_ref",
        "github.event.pull_request.head.repo.full_name",
        "github.event.pull_request.user.login",
        "github.event.sender.login",
    ]
    .into_iter()
    .map(ContextPattern::new)
    .collect()
});

/// Classifies a context by capability.
///
/// Returns `None` when the context is outside the model, i.e. nothing
/// is statically known about its expansion.
pub fn capability_of(ctx: &Context<'_>) -> Option<Capability> {
    // Fixed wins over untrusted: content-addressed tails like
    // `github.event.commits.*.sha` live under otherwise-untrusted objects.
    if FIXED_CONTEXTS.iter().any(|p| p.parent_of(ctx)) {
        return Some(Capability::Fixed);
    }

    if UNTRUSTED_CONTEXTS.iter().any(|p| p.parent_of(ctx)) {
        return Some(Capability::Arbitrary);
    }

    if STRUCTURED_CONTEXTS.iter().any(|p| p.parent_of(ctx)) {
        return Some(Capability::Structured);
    }

    None
}

/// An untrusted context discovered inside an expression.
#[derive(Debug)]
pub struct UntrustedRef<'a, 'src> {
    /// The offending context.
    pub context: &'a Context<'src>,
    /// The untrusted pattern it matched.
    pub pattern: &'static str,
    /// Whether the match is transitive: the context names an object
    /// that *contains* the untrusted field (e.g. `toJSON(github.event.issue)`
    /// contains `github.event.issue.title`).
    pub transitive: bool,
}

/// Finds every potentially untrusted context whose value flows into the
/// expression's evaluation.
///
/// Boolean positions do not flow (`x == 'y'` expands to a boolean), the
/// RHS of `&&` and both sides of `||` do, and `toJSON`/`format`/`join`
/// propagate their arguments outward. `toJSON` additionally performs a
/// transitive check, since it expands entire objects.
pub fn untrusted_contexts<'a, 'src>(expr: &'a SpannedExpr<'src>) -> Vec<UntrustedRef<'a, 'src>> {
    let mut refs = vec![];
    collect_untrusted(expr, false, &mut refs);
    refs
}

fn collect_untrusted<'a, 'src>(
    expr: &'a SpannedExpr<'src>,
    expanded: bool,
    refs: &mut Vec<UntrustedRef<'a, 'src>>,
) {
    match &expr.inner {
        Expr::Context(ctx) => {
            if let Some(pattern) = UNTRUSTED_CONTEXTS
                .iter()
                .find(|p| p.parent_of(ctx))
                .map(|p| p.as_str())
            {
                // Fixed tails (e.g. `commits.*.sha`) are trusted even when
                // nested under an untrusted object.
                if !FIXED_CONTEXTS.iter().any(|p| p.parent_of(ctx)) {
                    refs.push(UntrustedRef {
                        context: ctx,
                        pattern,
                        transitive: false,
                    });
                }
            } else if expanded {
                // Inside a whole-object expansion: the context taints the
                // evaluation if any untrusted field lives underneath it.
                if let Some(pattern) = UNTRUSTED_CONTEXTS
                    .iter()
                    .find(|p| p.contained_by(ctx))
                    .map(|p| p.as_str())
                {
                    refs.push(UntrustedRef {
                        context: ctx,
                        pattern,
                        transitive: true,
                    });
                }
            }
        }
        Expr::Call { func, args } => {
            // `toJSON` expands whole objects, so its arguments get the
            // transitive containment check. Any other call evaluates
            // its arguments, which propagates their taint outward.
            let expanded = expanded || func == "toJSON";
            for arg in args {
                collect_untrusted(arg, expanded, refs);
            }
        }
        Expr::BinOp { lhs, op, rhs } => match op {
            BinOp::And => collect_untrusted(rhs, expanded, refs),
            BinOp::Or => {
                collect_untrusted(lhs, expanded, refs);
                collect_untrusted(rhs, expanded, refs);
            }
            _ => (),
        },
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, capability_of, untrusted_contexts};
    use crate::{Expr, SpannedExpr};

    fn capability(raw: &str) -> Option<Capability> {
        let expr = SpannedExpr::parse(raw).unwrap();
        let Expr::Context(ctx) = &expr.inner else {
            panic!("not a context: {raw}");
        };
        capability_of(ctx)
    }

    #[test]
    fn test_capability_of() {
        for (case, expected) in &[
            ("github.event.issue.title", Some(Capability::Arbitrary)),
            ("github.event.pull_request.body", Some(Capability::Arbitrary)),
            ("github.head_ref", Some(Capability::Arbitrary)),
            ("github.event.commits[0].message", Some(Capability::Arbitrary)),
            ("github.event.pages.*.page_name", Some(Capability::Arbitrary)),
            // Content-addressed tails are fixed, even under untrusted
            // parents.
            ("github.event.commits.*.sha", Some(Capability::Fixed)),
            ("github.event.pull_request.head.sha", Some(Capability::Fixed)),
            ("github.sha", Some(Capability::Fixed)),
            ("runner.os", Some(Capability::Fixed)),
            // Charset-restricted contexts.
            ("github.actor", Some(Capability::Structured)),
            ("github.ref_name", Some(Capability::Structured)),
            // Unknown contexts.
            ("github.event.whatever", None),
            ("steps.foo.outputs.bar", None),
            ("env.FOO", None),
        ] {
            assert_eq!(capability(case), *expected, "for {case}");
        }
    }

    #[test]
    fn test_untrusted_contexts_direct() {
        let expr = SpannedExpr::parse("github.event.pull_request.title").unwrap();
        let refs = untrusted_contexts(&expr);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].pattern, "github.event.pull_request.title");
        assert!(!refs[0].transitive);
    }

    #[test]
    fn test_untrusted_contexts_boolean_position() {
        // Equality comparisons expand to booleans; nothing flows.
        let expr = SpannedExpr::parse("github.event.issue.title == 'x'").unwrap();
        assert!(untrusted_contexts(&expr).is_empty());

        // ...but the RHS of && does flow.
        let expr =
            SpannedExpr::parse("github.event_name == 'push' && github.event.issue.title").unwrap();
        let refs = untrusted_contexts(&expr);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].pattern, "github.event.issue.title");
    }

    #[test]
    fn test_untrusted_contexts_call_propagation() {
        let expr = SpannedExpr::parse("format('{0}', github.event.comment.body)").unwrap();
        assert_eq!(untrusted_contexts(&expr).len(), 1);

        // join over trusted tails is fine.
        let expr = SpannedExpr::parse("join(github.event.commits.*.sha, ', ')").unwrap();
        assert!(untrusted_contexts(&expr).is_empty());

        // ...but join over commit messages is not.
        let expr = SpannedExpr::parse("join(github.event.commits.*.message, ', ')").unwrap();
        assert_eq!(untrusted_contexts(&expr).len(), 1);
    }

    #[test]
    fn test_untrusted_contexts_tojson_transitive() {
        let expr = SpannedExpr::parse("toJSON(github.event.issue)").unwrap();
        let refs = untrusted_contexts(&expr);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].transitive);
        assert_eq!(refs[0].context.as_str(), "github.event.issue");

        // Outside of a whole-object expansion, a bare object context
        // expands to nothing useful and is not flagged.
        let expr = SpannedExpr::parse("github.event.issue").unwrap();
        assert!(untrusted_contexts(&expr).is_empty());
    }
}
