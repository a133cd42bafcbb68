//! Effective-trigger analysis for job `if:` conditions.
//!
//! A job guarded by `if: github.event_name == 'push'` only runs for a
//! subset of the workflow's triggers. Rules that key off "does this job
//! run under a dangerous trigger" use this to suppress false positives.

use workflow_expressions::{BinOp, Expr, Literal, SpannedExpr, UnOp};
use workflow_models::common::If;

/// An abstract set of event names a condition admits.
#[derive(Clone, Debug, PartialEq)]
enum TriggerSet {
    /// The condition tells us nothing; any trigger may run the job.
    Any,
    /// The condition is statically false.
    None,
    /// Only these events run the job.
    Only(Vec<String>),
    /// Every event except these runs the job.
    Except(Vec<String>),
}

impl TriggerSet {
    fn intersect(self, other: TriggerSet) -> TriggerSet {
        use TriggerSet::*;

        match (self, other) {
            (None, _) | (_, None) => None,
            (Any, x) | (x, Any) => x,
            (Only(a), Only(b)) => Only(a.into_iter().filter(|e| b.contains(e)).collect()),
            (Only(a), Except(b)) | (Except(b), Only(a)) => {
                Only(a.into_iter().filter(|e| !b.contains(e)).collect())
            }
            (Except(a), Except(b)) => {
                let mut union = a;
                for e in b {
                    if !union.contains(&e) {
                        union.push(e);
                    }
                }
                Except(union)
            }
        }
    }

    fn union(self, other: TriggerSet) -> TriggerSet {
        use TriggerSet::*;

        match (self, other) {
            (Any, _) | (_, Any) => Any,
            (None, x) | (x, None) => x,
            (Only(mut a), Only(b)) => {
                for e in b {
                    if !a.contains(&e) {
                        a.push(e);
                    }
                }
                Only(a)
            }
            (Except(a), Only(b)) | (Only(b), Except(a)) => {
                Except(a.into_iter().filter(|e| !b.contains(e)).collect())
            }
            (Except(a), Except(b)) => Except(a.into_iter().filter(|e| b.contains(e)).collect()),
        }
    }

    fn complement(self) -> TriggerSet {
        use TriggerSet::*;

        match self {
            Only(a) => Except(a),
            Except(a) => Only(a),
            // `!<unknown>` is still unknown; `!<false>` could be
            // anything. Stay conservative either way.
            Any | None => Any,
        }
    }
}

/// Computes the subset of `triggers` under which a job guarded by
/// `condition` actually runs.
///
/// Unknown condition shapes degrade conservatively to "all triggers".
pub(crate) fn effective_triggers(
    triggers: &[&'static str],
    condition: Option<&If>,
) -> Vec<&'static str> {
    let set = match condition {
        Option::None => TriggerSet::Any,
        Some(If::Bool(true)) => TriggerSet::Any,
        Some(If::Bool(false)) => TriggerSet::None,
        Some(If::Expr(raw)) => {
            let bare = raw
                .trim()
                .trim_start_matches("${{")
                .trim_end_matches("}}")
                .trim();

            match SpannedExpr::parse(bare) {
                Ok(expr) => eval(&expr),
                Err(_) => TriggerSet::Any,
            }
        }
    };

    match set {
        TriggerSet::Any => triggers.to_vec(),
        TriggerSet::None => vec![],
        TriggerSet::Only(only) => triggers
            .iter()
            .copied()
            .filter(|t| only.iter().any(|o| o == t))
            .collect(),
        TriggerSet::Except(except) => triggers
            .iter()
            .copied()
            .filter(|t| !except.iter().any(|e| e == t))
            .collect(),
    }
}

fn eval(expr: &SpannedExpr<'_>) -> TriggerSet {
    match &expr.inner {
        Expr::BinOp { lhs, op, rhs } => match op {
            BinOp::And => eval(lhs).intersect(eval(rhs)),
            BinOp::Or => eval(lhs).union(eval(rhs)),
            BinOp::Eq => eval_comparison(lhs, rhs, false),
            BinOp::Neq => eval_comparison(lhs, rhs, true),
            _ => TriggerSet::Any,
        },
        Expr::UnOp {
            op: UnOp::Not,
            expr,
        } => eval(expr).complement(),
        Expr::Call { func, args } => {
            // `contains(fromJson('["a", "b"]'), github.event_name)`
            if func == "contains"
                && args.len() == 2
                && is_event_name(&args[1])
                && let Some(events) = json_string_list(&args[0])
            {
                return TriggerSet::Only(events);
            }

            TriggerSet::Any
        }
        _ => TriggerSet::Any,
    }
}

fn eval_comparison(lhs: &SpannedExpr<'_>, rhs: &SpannedExpr<'_>, negated: bool) -> TriggerSet {
    let event = match (&lhs.inner, &rhs.inner) {
        (_, Expr::Literal(Literal::String(lit))) if is_event_name(lhs) => Some(lit.clone()),
        (Expr::Literal(Literal::String(lit)), _) if is_event_name(rhs) => Some(lit.clone()),
        _ => None,
    };

    match event {
        Some(event) if negated => TriggerSet::Except(vec![event]),
        Some(event) => TriggerSet::Only(vec![event]),
        Option::None => TriggerSet::Any,
    }
}

fn is_event_name(expr: &SpannedExpr<'_>) -> bool {
    matches!(&expr.inner, Expr::Context(ctx) if ctx.matches("github.event_name"))
}

/// Extracts a JSON string array from a `fromJson('[...]')` argument.
fn json_string_list(expr: &SpannedExpr<'_>) -> Option<Vec<String>> {
    let Expr::Call { func, args } = &expr.inner else {
        return None;
    };

    if func != "fromJSON" || args.len() != 1 {
        return None;
    }

    let Expr::Literal(Literal::String(raw)) = &args[0].inner else {
        return None;
    };

    serde_json::from_str::<Vec<String>>(raw).ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use workflow_models::common::If;

    use super::effective_triggers;

    const TRIGGERS: &[&str] = &["push", "pull_request_target", "issue_comment"];

    fn expr(raw: &str) -> Option<If> {
        Some(If::Expr(raw.into()))
    }

    #[test]
    fn test_no_condition() {
        assert_eq!(effective_triggers(TRIGGERS, None), TRIGGERS);
    }

    #[test]
    fn test_equality() {
        assert_eq!(
            effective_triggers(TRIGGERS, expr("github.event_name == 'push'").as_ref()),
            vec!["push"]
        );

        // Reversed operands work too.
        assert_eq!(
            effective_triggers(TRIGGERS, expr("'push' == github.event_name").as_ref()),
            vec!["push"]
        );

        assert_eq!(
            effective_triggers(TRIGGERS, expr("github.event_name != 'push'").as_ref()),
            vec!["pull_request_target", "issue_comment"]
        );
    }

    #[test]
    fn test_curly_condition() {
        assert_eq!(
            effective_triggers(
                TRIGGERS,
                expr("${{ github.event_name == 'issue_comment' }}").as_ref()
            ),
            vec!["issue_comment"]
        );
    }

    #[test]
    fn test_contains_fromjson() {
        assert_eq!(
            effective_triggers(
                TRIGGERS,
                expr(r#"contains(fromJson('["push", "issue_comment"]'), github.event_name)"#)
                    .as_ref()
            ),
            vec!["push", "issue_comment"]
        );
    }

    #[test]
    fn test_boolean_combinations() {
        assert_eq!(
            effective_triggers(
                TRIGGERS,
                expr("github.event_name == 'push' || github.event_name == 'issue_comment'")
                    .as_ref()
            ),
            vec!["push", "issue_comment"]
        );

        // A conjunction with an unrelated condition keeps the
        // event-name restriction.
        assert_eq!(
            effective_triggers(
                TRIGGERS,
                expr("github.event_name == 'push' && github.actor == 'octocat'").as_ref()
            ),
            vec!["push"]
        );

        assert_eq!(
            effective_triggers(
                TRIGGERS,
                expr("!(github.event_name == 'pull_request_target')").as_ref()
            ),
            vec!["push", "issue_comment"]
        );
    }

    #[test]
    fn test_unknown_conditions_conservative() {
        assert_eq!(
            effective_triggers(TRIGGERS, expr("github.actor == 'octocat'").as_ref()),
            TRIGGERS
        );

        assert_eq!(
            effective_triggers(TRIGGERS, expr("not even an expression ===").as_ref()),
            TRIGGERS
        );
    }

    #[test]
    fn test_static_booleans() {
        assert_eq!(effective_triggers(TRIGGERS, Some(&If::Bool(true))), TRIGGERS);
        assert!(effective_triggers(TRIGGERS, Some(&If::Bool(false))).is_empty());
    }
}
