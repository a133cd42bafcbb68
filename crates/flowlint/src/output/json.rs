//! Machine-readable JSON output.

use serde_json::json;

use crate::registry::FindingRegistry;

/// Serializes findings as a JSON array of
/// `{file, line, column, rule, severity, message, ...}` records.
///
/// Lines and columns are 1-based.
pub(crate) fn render_findings(findings: &FindingRegistry) -> serde_json::Value {
    let records: Vec<serde_json::Value> = findings
        .findings()
        .iter()
        .map(|finding| {
            let primary = finding.primary_location();
            json!({
                "file": primary.symbolic.key.relative_path(),
                "line": primary.concrete.location.start_point.row + 1,
                "column": primary.concrete.location.start_point.column + 1,
                "rule": finding.ident,
                "category": finding.category,
                "severity": finding.determinations.severity,
                "confidence": finding.determinations.confidence,
                "message": primary.symbolic.annotation,
                "untrusted_paths": finding.untrusted_paths,
                "fixable": !finding.fixes.is_empty(),
            })
        })
        .collect();

    serde_json::Value::Array(records)
}
