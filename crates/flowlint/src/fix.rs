//! Applies accepted fixes to their input files.

use std::collections::HashMap;

use anstream::{eprintln, println};
use anyhow::Result;
use owo_colors::OwoColorize;

use crate::finding::{Finding, Fix};
use crate::models::AsDocument as _;
use crate::registry::FindingRegistry;
use crate::registry::input::{InputKey, InputRegistry};

/// Applies every fix attached to the current findings, one file at a
/// time.
///
/// Each fix is validated against the file's *original* content first;
/// validated fixes are then applied sequentially. A fix that stops
/// applying after earlier rewrites has conflicted with them: it is
/// skipped with a warning, and its finding is not retracted.
pub(crate) fn apply_fixes(results: &FindingRegistry, registry: &InputRegistry) -> Result<()> {
    let mut fixes_by_input: HashMap<&InputKey, Vec<(&Fix, &Finding)>> = HashMap::new();
    for finding in results.findings() {
        for fix in &finding.fixes {
            fixes_by_input
                .entry(fix.key)
                .or_default()
                .push((fix, finding));
        }
    }

    if fixes_by_input.is_empty() {
        println!("No fixes available to apply.");
        return Ok(());
    }

    let mut applied = vec![];
    let mut failed = vec![];

    // Deterministic file order.
    let mut inputs: Vec<_> = fixes_by_input.into_iter().collect();
    inputs.sort_by_key(|(key, _)| (*key).clone());

    for (key, fixes) in inputs {
        let input = registry.get_input(key);
        let original = input.as_document();

        // First pass: which fixes apply cleanly to the pristine
        // document?
        let mut validated = vec![];
        for (fix, finding) in fixes {
            match fix.apply(original) {
                Ok(_) => validated.push((fix, finding)),
                Err(e) => failed.push((finding.ident, key, e.to_string())),
            }
        }

        // Second pass: apply sequentially, skipping conflicts.
        let mut current: Option<yamlpath::Document> = None;
        let mut file_applied = 0usize;
        for (fix, finding) in validated {
            let base = current.as_ref().unwrap_or(original);
            match fix.apply(base) {
                Ok(next) => {
                    current = Some(next);
                    file_applied += 1;
                    println!(
                        "  {ident}: {title}",
                        ident = finding.ident.yellow(),
                        title = fix.title
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "skipping conflicting fix for {ident} in {key}: {e}",
                        ident = finding.ident
                    );
                    failed.push((
                        finding.ident,
                        key,
                        format!("conflict after applying earlier fixes: {e}"),
                    ));
                }
            }
        }

        if let Some(document) = current {
            match std::fs::write(key.given_path.as_std_path(), document.source()) {
                Ok(()) => applied.push((key, file_applied)),
                Err(e) => eprintln!("failed to write {key}: {e}"),
            }
        }
    }

    if !applied.is_empty() || !failed.is_empty() {
        println!("\n{}", "Fix summary".green().bold());

        for (key, count) in &applied {
            println!(
                "  {path}: {count} fix{es} applied",
                path = key.presentation_path(),
                es = if *count == 1 { "" } else { "es" }
            );
        }

        for (ident, key, error) in &failed {
            println!(
                "  {ident}: skipped in {path} ({error})",
                path = key.presentation_path()
            );
        }
    }

    Ok(())
}
