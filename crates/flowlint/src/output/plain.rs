//! "plain" (i.e. cargo-style) output.

use std::collections::{HashMap, hash_map::Entry};

use annotate_snippets::{Annotation, AnnotationKind, Group, Level, Renderer, Snippet};
use anstream::{print, println};
use owo_colors::OwoColorize;

use crate::finding::location::{Location, LocationKind};
use crate::finding::{Finding, Severity};
use crate::models::AsDocument as _;
use crate::registry::FindingRegistry;
use crate::registry::input::{InputKey, InputRegistry};

impl From<LocationKind> for AnnotationKind {
    fn from(kind: LocationKind) -> Self {
        match kind {
            LocationKind::Primary => AnnotationKind::Primary,
            LocationKind::Related => AnnotationKind::Context,
            // Unreachable because hidden locations are filtered out
            // earlier.
            LocationKind::Hidden => unreachable!(),
        }
    }
}

impl From<&Severity> for Level<'_> {
    fn from(sev: &Severity) -> Self {
        match sev {
            Severity::Unknown => Level::NOTE,
            Severity::Informational => Level::INFO,
            Severity::Low => Level::HELP,
            Severity::Medium => Level::WARNING,
            Severity::High | Severity::Critical => Level::ERROR,
        }
    }
}

fn finding_snippets<'doc>(
    registry: &'doc InputRegistry,
    finding: &'doc Finding<'doc>,
) -> Vec<Snippet<'doc, Annotation<'doc>>> {
    // A finding's locations are grouped by their enclosing input, so
    // that each snippet renders against the right source.
    let mut locations_by_input: HashMap<&InputKey, Vec<&Location<'doc>>> = HashMap::new();
    for location in finding.visible_locations() {
        match locations_by_input.entry(location.symbolic.key) {
            Entry::Occupied(mut e) => {
                e.get_mut().push(location);
            }
            Entry::Vacant(e) => {
                e.insert(vec![location]);
            }
        }
    }

    let mut snippets = vec![];
    for (input_key, locations) in locations_by_input {
        let input = registry.get_input(input_key);

        snippets.push(
            Snippet::source(input.as_document().source())
                .fold(true)
                .line_start(1)
                .path(input_key.presentation_path())
                .annotations(locations.iter().map(|loc| {
                    AnnotationKind::from(loc.symbolic.kind)
                        .span(
                            loc.concrete.location.offset_span.start
                                ..loc.concrete.location.offset_span.end,
                        )
                        .label(&loc.symbolic.annotation)
                })),
        );
    }

    snippets
}

pub(crate) fn render_findings(registry: &InputRegistry, findings: &FindingRegistry) {
    for finding in findings.findings() {
        render_finding(registry, finding);
        println!();
    }

    let mut qualifiers = vec![];

    if !findings.ignored().is_empty() {
        qualifiers.push(format!(
            "{nignored} ignored",
            nignored = findings.ignored().len().bright_yellow()
        ));
    }

    let nfixable = findings.fixable_findings().count();
    if nfixable > 0 {
        qualifiers.push(format!(
            "{nfixable} fixable",
            nfixable = nfixable.bright_green()
        ));
    }

    if findings.findings().is_empty() {
        if qualifiers.is_empty() {
            println!("{}", "No findings to report. Good job!".green());
        } else {
            println!(
                "{no_findings} ({qualifiers})",
                no_findings = "No findings to report. Good job!".green(),
                qualifiers = qualifiers.join(", ").bold(),
            );
        }
    } else {
        let mut by_severity = HashMap::new();
        for finding in findings.findings() {
            *by_severity
                .entry(&finding.determinations.severity)
                .or_insert(0usize) += 1;
        }

        if qualifiers.is_empty() {
            let nfindings = findings.count();
            print!(
                "{nfindings} finding{s}: ",
                nfindings = nfindings.green(),
                s = if nfindings == 1 { "" } else { "s" },
            );
        } else {
            print!(
                "{nfindings} findings ({qualifiers}): ",
                nfindings = findings.count().green(),
                qualifiers = qualifiers.join(", ").bold(),
            );
        }

        println!(
            "{nlow} low, {nmedium} medium, {nhigh} high, {ncritical} critical",
            nlow = by_severity.get(&Severity::Low).unwrap_or(&0).cyan(),
            nmedium = by_severity.get(&Severity::Medium).unwrap_or(&0).yellow(),
            nhigh = by_severity.get(&Severity::High).unwrap_or(&0).red(),
            ncritical = by_severity
                .get(&Severity::Critical)
                .unwrap_or(&0)
                .bright_red(),
        );
    }
}

fn render_finding(registry: &InputRegistry, finding: &Finding) {
    let title = Level::from(&finding.determinations.severity)
        .primary_title(finding.desc)
        .id(finding.ident);

    let confidence = format!(
        "audit confidence → {:?}",
        &finding.determinations.confidence
    );

    let mut group = Group::with_title(title)
        .elements(finding_snippets(registry, finding))
        .element(Level::NOTE.message(confidence));

    if !finding.fixes.is_empty() {
        group = group.element(Level::NOTE.message("this finding has an auto-fix"));
    }

    let renderer = Renderer::styled();
    println!("{}", renderer.render(&[group]));
}
