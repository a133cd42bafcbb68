//! Models and APIs for handling findings and their locations.

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use self::location::{Location, SymbolicLocation};
use crate::models::AsDocument;
use crate::registry::input::InputKey;

pub(crate) mod location;

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialOrd,
    PartialEq,
    Serialize,
    Deserialize,
    ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Confidence {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialOrd,
    PartialEq,
    Serialize,
    Deserialize,
    ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Severity {
    #[default]
    Unknown,
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

/// A finding's "determination," i.e. its various classifications.
#[derive(Serialize)]
pub(crate) struct Determinations {
    pub(crate) confidence: Confidence,
    pub(crate) severity: Severity,
}

/// Represents a suggested fix for a finding.
pub(crate) struct Fix<'doc> {
    /// A short title describing the fix.
    pub(crate) title: String,
    /// The key back into the input registry that this fix applies to.
    pub(crate) key: &'doc InputKey,
    /// The patch operations making up the fix.
    pub(crate) patches: Vec<yamlpatch::Patch<'doc>>,
}

impl Fix<'_> {
    /// Apply the fix to the given document, producing a new document.
    pub(crate) fn apply(&self, document: &yamlpath::Document) -> Result<yamlpath::Document> {
        yamlpatch::apply_yaml_patches(document, &self.patches)
            .map_err(|e| anyhow!("patch failed: {e}"))
    }
}

#[derive(Serialize)]
pub(crate) struct Finding<'doc> {
    /// The finding's rule ID, e.g. `code-injection-critical`.
    pub(crate) ident: &'static str,
    /// A short human description of the rule.
    pub(crate) desc: &'static str,
    /// The rule's category path, e.g. `injection/code`.
    pub(crate) category: &'static str,
    pub(crate) determinations: Determinations,
    pub(crate) locations: Vec<Location<'doc>>,
    /// The untrusted context paths implicated in this finding, quoted
    /// in messages and surfaced in machine-readable output.
    pub(crate) untrusted_paths: Vec<String>,
    pub(crate) ignored: bool,
    #[serde(skip_serializing)]
    pub(crate) fixes: Vec<Fix<'doc>>,
}

impl Finding<'_> {
    pub(crate) fn visible_locations(&self) -> impl Iterator<Item = &Location<'_>> {
        self.locations.iter().filter(|l| !l.symbolic.is_hidden())
    }

    pub(crate) fn primary_location(&self) -> &Location<'_> {
        // NOTE: Safe because FindingBuilder::build enforces a primary
        // location.
        self.locations
            .iter()
            .find(|l| l.symbolic.is_primary())
            .expect("API misuse: finding without a primary location")
    }
}

pub(crate) struct FindingBuilder<'doc> {
    ident: &'static str,
    desc: &'static str,
    category: &'static str,
    severity: Severity,
    confidence: Confidence,
    locations: Vec<SymbolicLocation<'doc>>,
    untrusted_paths: Vec<String>,
    fixes: Vec<Fix<'doc>>,
}

impl<'doc> FindingBuilder<'doc> {
    pub(crate) fn new(ident: &'static str, desc: &'static str, category: &'static str) -> Self {
        Self {
            ident,
            desc,
            category,
            severity: Default::default(),
            confidence: Default::default(),
            locations: vec![],
            untrusted_paths: vec![],
            fixes: vec![],
        }
    }

    /// Override the finding's rule ID, e.g. to select a severity-tiered
    /// variant of the parent rule.
    pub(crate) fn ident(mut self, ident: &'static str) -> Self {
        self.ident = ident;
        self
    }

    pub(crate) fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub(crate) fn confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub(crate) fn add_location(mut self, location: SymbolicLocation<'doc>) -> Self {
        self.locations.push(location);
        self
    }

    pub(crate) fn untrusted_path(mut self, path: impl Into<String>) -> Self {
        self.untrusted_paths.push(path.into());
        self
    }

    pub(crate) fn fix(mut self, fix: Fix<'doc>) -> Self {
        self.fixes.push(fix);
        self
    }

    pub(crate) fn build<'a>(
        self,
        document: &'a impl AsDocument<'a, 'doc>,
    ) -> Result<Finding<'doc>> {
        let locations = self
            .locations
            .iter()
            .map(|l| l.clone().concretize(document.as_document()))
            .collect::<Result<Vec<_>>>()?;

        if !locations.iter().any(|l| l.symbolic.is_primary()) {
            return Err(anyhow!(
                "API misuse: at least one location must be marked with primary()"
            ));
        }

        let should_ignore = Self::ignored_from_inlined_comment(&locations, self.ident);

        Ok(Finding {
            ident: self.ident,
            desc: self.desc,
            category: self.category,
            determinations: Determinations {
                confidence: self.confidence,
                severity: self.severity,
            },
            locations,
            untrusted_paths: self.untrusted_paths,
            ignored: should_ignore,
            fixes: self.fixes,
        })
    }

    fn ignored_from_inlined_comment(locations: &[Location], id: &str) -> bool {
        locations
            .iter()
            .flat_map(|l| &l.concrete.comments)
            .any(|c| c.ignores(id))
    }
}
