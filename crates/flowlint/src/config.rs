//! Run configuration (`flowlint.yml`).

use anyhow::Context as _;
use camino::Utf8Path;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::finding::Severity;

/// The analyzer's configuration file.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Config {
    /// Per-rule configuration, keyed by rule ID.
    #[serde(default)]
    rules: IndexMap<String, RuleConfig>,

    /// Additional endpoints the secret-exfiltration rule treats as
    /// legitimate. Extends (never shrinks) the built-in allowlist.
    #[serde(default)]
    pub(crate) extra_allowed_endpoints: Vec<String>,
}

/// Per-rule overrides.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct RuleConfig {
    /// Whether the rule is enabled. Defaults to true.
    pub(crate) enabled: Option<bool>,
    /// A severity override for the rule's findings.
    pub(crate) severity: Option<Severity>,
}

impl Config {
    pub(crate) fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read config at {path}"))?;
        serde_yaml::from_str(&contents).with_context(|| format!("malformed config at {path}"))
    }

    /// Looks up the configuration for the given rule ID. Tiered rule
    /// IDs (e.g. `code-injection-critical`) fall back to their base
    /// rule's entry.
    fn rule(&self, ident: &str) -> Option<&RuleConfig> {
        if let Some(config) = self.rules.get(ident) {
            return Some(config);
        }

        self.rules
            .iter()
            .find(|(key, _)| ident.starts_with(key.as_str()))
            .map(|(_, config)| config)
    }

    /// Whether findings from the given rule are enabled.
    pub(crate) fn rule_enabled(&self, ident: &str) -> bool {
        self.rule(ident)
            .and_then(|r| r.enabled)
            .unwrap_or(true)
    }

    /// The configured severity override for the given rule, if any.
    pub(crate) fn severity_override(&self, ident: &str) -> Option<Severity> {
        self.rule(ident).and_then(|r| r.severity)
    }
}
