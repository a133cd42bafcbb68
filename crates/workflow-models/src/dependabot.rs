//! Dependabot v2 configuration models.
//!
//! Only the subset needed to check update coverage is modeled; the
//! rest of the file is intentionally ignored.

use serde::Deserialize;

use crate::common::scalar_or_vector;

/// A `.github/dependabot.yml` configuration file.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Dependabot {
    /// The config schema version; always `2` in practice.
    pub version: u64,
    /// The configured update jobs.
    #[serde(default)]
    pub updates: Vec<Update>,
}

/// A single dependabot update job.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Update {
    /// The package ecosystem the job updates, e.g. `github-actions`.
    pub package_ecosystem: String,
    /// The directory (or directories) the job covers.
    #[serde(default, deserialize_with = "opt_scalar_or_vector")]
    pub directory: Option<Vec<String>>,
    #[serde(default)]
    pub directories: Option<Vec<String>>,
    /// The update schedule.
    pub schedule: Option<Schedule>,
}

/// An update job's schedule.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Schedule {
    pub interval: Option<String>,
}

impl Dependabot {
    /// Whether any update job covers the given ecosystem.
    pub fn covers_ecosystem(&self, ecosystem: &str) -> bool {
        self.updates
            .iter()
            .any(|u| u.package_ecosystem.eq_ignore_ascii_case(ecosystem))
    }
}

fn opt_scalar_or_vector<'de, D>(de: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    scalar_or_vector(de).map(Some)
}

#[cfg(test)]
mod tests {
    use super::Dependabot;

    #[test]
    fn test_dependabot_coverage() {
        let config: Dependabot = serde_yaml::from_str(
            r#"
version: 2
updates:
  - package-ecosystem: github-actions
    directory: /
    schedule:
      interval: weekly
  - package-ecosystem: cargo
    directory: /
    schedule:
      interval: daily
"#,
        )
        .unwrap();

        assert_eq!(config.version, 2);
        assert!(config.covers_ecosystem("github-actions"));
        assert!(config.covers_ecosystem("GitHub-Actions"));
        assert!(!config.covers_ecosystem("npm"));
    }
}
