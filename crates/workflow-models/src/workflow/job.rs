//! Workflow job and step models.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::common::{
    Env, If, Permissions, Uses, bool_is_string, expr::LoE, reusable_uses, scalar_or_vector,
    step_uses,
};
use crate::workflow::Defaults;

/// A single workflow job: either a "normal" job with steps, or a call
/// to a reusable workflow. The two are mutually exclusive; the untagged
/// representation enforces this structurally.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum Job {
    /// A reusable workflow call job.
    ReusableWorkflowCallJob(ReusableWorkflowCallJob),
    /// An ordinary job with steps.
    NormalJob(NormalJob),
}

/// An ordinary job: a runner, steps, and their shared configuration.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct NormalJob {
    pub name: Option<String>,
    #[serde(rename = "if")]
    pub r#if: Option<If>,
    pub runs_on: LoE<RunsOn>,
    pub permissions: Option<Permissions>,
    pub environment: Option<Environment>,
    pub env: Option<LoE<Env>>,
    pub defaults: Option<Defaults>,
    #[serde(default, deserialize_with = "crate::workflow::job::opt_scalar_or_vector")]
    pub needs: Option<Vec<String>>,
    pub concurrency: Option<serde_yaml::Value>,
    pub strategy: Option<Strategy>,
    pub container: Option<serde_yaml::Value>,
    pub services: Option<serde_yaml::Value>,
    pub outputs: Option<IndexMap<String, String>>,
    pub timeout_minutes: Option<LoE<f64>>,
    pub continue_on_error: Option<LoE<bool>>,
    pub steps: Vec<Step>,
}

/// A reusable workflow call job.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ReusableWorkflowCallJob {
    pub name: Option<String>,
    #[serde(rename = "if")]
    pub r#if: Option<If>,
    #[serde(deserialize_with = "reusable_uses")]
    pub uses: Uses,
    pub permissions: Option<Permissions>,
    pub with: Option<Env>,
    pub secrets: Option<Secrets>,
    #[serde(default, deserialize_with = "crate::workflow::job::opt_scalar_or_vector")]
    pub needs: Option<Vec<String>>,
}

/// The `secrets:` clause of a reusable workflow call.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase", untagged)]
pub enum Secrets {
    /// `secrets: inherit`: every secret of the caller flows to the callee.
    Inherit(InheritMarker),
    /// An explicit mapping of secrets.
    Explicit(Env),
}

/// The literal `inherit` keyword.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum InheritMarker {
    Inherit,
}

impl Secrets {
    /// Whether this is `secrets: inherit`.
    pub fn is_inherit(&self) -> bool {
        matches!(self, Secrets::Inherit(_))
    }
}

/// A job's `runs-on:` clause.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum RunsOn {
    /// A runner group.
    Group {
        group: Option<String>,
        #[serde(default, deserialize_with = "scalar_or_vector")]
        labels: Vec<String>,
    },
    /// One or more runner labels.
    Target(#[serde(deserialize_with = "scalar_or_vector")] Vec<String>),
}

impl RunsOn {
    /// The runner labels, regardless of form.
    pub fn labels(&self) -> &[String] {
        match self {
            RunsOn::Group { labels, .. } => labels,
            RunsOn::Target(labels) => labels,
        }
    }
}

/// A job's `environment:` clause.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum Environment {
    /// A bare environment name.
    Name(String),
    /// An environment with a name and URL.
    Full {
        name: Option<String>,
        url: Option<String>,
    },
}

/// A job's `strategy:` clause.
///
/// The matrix itself is kept opaque; the analyzer treats matrix
/// expansions conservatively.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Strategy {
    pub matrix: Option<LoE<serde_yaml::Value>>,
    pub fail_fast: Option<LoE<bool>>,
    pub max_parallel: Option<LoE<f64>>,
}

/// A single step within a normal job.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// The step's ID, for later `steps.<id>.outputs.*` references.
    pub id: Option<String>,
    /// The step's display name.
    pub name: Option<String>,
    #[serde(rename = "if")]
    pub r#if: Option<If>,
    /// Step-level environment.
    pub env: Option<LoE<Env>>,
    pub continue_on_error: Option<LoE<bool>>,
    pub timeout_minutes: Option<LoE<f64>>,
    /// The step's body: a script or an action reference.
    #[serde(flatten)]
    pub body: StepBody,
}

/// The body of a step: `run:` and `uses:` are mutually exclusive.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case", untagged)]
pub enum StepBody {
    /// An action invocation.
    Uses {
        #[serde(deserialize_with = "step_uses")]
        uses: Uses,
        /// The action's inputs.
        #[serde(default)]
        with: Env,
    },
    /// An inline script.
    Run {
        /// The script body.
        #[serde(deserialize_with = "bool_is_string")]
        run: String,
        /// An explicit shell, if any.
        shell: Option<String>,
        #[serde(rename = "working-directory")]
        working_directory: Option<String>,
    },
}

pub(crate) fn opt_scalar_or_vector<'de, D>(de: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    scalar_or_vector(de).map(Some)
}

#[cfg(test)]
mod tests {
    use super::{Job, RunsOn, Secrets, StepBody};
    use crate::common::expr::LoE;

    #[test]
    fn test_normal_job() {
        let job: Job = serde_yaml::from_str(
            r#"
runs-on: ubuntu-latest
steps:
  - id: build
    run: make
  - uses: actions/checkout@v4
    with:
      ref: main
"#,
        )
        .unwrap();

        let Job::NormalJob(job) = job else {
            panic!("expected a normal job");
        };

        let LoE::Literal(RunsOn::Target(labels)) = &job.runs_on else {
            panic!("expected literal runner labels");
        };
        assert_eq!(labels, &["ubuntu-latest".to_string()]);

        assert_eq!(job.steps.len(), 2);
        assert_eq!(job.steps[0].id.as_deref(), Some("build"));
        assert!(matches!(job.steps[0].body, StepBody::Run { .. }));
        assert!(matches!(job.steps[1].body, StepBody::Uses { .. }));
    }

    #[test]
    fn test_reusable_job() {
        let job: Job = serde_yaml::from_str(
            r#"
uses: ./.github/workflows/deploy.yml
secrets: inherit
"#,
        )
        .unwrap();

        let Job::ReusableWorkflowCallJob(job) = job else {
            panic!("expected a reusable workflow call job");
        };
        assert!(matches!(job.secrets, Some(Secrets::Inherit(_))));
        assert!(job.secrets.as_ref().unwrap().is_inherit());
    }

    #[test]
    fn test_reusable_job_explicit_secrets() {
        let job: Job = serde_yaml::from_str(
            r#"
uses: org/repo/.github/workflows/deploy.yml@v1
secrets:
  token: ${{ secrets.DEPLOY_TOKEN }}
"#,
        )
        .unwrap();

        let Job::ReusableWorkflowCallJob(job) = job else {
            panic!("expected a reusable workflow call job");
        };
        assert!(matches!(job.secrets, Some(Secrets::Explicit(_))));
    }

    #[test]
    fn test_run_step_boolean_body() {
        // `run: true` is reinterpreted as the string "true".
        let job: Job = serde_yaml::from_str("runs-on: ubuntu-latest\nsteps:\n  - run: true")
            .unwrap();
        let Job::NormalJob(job) = job else {
            panic!("expected a normal job");
        };
        let StepBody::Run { run, .. } = &job.steps[0].body else {
            panic!("expected a run step");
        };
        assert_eq!(run, "true");
    }
}
