//! Workflow models, enriched with document access and locations.

use anyhow::Context as _;
use workflow_models::common::{Env, EnvValue, Uses, expr::LoE};
use workflow_models::workflow::{self, event::BareEvent, job};

use crate::finding::location::{Locatable, SymbolicLocation};
use crate::models::AsDocument;
use crate::registry::input::{InputError, InputKey};

/// Workflow triggers that run with elevated permissions or secrets
/// access in contexts where external contributors influence the payload.
pub(crate) const PRIVILEGED_TRIGGERS: &[&str] = &[
    "pull_request_target",
    "workflow_run",
    "issue_comment",
    "issues",
    "discussion_comment",
];

/// Represents an entire GitHub Actions workflow.
///
/// This type implements [`std::ops::Deref`] for [`workflow::Workflow`],
/// providing access to the underlying data model.
pub(crate) struct Workflow {
    /// This workflow's unique key into the input registry.
    pub(crate) key: InputKey,
    document: yamlpath::Document,
    inner: workflow::Workflow,
}

impl<'a> AsDocument<'a, 'a> for Workflow {
    fn as_document(&'a self) -> &'a yamlpath::Document {
        &self.document
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{key}", key = self.key)
    }
}

impl std::ops::Deref for Workflow {
    type Target = workflow::Workflow;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Workflow {
    /// Load a workflow from a buffer, with an assigned key.
    pub(crate) fn from_string(contents: String, key: InputKey) -> Result<Self, InputError> {
        let inner = match serde_yaml::from_str::<workflow::Workflow>(&contents) {
            Ok(inner) => inner,
            Err(e) => {
                // serde_yaml doesn't distinguish syntax from semantic
                // errors; re-parsing as a bare value is the oracle.
                return match serde_yaml::from_str::<serde_yaml::Value>(&contents) {
                    Ok(_) => Err(InputError::Model(e.into())),
                    Err(e) => Err(InputError::Syntax(e.into())),
                };
            }
        };

        let document = yamlpath::Document::new(&contents)
            .context("failed to load internal pathing document")?;

        Ok(Self {
            key,
            document,
            inner,
        })
    }

    /// A [`Jobs`] iterator over this workflow's constituent [`Job`]s.
    pub(crate) fn jobs(&self) -> Jobs<'_> {
        Jobs::new(self)
    }

    /// The names of every event this workflow triggers on.
    pub(crate) fn trigger_names(&self) -> Vec<&'static str> {
        self.on.event_names()
    }

    /// Whether this workflow is triggered by the given event.
    pub(crate) fn has_event(&self, event: BareEvent) -> bool {
        self.on.has_event(event)
    }

    /// The privileged triggers this workflow fires on, if any.
    pub(crate) fn privileged_triggers(&self) -> Vec<&'static str> {
        self.trigger_names()
            .into_iter()
            .filter(|name| PRIVILEGED_TRIGGERS.contains(name))
            .collect()
    }

    /// Whether any of this workflow's triggers is privileged.
    pub(crate) fn has_privileged_trigger(&self) -> bool {
        !self.privileged_triggers().is_empty()
    }

    /// Whether this workflow is itself reusable.
    pub(crate) fn has_workflow_call(&self) -> bool {
        self.has_event(BareEvent::WorkflowCall)
    }

    /// Whether this workflow can be triggered by external contributors
    /// (directly or through a PR).
    pub(crate) fn has_external_trigger(&self) -> bool {
        self.has_privileged_trigger() || self.has_event(BareEvent::PullRequest)
    }

    /// Returns this workflow's [`SymbolicLocation`].
    pub(crate) fn location(&self) -> SymbolicLocation<'_> {
        SymbolicLocation::new(&self.key, "this workflow")
    }
}

/// Common behavior across both normal and reusable jobs.
pub(crate) trait JobExt<'doc> {
    /// The job's unique ID (i.e., its key in the workflow's `jobs:` block).
    fn id(&self) -> &'doc str;

    /// The job's name, if it has one.
    fn name(&self) -> Option<&'doc str>;

    /// The job's parent [`Workflow`].
    fn parent(&self) -> &'doc Workflow;
}

impl<'doc, T: JobExt<'doc>> Locatable<'doc> for T {
    fn location(&self) -> SymbolicLocation<'doc> {
        self.parent()
            .location()
            .annotated("this job")
            .with_keys(["jobs".into(), self.id().into()])
    }

    fn location_with_name(&self) -> SymbolicLocation<'doc> {
        match self.name() {
            Some(_) => self.location().with_keys(["name".into()]),
            None => self.location(),
        }
    }
}

/// Represents a single "normal" GitHub Actions job.
#[derive(Clone)]
pub(crate) struct NormalJob<'doc> {
    /// The job's unique ID.
    id: &'doc str,
    /// The underlying job.
    inner: &'doc job::NormalJob,
    /// The job's parent [`Workflow`].
    parent: &'doc Workflow,
}

impl<'doc> NormalJob<'doc> {
    pub(crate) fn new(id: &'doc str, inner: &'doc job::NormalJob, parent: &'doc Workflow) -> Self {
        Self { id, inner, parent }
    }

    /// An iterator of this job's constituent [`Step`]s.
    pub(crate) fn steps(&self) -> Steps<'doc> {
        Steps::new(self)
    }

    /// Figure out what this job's runner's default shell is.
    ///
    /// Returns `None` if the runner environment is indeterminate
    /// (e.g. controlled by an expression).
    pub(crate) fn runner_default_shell(&self) -> Option<&'static str> {
        match &self.inner.runs_on {
            LoE::Expr(_) => None,
            LoE::Literal(runs_on) => {
                for label in runs_on.labels() {
                    match label.as_str() {
                        // Default self-hosted routing labels.
                        "linux" | "macOS" => return Some("bash"),
                        "windows" => return Some("pwsh"),
                        // Standard GitHub-hosted runners, matched by
                        // prefix so new variations keep working.
                        l if l.contains("ubuntu-") || l.contains("macos") => return Some("bash"),
                        l if l.contains("windows-") => return Some("pwsh"),
                        _ => continue,
                    }
                }

                None
            }
        }
    }
}

impl<'doc> JobExt<'doc> for NormalJob<'doc> {
    fn id(&self) -> &'doc str {
        self.id
    }

    fn name(&self) -> Option<&'doc str> {
        self.inner.name.as_deref()
    }

    fn parent(&self) -> &'doc Workflow {
        self.parent
    }
}

impl<'doc> std::ops::Deref for NormalJob<'doc> {
    type Target = &'doc job::NormalJob;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Represents a reusable workflow call job.
#[derive(Clone)]
pub(crate) struct ReusableWorkflowCallJob<'doc> {
    /// The job's unique ID.
    id: &'doc str,
    /// The underlying job.
    inner: &'doc job::ReusableWorkflowCallJob,
    /// The job's parent [`Workflow`].
    parent: &'doc Workflow,
}

impl<'doc> ReusableWorkflowCallJob<'doc> {
    pub(crate) fn new(
        id: &'doc str,
        inner: &'doc job::ReusableWorkflowCallJob,
        parent: &'doc Workflow,
    ) -> Self {
        Self { id, inner, parent }
    }
}

impl<'doc> JobExt<'doc> for ReusableWorkflowCallJob<'doc> {
    fn id(&self) -> &'doc str {
        self.id
    }

    fn name(&self) -> Option<&'doc str> {
        self.inner.name.as_deref()
    }

    fn parent(&self) -> &'doc Workflow {
        self.parent
    }
}

impl<'doc> std::ops::Deref for ReusableWorkflowCallJob<'doc> {
    type Target = &'doc job::ReusableWorkflowCallJob;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Represents a single GitHub Actions job.
#[derive(Clone)]
pub(crate) enum Job<'doc> {
    NormalJob(NormalJob<'doc>),
    ReusableWorkflowCallJob(ReusableWorkflowCallJob<'doc>),
}

impl<'doc> Job<'doc> {
    fn new(id: &'doc str, inner: &'doc job::Job, parent: &'doc Workflow) -> Self {
        match inner {
            job::Job::NormalJob(normal) => Job::NormalJob(NormalJob::new(id, normal, parent)),
            job::Job::ReusableWorkflowCallJob(reusable) => {
                Job::ReusableWorkflowCallJob(ReusableWorkflowCallJob::new(id, reusable, parent))
            }
        }
    }
}

/// An iterable container for jobs within a [`Workflow`].
pub(crate) struct Jobs<'doc> {
    parent: &'doc Workflow,
    inner: indexmap::map::Iter<'doc, String, job::Job>,
}

impl<'doc> Jobs<'doc> {
    fn new(workflow: &'doc Workflow) -> Self {
        Self {
            parent: workflow,
            inner: workflow.jobs.iter(),
        }
    }
}

impl<'doc> Iterator for Jobs<'doc> {
    type Item = Job<'doc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(id, job)| Job::new(id, job, self.parent))
    }
}

/// The kind of inline script a step carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScriptKind {
    /// A `run:` step's shell script.
    Run,
    /// The `script` input of `actions/github-script`.
    GithubScript,
}

/// Represents a single step in a normal workflow job.
///
/// This type implements [`std::ops::Deref`] for [`job::Step`], which
/// provides access to the step's actual fields.
#[derive(Clone)]
pub(crate) struct Step<'doc> {
    /// The step's index within its parent job.
    pub(crate) index: usize,
    /// The inner step model.
    inner: &'doc job::Step,
    /// The parent job.
    pub(crate) parent: NormalJob<'doc>,
}

impl<'doc> std::ops::Deref for Step<'doc> {
    type Target = &'doc job::Step;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'doc> Locatable<'doc> for Step<'doc> {
    fn location(&self) -> SymbolicLocation<'doc> {
        self.parent
            .location()
            .with_keys(["steps".into(), self.index.into()])
            .annotated("this step")
    }

    fn location_with_name(&self) -> SymbolicLocation<'doc> {
        match self.inner.name {
            Some(_) => self.location().with_keys(["name".into()]),
            None => self.location(),
        }
    }
}

impl<'doc> Step<'doc> {
    fn new(index: usize, inner: &'doc job::Step, parent: NormalJob<'doc>) -> Self {
        Self {
            index,
            inner,
            parent,
        }
    }

    /// Returns this step's parent [`NormalJob`].
    pub(crate) fn job(&self) -> &NormalJob<'doc> {
        &self.parent
    }

    /// Returns this step's (grand)parent [`Workflow`].
    pub(crate) fn workflow(&self) -> &'doc Workflow {
        self.parent.parent()
    }

    /// Returns this step's `uses:`, if it's an action step.
    pub(crate) fn uses(&self) -> Option<&'doc Uses> {
        match &self.inner.body {
            job::StepBody::Uses { uses, .. } => Some(uses),
            _ => None,
        }
    }

    /// Whether this step uses the given `owner/repo[/subpath]` action,
    /// ignoring the ref.
    pub(crate) fn uses_matches(&self, template: &str) -> bool {
        matches!(self.uses(), Some(Uses::Repository(repo)) if repo.matches(template))
    }

    /// Returns this step's `with:` inputs, if it's an action step.
    pub(crate) fn with(&self) -> Option<&'doc Env> {
        match &self.inner.body {
            job::StepBody::Uses { with, .. } => Some(with),
            _ => None,
        }
    }

    /// Returns the given `with:` input's stringified value, if present.
    pub(crate) fn input(&self, name: &str) -> Option<String> {
        self.with().and_then(|with| {
            with.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.to_string())
        })
    }

    /// Returns this step's `run:` body, if it's a run step.
    pub(crate) fn run_body(&self) -> Option<&'doc str> {
        match &self.inner.body {
            job::StepBody::Run { run, .. } => Some(run),
            _ => None,
        }
    }

    /// Returns this step's inline script (a `run:` body or a
    /// `github-script` `script` input), along with its kind and
    /// symbolic location.
    pub(crate) fn script_with_location(
        &self,
    ) -> Option<(ScriptKind, &'doc str, SymbolicLocation<'doc>)> {
        match &self.inner.body {
            job::StepBody::Run { run, .. } => Some((
                ScriptKind::Run,
                run.as_str(),
                self.location().with_keys(["run".into()]),
            )),
            job::StepBody::Uses { uses, with } => {
                let Uses::Repository(repo) = uses else {
                    return None;
                };

                if !repo.matches("actions/github-script") {
                    return None;
                }

                with.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("script"))
                    .and_then(|(_, script)| match script {
                        // Non-string script inputs aren't analyzable.
                        EnvValue::String(script) => Some((
                            ScriptKind::GithubScript,
                            script.as_str(),
                            self.location()
                                .with_keys(["with".into(), "script".into()]),
                        )),
                        _ => None,
                    })
            }
        }
    }

    /// Returns the shell used by this step, or `None` if it can't be
    /// statically inferred.
    ///
    /// Returns `None` for non-run steps as well.
    pub(crate) fn shell(&self) -> Option<&str> {
        let job::StepBody::Run { shell, .. } = &self.inner.body else {
            return None;
        };

        // The step's own `shell:` takes precedence, followed by the
        // job's default, followed by the workflow's default, followed
        // by the runner's default.
        shell
            .as_deref()
            .or_else(|| {
                self.job()
                    .defaults
                    .as_ref()
                    .and_then(|d| d.run.as_ref().and_then(|r| r.shell.as_deref()))
            })
            .or_else(|| {
                self.workflow()
                    .defaults
                    .as_ref()
                    .and_then(|d| d.run.as_ref().and_then(|r| r.shell.as_deref()))
            })
            .or_else(|| self.parent.runner_default_shell())
    }

    /// This step's literal environment entries, stringified.
    ///
    /// Entries are empty when the step's `env:` is itself an
    /// expression.
    pub(crate) fn env_entries(&self) -> Vec<(&'doc str, String)> {
        match &self.inner.env {
            Some(LoE::Literal(env)) => env
                .iter()
                .map(|(k, v): (&'doc String, &'doc EnvValue)| (k.as_str(), v.to_string()))
                .collect(),
            _ => vec![],
        }
    }

    /// Whether this step's environment already contains the given key,
    /// compared case-insensitively.
    pub(crate) fn env_has_key(&self, name: &str) -> bool {
        self.env_entries()
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the name of a step-level env var whose value contains the
    /// given raw expression, if any. Used to recognize expressions that
    /// are already hoisted out of the inline script.
    pub(crate) fn env_binding_for(&self, raw_expr: &str) -> Option<&'doc str> {
        let bare = raw_expr
            .trim_start_matches("${{")
            .trim_end_matches("}}")
            .trim()
            .to_string();

        self.env_entries()
            .into_iter()
            .find(|(_, v)| {
                crate::utils::extract_expressions(v)
                    .iter()
                    .any(|(e, _)| e.as_bare().trim() == bare)
            })
            .map(|(k, _)| k)
    }
}

/// An iterable container for steps within a [`NormalJob`].
pub(crate) struct Steps<'doc> {
    inner: std::iter::Enumerate<std::slice::Iter<'doc, job::Step>>,
    parent: NormalJob<'doc>,
}

impl<'doc> Steps<'doc> {
    fn new(job: &NormalJob<'doc>) -> Self {
        Self {
            inner: job.inner.steps.iter().enumerate(),
            parent: job.clone(),
        }
    }
}

impl<'doc> Iterator for Steps<'doc> {
    type Item = Step<'doc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(idx, step)| Step::new(idx, step, self.parent.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Job, Workflow};
    use crate::registry::input::InputKey;

    fn workflow(contents: &str) -> Workflow {
        Workflow::from_string(contents.into(), InputKey::local("test.yml", None).unwrap())
            .unwrap()
    }

    #[test]
    fn test_workflow_privileged_triggers() {
        let wf = workflow(
            r#"
on:
  pull_request_target:
  push:
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: make
"#,
        );

        assert!(wf.has_privileged_trigger());
        assert_eq!(wf.privileged_triggers(), vec!["pull_request_target"]);
        assert_eq!(wf.trigger_names(), vec!["pull_request_target", "push"]);
    }

    #[test]
    fn test_step_shell_inference() {
        let wf = workflow(
            r#"
on: push
defaults:
  run:
    shell: sh
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: make
      - run: make
        shell: bash
"#,
        );

        let Some(Job::NormalJob(job)) = wf.jobs().next() else {
            panic!("expected a normal job");
        };

        let steps: Vec<_> = job.steps().collect();
        assert_eq!(steps[0].shell(), Some("sh"));
        assert_eq!(steps[1].shell(), Some("bash"));
    }

    #[test]
    fn test_step_env_binding() {
        let wf = workflow(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - env:
          PR_TITLE: ${{ github.event.pull_request.title }}
        run: echo "$PR_TITLE"
"#,
        );

        let Some(Job::NormalJob(job)) = wf.jobs().next() else {
            panic!("expected a normal job");
        };
        let step = job.steps().next().unwrap();

        assert!(step.env_has_key("pr_title"));
        assert_eq!(
            step.env_binding_for("${{ github.event.pull_request.title }}"),
            Some("PR_TITLE")
        );
        assert_eq!(step.env_binding_for("${{ github.head_ref }}"), None);
    }

    #[test]
    fn test_step_uses_matching() {
        let wf = workflow(
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: main
"#,
        );

        let Some(Job::NormalJob(job)) = wf.jobs().next() else {
            panic!("expected a normal job");
        };
        let step = job.steps().next().unwrap();
        assert!(step.uses_matches("actions/checkout"));
        assert!(!step.uses_matches("actions/cache"));
        assert_eq!(step.input("ref").as_deref(), Some("main"));
    }
}
