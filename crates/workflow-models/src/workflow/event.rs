//! Workflow trigger (`on:`) event models.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

/// The presence (and optional body) of an event in an `on:` mapping.
///
/// `Missing` means the event key is absent entirely; `Default` means the
/// key is present with a null body (e.g. `push:`); `Body` carries the
/// event's configuration.
#[derive(Debug, Default)]
pub enum OptionalBody<T> {
    /// The event is configured with a body.
    Body(Box<T>),
    /// The event is present with an empty body.
    Default,
    /// The event is absent.
    #[default]
    Missing,
}

impl<T> OptionalBody<T> {
    /// Whether the event is present at all.
    pub fn is_present(&self) -> bool {
        !matches!(self, OptionalBody::Missing)
    }

    /// The event's body, if it has one.
    pub fn body(&self) -> Option<&T> {
        match self {
            OptionalBody::Body(b) => Some(b),
            _ => None,
        }
    }
}

impl<'de, T> Deserialize<'de> for OptionalBody<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(body) => OptionalBody::Body(Box::new(body)),
            None => OptionalBody::Default,
        })
    }
}

macro_rules! bare_events {
    ($(($field:ident, $name:literal, $variant:ident, $body:ty)),* $(,)?) => {
        /// A bare workflow trigger event, e.g. `on: push`.
        #[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
        #[serde(rename_all = "snake_case")]
        pub enum BareEvent {
            $(
                #[doc = $name]
                $variant,
            )*
        }

        impl BareEvent {
            /// The event's name, as it appears in workflow YAML.
            pub fn name(&self) -> &'static str {
                match self {
                    $(BareEvent::$variant => $name,)*
                }
            }
        }

        /// The full `on:` mapping form, with per-event configuration.
        #[derive(Deserialize, Debug, Default)]
        #[serde(rename_all = "snake_case", default)]
        pub struct Events {
            $(
                #[doc = $name]
                pub $field: OptionalBody<$body>,
            )*
        }

        impl Events {
            /// Whether the given event is present in this mapping.
            pub fn has(&self, event: BareEvent) -> bool {
                match event {
                    $(BareEvent::$variant => self.$field.is_present(),)*
                }
            }

            /// The names of every present event.
            pub fn names(&self) -> Vec<&'static str> {
                let mut names = vec![];
                $(
                    if self.$field.is_present() {
                        names.push($name);
                    }
                )*
                names
            }

            /// The number of present events.
            pub fn count(&self) -> usize {
                self.names().len()
            }
        }
    };
}

bare_events! {
    (branch_protection_rule, "branch_protection_rule", BranchProtectionRule, TypesEvent),
    (check_run, "check_run", CheckRun, TypesEvent),
    (check_suite, "check_suite", CheckSuite, TypesEvent),
    (create, "create", Create, EmptyEvent),
    (delete, "delete", Delete, EmptyEvent),
    (deployment, "deployment", Deployment, EmptyEvent),
    (deployment_status, "deployment_status", DeploymentStatus, EmptyEvent),
    (discussion, "discussion", Discussion, TypesEvent),
    (discussion_comment, "discussion_comment", DiscussionComment, TypesEvent),
    (fork, "fork", Fork, EmptyEvent),
    (issue_comment, "issue_comment", IssueComment, TypesEvent),
    (issues, "issues", Issues, TypesEvent),
    (label, "label", Label, TypesEvent),
    (merge_group, "merge_group", MergeGroup, TypesEvent),
    (milestone, "milestone", Milestone, TypesEvent),
    (page_build, "page_build", PageBuild, EmptyEvent),
    (public, "public", Public, EmptyEvent),
    (pull_request, "pull_request", PullRequest, PullRequestEvent),
    (pull_request_review, "pull_request_review", PullRequestReview, TypesEvent),
    (pull_request_review_comment, "pull_request_review_comment", PullRequestReviewComment, TypesEvent),
    (pull_request_target, "pull_request_target", PullRequestTarget, PullRequestEvent),
    (push, "push", Push, PushEvent),
    (registry_package, "registry_package", RegistryPackage, TypesEvent),
    (release, "release", Release, TypesEvent),
    (repository_dispatch, "repository_dispatch", RepositoryDispatch, TypesEvent),
    (schedule, "schedule", Schedule, Vec<Cron>),
    (status, "status", Status, EmptyEvent),
    (watch, "watch", Watch, TypesEvent),
    (workflow_call, "workflow_call", WorkflowCall, WorkflowCall),
    (workflow_dispatch, "workflow_dispatch", WorkflowDispatch, WorkflowDispatch),
    (workflow_run, "workflow_run", WorkflowRun, WorkflowRunEvent),
}

/// An event with no configurable body.
#[derive(Deserialize, Debug, Default)]
pub struct EmptyEvent {}

/// An event configurable only by activity types.
#[derive(Deserialize, Debug, Default)]
pub struct TypesEvent {
    /// The activity types this event fires on.
    pub types: Option<Vec<String>>,
}

/// A single schedule entry.
#[derive(Deserialize, Debug)]
pub struct Cron {
    /// The POSIX cron expression.
    pub cron: String,
}

/// The `push:` event's configuration.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PushEvent {
    pub branches: Option<Vec<String>>,
    pub branches_ignore: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub tags_ignore: Option<Vec<String>>,
    pub paths: Option<Vec<String>>,
    pub paths_ignore: Option<Vec<String>>,
}

/// The `pull_request:` and `pull_request_target:` events' configuration.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PullRequestEvent {
    pub types: Option<Vec<String>>,
    pub branches: Option<Vec<String>>,
    pub branches_ignore: Option<Vec<String>>,
    pub paths: Option<Vec<String>>,
    pub paths_ignore: Option<Vec<String>>,
}

/// The `workflow_run:` event's configuration.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowRunEvent {
    pub workflows: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
    pub branches: Option<Vec<String>>,
    pub branches_ignore: Option<Vec<String>>,
}

/// The `workflow_dispatch:` event's configuration.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowDispatch {
    /// The dispatch's inputs, if any.
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowDispatchInput>,
}

/// A single `workflow_dispatch` input.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowDispatchInput {
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type")]
    pub input_type: Option<InputType>,
    pub options: Option<Vec<String>>,
    pub default: Option<serde_yaml::Value>,
}

/// The `workflow_call:` event's configuration.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowCall {
    /// The callee's declared inputs, if any.
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowCallInput>,
    /// The callee's declared outputs, if any.
    #[serde(default)]
    pub outputs: IndexMap<String, WorkflowCallOutput>,
    /// The callee's declared secrets, if any.
    #[serde(default)]
    pub secrets: IndexMap<String, Option<WorkflowCallSecret>>,
}

/// A single `workflow_call` input.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowCallInput {
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type")]
    pub input_type: Option<InputType>,
    pub default: Option<serde_yaml::Value>,
}

/// A single `workflow_call` output.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowCallOutput {
    pub description: Option<String>,
    pub value: Option<String>,
}

/// A single `workflow_call` secret.
#[derive(Deserialize, Debug, Default)]
pub struct WorkflowCallSecret {
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Declared input types for dispatch and call inputs.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Boolean,
    Choice,
    Environment,
    Number,
    String,
}

impl InputType {
    /// Whether values of this type can carry arbitrary attacker-chosen
    /// text.
    pub fn is_free_form(&self) -> bool {
        matches!(self, InputType::String)
    }
}

#[cfg(test)]
mod tests {
    use super::{BareEvent, Events, OptionalBody};

    #[test]
    fn test_events_presence() {
        let events: Events = serde_yaml::from_str(
            r#"
push:
  branches: [main]
pull_request_target:
workflow_dispatch:
  inputs:
    version:
      type: string
"#,
        )
        .unwrap();

        assert!(events.has(BareEvent::Push));
        assert!(events.has(BareEvent::PullRequestTarget));
        assert!(events.has(BareEvent::WorkflowDispatch));
        assert!(!events.has(BareEvent::Issues));
        assert_eq!(events.count(), 3);

        // `pull_request_target:` with a null body is present but bodiless.
        assert!(matches!(
            events.pull_request_target,
            OptionalBody::Default
        ));

        let push = events.push.body().unwrap();
        assert_eq!(push.branches.as_deref(), Some(["main".to_string()].as_slice()));
    }

    #[test]
    fn test_workflow_call_secrets() {
        let events: Events = serde_yaml::from_str(
            r#"
workflow_call:
  secrets:
    DEPLOY_TOKEN:
      required: true
    OPTIONAL_TOKEN:
"#,
        )
        .unwrap();

        let call = events.workflow_call.body().unwrap();
        assert_eq!(call.secrets.len(), 2);
        assert!(call.secrets["DEPLOY_TOKEN"].as_ref().unwrap().required);
        assert!(call.secrets["OPTIONAL_TOKEN"].is_none());
    }
}
