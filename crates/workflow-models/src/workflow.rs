//! Workflow definition models.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::common::{Env, Permissions, expr::LoE};

pub mod event;
pub mod job;

use self::event::{BareEvent, Events};
use self::job::Job;

/// A single GitHub Actions workflow.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Workflow {
    /// The workflow's name, if any.
    pub name: Option<String>,
    /// The workflow's dynamic run name, if any.
    pub run_name: Option<String>,
    /// The workflow's trigger configuration.
    pub on: Trigger,
    /// Workflow-level permissions, if any.
    pub permissions: Option<Permissions>,
    /// Workflow-level environment, if any.
    pub env: Option<LoE<Env>>,
    /// Workflow-level defaults, if any.
    pub defaults: Option<Defaults>,
    /// Workflow-level concurrency settings. Kept opaque; the analyzer
    /// doesn't reason about concurrency groups.
    pub concurrency: Option<serde_yaml::Value>,
    /// The workflow's jobs, keyed by job ID in declaration order.
    pub jobs: IndexMap<String, Job>,
}

/// A workflow's `on:` trigger block.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum Trigger {
    /// A single bare event, e.g. `on: push`.
    BareEvent(BareEvent),
    /// A list of bare events, e.g. `on: [push, pull_request]`.
    BareEvents(Vec<BareEvent>),
    /// A mapping of event names to (possibly empty) configurations.
    Events(Box<Events>),
}

impl Trigger {
    /// Whether this trigger includes the given bare event.
    pub fn has_event(&self, event: BareEvent) -> bool {
        match self {
            Trigger::BareEvent(e) => *e == event,
            Trigger::BareEvents(events) => events.contains(&event),
            Trigger::Events(events) => events.has(event),
        }
    }

    /// The names of every event this trigger fires on.
    ///
    /// For the mapping form the order is the schema's field order, not
    /// the document's; callers needing document positions should query
    /// the concrete tree instead.
    pub fn event_names(&self) -> Vec<&'static str> {
        match self {
            Trigger::BareEvent(e) => vec![e.name()],
            Trigger::BareEvents(events) => events.iter().map(|e| e.name()).collect(),
            Trigger::Events(events) => events.names(),
        }
    }
}

/// `defaults:` for a workflow or job.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Defaults {
    /// Defaults for `run:` steps.
    pub run: Option<RunDefaults>,
}

/// Default settings for `run:` steps.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct RunDefaults {
    /// The default shell.
    pub shell: Option<String>,
    /// The default working directory.
    pub working_directory: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{Trigger, Workflow};
    use crate::workflow::event::BareEvent;

    #[test]
    fn test_workflow_triggers() {
        let workflow = r#"
name: CI
on:
  push:
    branches: [main]
  pull_request_target:
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: make
"#;
        let workflow: Workflow = serde_yaml::from_str(workflow).unwrap();
        assert!(workflow.on.has_event(BareEvent::Push));
        assert!(workflow.on.has_event(BareEvent::PullRequestTarget));
        assert!(!workflow.on.has_event(BareEvent::Schedule));
        assert_eq!(
            workflow.on.event_names(),
            vec!["pull_request_target", "push"]
        );
    }

    #[test]
    fn test_workflow_bare_triggers() {
        let workflow: Workflow = serde_yaml::from_str("on: push\njobs: {}").unwrap();
        assert!(matches!(workflow.on, Trigger::BareEvent(BareEvent::Push)));

        let workflow: Workflow =
            serde_yaml::from_str("on: [push, workflow_dispatch]\njobs: {}").unwrap();
        assert!(workflow.on.has_event(BareEvent::WorkflowDispatch));
    }
}
