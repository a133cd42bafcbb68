//! Input registry and associated types.

use std::collections::{BTreeMap, btree_map};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;

use crate::models::workflow::Workflow;

#[derive(Error, Debug)]
pub(crate) enum InputError {
    /// The input's syntax is invalid. This typically indicates a user
    /// error.
    #[error("invalid YAML syntax: {0}")]
    Syntax(#[source] anyhow::Error),
    /// The input couldn't be converted into the workflow model.
    #[error("input is valid YAML but not a valid workflow")]
    Model(#[source] anyhow::Error),
    /// An I/O error occurred while loading the input.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The input's name is missing.
    #[error("invalid input: no filename component")]
    MissingName,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A unique identifying "key" for a workflow file in a given run.
///
/// Keys carry the path as given by the user, plus an optional
/// nondeterministic prefix (e.g. a scanned directory root) that gets
/// stripped for relative presentation.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, PartialOrd, Ord)]
pub(crate) struct InputKey {
    prefix: Option<Utf8PathBuf>,
    pub(crate) given_path: Utf8PathBuf,
}

impl std::fmt::Display for InputKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file://{path}", path = self.given_path)
    }
}

impl InputKey {
    pub(crate) fn local<P: AsRef<Utf8Path>>(path: P, prefix: Option<P>) -> Result<Self, InputError> {
        // All keys must have a filename component.
        if path.as_ref().file_name().is_none() {
            return Err(InputError::MissingName);
        }

        Ok(Self {
            prefix: prefix.map(|p| p.as_ref().to_path_buf()),
            given_path: path.as_ref().to_path_buf(),
        })
    }

    /// Return a "presentation" path for this [`InputKey`]: the path as
    /// the user gave it.
    pub(crate) fn presentation_path(&self) -> &str {
        self.given_path.as_str()
    }

    /// Returns a prefix-relative path, suitable for machine-readable
    /// outputs that dislike relative directory markers.
    pub(crate) fn relative_path(&self) -> &str {
        self.prefix
            .as_ref()
            .and_then(|pfx| self.given_path.strip_prefix(pfx).ok())
            .unwrap_or(&self.given_path)
            .as_str()
    }

    /// Returns the filename component of this [`InputKey`].
    pub(crate) fn filename(&self) -> &str {
        // NOTE: Safe unwrap, since a filename component is a
        // construction invariant.
        self.given_path.file_name().expect("no filename component")
    }
}

pub(crate) struct InputRegistry {
    strict: bool,
    // NOTE: A BTreeMap ensures that registered inputs iterate in a
    // deterministic order, independent of registration order.
    pub(crate) inputs: BTreeMap<InputKey, Workflow>,
}

impl InputRegistry {
    pub(crate) fn new(strict: bool) -> Self {
        Self {
            strict,
            inputs: Default::default(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Registers a workflow from its raw contents.
    ///
    /// In non-strict mode, syntax and model errors are logged and
    /// skipped rather than failing the whole run.
    pub(crate) fn register(&mut self, contents: String, key: InputKey) -> anyhow::Result<()> {
        tracing::debug!(
            "registering {name} with key {key}",
            name = key.filename()
        );

        match Workflow::from_string(contents, key.clone()) {
            Ok(workflow) => self.register_workflow(workflow),
            Err(e @ (InputError::Syntax(_) | InputError::Model(_))) if !self.strict => {
                tracing::warn!("failed to load {key}: {e}");
                Ok(())
            }
            Err(e) => {
                Err(anyhow::anyhow!(e)).with_context(|| format!("failed to load {key}"))
            }
        }
    }

    fn register_workflow(&mut self, workflow: Workflow) -> anyhow::Result<()> {
        if self.inputs.contains_key(&workflow.key) {
            return Err(anyhow::anyhow!(
                "can't register {key} more than once",
                key = workflow.key
            ));
        }

        self.inputs.insert(workflow.key.clone(), workflow);

        Ok(())
    }

    pub(crate) fn iter_inputs(&self) -> btree_map::Iter<'_, InputKey, Workflow> {
        self.inputs.iter()
    }

    pub(crate) fn get_input(&self, key: &InputKey) -> &Workflow {
        self.inputs
            .get(key)
            .expect("API misuse: requested an un-registered input")
    }
}

#[cfg(test)]
mod tests {
    use super::InputKey;

    #[test]
    fn test_input_key_display() {
        let key = InputKey::local("/foo/bar/baz.yml", None).unwrap();
        assert_eq!(key.to_string(), "file:///foo/bar/baz.yml");
        assert_eq!(key.filename(), "baz.yml");
    }

    #[test]
    fn test_input_key_relative_path() {
        let key = InputKey::local("/foo/bar/baz.yml", None).unwrap();
        assert_eq!(key.relative_path(), "/foo/bar/baz.yml");

        let key = InputKey::local("/foo/bar/baz.yml", Some("/foo")).unwrap();
        assert_eq!(key.relative_path(), "bar/baz.yml");

        let key = InputKey::local("./.github/workflows/ci.yml", Some(".")).unwrap();
        assert_eq!(key.relative_path(), ".github/workflows/ci.yml");
    }

    #[test]
    fn test_input_key_missing_name() {
        assert!(InputKey::local("/", None).is_err());
    }
}
