//! Analyzer runtime state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

/// Shared state handed to each audit at construction time.
#[derive(Default)]
pub(crate) struct AuditState {
    /// The repository root (the nearest ancestor containing `.github`),
    /// when one could be determined.
    pub(crate) repo_root: Option<Utf8PathBuf>,
    /// A cache of local reusable-workflow metadata.
    pub(crate) reusable_workflows: Arc<ReusableWorkflowCache>,
    /// Config-supplied additions to the exfiltration endpoint
    /// allowlist.
    pub(crate) extra_allowed_endpoints: Vec<String>,
}

impl AuditState {
    pub(crate) fn new(repo_root: Option<Utf8PathBuf>, extra_allowed_endpoints: Vec<String>) -> Self {
        Self {
            reusable_workflows: Arc::new(ReusableWorkflowCache::new(repo_root.clone())),
            repo_root,
            extra_allowed_endpoints,
        }
    }
}

/// Metadata extracted from a reusable workflow's `workflow_call`
/// declaration.
#[derive(Debug)]
pub(crate) struct CalleeMetadata {
    /// Declared secret names, in declaration order.
    pub(crate) secrets: Vec<String>,
    /// Declared inputs, with whether each is free-form (string-typed).
    pub(crate) inputs: Vec<(String, bool)>,
}

/// Resolves and caches `uses: ./path/to.yml` reusable workflow targets.
///
/// The map is read-mostly; the lock exists so a host can lint files in
/// parallel while sharing one cache. Lookups hit the filesystem once
/// per path; failures are cached as `None`.
#[derive(Default)]
pub(crate) struct ReusableWorkflowCache {
    root: Option<Utf8PathBuf>,
    cache: RwLock<HashMap<Utf8PathBuf, Option<Arc<CalleeMetadata>>>>,
}

impl ReusableWorkflowCache {
    pub(crate) fn new(root: Option<Utf8PathBuf>) -> Self {
        Self {
            root,
            cache: Default::default(),
        }
    }

    /// Looks up the metadata for a local reusable workflow path
    /// (e.g. `./.github/workflows/deploy.yml`).
    pub(crate) fn lookup(&self, path: &str) -> Option<Arc<CalleeMetadata>> {
        let resolved = self.resolve(path)?;

        if let Some(cached) = self
            .cache
            .read()
            .expect("reusable workflow cache poisoned")
            .get(&resolved)
        {
            return cached.clone();
        }

        let loaded = Self::load(&resolved).map(Arc::new);
        if loaded.is_none() {
            tracing::debug!("no reusable workflow metadata at {resolved}");
        }

        self.cache
            .write()
            .expect("reusable workflow cache poisoned")
            .insert(resolved, loaded.clone());

        loaded
    }

    fn resolve(&self, path: &str) -> Option<Utf8PathBuf> {
        let relative = path.strip_prefix("./").unwrap_or(path);
        let root = self.root.as_deref().unwrap_or(Utf8Path::new("."));
        Some(root.join(relative))
    }

    fn load(path: &Utf8Path) -> Option<CalleeMetadata> {
        let contents = std::fs::read_to_string(path).ok()?;
        let workflow: workflow_models::workflow::Workflow = serde_yaml::from_str(&contents).ok()?;

        let workflow_models::workflow::Trigger::Events(events) = &workflow.on else {
            return None;
        };

        let call = events.workflow_call.body()?;

        Some(CalleeMetadata {
            secrets: call.secrets.keys().cloned().collect(),
            inputs: call
                .inputs
                .iter()
                .map(|(name, input)| {
                    let free_form = input
                        .input_type
                        .map(|t| t.is_free_form())
                        // Untyped inputs are treated as free-form.
                        .unwrap_or(true);
                    (name.clone(), free_form)
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ReusableWorkflowCache;

    #[test]
    fn test_lookup_missing_is_cached() {
        let cache = ReusableWorkflowCache::new(None);
        assert!(cache.lookup("./does/not/exist.yml").is_none());
        // A second lookup hits the cache, not the filesystem.
        assert!(cache.lookup("./does/not/exist.yml").is_none());
    }
}
