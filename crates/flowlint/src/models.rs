//! Enriching/context-bearing wrappers over the schema models from
//! [`workflow_models`].

pub(crate) mod workflow;

/// Anything that can hand out a reference to its preserved concrete
/// YAML document.
///
/// The document is the serialization source of truth: fixes mutate it,
/// and findings concretize their positions against it.
pub(crate) trait AsDocument<'a, 'doc> {
    fn as_document(&'a self) -> &'doc yamlpath::Document;
}
