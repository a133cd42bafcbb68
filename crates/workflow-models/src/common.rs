//! Models shared between workflow and related definitions.

use std::fmt::{self, Display};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, de};

pub mod expr;

/// `permissions` for a workflow, job, or step.
///
/// Invariant: a permissions block is *either* a blanket setting or a
/// fine-grained mapping, never both; the untagged representation
/// enforces this structurally.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", untagged)]
pub enum Permissions {
    /// Base, i.e. blanket permissions.
    Base(BasePermission),
    /// Fine-grained permissions.
    ///
    /// These are modeled with an open-ended mapping rather than a
    /// structure to make iteration over all defined permissions easier.
    Explicit(IndexMap<String, Permission>),
}

impl Default for Permissions {
    fn default() -> Self {
        Self::Base(BasePermission::Default)
    }
}

impl Permissions {
    /// Whether this permissions block restricts the default token grants,
    /// i.e. is anything other than the implicit default.
    pub fn is_restrictive(&self) -> bool {
        match self {
            Permissions::Base(BasePermission::WriteAll) => false,
            Permissions::Base(BasePermission::Default) => false,
            Permissions::Base(BasePermission::ReadAll) => true,
            Permissions::Explicit(_) => true,
        }
    }
}

/// "Base" permissions, where all individual permissions are configured
/// with a blanket setting.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BasePermission {
    /// Whatever default permissions come from the workflow's `GITHUB_TOKEN`.
    #[default]
    Default,
    /// "Read" access to all resources.
    ReadAll,
    /// "Write" access to all resources (implies read).
    WriteAll,
}

/// A singular permission setting.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// Read access.
    Read,
    /// Write access.
    Write,
    /// No access.
    #[default]
    None,
}

/// An environment mapping.
///
/// Keys preserve their original casing; lookups that need case
/// insensitivity normalize at the call site.
pub type Env = IndexMap<String, EnvValue>;

/// Environment variable values are always strings, but GitHub Actions
/// allows users to configure them as various native YAML types before
/// internal stringification.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum EnvValue {
    // Missing values are empty strings.
    #[serde(deserialize_with = "null_to_default")]
    String(String),
    Number(f64),
    Boolean(bool),
}

impl Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl EnvValue {
    /// Returns whether this value is "trueish" under GitHub's
    /// C#-derived boolean parsing: the case-insensitive string "true"
    /// is true, while "1", "yes", etc. are not.
    pub fn trueish(&self) -> bool {
        match self {
            EnvValue::Boolean(b) => *b,
            EnvValue::String(maybe) => maybe.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// A "scalar or vector" type, for places in GitHub Actions where a
/// key can have either a scalar value or an array of values.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
enum SoV<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<SoV<T>> for Vec<T> {
    fn from(val: SoV<T>) -> Vec<T> {
        match val {
            SoV::One(v) => vec![v],
            SoV::Many(vs) => vs,
        }
    }
}

pub(crate) fn scalar_or_vector<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    SoV::deserialize(de).map(Into::into)
}

/// A bool or string, for places where GitHub Actions contextually
/// reinterprets a YAML boolean as a string, e.g. `run: true` really
/// means `run: 'true'`.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
enum BoS {
    Bool(bool),
    String(String),
}

impl From<BoS> for String {
    fn from(value: BoS) -> Self {
        match value {
            BoS::Bool(b) => b.to_string(),
            BoS::String(s) => s,
        }
    }
}

pub(crate) fn bool_is_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    BoS::deserialize(de).map(Into::into)
}

/// An `if:` condition in a workflow or job definition.
///
/// These are either booleans or bare (i.e. non-curly) expressions.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum If {
    Bool(bool),
    Expr(String),
}

fn null_to_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let key = Option::<T>::deserialize(de)?;
    Ok(key.unwrap_or_default())
}

/// An error produced while parsing a `uses:` clause.
#[derive(Debug, PartialEq)]
pub struct UsesError(String);

impl Display for UsesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed `uses` ref: {}", self.0)
    }
}

/// A step or job `uses:` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Uses {
    /// A local `uses:` clause, e.g. `uses: ./foo/bar`.
    Local(LocalUses),
    /// A repository `uses:` clause, e.g. `uses: foo/bar@v1`.
    Repository(RepositoryUses),
    /// A Docker image `uses:` clause, e.g. `uses: docker://ubuntu`.
    Docker(DockerUses),
}

impl Uses {
    /// Parse a `uses:` clause into its appropriate variant.
    pub fn parse(uses: impl Into<String>) -> Result<Self, UsesError> {
        let uses = uses.into();

        if uses.starts_with("./") {
            Ok(Self::Local(LocalUses { path: uses }))
        } else if let Some(image) = uses.strip_prefix("docker://") {
            Ok(Self::Docker(DockerUses::parse(image)))
        } else {
            RepositoryUses::parse(uses).map(Self::Repository)
        }
    }

    /// Returns the original raw `uses:` clause, without any
    /// `docker://` prefix.
    pub fn raw(&self) -> &str {
        match self {
            Uses::Local(local) => &local.path,
            Uses::Repository(repo) => &repo.raw,
            Uses::Docker(docker) => &docker.raw,
        }
    }
}

/// A `uses: ./some/path` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalUses {
    /// The path to the local action or reusable workflow.
    pub path: String,
}

/// A `uses: owner/repo[/subpath]@ref` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryUses {
    /// The raw clause.
    pub raw: String,
    /// The repo user or org.
    pub owner: String,
    /// The repo name.
    pub repo: String,
    /// The subpath to the action or reusable workflow, if present.
    pub subpath: Option<String>,
    /// The `@<ref>` that the `uses:` is pinned to, if present.
    ///
    /// GitHub itself rejects repository uses without a ref; we keep
    /// parsing lenient so that analysis can still see the slug.
    pub git_ref: Option<String>,
}

impl RepositoryUses {
    fn parse(uses: String) -> Result<Self, UsesError> {
        // NOTE: Both git refs and paths can contain `@`, but in practice
        // GHA refuses to run a `uses:` clause with more than one `@` in it.
        let (path, git_ref) = match uses.rsplit_once('@') {
            Some((path, git_ref)) => (path.to_string(), Some(git_ref.to_string())),
            None => (uses.clone(), None),
        };

        let mut components = path.splitn(3, '/');
        match (components.next(), components.next()) {
            (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => Ok(Self {
                owner: owner.to_string(),
                repo: repo.to_string(),
                subpath: components.next().map(Into::into),
                git_ref,
                raw: uses,
            }),
            _ => Err(UsesError(format!("owner/repo slug is too short: {uses}"))),
        }
    }

    /// The `owner/repo` slug.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Whether this `uses:` matches the given `owner/repo[/subpath]`
    /// template, ignoring the ref. Matching is case-insensitive.
    pub fn matches(&self, template: &str) -> bool {
        let (slug, subpath) = match template.splitn(3, '/').collect::<Vec<_>>()[..] {
            [owner, repo] => (format!("{owner}/{repo}"), None),
            [owner, repo, subpath] => (format!("{owner}/{repo}"), Some(subpath)),
            _ => return false,
        };

        if !slug.eq_ignore_ascii_case(&self.slug()) {
            return false;
        }

        match (subpath, self.subpath.as_deref()) {
            (None, None) => true,
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            _ => false,
        }
    }

    /// Whether this `uses:` is pinned to a commit hash.
    pub fn ref_is_commit(&self) -> bool {
        match &self.git_ref {
            Some(r) => r.len() == 40 && r.bytes().all(|b| b.is_ascii_hexdigit()),
            None => false,
        }
    }
}

/// A `uses: docker://some-image` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct DockerUses {
    /// The raw clause, without the `docker://` prefix.
    pub raw: String,
    /// The registry this image is on, if present.
    pub registry: Option<String>,
    /// The name of the Docker image.
    pub image: String,
    /// An optional tag for the image.
    pub tag: Option<String>,
    /// An optional integrity hash for the image.
    pub hash: Option<String>,
}

impl DockerUses {
    fn is_registry(registry: &str) -> bool {
        // https://stackoverflow.com/a/42116190
        registry == "localhost" || registry.contains('.') || registry.contains(':')
    }

    fn parse(uses: &str) -> Self {
        let (registry, image) = match uses.split_once('/') {
            Some((registry, image)) if Self::is_registry(registry) => {
                (Some(registry.to_string()), image)
            }
            _ => (None, uses),
        };

        if let Some((image, hash)) = image.split_once('@') {
            Self {
                raw: uses.to_string(),
                registry,
                image: image.to_string(),
                tag: None,
                hash: (!hash.is_empty()).then(|| hash.to_string()),
            }
        } else {
            let (image, tag) = match image.split_once(':') {
                Some((image, "")) => (image, None),
                Some((image, tag)) => (image, Some(tag.to_string())),
                None => (image, None),
            };

            Self {
                raw: uses.to_string(),
                registry,
                image: image.to_string(),
                tag,
                hash: None,
            }
        }
    }
}

/// Wraps a `de::Error::custom` call to log the same error as
/// a `tracing::error!` event.
///
/// This is useful when doing custom deserialization within untagged
/// enum variants, since serde loses track of the original error.
pub(crate) fn custom_error<'de, D>(msg: impl Display) -> D::Error
where
    D: Deserializer<'de>,
{
    let msg = msg.to_string();
    tracing::error!(msg);
    de::Error::custom(msg)
}

/// Deserialize an ordinary step `uses:`.
pub(crate) fn step_uses<'de, D>(de: D) -> Result<Uses, D::Error>
where
    D: Deserializer<'de>,
{
    let uses = <String>::deserialize(de)?;
    Uses::parse(uses).map_err(custom_error::<D>)
}

/// Deserialize a reusable workflow job `uses:`.
pub(crate) fn reusable_uses<'de, D>(de: D) -> Result<Uses, D::Error>
where
    D: Deserializer<'de>,
{
    let uses = step_uses(de)?;

    match uses {
        Uses::Repository(_) => Ok(uses),
        Uses::Local(ref local) => {
            // Local reusable workflows cannot be pinned.
            if local.path.contains('@') {
                Err(custom_error::<D>(
                    "local reusable workflow reference can't specify `@<ref>`",
                ))
            } else {
                Ok(uses)
            }
        }
        Uses::Docker(_) => Err(custom_error::<D>(
            "docker action invalid in reusable workflow `uses`",
        )),
    }
}
