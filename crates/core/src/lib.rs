//! Keel core types: manifest object model, apply ordering and the
//! desired-state capability every reconciled kind implements.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod object;
pub mod order;
pub mod set;
pub mod status;

pub use object::ManifestObject;
pub use order::{default_object_order, ObjectOrder};
pub use set::ManifestObjectSet;
pub use status::{CommonStatus, DesiredState};

/// Annotation carrying the minimum engine version a manifest needs.
pub const OPERATOR_VERSION_ANNOTATION: &str = "addons.k8s.io/operator-version";
/// Presence-only annotation: live objects carrying it are left alone.
pub const IGNORE_ANNOTATION: &str = "addons.k8s.io/ignore";

pub mod prelude {
    pub use super::{
        CommonStatus, DesiredState, Gvk, ManifestObject, ManifestObjectSet, ObjectKey, ObjectOrder,
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("missing field {field} in {context}")]
    MissingField { field: &'static str, context: String },
    #[error("object is not a mapping: {0}")]
    NotAnObject(String),
    #[error("refusing to modify identity field {0}")]
    IdentityField(String),
    #[error("field {path} is not an object")]
    NotTraversable { path: String },
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ManifestError> = std::result::Result<T, E>;

/// Group/Version/Kind triple. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` string (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Parse a key in the `v1/Kind` or `group/v1/Kind` form used throughout the CLI.
    pub fn parse_key(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(ManifestError::InvalidGvkKey(key.to_string())),
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Namespace/name identity of an object. `namespace` is `None` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.filter(|s| !s.is_empty()).map(str::to_string), name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Read `metadata.namespace` / `metadata.name` out of a raw object.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        let ns = meta.get("namespace").and_then(|v| v.as_str());
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
