//! Keel manifest builder: turns a desired-state object into the ordered set of
//! resources to converge toward.

#![forbid(unsafe_code)]

use keel_core::ManifestError;

pub mod builder;
pub mod parse;
pub mod resolver;
pub mod transform;

pub use builder::ManifestBuilder;
pub use parse::parse_objects;
pub use resolver::{read_manifest_dir, DirManifestResolver, ManifestResolver};
pub use transform::{label_maker, selector_from, AddLabels, LabelMaker, ObjectTransform, PostProcessor, RawTransform};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("resolving manifest: {0:#}")]
    Resolve(anyhow::Error),
    #[error("raw transform of {path}: {error:#}")]
    RawTransform { path: String, error: anyhow::Error },
    #[error("parsing manifest: {0}")]
    Parse(#[source] ManifestError),
    #[error("parsing manifest {path}: {error}")]
    ParseIn { path: String, error: ManifestError },
    #[error("object transform: {0:#}")]
    ObjectTransform(anyhow::Error),
    #[error("post-processing: {0:#}")]
    PostProcess(anyhow::Error),
}

impl BuildError {
    /// Attach the originating path to parse failures.
    pub(crate) fn in_path(self, path: &str) -> Self {
        match self {
            BuildError::Parse(error) => BuildError::ParseIn { path: path.to_string(), error },
            other => other,
        }
    }
}
