//! Manifest sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use keel_core::DesiredState;
use tracing::debug;

/// Loads the raw manifest documents for a desired-state object, keyed by path.
#[async_trait::async_trait]
pub trait ManifestResolver<D>: Send + Sync {
    async fn resolve(&self, obj: &D) -> Result<BTreeMap<String, String>>;
}

/// Reads every `*.yaml` / `*.yml` file of a directory.
///
/// When the object names a manifest version and `<root>/<version>` exists,
/// that subdirectory is read instead.
#[derive(Debug, Clone)]
pub struct DirManifestResolver {
    root: PathBuf,
}

impl DirManifestResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    async fn pick_dir(&self, version: Option<String>) -> PathBuf {
        if let Some(v) = version.filter(|v| !v.is_empty() && !v.contains(['/', '\\']) && v != "..") {
            let candidate = self.root.join(v);
            if tokio::fs::metadata(&candidate).await.map(|m| m.is_dir()).unwrap_or(false) {
                return candidate;
            }
        }
        self.root.clone()
    }
}

#[async_trait::async_trait]
impl<D: DesiredState> ManifestResolver<D> for DirManifestResolver {
    async fn resolve(&self, obj: &D) -> Result<BTreeMap<String, String>> {
        let dir = self.pick_dir(obj.manifest_version()).await;
        read_manifest_dir(&dir).await
    }
}

pub async fn read_manifest_dir(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading manifest dir {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
        if !is_yaml || !entry.file_type().await?.is_file() {
            continue;
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading manifest {}", path.display()))?;
        debug!(path = %path.display(), bytes = text.len(), "loaded manifest");
        out.insert(path.to_string_lossy().into_owned(), text);
    }
    Ok(out)
}
