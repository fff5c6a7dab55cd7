//! Point lookups of the live counterpart of a manifest object.

use keel_core::ManifestObject;
use serde_json::Value as Json;
use tracing::trace;

use crate::{dynamic_api, strip_managed_fields, RestMapper};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("mapping {gvk}: {error:#}")]
    Mapping { gvk: String, error: anyhow::Error },
    #[error("get {kind} {name}: {error}")]
    Api { kind: String, name: String, error: kube::Error },
    #[error("decoding live object: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Fetches the live version of an object. `Ok(None)` means it does not exist.
#[async_trait::async_trait]
pub trait LiveLookup: Send + Sync {
    /// `namespace` is used when the object itself names none.
    async fn get_live(&self, obj: &ManifestObject, namespace: Option<&str>) -> Result<Option<Json>, LookupError>;
}

pub struct KubeLiveLookup {
    mapper: RestMapper,
}

impl KubeLiveLookup {
    pub fn new(mapper: RestMapper) -> Self { Self { mapper } }
}

#[async_trait::async_trait]
impl LiveLookup for KubeLiveLookup {
    async fn get_live(&self, obj: &ManifestObject, namespace: Option<&str>) -> Result<Option<Json>, LookupError> {
        let mapping = self
            .mapper
            .mapping(obj.gvk())
            .await
            .map_err(|error| LookupError::Mapping { gvk: obj.gvk().to_string(), error })?;
        let client = self.mapper.client().clone();
        let ns = obj.namespace().or(namespace).unwrap_or(client.default_namespace()).to_string();
        let api = dynamic_api(client, &mapping, Some(&ns));
        let found = api
            .get_opt(obj.name())
            .await
            .map_err(|error| LookupError::Api { kind: obj.kind().to_string(), name: obj.name().to_string(), error })?;
        trace!(kind = %obj.kind(), name = %obj.name(), ns = %ns, found = found.is_some(), "live lookup");
        match found {
            Some(o) => {
                let mut raw = serde_json::to_value(&o)?;
                strip_managed_fields(&mut raw);
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }
}
