//! Access to the desired-state objects themselves.

use std::fmt::Debug;
use std::marker::PhantomData;

use k8s_openapi::NamespaceResourceScope;
use keel_core::{CommonStatus, DesiredState, ObjectKey};
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value as Json};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("encoding status: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Merge-patch body for a status write.
///
/// A merge patch leaves absent keys untouched, so every field is sent:
/// cleared errors as `[]`, unset optionals as `null`.
pub fn status_patch(status: Option<&CommonStatus>) -> Result<Json, StoreError> {
    let Some(status) = status else { return Ok(json!({ "status": null })) };
    let mut body = serde_json::to_value(status)?;
    if let Json::Object(fields) = &mut body {
        fields.insert("errors".into(), json!(status.errors));
        fields.entry("phase").or_insert(Json::Null);
        fields.entry("observedGeneration").or_insert(Json::Null);
    }
    Ok(json!({ "status": body }))
}

/// Read desired objects and write back their status.
#[async_trait::async_trait]
pub trait DesiredStateStore<D>: Send + Sync {
    /// `Ok(None)` when the object no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<D>, StoreError>;
    async fn update_status(&self, obj: &D) -> Result<(), StoreError>;
}

/// Store over a namespaced kube resource type.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, key: &ObjectKey) -> Api<K> {
        match &key.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl<K> DesiredStateStore<K> for KubeStore<K>
where
    K: DesiredState + Resource<DynamicType = (), Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Debug,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.api(key).get_opt(&key.name).await?)
    }

    async fn update_status(&self, obj: &K) -> Result<(), StoreError> {
        let key = obj.key();
        let status = status_patch(obj.common_status())?;
        self.api(&key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        debug!(object = %key, "status patched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(server: &Json, status: &CommonStatus) -> Json {
        let mut doc = server.clone();
        json_patch::merge(&mut doc, &status_patch(Some(status)).expect("patch"));
        doc
    }

    #[test]
    fn healthy_status_clears_previous_errors() {
        let gated = CommonStatus { phase: Some("InProgress".into()), observed_generation: Some(2), ..CommonStatus::unhealthy("needs 1.5.0") };
        let server = merged(&json!({"spec": {}}), &gated);
        assert_eq!(server["status"]["errors"], json!(["needs 1.5.0"]));

        let recovered = CommonStatus { healthy: true, ..Default::default() };
        let server = merged(&server, &recovered);
        assert_eq!(server["status"], json!({"healthy": true, "errors": []}));
        assert_eq!(serde_json::from_value::<CommonStatus>(server["status"].clone()).expect("status"), recovered);
        assert_eq!(server["spec"], json!({}));
    }

    #[test]
    fn missing_status_is_removed() {
        assert_eq!(status_patch(None).expect("patch"), json!({"status": null}));
    }
}
