//! Owner references stamped onto applied objects.

use keel_core::{DesiredState, Gvk, ManifestObject, ManifestObjectSet, ObjectKey};
use serde_json::{json, Value as Json};
use tracing::debug;

/// Object that should own a manifest object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub gvk: Gvk,
    pub key: ObjectKey,
    pub uid: Option<String>,
}

impl Owner {
    pub fn of<D: DesiredState>(obj: &D) -> Self { Self { gvk: obj.gvk(), key: obj.key(), uid: obj.uid() } }

    /// Controller reference for `candidate`, or `None` when this owner cannot
    /// legally own it.
    pub fn reference_for(&self, candidate: &ManifestObject) -> Option<Json> {
        let uid = self.uid.as_deref().filter(|u| !u.is_empty());
        let skip = if self.key.name.is_empty() {
            Some("owner has no name")
        } else if uid.is_none() {
            Some("owner has no uid")
        } else if self.gvk.group.is_empty() || self.gvk.version.is_empty() {
            Some("owner group/version is empty")
        } else {
            match (candidate.namespace(), self.key.namespace.as_deref()) {
                (Some(c), Some(o)) if c != o => Some("owner lives in another namespace"),
                _ => None,
            }
        };
        if let Some(reason) = skip {
            debug!(kind = %candidate.kind(), name = %candidate.name(), owner = %self.key, reason, "not injecting owner");
            return None;
        }
        Some(json!([{
            "apiVersion": self.gvk.api_version(),
            "blockOwnerDeletion": true,
            "controller": true,
            "kind": self.gvk.kind,
            "name": self.key.name,
            "uid": uid,
        }]))
    }
}

/// Picks the owner of each manifest object.
#[async_trait::async_trait]
pub trait OwnerResolver<D>: Send + Sync {
    async fn resolve(&self, obj: &D, candidate: &ManifestObject, objects: &ManifestObjectSet) -> anyhow::Result<Option<Owner>>;
}

/// The desired object owns everything it renders.
pub struct SourceAsOwner;

#[async_trait::async_trait]
impl<D: DesiredState> OwnerResolver<D> for SourceAsOwner {
    async fn resolve(&self, obj: &D, _candidate: &ManifestObject, _objects: &ManifestObjectSet) -> anyhow::Result<Option<Owner>> {
        Ok(Some(Owner::of(obj)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(ns: Option<&str>) -> ManifestObject {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}});
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = json!(ns);
        }
        ManifestObject::from_value(v).expect("object")
    }

    fn owner() -> Owner {
        Owner { gvk: Gvk::new("addons.keel.dev", "v1alpha1", "Addon"), key: ObjectKey::namespaced("ns", "dash"), uid: Some("u1".into()) }
    }

    #[test]
    fn builds_single_controller_reference() {
        let r = owner().reference_for(&cm(Some("ns"))).expect("reference");
        assert_eq!(
            r,
            json!([{"apiVersion": "addons.keel.dev/v1alpha1", "blockOwnerDeletion": true, "controller": true, "kind": "Addon", "name": "dash", "uid": "u1"}])
        );
        assert!(owner().reference_for(&cm(None)).is_some());
    }

    #[test]
    fn invalid_owners_are_skipped() {
        let mut no_uid = owner();
        no_uid.uid = Some(String::new());
        assert!(no_uid.reference_for(&cm(None)).is_none());

        let mut core = owner();
        core.gvk = Gvk::new("", "v1", "ConfigMap");
        assert!(core.reference_for(&cm(None)).is_none());

        let mut unnamed = owner();
        unnamed.key.name.clear();
        assert!(unnamed.reference_for(&cm(None)).is_none());

        assert!(owner().reference_for(&cm(Some("elsewhere"))).is_none());
    }
}
