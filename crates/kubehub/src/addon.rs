//! The `Addon` custom resource.

use keel_core::{CommonStatus, DesiredState, Gvk, ObjectKey};
use kube::{CustomResource, Resource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "addons.keel.dev",
    version = "v1alpha1",
    kind = "Addon",
    namespaced,
    status = "CommonStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Manifest variant to install; the unversioned manifests when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DesiredState for Addon {
    fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace().as_deref(), self.name_any()) }

    fn gvk(&self) -> Gvk {
        Gvk::new(Addon::group(&()).into_owned(), Addon::version(&()).into_owned(), Addon::kind(&()).into_owned())
    }

    fn uid(&self) -> Option<String> { self.metadata.uid.clone() }
    fn generation(&self) -> Option<i64> { self.metadata.generation }
    fn resource_version(&self) -> Option<String> { self.metadata.resource_version.clone() }
    fn manifest_version(&self) -> Option<String> { self.spec.version.clone() }
    fn common_status(&self) -> Option<&CommonStatus> { self.status.as_ref() }
    fn set_common_status(&mut self, status: CommonStatus) { self.status = Some(status); }
}
