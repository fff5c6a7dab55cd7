//! Desired-state capability and the status sub-structure every addon carries.

use serde::{Deserialize, Serialize};

use crate::{Gvk, ObjectKey};

/// Status shared by every reconciled kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonStatus {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CommonStatus {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self { healthy: false, errors: vec![error.into()], ..Default::default() }
    }
}

/// Anything with identity, spec and status the reconciler can drive.
///
/// Implementors are plain values: the controller clones one per pass and
/// submits status changes through the store rather than mutating shared state.
pub trait DesiredState: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn gvk(&self) -> Gvk;
    fn uid(&self) -> Option<String>;
    fn generation(&self) -> Option<i64> { None }
    fn resource_version(&self) -> Option<String> { None }
    /// Version hint used by manifest resolvers to pick a manifest variant.
    fn manifest_version(&self) -> Option<String> { None }
    fn common_status(&self) -> Option<&CommonStatus>;
    fn set_common_status(&mut self, status: CommonStatus);
}
