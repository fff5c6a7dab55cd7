//! Apply-order policy.
//!
//! Objects other objects depend on (CRDs, namespaces, service accounts, RBAC,
//! config) sort ahead of the workloads that reference them. Services go last so
//! endpoints appear once their backends exist.

use crate::ManifestObject;

/// Priority function: lower values are applied first.
pub type ObjectOrder = fn(&ManifestObject) -> i32;

pub fn default_object_order(obj: &ManifestObject) -> i32 {
    match (obj.group(), obj.kind()) {
        ("apiextensions.k8s.io", "CustomResourceDefinition") => -1000,
        ("", "Namespace") => -900,
        ("", "ServiceAccount") => 1,
        ("rbac.authorization.k8s.io", "ClusterRole" | "Role") => 1,
        ("rbac.authorization.k8s.io", "ClusterRoleBinding" | "RoleBinding") => 2,
        ("", "ConfigMap" | "Secret") => 100,
        ("", "PersistentVolumeClaim") => 200,
        ("apps" | "extensions", "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet") => 1000,
        ("batch", "Job" | "CronJob") => 1000,
        ("", "Pod") => 1000,
        ("autoscaling", "HorizontalPodAutoscaler") => 1001,
        ("", "Service") => 10000,
        _ => 0,
    }
}

/// Total order: priority, then name, namespace and finally GVK key so equal
/// priorities never depend on input order.
pub(crate) fn compare(order: ObjectOrder, a: &ManifestObject, b: &ManifestObject) -> std::cmp::Ordering {
    order(a)
        .cmp(&order(b))
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.namespace().cmp(&b.namespace()))
        .then_with(|| a.gvk().cmp(b.gvk()))
}
