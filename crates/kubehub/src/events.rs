//! Kubernetes Events about desired-state objects.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! the caller.

use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;
use keel_core::DesiredState;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, warn};

/// `type` of a core/v1 Event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

pub mod reasons {
    pub const FAILED_VERSION_CHECK: &str = "Failed version check";
}

/// Reference to `obj` as an Event's `involvedObject`.
pub fn object_reference<D: DesiredState>(obj: &D) -> ObjectReference {
    let key = obj.key();
    ObjectReference {
        api_version: Some(obj.gvk().api_version()),
        kind: Some(obj.gvk().kind),
        name: Some(key.name),
        namespace: key.namespace,
        uid: obj.uid(),
        ..Default::default()
    }
}

#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: &str);
}

/// Creates core/v1 Events through the API server.
pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self { Self { client, component: component.into() } }

    fn event(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: &str) -> Event {
        let now = Utc::now();
        let name = regarding.name.clone().unwrap_or_default();
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", name)),
                namespace: regarding.namespace.clone(),
                ..Default::default()
            },
            involved_object: regarding.clone(),
            type_: Some(type_.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(note.to_string()),
            action: Some("Reconcile".to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            reporting_component: Some(self.component.clone()),
            reporting_instance: Some(self.component.clone()),
            source: Some(EventSource { component: Some(self.component.clone()), host: None }),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: &str) {
        let api: Api<Event> = match regarding.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        let event = self.event(regarding, type_, reason, note);
        match api.create(&PostParams::default(), &event).await {
            Ok(_) => debug!(object = ?regarding.name, reason, "event published"),
            Err(e) => warn!(object = ?regarding.name, reason, error = %e, "publishing event failed"),
        }
    }
}
