//! Keel kubehub: client acquisition, REST mapping and the cluster-facing
//! collaborators of the reconciler (live lookups, desired-state store, events).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use keel_core::Gvk;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod addon;
pub mod events;
pub mod live;
pub mod store;

pub use addon::{Addon, AddonSpec};
pub use events::{object_reference, EventRecorder, KubeEventRecorder};
pub use live::{KubeLiveLookup, LiveLookup, LookupError};
pub use store::{status_patch, DesiredStateStore, KubeStore, StoreError};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async {
            let c = Client::try_default().await.context("building kube client")?;
            info!(namespace = %c.default_namespace(), "kube client ready");
            Ok::<_, anyhow::Error>(c)
        })
        .await?;
    Ok(client.clone())
}

pub fn to_kube_gvk(gvk: &Gvk) -> GroupVersionKind {
    GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
}

/// Resolved REST endpoint of a kind.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// GVK → resource mapping backed by discovery, cached for the process lifetime.
///
/// Reads are lock-free; a miss performs one pinned discovery call and
/// publishes a new snapshot of the cache.
#[derive(Clone)]
pub struct RestMapper {
    client: Client,
    cache: Arc<ArcSwap<HashMap<Gvk, Mapping>>>,
}

impl RestMapper {
    pub fn new(client: Client) -> Self {
        Self { client, cache: Arc::new(ArcSwap::from_pointee(HashMap::new())) }
    }

    pub fn client(&self) -> &Client { &self.client }

    pub async fn mapping(&self, gvk: &Gvk) -> Result<Mapping> {
        if let Some(m) = self.cache.load().get(gvk) {
            return Ok(m.clone());
        }
        let (resource, caps) = discovery::pinned_kind(&self.client, &to_kube_gvk(gvk))
            .await
            .map_err(|e| anyhow!("no REST mapping for {}: {}", gvk, e))?;
        let mapping = Mapping { resource, namespaced: matches!(caps.scope, Scope::Namespaced) };
        debug!(gvk = %gvk, plural = %mapping.resource.plural, namespaced = mapping.namespaced, "resolved mapping");
        self.cache.rcu(|cur| {
            let mut next = HashMap::clone(cur);
            next.insert(gvk.clone(), mapping.clone());
            next
        });
        Ok(mapping)
    }

    /// Dynamic API for a kind. Namespaced kinds without a namespace get the all-namespaces view.
    pub async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let m = self.mapping(gvk).await?;
        Ok(dynamic_api(self.client.clone(), &m, namespace))
    }
}

pub fn dynamic_api(client: Client, m: &Mapping, namespace: Option<&str>) -> Api<DynamicObject> {
    match (m.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &m.resource),
        _ => Api::all_with(client, &m.resource),
    }
}

/// Drop server bookkeeping that is noise for consumers of raw objects.
pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}
