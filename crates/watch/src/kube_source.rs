//! Watch sessions against the API server.

use anyhow::{Context, Result};
use futures::{future, StreamExt};
use keel_kubehub::{dynamic_api, strip_managed_fields, Mapping};
use kube::{
    api::{WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};

use crate::{EventStream, EventType, ListFilter, RawEvent, ResourceRef, WatchSource};

pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self { Self { client } }
}

fn to_raw(kind: EventType, obj: &DynamicObject) -> Result<RawEvent> {
    let mut object = serde_json::to_value(obj).context("serializing watched object")?;
    strip_managed_fields(&mut object);
    Ok(RawEvent { kind, object })
}

fn convert(ev: kube::Result<WatchEvent<DynamicObject>>) -> Option<Result<RawEvent>> {
    match ev {
        Ok(WatchEvent::Added(o)) => Some(to_raw(EventType::Added, &o)),
        Ok(WatchEvent::Modified(o)) => Some(to_raw(EventType::Modified, &o)),
        Ok(WatchEvent::Deleted(o)) => Some(to_raw(EventType::Deleted, &o)),
        Ok(WatchEvent::Bookmark(_)) => None,
        Ok(WatchEvent::Error(e)) => Some(
            serde_json::to_value(&e)
                .map(|object| RawEvent { kind: EventType::Error, object })
                .context("serializing watch error"),
        ),
        Err(e) => Some(Err(anyhow::Error::new(e).context("watch stream"))),
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeWatchSource {
    async fn open(&self, resource: &ResourceRef, filter: &ListFilter) -> Result<EventStream> {
        let gvk = keel_kubehub::to_kube_gvk(&resource.gvk);
        let mapping = Mapping { resource: ApiResource::from_gvk_with_plural(&gvk, &resource.plural), namespaced: resource.namespaced };
        let api = dynamic_api(self.client.clone(), &mapping, filter.namespace.as_deref());
        let mut wp = WatchParams::default();
        if let Some(l) = &filter.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &filter.field_selector {
            wp = wp.fields(f);
        }
        let stream = api.watch(&wp, "0").await.with_context(|| format!("watching {}", resource.gvk))?;
        Ok(stream.filter_map(|ev| future::ready(convert(ev))).boxed())
    }
}
