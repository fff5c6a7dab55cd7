//! Keel watch: long-lived, self-restarting watches that turn changes on
//! arbitrary kinds into reconcile triggers.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use keel_core::{Gvk, ObjectKey};
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod kube_source;

pub use kube_source::KubeWatchSource;

/// Pause between a watch closing and the next attempt.
pub const WATCH_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_TRIGGER_CAP: usize = 1024;

/// `KEEL_WATCH_DELAY_SECS` override of [`WATCH_DELAY`].
pub fn watch_delay() -> Duration {
    std::env::var("KEEL_WATCH_DELAY_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(WATCH_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: EventType,
    pub object: Json,
}

impl RawEvent {
    pub fn key(&self) -> Option<ObjectKey> { ObjectKey::from_raw(&self.object) }
}

/// Scope of a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListFilter {
    pub fn in_namespace(ns: impl Into<String>) -> Self { Self { namespace: Some(ns.into()), ..Default::default() } }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// A kind resolved to its REST resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
}

/// Change event correlated with the desired object it should wake.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub target: ObjectKey,
    pub event: RawEvent,
}

pub type EventStream = BoxStream<'static, Result<RawEvent>>;

/// Opens one watch session. The stream ending or yielding an error ends the session.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    async fn open(&self, resource: &ResourceRef, filter: &ListFilter) -> Result<EventStream>;
}

#[async_trait::async_trait]
pub trait KindResolver: Send + Sync {
    async fn resolve(&self, kind: &Gvk) -> Result<ResourceRef>;
}

#[async_trait::async_trait]
impl KindResolver for keel_kubehub::RestMapper {
    async fn resolve(&self, kind: &Gvk) -> Result<ResourceRef> {
        let m = self.mapping(kind).await?;
        Ok(ResourceRef { gvk: kind.clone(), plural: m.resource.plural, namespaced: m.namespaced })
    }
}

/// Registry of watches feeding one shared trigger channel.
pub struct DynamicWatch {
    source: Arc<dyn WatchSource>,
    resolver: Arc<dyn KindResolver>,
    delay: Duration,
    events: mpsc::Sender<TriggerEvent>,
    shutdown: CancellationToken,
}

impl DynamicWatch {
    pub fn new(
        source: Arc<dyn WatchSource>,
        resolver: Arc<dyn KindResolver>,
        delay: Duration,
    ) -> (Self, mpsc::Receiver<TriggerEvent>) {
        Self::with_capacity(source, resolver, delay, DEFAULT_TRIGGER_CAP)
    }

    pub fn with_capacity(
        source: Arc<dyn WatchSource>,
        resolver: Arc<dyn KindResolver>,
        delay: Duration,
        cap: usize,
    ) -> (Self, mpsc::Receiver<TriggerEvent>) {
        let (events, rx) = mpsc::channel(cap.max(1));
        (Self { source, resolver, delay, events, shutdown: CancellationToken::new() }, rx)
    }

    /// Tie every watch to an outer shutdown token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Watch `resource` forever, awaiting `callback` for each event in order.
    ///
    /// Each session starts without a resume point, so existing objects are
    /// replayed as `Added`. When a session ends the loop sleeps the fixed
    /// delay and reopens. Only the shutdown token stops it.
    pub fn register_raw<F, Fut>(&self, resource: ResourceRef, filter: ListFilter, callback: F) -> JoinHandle<()>
    where
        F: Fn(RawEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        let shutdown = self.shutdown.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            let gvk = resource.gvk.to_string();
            loop {
                match source.open(&resource, &filter).await {
                    Ok(mut stream) => {
                        info!(gvk = %gvk, ns = ?filter.namespace, labels = ?filter.label_selector, "watch started");
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                next = stream.next() => match next {
                                    Some(Ok(ev)) => {
                                        counter!("watch_events_total", 1u64);
                                        callback(ev).await;
                                    }
                                    Some(Err(e)) => {
                                        warn!(gvk = %gvk, error = %e, "watch failed");
                                        break;
                                    }
                                    None => {
                                        debug!(gvk = %gvk, "watch closed");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!(gvk = %gvk, error = %e, "opening watch failed"),
                }
                counter!("watch_restarts_total", 1u64);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// Watch `kind` and wake `target` on every change.
    pub async fn register(&self, kind: &Gvk, filter: ListFilter, target: ObjectKey) -> Result<JoinHandle<()>> {
        let resource = self.resolver.resolve(kind).await?;
        let tx = self.events.clone();
        Ok(self.register_raw(resource, filter, move |event| {
            let tx = tx.clone();
            let target = target.clone();
            async move {
                if tx.send(TriggerEvent { target, event }).await.is_err() {
                    debug!("trigger receiver dropped");
                }
            }
        }))
    }

    /// Watch `kind` and wake each event's own object.
    pub async fn register_owned(&self, kind: &Gvk, filter: ListFilter) -> Result<JoinHandle<()>> {
        let resource = self.resolver.resolve(kind).await?;
        let tx = self.events.clone();
        Ok(self.register_raw(resource, filter, move |event| {
            let tx = tx.clone();
            async move {
                let Some(target) = event.key() else {
                    debug!(kind = ?event.kind, "event without identity; dropped");
                    return;
                };
                if tx.send(TriggerEvent { target, event }).await.is_err() {
                    debug!("trigger receiver dropped");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder_sets_selectors() {
        let f = ListFilter::in_namespace("kube-system").labels("app=dns").fields("metadata.name=x");
        assert_eq!(f.namespace.as_deref(), Some("kube-system"));
        assert_eq!(f.label_selector.as_deref(), Some("app=dns"));
        assert_eq!(f.field_selector.as_deref(), Some("metadata.name=x"));
    }

    #[test]
    fn event_key_reads_metadata() {
        let ev = RawEvent {
            kind: EventType::Added,
            object: serde_json::json!({"metadata": {"name": "a", "namespace": "ns"}}),
        };
        assert_eq!(ev.key(), Some(ObjectKey::namespaced("ns", "a")));
    }
}
