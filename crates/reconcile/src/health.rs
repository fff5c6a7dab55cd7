//! Aggregated health of the applied objects, written into `CommonStatus`.

use std::sync::Arc;

use futures::{stream, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use keel_core::{CommonStatus, DesiredState, ManifestObject, ManifestObjectSet};
use keel_kubehub::{DesiredStateStore, LiveLookup};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{config, StatusAggregator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    Current,
    Failed,
    InProgress,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Current => "Current",
            Health::Failed => "Failed",
            Health::InProgress => "InProgress",
        }
    }
}

/// Anything still progressing wins, then failures.
pub fn aggregate(items: impl IntoIterator<Item = Health>) -> Health {
    items.into_iter().max().unwrap_or(Health::Current)
}

fn failed_condition(live: &Json) -> Option<String> {
    live.pointer("/status/conditions")?.as_array()?.iter().find_map(|c| {
        let failed = c.get("type").and_then(Json::as_str) == Some("Failed") && c.get("status").and_then(Json::as_str) == Some("True");
        failed.then(|| c.get("message").and_then(Json::as_str).unwrap_or("failed").to_string())
    })
}

fn rollout(observed: Option<i64>, generation: Option<i64>, want: i32, ready: i32, updated: i32) -> Health {
    let caught_up = match (observed, generation) {
        (Some(o), Some(g)) => o >= g,
        (None, Some(_)) => false,
        _ => true,
    };
    if caught_up && ready >= want && updated >= want { Health::Current } else { Health::InProgress }
}

/// Classify one live object. `None` means it does not exist yet.
pub fn classify(kind: &str, live: Option<&Json>) -> (Health, Option<String>) {
    let Some(live) = live else { return (Health::InProgress, Some("not found".into())) };
    if let Some(msg) = failed_condition(live) {
        return (Health::Failed, Some(msg));
    }
    let health = match kind {
        "Deployment" => match serde_json::from_value::<Deployment>(live.clone()) {
            Ok(d) => {
                let st = d.status.unwrap_or_default();
                let deadline = st.conditions.iter().flatten().any(|c| c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
                if deadline {
                    return (Health::Failed, Some("progress deadline exceeded".into()));
                }
                let want = d.spec.and_then(|s| s.replicas).unwrap_or(1);
                rollout(st.observed_generation, d.metadata.generation, want, st.available_replicas.unwrap_or(0), st.updated_replicas.unwrap_or(0))
            }
            Err(_) => Health::Current,
        },
        "StatefulSet" => match serde_json::from_value::<StatefulSet>(live.clone()) {
            Ok(s) => {
                let st = s.status.unwrap_or_default();
                let want = s.spec.and_then(|s| s.replicas).unwrap_or(1);
                rollout(st.observed_generation, s.metadata.generation, want, st.ready_replicas.unwrap_or(0), st.updated_replicas.unwrap_or(0))
            }
            Err(_) => Health::Current,
        },
        "DaemonSet" => match serde_json::from_value::<DaemonSet>(live.clone()) {
            Ok(d) => {
                let st = d.status.unwrap_or_default();
                let want = st.desired_number_scheduled;
                rollout(st.observed_generation, d.metadata.generation, want, st.number_ready, st.updated_number_scheduled.unwrap_or(0))
            }
            Err(_) => Health::Current,
        },
        _ => Health::Current,
    };
    let reason = (health != Health::Current).then(|| "rollout in progress".to_string());
    (health, reason)
}

/// Looks up every applied object and persists the aggregated status when it changed.
pub struct HealthAggregator<D> {
    lookup: Arc<dyn LiveLookup>,
    store: Arc<dyn DesiredStateStore<D>>,
    concurrency: usize,
}

impl<D> HealthAggregator<D> {
    pub fn new(lookup: Arc<dyn LiveLookup>, store: Arc<dyn DesiredStateStore<D>>) -> Self {
        Self { lookup, store, concurrency: config::lookup_concurrency() }
    }

    async fn check(&self, obj: &ManifestObject, namespace: Option<&str>) -> (Health, Option<String>) {
        match self.lookup.get_live(obj, namespace).await {
            Ok(live) => classify(obj.kind(), live.as_ref()),
            Err(e) => (Health::InProgress, Some(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl<D: DesiredState> StatusAggregator<D> for HealthAggregator<D> {
    async fn reconciled(&self, obj: &D, objects: &ManifestObjectSet, namespace: &str) -> anyhow::Result<()> {
        let key = obj.key();
        let ns = Some(namespace).filter(|s| !s.is_empty());
        let checks: Vec<_> = objects.items.iter().map(|o| self.check(o, ns).boxed()).collect();
        let results: Vec<(Health, Option<String>)> = stream::iter(checks).buffered(self.concurrency.max(1)).collect().await;

        let health = aggregate(results.iter().map(|(h, _)| *h));
        let errors = objects
            .items
            .iter()
            .zip(&results)
            .filter_map(|(o, (_, why))| why.as_ref().map(|w| format!("{} {}: {}", o.kind(), o.key(), w)))
            .collect();
        let prev = obj.common_status().cloned().unwrap_or_default();
        let next = CommonStatus {
            healthy: health == Health::Current,
            errors,
            phase: Some(health.as_str().to_string()),
            observed_generation: obj.generation().or(prev.observed_generation),
        };
        if next == prev {
            debug!(object = %key, phase = %health.as_str(), "status unchanged");
            return Ok(());
        }
        let mut updated = obj.clone();
        updated.set_common_status(next);
        self.store.update_status(&updated).await?;
        info!(object = %key, phase = %health.as_str(), "status updated");
        Ok(())
    }
}
