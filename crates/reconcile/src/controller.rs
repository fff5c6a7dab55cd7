//! One reconcile pass: fetch, build, gate, filter, own, apply, observe, status.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{stream, FutureExt, StreamExt};
use keel_apply::{Applier, ApplyArgs};
use keel_core::{DesiredState, ManifestObjectSet, ObjectKey, IGNORE_ANNOTATION};
use keel_kubehub::events::{reasons, EventType};
use keel_kubehub::{object_reference, DesiredStateStore, EventRecorder, LiveLookup};
use keel_manifest::{selector_from, ManifestBuilder};
use keel_preflight::{GateError, VersionGate};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config, Observer, OptionsError, Outcome, OwnerResolver, Phase, ReconcileError, StatusAggregator};

/// Run `fut` unless `cancel` fires first.
async fn guard<T>(cancel: &CancellationToken, phase: Phase, fut: impl Future<Output = T>) -> Result<T, ReconcileError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled(phase)),
        v = fut => Ok(v),
    }
}

fn is_ignored(live: &Json) -> bool {
    live.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(IGNORE_ANNOTATION))
        .is_some()
}

pub struct Reconciler<D> {
    store: Arc<dyn DesiredStateStore<D>>,
    manifest: ManifestBuilder<D>,
    gate: Option<VersionGate>,
    lookup: Option<Arc<dyn LiveLookup>>,
    owner: Option<Arc<dyn OwnerResolver<D>>>,
    applier: Arc<dyn Applier>,
    observer: Option<Arc<dyn Observer<D>>>,
    status: Option<Arc<dyn StatusAggregator<D>>>,
    recorder: Option<Arc<dyn EventRecorder>>,
    prune: bool,
    preserve_namespace: bool,
    validate: bool,
    lookup_concurrency: usize,
}

impl<D: DesiredState> Reconciler<D> {
    pub fn builder() -> ReconcilerBuilder<D> { ReconcilerBuilder::default() }

    /// Drive the object at `key` one step toward its desired state.
    ///
    /// There is no retry inside a pass; callers requeue on error.
    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        info!(object = %key, "reconciling");
        let res = self.reconcile_inner(key, cancel).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(Outcome::Gated { required, actual }) => {
                counter!("reconcile_gated_total", 1u64);
                warn!(object = %key, %required, %actual, "version check failed; not reconciling");
            }
            Ok(outcome) => debug!(object = %key, ?outcome, "pass finished"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                error!(object = %key, phase = %e.phase(), error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn reconcile_inner(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let fetched = guard(cancel, Phase::Fetching, self.store.get(key)).await?.map_err(ReconcileError::Fetch)?;
        let Some(mut obj) = fetched else {
            info!(object = %key, "desired object not found; nothing to do");
            return Ok(Outcome::NotFound);
        };

        let mut objects = guard(cancel, Phase::Building, self.manifest.build(&obj))
            .await?
            .map_err(ReconcileError::Build)?;
        info!(object = %key, objects = objects.items.len(), "built deployment objects");

        if let Some(gate) = &self.gate {
            if let Err(err) = gate.check(&mut obj, &objects) {
                if let Some(recorder) = &self.recorder {
                    let regarding = object_reference(&obj);
                    let note = err.to_string();
                    let publish = recorder.publish(&regarding, EventType::Warning, reasons::FAILED_VERSION_CHECK, &note);
                    guard(cancel, Phase::Gating, publish).await?;
                }
                if let Err(e) = guard(cancel, Phase::Gating, self.store.update_status(&obj)).await? {
                    warn!(object = %key, error = %e, "persisting gate status failed");
                }
                let GateError::VersionMismatch { required, actual } = err;
                return Ok(Outcome::Gated { required, actual });
            }
        }

        let namespace = if self.preserve_namespace { "" } else { key.namespace.as_deref().unwrap_or("") };
        let converged = self.converge(&obj, &mut objects, namespace, cancel).await;
        if let Err(ReconcileError::Cancelled(_)) = converged {
            return converged;
        }

        if let Some(status) = &self.status {
            if let Err(e) = guard(cancel, Phase::UpdatingStatus, status.reconciled(&obj, &objects, namespace)).await? {
                warn!(object = %key, error = %e, "failed to reconcile status");
            }
        }
        converged
    }

    async fn converge(
        &self,
        obj: &D,
        objects: &mut ManifestObjectSet,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ReconcileError> {
        if let Some(lookup) = &self.lookup {
            guard(cancel, Phase::Filtering, self.drop_ignored(lookup.as_ref(), objects, namespace)).await?;
        }
        if let Some(owner) = &self.owner {
            guard(cancel, Phase::OwnerInjection, inject_owner(owner.as_ref(), obj, objects)).await?;
        }

        let args = self.apply_args(obj);
        guard(cancel, Phase::Applying, self.applier.apply(namespace, objects, self.validate, &args))
            .await?
            .map_err(ReconcileError::Apply)?;

        if let Some(observer) = &self.observer {
            guard(cancel, Phase::NotifyingObservers, observer.notify(obj, objects))
                .await?
                .map_err(ReconcileError::Observer)?;
        }
        Ok(Outcome::Reconciled { objects: objects.items.len() })
    }

    /// Remove objects whose live counterpart carries the ignore annotation.
    async fn drop_ignored(&self, lookup: &dyn LiveLookup, objects: &mut ManifestObjectSet, namespace: &str) {
        let hint = Some(namespace).filter(|s| !s.is_empty());
        let checks: Vec<_> = objects
            .items
            .iter()
            .map(|o| {
                async move {
                    match lookup.get_live(o, hint).await {
                        Ok(Some(live)) if is_ignored(&live) => {
                            info!(kind = %o.kind(), name = %o.name(), "found ignore annotation on object; skipping");
                            false
                        }
                        Ok(_) => true,
                        Err(e) => {
                            warn!(kind = %o.kind(), name = %o.name(), error = %e, "unable to get live object");
                            true
                        }
                    }
                }
                .boxed()
            })
            .collect();
        let keep: Vec<bool> = stream::iter(checks).buffered(self.lookup_concurrency).collect().await;
        let items = std::mem::take(&mut objects.items);
        objects.items = items.into_iter().zip(keep).filter_map(|(o, k)| k.then_some(o)).collect();
    }

    fn apply_args(&self, obj: &D) -> Vec<String> {
        let labels = if self.prune { self.manifest.label_maker().map(|m| m(obj)) } else { None };
        ApplyArgs { force: true, prune: labels.is_some(), selector: labels.map(|l| selector_from(&l)) }.to_args()
    }
}

async fn inject_owner<D: DesiredState>(resolver: &dyn OwnerResolver<D>, obj: &D, objects: &mut ManifestObjectSet) {
    let snapshot = objects.clone();
    for item in objects.items.iter_mut() {
        let owner = match resolver.resolve(obj, item, &snapshot).await {
            Ok(Some(o)) => o,
            Ok(None) => {
                debug!(kind = %item.kind(), name = %item.name(), "no owner resolved");
                continue;
            }
            Err(e) => {
                warn!(kind = %item.kind(), name = %item.name(), error = %e, "resolving owner failed; skipping");
                continue;
            }
        };
        let Some(refs) = owner.reference_for(item) else { continue };
        if let Err(e) = item.set_nested_field(&["metadata", "ownerReferences"], refs) {
            warn!(kind = %item.kind(), name = %item.name(), error = %e, "setting owner reference failed");
        }
    }
}

pub struct ReconcilerBuilder<D> {
    store: Option<Arc<dyn DesiredStateStore<D>>>,
    manifest: Option<ManifestBuilder<D>>,
    gate: Option<VersionGate>,
    lookup: Option<Arc<dyn LiveLookup>>,
    owner: Option<Arc<dyn OwnerResolver<D>>>,
    applier: Option<Arc<dyn Applier>>,
    observer: Option<Arc<dyn Observer<D>>>,
    status: Option<Arc<dyn StatusAggregator<D>>>,
    recorder: Option<Arc<dyn EventRecorder>>,
    prune: bool,
    preserve_namespace: bool,
    validate: bool,
    lookup_concurrency: usize,
}

impl<D> Default for ReconcilerBuilder<D> {
    fn default() -> Self {
        Self {
            store: None,
            manifest: None,
            gate: None,
            lookup: None,
            owner: None,
            applier: None,
            observer: None,
            status: None,
            recorder: None,
            prune: false,
            preserve_namespace: false,
            validate: true,
            lookup_concurrency: config::lookup_concurrency(),
        }
    }
}

impl<D: DesiredState> ReconcilerBuilder<D> {
    pub fn with_store(mut self, store: Arc<dyn DesiredStateStore<D>>) -> Self { self.store = Some(store); self }
    pub fn with_manifest(mut self, manifest: ManifestBuilder<D>) -> Self { self.manifest = Some(manifest); self }
    pub fn with_gate(mut self, gate: VersionGate) -> Self { self.gate = Some(gate); self }
    pub fn with_live_lookup(mut self, lookup: Arc<dyn LiveLookup>) -> Self { self.lookup = Some(lookup); self }
    pub fn with_owner(mut self, owner: Arc<dyn OwnerResolver<D>>) -> Self { self.owner = Some(owner); self }
    pub fn with_applier(mut self, applier: Arc<dyn Applier>) -> Self { self.applier = Some(applier); self }
    pub fn with_observer(mut self, observer: Arc<dyn Observer<D>>) -> Self { self.observer = Some(observer); self }
    pub fn with_status(mut self, status: Arc<dyn StatusAggregator<D>>) -> Self { self.status = Some(status); self }
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self { self.recorder = Some(recorder); self }
    pub fn with_prune(mut self, prune: bool) -> Self { self.prune = prune; self }
    pub fn preserve_namespace(mut self, preserve: bool) -> Self { self.preserve_namespace = preserve; self }
    pub fn with_validate(mut self, validate: bool) -> Self { self.validate = validate; self }
    pub fn with_lookup_concurrency(mut self, n: usize) -> Self { self.lookup_concurrency = n.max(1); self }

    pub fn build(self) -> Result<Reconciler<D>, OptionsError> {
        let store = self.store.ok_or(OptionsError::MissingStore)?;
        let manifest = self.manifest.ok_or(OptionsError::MissingManifest)?;
        let applier = self.applier.ok_or(OptionsError::MissingApplier)?;
        if self.prune && manifest.label_maker().is_none() {
            return Err(OptionsError::PruneWithoutLabels);
        }
        Ok(Reconciler {
            store,
            manifest,
            gate: self.gate,
            lookup: self.lookup,
            owner: self.owner,
            applier,
            observer: self.observer,
            status: self.status,
            recorder: self.recorder,
            prune: self.prune,
            preserve_namespace: self.preserve_namespace,
            validate: self.validate,
            lookup_concurrency: self.lookup_concurrency.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ignore_annotation_is_presence_only() {
        let mut live = json!({"metadata": {"name": "x"}});
        assert!(!is_ignored(&live));
        live["metadata"]["annotations"][IGNORE_ANNOTATION] = json!("");
        assert!(is_ignored(&live));
    }

    #[tokio::test]
    async fn guard_prefers_cancellation() {
        let cancel = CancellationToken::new();
        assert_eq!(guard(&cancel, Phase::Applying, async { 7 }).await.expect("runs"), 7);
        cancel.cancel();
        let err = guard(&cancel, Phase::Applying, async { 7 }).await.unwrap_err();
        assert_eq!(err.phase(), Phase::Applying);
    }
}
