//! Server-side apply with label-scoped pruning.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::{Gvk, ManifestObject, ManifestObjectSet, ObjectKey, IGNORE_ANNOTATION};
use keel_kubehub::{dynamic_api, RestMapper};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::{Applier, ApplyArgs, FIELD_MANAGER};

pub struct SsaApplier {
    mapper: RestMapper,
    field_manager: String,
}

impl SsaApplier {
    pub fn new(mapper: RestMapper) -> Self { Self { mapper, field_manager: FIELD_MANAGER.to_string() } }

    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    async fn patch_one(&self, obj: &ManifestObject, namespace: &str, pp: &PatchParams) -> Result<ObjectKey> {
        let mapping = self.mapper.mapping(obj.gvk()).await?;
        let client = self.mapper.client().clone();
        let ns = target_namespace(mapping.namespaced, obj.namespace(), namespace, client.default_namespace());
        let mut body = obj.raw().clone();
        if let (Some(ns), None) = (&ns, obj.namespace()) {
            body["metadata"]["namespace"] = Json::String(ns.clone());
        }
        let api = dynamic_api(client, &mapping, ns.as_deref());
        api.patch(obj.name(), pp, &Patch::Apply(&body))
            .await
            .with_context(|| format!("applying {} {}", obj.gvk(), obj.name()))?;
        Ok(ObjectKey::new(ns.as_deref(), obj.name()))
    }

    async fn prune(&self, applied: &BTreeMap<Gvk, BTreeSet<ObjectKey>>, selector: &str) -> Result<usize> {
        let mut removed = 0usize;
        for (gvk, keep) in applied {
            let mapping = self.mapper.mapping(gvk).await?;
            let api = dynamic_api(self.mapper.client().clone(), &mapping, None);
            let live = api
                .list(&ListParams::default().labels(selector))
                .await
                .with_context(|| format!("listing {} for prune", gvk))?;
            let raws = live.items.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()?;
            for key in prune_candidates(&raws, keep) {
                let scoped = dynamic_api(self.mapper.client().clone(), &mapping, key.namespace.as_deref());
                match scoped.delete(&key.name, &DeleteParams::default()).await {
                    Ok(_) => {
                        info!(gvk = %gvk, object = %key, "pruned");
                        removed += 1;
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 404 => debug!(gvk = %gvk, object = %key, "already gone"),
                    Err(e) => return Err(anyhow!("pruning {} {}: {}", gvk, key, e)),
                }
            }
        }
        Ok(removed)
    }
}

/// Namespace an object is applied into; `None` for cluster-scoped kinds.
fn target_namespace(namespaced: bool, own: Option<&str>, default: &str, client_default: &str) -> Option<String> {
    if !namespaced {
        return None;
    }
    let ns = own.filter(|s| !s.is_empty()).or(Some(default).filter(|s| !s.is_empty())).unwrap_or(client_default);
    Some(ns.to_string())
}

/// Live objects matched by the selector that the applied set no longer contains.
fn prune_candidates(live: &[Json], keep: &BTreeSet<ObjectKey>) -> Vec<ObjectKey> {
    live.iter()
        .filter(|o| o.pointer(&format!("/metadata/annotations/{}", IGNORE_ANNOTATION.replace('/', "~1"))).is_none())
        .filter_map(ObjectKey::from_raw)
        .filter(|k| !keep.contains(k))
        .collect()
}

/// Writes one object, for real or as a server dry run.
#[async_trait::async_trait]
trait ObjectPatcher: Send + Sync {
    async fn patch(&self, obj: &ManifestObject, namespace: &str, dry_run: bool) -> Result<ObjectKey>;
}

struct ApplyPatcher<'a> {
    applier: &'a SsaApplier,
    params: PatchParams,
}

#[async_trait::async_trait]
impl ObjectPatcher for ApplyPatcher<'_> {
    async fn patch(&self, obj: &ManifestObject, namespace: &str, dry_run: bool) -> Result<ObjectKey> {
        if dry_run {
            self.applier.patch_one(obj, namespace, &self.params.clone().dry_run()).await
        } else {
            self.applier.patch_one(obj, namespace, &self.params).await
        }
    }
}

/// Apply `objects` in order. With `validate`, each object is dry-run right
/// before its own write, so it can depend on namespaces and CRDs applied
/// earlier in the same set.
async fn apply_in_order(
    patcher: &dyn ObjectPatcher,
    objects: &ManifestObjectSet,
    namespace: &str,
    validate: bool,
) -> Result<BTreeMap<Gvk, BTreeSet<ObjectKey>>> {
    let mut applied: BTreeMap<Gvk, BTreeSet<ObjectKey>> = BTreeMap::new();
    for obj in objects.iter() {
        if validate {
            patcher
                .patch(obj, namespace, true)
                .await
                .with_context(|| format!("validation of {} {} failed", obj.kind(), obj.name()))?;
        }
        let key = patcher.patch(obj, namespace, false).await?;
        debug!(gvk = %obj.gvk(), object = %key, "applied");
        applied.entry(obj.gvk().clone()).or_default().insert(key);
    }
    Ok(applied)
}

#[async_trait::async_trait]
impl Applier for SsaApplier {
    async fn apply(&self, namespace: &str, objects: &ManifestObjectSet, validate: bool, extra_args: &[String]) -> Result<()> {
        let t0 = Instant::now();
        let args = ApplyArgs::parse(extra_args)?;
        if !objects.blobs.is_empty() {
            warn!(blobs = objects.blobs.len(), "unstructured documents cannot be applied server-side; skipping");
        }
        let mut params = PatchParams::apply(&self.field_manager);
        if args.force {
            params = params.force();
        }

        let patcher = ApplyPatcher { applier: self, params };
        let applied = match apply_in_order(&patcher, objects, namespace, validate).await {
            Ok(applied) => applied,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e);
            }
        };

        let pruned = match args.selector.as_deref() {
            Some(sel) if args.prune => self.prune(&applied, sel).await?,
            _ => 0,
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        info!(objects = objects.items.len(), pruned, "apply complete");
        Ok(())
    }
}
