//! Observer that keeps a watch on every kind a desired object renders, so
//! drift on children triggers a new pass of their owner.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use keel_core::{DesiredState, Gvk, ManifestObjectSet, ObjectKey};
use keel_manifest::{selector_from, LabelMaker};
use keel_watch::{DynamicWatch, ListFilter};
use tokio::sync::Mutex;
use tracing::info;

use crate::Observer;

pub struct ChildWatcher<D> {
    watch: Arc<DynamicWatch>,
    labels: LabelMaker<D>,
    registered: Mutex<HashSet<(Gvk, ObjectKey)>>,
}

impl<D> ChildWatcher<D> {
    pub fn new(watch: Arc<DynamicWatch>, labels: LabelMaker<D>) -> Self {
        Self { watch, labels, registered: Mutex::new(HashSet::new()) }
    }
}

#[async_trait::async_trait]
impl<D: DesiredState> Observer<D> for ChildWatcher<D> {
    async fn notify(&self, obj: &D, objects: &ManifestObjectSet) -> anyhow::Result<()> {
        let target = obj.key();
        let selector = selector_from(&(self.labels)(obj));
        let kinds: BTreeSet<&Gvk> = objects.iter().map(|o| o.gvk()).collect();
        let mut registered = self.registered.lock().await;
        for gvk in kinds {
            let entry = (gvk.clone(), target.clone());
            if registered.contains(&entry) {
                continue;
            }
            let filter = ListFilter { label_selector: Some(selector.clone()).filter(|s| !s.is_empty()), ..Default::default() };
            self.watch.register(gvk, filter, target.clone()).await?;
            info!(gvk = %gvk, owner = %target, "watching children");
            registered.insert(entry);
        }
        Ok(())
    }
}
