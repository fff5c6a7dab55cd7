//! Pluggable build stages.
//!
//! Each stage is a trait so implementations can do I/O (template rendering,
//! fetching overlays). Plain closures implement the raw and object stages for
//! the common synchronous case.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use keel_core::{DesiredState, ManifestObjectSet};

/// Text-level rewrite applied to each raw document before parsing.
#[async_trait::async_trait]
pub trait RawTransform<D>: Send + Sync {
    async fn transform(&self, obj: &D, manifest: String) -> Result<String>;
}

#[async_trait::async_trait]
impl<D, F> RawTransform<D> for F
where
    D: DesiredState,
    F: Fn(&D, String) -> Result<String> + Send + Sync,
{
    async fn transform(&self, obj: &D, manifest: String) -> Result<String> {
        self(obj, manifest)
    }
}

/// Structural rewrite over the parsed objects of one document.
#[async_trait::async_trait]
pub trait ObjectTransform<D>: Send + Sync {
    async fn transform(&self, obj: &D, objects: &mut ManifestObjectSet) -> Result<()>;
}

#[async_trait::async_trait]
impl<D, F> ObjectTransform<D> for F
where
    D: DesiredState,
    F: Fn(&D, &mut ManifestObjectSet) -> Result<()> + Send + Sync,
{
    async fn transform(&self, obj: &D, objects: &mut ManifestObjectSet) -> Result<()> {
        self(obj, objects)
    }
}

/// Whole-set post-processing (overlays, patches). Receives the accumulated set
/// as multi-document YAML; its output replaces the set entirely.
#[async_trait::async_trait]
pub trait PostProcessor<D>: Send + Sync {
    async fn process(&self, obj: &D, manifest: String) -> Result<String>;
}

/// Computes the labels stamped on every object and used as the prune selector.
pub type LabelMaker<D> = Arc<dyn Fn(&D) -> BTreeMap<String, String> + Send + Sync>;

/// Label injection stage appended after every configured object transform.
pub struct AddLabels<D> {
    maker: LabelMaker<D>,
}

impl<D> AddLabels<D> {
    pub fn new(maker: LabelMaker<D>) -> Self { Self { maker } }
}

#[async_trait::async_trait]
impl<D: DesiredState> ObjectTransform<D> for AddLabels<D> {
    async fn transform(&self, obj: &D, objects: &mut ManifestObjectSet) -> Result<()> {
        let labels = (self.maker)(obj);
        for item in objects.items.iter_mut() {
            item.add_labels(&labels)?;
        }
        Ok(())
    }
}

/// Convenience wrapper turning a closure into a [`LabelMaker`].
pub fn label_maker<D, F>(f: F) -> LabelMaker<D>
where
    F: Fn(&D) -> BTreeMap<String, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Format labels as a `k=v,k2=v2` selector in key order.
pub fn selector_from(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}
