//! The manifest build pipeline: resolve → raw transforms → parse → object
//! transforms (+ labels) → optional post-processing → List expansion → sort.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use keel_core::{default_object_order, DesiredState, ManifestObjectSet, ObjectOrder};
use metrics::{counter, histogram};
use tracing::{debug, error, info};

use crate::parse::parse_objects;
use crate::transform::{AddLabels, LabelMaker, ObjectTransform, PostProcessor, RawTransform};
use crate::{BuildError, ManifestResolver};

/// Builds the ordered object set for a desired-state object.
pub struct ManifestBuilder<D> {
    resolver: Arc<dyn ManifestResolver<D>>,
    raw_transforms: Vec<Arc<dyn RawTransform<D>>>,
    object_transforms: Vec<Arc<dyn ObjectTransform<D>>>,
    label_maker: Option<LabelMaker<D>>,
    post_processor: Option<Arc<dyn PostProcessor<D>>>,
    order: ObjectOrder,
}

impl<D> Clone for ManifestBuilder<D> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            raw_transforms: self.raw_transforms.clone(),
            object_transforms: self.object_transforms.clone(),
            label_maker: self.label_maker.clone(),
            post_processor: self.post_processor.clone(),
            order: self.order,
        }
    }
}

impl<D: DesiredState> ManifestBuilder<D> {
    pub fn new(resolver: Arc<dyn ManifestResolver<D>>) -> Self {
        Self {
            resolver,
            raw_transforms: Vec::new(),
            object_transforms: Vec::new(),
            label_maker: None,
            post_processor: None,
            order: default_object_order,
        }
    }

    pub fn with_raw_transform(mut self, t: impl RawTransform<D> + 'static) -> Self {
        self.raw_transforms.push(Arc::new(t));
        self
    }

    pub fn with_object_transform(mut self, t: impl ObjectTransform<D> + 'static) -> Self {
        self.object_transforms.push(Arc::new(t));
        self
    }

    pub fn with_labels(mut self, maker: LabelMaker<D>) -> Self {
        self.label_maker = Some(maker);
        self
    }

    pub fn with_post_processor(mut self, p: impl PostProcessor<D> + 'static) -> Self {
        self.post_processor = Some(Arc::new(p));
        self
    }

    pub fn with_order(mut self, order: ObjectOrder) -> Self {
        self.order = order;
        self
    }

    pub fn label_maker(&self) -> Option<&LabelMaker<D>> { self.label_maker.as_ref() }

    /// Produce the complete, ordered set. Never returns a partial set.
    pub async fn build(&self, obj: &D) -> Result<ManifestObjectSet, BuildError> {
        let t0 = Instant::now();
        let key = obj.key();
        let res = self.build_inner(obj).await;
        match &res {
            Ok(set) => {
                histogram!("manifest_build_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(object = %key, objects = set.items.len(), blobs = set.blobs.len(), "built manifest");
            }
            Err(e) => {
                counter!("manifest_build_err", 1u64);
                error!(object = %key, error = %e, "manifest build failed");
            }
        }
        res
    }

    async fn build_inner(&self, obj: &D) -> Result<ManifestObjectSet, BuildError> {
        let files = self.resolver.resolve(obj).await.map_err(BuildError::Resolve)?;
        let mut out = ManifestObjectSet::default();
        for (path, mut text) in files {
            for t in &self.raw_transforms {
                text = t
                    .transform(obj, text)
                    .await
                    .map_err(|error| BuildError::RawTransform { path: path.clone(), error })?;
            }
            let objects = self
                .parse_and_transform(obj, &text)
                .await
                .map_err(|e| e.in_path(&path))?;
            debug!(path = %path, objects = objects.items.len(), "parsed manifest document");
            out.path = Path::new(&path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            out.extend(objects);
        }

        if let Some(post) = &self.post_processor {
            let yaml = out.to_yaml().map_err(BuildError::Parse)?;
            let processed = post.process(obj, yaml).await.map_err(BuildError::PostProcess)?;
            let replaced = self.parse_and_transform(obj, &processed).await?;
            out = ManifestObjectSet { path: out.path, ..replaced };
        }

        out.expand_lists().map_err(BuildError::Parse)?;
        out.sort(self.order);
        Ok(out)
    }

    async fn parse_and_transform(&self, obj: &D, text: &str) -> Result<ManifestObjectSet, BuildError> {
        let mut objects = parse_objects(text).map_err(BuildError::Parse)?;
        for t in &self.object_transforms {
            t.transform(obj, &mut objects).await.map_err(BuildError::ObjectTransform)?;
        }
        if let Some(maker) = &self.label_maker {
            AddLabels::new(Arc::clone(maker))
                .transform(obj, &mut objects)
                .await
                .map_err(BuildError::ObjectTransform)?;
        }
        Ok(objects)
    }
}
