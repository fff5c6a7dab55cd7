//! Keel reconcile: the controller that drives one desired-state object to
//! convergence per pass, plus the queue and runner that schedule passes.

#![forbid(unsafe_code)]

use std::fmt;

use keel_core::ManifestObjectSet;
use keel_kubehub::StoreError;
use keel_manifest::BuildError;
use semver::Version;

mod children;
pub mod config;
mod controller;
pub mod health;
pub mod owner;
pub mod queue;
pub mod runner;

pub use children::ChildWatcher;
pub use controller::{Reconciler, ReconcilerBuilder};
pub use health::{Health, HealthAggregator};
pub use owner::{Owner, OwnerResolver, SourceAsOwner};
pub use queue::WorkQueue;
pub use runner::Runner;

/// Steps of one pass, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Gating,
    Building,
    Filtering,
    OwnerInjection,
    Applying,
    NotifyingObservers,
    UpdatingStatus,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// Successful results of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reconciled { objects: usize },
    /// The desired object no longer exists.
    NotFound,
    /// Blocked by the version gate; nothing was applied.
    Gated { required: Version, actual: Version },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching desired object: {0}")]
    Fetch(StoreError),
    #[error("building manifest: {0}")]
    Build(BuildError),
    #[error("applying manifest: {0:#}")]
    Apply(anyhow::Error),
    #[error("notifying observer: {0:#}")]
    Observer(anyhow::Error),
    #[error("cancelled during {0}")]
    Cancelled(Phase),
}

impl ReconcileError {
    /// Phase the pass aborted in.
    pub fn phase(&self) -> Phase {
        match self {
            ReconcileError::Fetch(_) => Phase::Fetching,
            ReconcileError::Build(_) => Phase::Building,
            ReconcileError::Apply(_) => Phase::Applying,
            ReconcileError::Observer(_) => Phase::NotifyingObservers,
            ReconcileError::Cancelled(p) => *p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("a desired-state store is required")]
    MissingStore,
    #[error("a manifest builder is required")]
    MissingManifest,
    #[error("an applier is required")]
    MissingApplier,
    #[error("pruning requires a label maker on the manifest builder")]
    PruneWithoutLabels,
}

/// Receives the applied set after a successful apply.
#[async_trait::async_trait]
pub trait Observer<D>: Send + Sync {
    async fn notify(&self, obj: &D, objects: &ManifestObjectSet) -> anyhow::Result<()>;
}

/// Computes and persists the desired object's status after a pass.
///
/// `namespace` is the default the set was applied with; empty means each
/// object's own namespace, falling back to the client default.
#[async_trait::async_trait]
pub trait StatusAggregator<D>: Send + Sync {
    async fn reconciled(&self, obj: &D, objects: &ManifestObjectSet, namespace: &str) -> anyhow::Result<()>;
}
