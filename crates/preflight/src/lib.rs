//! Keel preflight: blocks reconciliation of manifests that require a newer
//! engine than the one running.

#![forbid(unsafe_code)]

use keel_core::{DesiredState, ManifestObjectSet, OPERATOR_VERSION_ANNOTATION};
use metrics::counter;
use semver::Version;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("operator not qualified, manifest needs operator >= {required} (running {actual})")]
    VersionMismatch { required: Version, actual: Version },
}

impl GateError {
    /// Message written into the desired object's status.
    pub fn status_message(&self) -> String {
        match self {
            GateError::VersionMismatch { required, actual } => {
                format!("Addon needs version {}, this operator is version {}", required, actual)
            }
        }
    }
}

/// Compares the highest `operator-version` annotation in a set against the
/// engine's own version.
#[derive(Debug, Clone)]
pub struct VersionGate {
    engine: Option<Version>,
}

impl VersionGate {
    /// An unparsable engine version disables the gate instead of blocking everything.
    pub fn new(engine_version: &str) -> Self {
        let engine = match Version::parse(engine_version.trim()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(version = %engine_version, error = %e, "engine version is not semver; version gate disabled");
                None
            }
        };
        Self { engine }
    }

    pub fn engine_version(&self) -> Option<&Version> { self.engine.as_ref() }

    /// Highest valid requirement across the set; unparsable values are skipped.
    pub fn required_version(objects: &ManifestObjectSet) -> Option<Version> {
        let mut max: Option<Version> = None;
        for obj in objects.iter() {
            let Some(raw) = obj.annotation(OPERATOR_VERSION_ANNOTATION) else { continue };
            match Version::parse(raw.trim()) {
                Ok(v) => {
                    debug!(kind = %obj.kind(), name = %obj.name(), version = %v, "found version requirement");
                    if max.as_ref().map_or(true, |m| v > *m) {
                        max = Some(v);
                    }
                }
                Err(e) => {
                    warn!(kind = %obj.kind(), name = %obj.name(), version = %raw, error = %e, "unparsable operator-version annotation; skipping");
                }
            }
        }
        max
    }

    /// Pure decision over a set.
    pub fn evaluate(&self, objects: &ManifestObjectSet) -> Result<(), GateError> {
        let Some(engine) = &self.engine else { return Ok(()) };
        let Some(required) = Self::required_version(objects) else { return Ok(()) };
        if required > *engine {
            counter!("preflight_blocked_total", 1u64);
            return Err(GateError::VersionMismatch { required, actual: engine.clone() });
        }
        Ok(())
    }

    /// Evaluate and, on mismatch, mark the desired object's status unhealthy
    /// so the caller can persist it.
    pub fn check<D: DesiredState>(&self, obj: &mut D, objects: &ManifestObjectSet) -> Result<(), GateError> {
        let res = self.evaluate(objects);
        if let Err(e) = &res {
            let mut status = obj.common_status().cloned().unwrap_or_default();
            status.healthy = false;
            status.errors = vec![e.status_message()];
            info!(object = %obj.key(), error = %e, "version gate failed; marking unhealthy");
            obj.set_common_status(status);
        }
        res
    }
}
