//! Keel apply: converge the cluster toward a manifest object set.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Result};
use keel_core::ManifestObjectSet;

mod kubectl;
mod ssa;

pub use kubectl::{CommandOutput, CommandRunner, KubectlApplier, TokioCommandRunner};
pub use ssa::SsaApplier;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "keel";

/// Applies a whole object set.
///
/// `namespace` is the default for namespaced objects that carry none; an
/// empty string leaves every object's own namespace untouched.
#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, namespace: &str, objects: &ManifestObjectSet, validate: bool, extra_args: &[String]) -> Result<()>;
}

/// The subset of `kubectl apply` flags the reconciler emits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyArgs {
    pub force: bool,
    pub prune: bool,
    pub selector: Option<String>,
}

impl ApplyArgs {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut out = Self::default();
        let mut it = args.iter();
        while let Some(a) = it.next() {
            match a.as_str() {
                "--force" => out.force = true,
                "--prune" => out.prune = true,
                "--selector" | "-l" => {
                    let sel = it.next().ok_or_else(|| anyhow!("{} needs a value", a))?;
                    out.selector = Some(sel.clone());
                }
                s if s.starts_with("--selector=") => out.selector = Some(s["--selector=".len()..].to_string()),
                other => bail!("unsupported apply argument: {}", other),
            }
        }
        if out.prune && out.selector.as_deref().map_or(true, str::is_empty) {
            bail!("--prune requires a non-empty --selector");
        }
        Ok(out)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.force {
            v.push("--force".to_string());
        }
        if self.prune {
            v.push("--prune".to_string());
        }
        if let Some(sel) = &self.selector {
            v.push("--selector".to_string());
            v.push(sel.clone());
        }
        v
    }
}
