//! `kubectl apply` driven through an injectable command runner.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use keel_core::ManifestObjectSet;
use metrics::{counter, histogram};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::Applier;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

pub struct TokioCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String], stdin: &str) -> Result<CommandOutput> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", program))?;
        if let Some(mut input) = child.stdin.take() {
            input.write_all(stdin.as_bytes()).await.context("writing manifest to stdin")?;
        }
        let out = child.wait_with_output().await.with_context(|| format!("waiting for {}", program))?;
        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

pub struct KubectlApplier {
    runner: Arc<dyn CommandRunner>,
    program: String,
    kubeconfig: Option<PathBuf>,
}

impl KubectlApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self { Self { runner, program: "kubectl".into(), kubeconfig: None } }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn build_args(&self, namespace: &str, validate: bool, extra_args: &[String]) -> Vec<String> {
        let mut args = vec!["apply".to_string()];
        if !namespace.is_empty() {
            args.extend(["-n".to_string(), namespace.to_string()]);
        }
        args.push(format!("--validate={}", validate));
        if let Some(k) = &self.kubeconfig {
            args.extend(["--kubeconfig".to_string(), k.display().to_string()]);
        }
        args.extend(extra_args.iter().cloned());
        args.extend(["-f".to_string(), "-".to_string()]);
        args
    }
}

#[async_trait::async_trait]
impl Applier for KubectlApplier {
    async fn apply(&self, namespace: &str, objects: &ManifestObjectSet, validate: bool, extra_args: &[String]) -> Result<()> {
        let t0 = Instant::now();
        let manifest = objects.to_yaml()?;
        let args = self.build_args(namespace, validate, extra_args);
        debug!(program = %self.program, args = ?args, "running");
        let out = self.runner.run(&self.program, &args, &manifest).await?;
        if !out.success {
            counter!("apply_err", 1u64);
            bail!("{} apply failed: {}", self.program, out.stderr.trim());
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        info!(output = %out.stdout.trim(), "kubectl apply complete");
        Ok(())
    }
}
