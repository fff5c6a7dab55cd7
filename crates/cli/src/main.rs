use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{Applier, KubectlApplier, SsaApplier, TokioCommandRunner};
use keel_core::{DesiredState, Gvk, ManifestObjectSet};
use keel_kubehub::{
    get_kube_client, Addon, AddonSpec, DesiredStateStore, KubeEventRecorder, KubeLiveLookup, KubeStore, LiveLookup, RestMapper,
};
use keel_manifest::{label_maker, DirManifestResolver, LabelMaker, ManifestBuilder};
use keel_preflight::VersionGate;
use keel_reconcile::{ChildWatcher, HealthAggregator, Reconciler, Runner, SourceAsOwner};
use keel_watch::{watch_delay, DynamicWatch, EventType, KindResolver, KubeWatchSource, ListFilter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Label stamped on everything an addon renders; also the prune selector.
const ADDON_LABEL: &str = "addons.keel.dev/addon";

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel addon controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the manifest for an addon offline and print it
    Render {
        /// Manifest directory (a `<dir>/<version>` subdirectory wins when present)
        #[arg(long = "manifests", env = "KEEL_MANIFESTS")]
        manifests: PathBuf,
        /// Addon name
        #[arg(long = "name", default_value = "addon")]
        name: String,
        /// Manifest version
        #[arg(long = "version")]
        version: Option<String>,
        /// Extra label stamped on every object (k=v), repeatable
        #[arg(long = "label", short = 'l')]
        labels: Vec<String>,
    },
    /// Check whether this engine may install a manifest
    Preflight {
        #[arg(long = "manifests", env = "KEEL_MANIFESTS")]
        manifests: PathBuf,
        #[arg(long = "version")]
        version: Option<String>,
        /// Engine version to check against (default: this binary's version)
        #[arg(long = "engine-version", env = "KEEL_ENGINE_VERSION")]
        engine_version: Option<String>,
    },
    /// Watch objects for a GVK and print +/~/- events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Label selector
        #[arg(long = "selector", short = 'l')]
        selector: Option<String>,
    },
    /// Run the Addon controller
    Run {
        #[arg(long = "manifests", env = "KEEL_MANIFESTS")]
        manifests: PathBuf,
        /// Delete previously applied objects that are no longer rendered
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        /// Apply through `kubectl` instead of server-side apply
        #[arg(long = "kubectl", action = ArgAction::SetTrue)]
        kubectl: bool,
        /// kubeconfig passed to kubectl
        #[arg(long = "kubeconfig", env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        /// Keep each object's own namespace instead of the addon's
        #[arg(long = "preserve-namespace", action = ArgAction::SetTrue)]
        preserve_namespace: bool,
        /// Skip server-side validation
        #[arg(long = "no-validate", action = ArgAction::SetTrue)]
        no_validate: bool,
        /// Also re-reconcile when rendered children change
        #[arg(long = "watch-children", action = ArgAction::SetTrue)]
        watch_children: bool,
        #[arg(long = "engine-version", env = "KEEL_ENGINE_VERSION")]
        engine_version: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_labels(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|l| match l.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(anyhow!("invalid label {:?} (expect key=value)", l)),
        })
        .collect()
}

fn engine_version(flag: Option<String>) -> String { flag.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()) }

fn addon_labels(extra: BTreeMap<String, String>) -> LabelMaker<Addon> {
    label_maker(move |a: &Addon| {
        let mut labels = extra.clone();
        labels.insert(ADDON_LABEL.to_string(), a.key().name);
        labels
    })
}

fn local_addon(name: &str, namespace: Option<String>, version: Option<String>) -> Addon {
    let mut a = Addon::new(name, AddonSpec { version });
    a.metadata.namespace = namespace;
    a
}

fn set_rows(set: &ManifestObjectSet) -> Vec<String> {
    let mut rows = vec![format!("{:<24} {:<16} {}", "KIND", "NAMESPACE", "NAME")];
    for o in set.iter() {
        rows.push(format!("{:<24} {:<16} {}", o.kind(), o.namespace().unwrap_or("-"), o.name()));
    }
    rows
}

fn print_set(set: &ManifestObjectSet, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for row in set_rows(set) {
                println!("{}", row);
            }
        }
        Output::Json => {
            let items: Vec<_> = set.iter().map(|o| o.raw().clone()).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

async fn shutdown_on_ctrl_c(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        return;
    }
    info!("shutting down");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { manifests, name, version, labels } => {
            let addon = local_addon(&name, cli.namespace, version);
            let builder = ManifestBuilder::new(Arc::new(DirManifestResolver::new(manifests)))
                .with_labels(addon_labels(parse_labels(&labels)?));
            let set = builder.build(&addon).await?;
            if !set.blobs.is_empty() {
                warn!(blobs = set.blobs.len(), "manifest contains unstructured documents");
            }
            print_set(&set, cli.output)?;
        }
        Commands::Preflight { manifests, version, engine_version: engine } => {
            let addon = local_addon("preflight", cli.namespace, version);
            let set = ManifestBuilder::new(Arc::new(DirManifestResolver::new(manifests))).build(&addon).await?;
            let engine = engine_version(engine);
            let gate = VersionGate::new(&engine);
            let required = VersionGate::required_version(&set);
            let verdict = gate.evaluate(&set);
            match cli.output {
                Output::Human => match &required {
                    Some(r) => println!("manifest requires >= {} • engine {}", r, engine),
                    None => println!("manifest has no version requirement • engine {}", engine),
                },
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "required": required.as_ref().map(|v| v.to_string()),
                        "engine": engine,
                        "ok": verdict.is_ok(),
                    }))?
                ),
            }
            verdict?;
        }
        Commands::Watch { gvk, selector } => {
            let gvk = Gvk::parse_key(&gvk)?;
            let client = get_kube_client().await?;
            let mapper = RestMapper::new(client.clone());
            let resource = mapper.resolve(&gvk).await?;
            let (watch, _triggers) = DynamicWatch::new(Arc::new(KubeWatchSource::new(client)), Arc::new(mapper), watch_delay());
            let shutdown = watch.shutdown_token();
            let mut filter = cli.namespace.map(ListFilter::in_namespace).unwrap_or_default();
            filter.label_selector = selector;
            let output = cli.output;
            let handle = watch.register_raw(resource, filter, move |ev| async move {
                let name = ev.key().map(|k| k.to_string()).unwrap_or_default();
                match output {
                    Output::Human => {
                        let sign = match ev.kind {
                            EventType::Added => "+",
                            EventType::Modified => "~",
                            EventType::Deleted => "-",
                            EventType::Error => "!",
                        };
                        println!("{} {}", sign, name);
                    }
                    Output::Json => println!("{}", serde_json::json!({"type": format!("{:?}", ev.kind), "object": ev.object})),
                }
            });
            tokio::spawn(shutdown_on_ctrl_c(shutdown));
            handle.await.context("watch task")?;
        }
        Commands::Run { manifests, prune, kubectl, kubeconfig, preserve_namespace, no_validate, watch_children, engine_version: engine } => {
            let client = get_kube_client().await?;
            let mapper = RestMapper::new(client.clone());
            let store: Arc<dyn DesiredStateStore<Addon>> = Arc::new(KubeStore::<Addon>::new(client.clone()));
            let lookup: Arc<dyn LiveLookup> = Arc::new(KubeLiveLookup::new(mapper.clone()));
            let applier: Arc<dyn Applier> = if kubectl {
                let k = KubectlApplier::new(Arc::new(TokioCommandRunner));
                Arc::new(match kubeconfig {
                    Some(p) => k.with_kubeconfig(p),
                    None => k,
                })
            } else {
                Arc::new(SsaApplier::new(mapper.clone()))
            };
            let labels = addon_labels(BTreeMap::new());
            let recorder = Arc::new(KubeEventRecorder::new(client.clone(), "keel"));

            let shutdown = CancellationToken::new();
            let (watch, triggers) =
                DynamicWatch::new(Arc::new(KubeWatchSource::new(client)), Arc::new(mapper), watch_delay());
            let watch = Arc::new(watch.with_shutdown(shutdown.clone()));

            let mut builder = Reconciler::builder()
                .with_store(Arc::clone(&store))
                .with_manifest(
                    ManifestBuilder::new(Arc::new(DirManifestResolver::new(manifests))).with_labels(labels.clone()),
                )
                .with_gate(VersionGate::new(&engine_version(engine)))
                .with_live_lookup(Arc::clone(&lookup))
                .with_owner(Arc::new(SourceAsOwner))
                .with_applier(applier)
                .with_status(Arc::new(HealthAggregator::new(lookup, store)))
                .with_recorder(recorder)
                .with_prune(prune)
                .preserve_namespace(preserve_namespace)
                .with_validate(!no_validate);
            if watch_children {
                builder = builder.with_observer(Arc::new(ChildWatcher::new(Arc::clone(&watch), labels)));
            }
            let reconciler = builder.build()?;

            let addon_gvk = local_addon("", None, None).gvk();
            let filter = cli.namespace.map(ListFilter::in_namespace).unwrap_or_default();
            if let Err(e) = watch.register_owned(&addon_gvk, filter).await {
                error!(gvk = %addon_gvk, error = %e, "cannot watch addons; is the CRD installed?");
                return Err(e);
            }
            tokio::spawn(shutdown_on_ctrl_c(shutdown.clone()));
            Runner::new(Arc::new(reconciler)).run(triggers, shutdown).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_as_key_value_pairs() {
        let l = parse_labels(&["a=1".to_string(), "b=".to_string()]).expect("labels");
        assert_eq!(l.get("a").map(String::as_str), Some("1"));
        assert_eq!(l.get("b").map(String::as_str), Some(""));
        assert!(parse_labels(&["novalue".to_string()]).is_err());
        assert!(parse_labels(&["=x".to_string()]).is_err());
    }

    #[test]
    fn addon_label_is_always_present() {
        let maker = addon_labels(BTreeMap::from([("team".to_string(), "core".to_string())]));
        let labels = maker(&local_addon("dns", Some("kube-system".into()), None));
        assert_eq!(labels.get(ADDON_LABEL).map(String::as_str), Some("dns"));
        assert_eq!(labels.get("team").map(String::as_str), Some("core"));
    }

    #[test]
    fn rendered_set_prints_as_a_table() {
        let set = ManifestObjectSet::new(vec![
            keel_core::ManifestObject::from_value(serde_json::json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "addons"}}))
                .expect("object"),
            keel_core::ManifestObject::from_value(
                serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "addons"}}),
            )
            .expect("object"),
        ]);
        let rows = set_rows(&set);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("KIND") && rows[0].ends_with("NAME"));
        assert_eq!(rows[1].split_whitespace().collect::<Vec<_>>(), ["Namespace", "-", "addons"]);
        assert_eq!(rows[2].split_whitespace().collect::<Vec<_>>(), ["Deployment", "addons", "web"]);
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["keelctl", "--ns", "addons", "run", "--manifests", "/m", "--prune", "--kubectl"]).expect("parse");
        assert_eq!(cli.namespace.as_deref(), Some("addons"));
        match cli.command {
            Commands::Run { prune, kubectl, no_validate, .. } => assert!(prune && kubectl && !no_validate),
            other => panic!("unexpected {:?}", other),
        }
    }
}
