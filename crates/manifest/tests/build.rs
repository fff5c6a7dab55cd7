#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use keel_core::{CommonStatus, DesiredState, Gvk, ManifestObjectSet, ObjectKey};
use keel_manifest::{label_maker, BuildError, DirManifestResolver, ManifestBuilder, ManifestResolver, PostProcessor};

#[derive(Clone, Debug)]
struct TestAddon {
    name: String,
    version: Option<String>,
    status: Option<CommonStatus>,
}

impl TestAddon {
    fn new(name: &str) -> Self { Self { name: name.into(), version: None, status: None } }
}

impl DesiredState for TestAddon {
    fn key(&self) -> ObjectKey { ObjectKey::namespaced("addons", &self.name) }
    fn gvk(&self) -> Gvk { Gvk::new("addons.keel.dev", "v1alpha1", "Addon") }
    fn uid(&self) -> Option<String> { Some("uid-1".into()) }
    fn manifest_version(&self) -> Option<String> { self.version.clone() }
    fn common_status(&self) -> Option<&CommonStatus> { self.status.as_ref() }
    fn set_common_status(&mut self, status: CommonStatus) { self.status = Some(status); }
}

struct StaticResolver(BTreeMap<String, String>);

#[async_trait::async_trait]
impl ManifestResolver<TestAddon> for StaticResolver {
    async fn resolve(&self, _obj: &TestAddon) -> Result<BTreeMap<String, String>> { Ok(self.0.clone()) }
}

struct FailingResolver;

#[async_trait::async_trait]
impl ManifestResolver<TestAddon> for FailingResolver {
    async fn resolve(&self, _obj: &TestAddon) -> Result<BTreeMap<String, String>> { Err(anyhow!("channel unreachable")) }
}

const WORKLOAD: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{name}}
  namespace: addons
spec:
  replicas: 1
---
apiVersion: v1
kind: Service
metadata:
  name: {{name}}
  namespace: addons
"#;

const DEPS: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {{name}}
  namespace: addons
---
apiVersion: v1
kind: Namespace
metadata:
  name: addons
"#;

fn resolver(files: &[(&str, &str)]) -> Arc<dyn ManifestResolver<TestAddon>> {
    Arc::new(StaticResolver(files.iter().map(|(p, t)| (p.to_string(), t.to_string())).collect()))
}

fn templating(obj: &TestAddon, text: String) -> Result<String> { Ok(text.replace("{{name}}", &obj.name)) }

fn kinds(set: &ManifestObjectSet) -> Vec<&str> { set.iter().map(|o| o.kind()).collect() }

#[tokio::test]
async fn build_is_deterministic_and_orders_dependencies_first() {
    let addon = TestAddon::new("dash");
    let a = ManifestBuilder::new(resolver(&[("m/a.yaml", WORKLOAD), ("m/b.yaml", DEPS)])).with_raw_transform(templating);
    let b = ManifestBuilder::new(resolver(&[("m/a.yaml", DEPS), ("m/b.yaml", WORKLOAD)])).with_raw_transform(templating);

    let first = a.build(&addon).await.expect("build");
    let second = a.build(&addon).await.expect("build again");
    let swapped = b.build(&addon).await.expect("build swapped");

    assert_eq!(first, second);
    assert_eq!(first.items, swapped.items);
    assert_eq!(kinds(&first), ["Namespace", "ServiceAccount", "Deployment", "Service"]);
    assert_eq!(first.path, "m");
    assert!(first.iter().all(|o| o.name() == "dash" || o.kind() == "Namespace"));
}

#[tokio::test]
async fn list_wrappers_are_expanded() {
    let list = r#"
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: ConfigMap
  metadata: {name: c1}
- apiVersion: v1
  kind: ConfigMap
  metadata: {name: c2}
- apiVersion: v1
  kind: ConfigMap
  metadata: {name: c3}
"#;
    let set = ManifestBuilder::new(resolver(&[("l.yaml", list)])).build(&TestAddon::new("x")).await.expect("build");
    let names: Vec<_> = set.iter().map(|o| o.name()).collect();
    assert_eq!(names, ["c1", "c2", "c3"]);
    assert!(set.iter().all(|o| o.kind() != "List"));
}

#[tokio::test]
async fn raw_transform_failure_aborts_whole_build() {
    let builder = ManifestBuilder::new(resolver(&[("a.yaml", DEPS)]))
        .with_raw_transform(|_: &TestAddon, _: String| -> Result<String> { Err(anyhow!("template exploded")) });
    let err = builder.build(&TestAddon::new("x")).await.unwrap_err();
    assert!(matches!(err, BuildError::RawTransform { ref path, .. } if path == "a.yaml"), "{err}");
    assert!(err.to_string().contains("template exploded"));
}

#[tokio::test]
async fn resolver_failure_is_surfaced() {
    let err = ManifestBuilder::new(Arc::new(FailingResolver)).build(&TestAddon::new("x")).await.unwrap_err();
    assert!(matches!(err, BuildError::Resolve(_)));
    assert!(err.to_string().contains("channel unreachable"));
}

#[tokio::test]
async fn parse_errors_name_the_document() {
    let bad = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
    let err = ManifestBuilder::new(resolver(&[("bad.yaml", bad)])).build(&TestAddon::new("x")).await.unwrap_err();
    assert!(matches!(err, BuildError::ParseIn { ref path, .. } if path == "bad.yaml"), "{err}");
}

#[tokio::test]
async fn labels_are_injected_after_object_transforms() {
    let builder = ManifestBuilder::new(resolver(&[("a.yaml", DEPS)]))
        .with_raw_transform(templating)
        .with_object_transform(|_: &TestAddon, set: &mut ManifestObjectSet| -> Result<()> {
            let own = BTreeMap::from([("addon".to_string(), "from-transform".to_string())]);
            for item in set.items.iter_mut() {
                item.add_labels(&own)?;
            }
            Ok(())
        })
        .with_labels(label_maker(|o: &TestAddon| BTreeMap::from([("addon".to_string(), o.name.clone())])));
    let set = builder.build(&TestAddon::new("dash")).await.expect("build");
    for item in set.iter() {
        assert_eq!(item.labels().get("addon").map(String::as_str), Some("dash"));
    }
}

struct KeepOnlyServiceAccounts;

#[async_trait::async_trait]
impl PostProcessor<TestAddon> for KeepOnlyServiceAccounts {
    async fn process(&self, _obj: &TestAddon, manifest: String) -> Result<String> {
        let docs: Vec<&str> = manifest.split("---\n").filter(|d| d.contains("kind: ServiceAccount")).collect();
        Ok(docs.join("---\n"))
    }
}

#[tokio::test]
async fn post_processor_output_replaces_the_set() {
    let builder = ManifestBuilder::new(resolver(&[("a.yaml", DEPS), ("b.yaml", WORKLOAD)]))
        .with_raw_transform(templating)
        .with_labels(label_maker(|_: &TestAddon| BTreeMap::from([("managed".to_string(), "keel".to_string())])))
        .with_post_processor(KeepOnlyServiceAccounts);
    let set = builder.build(&TestAddon::new("dash")).await.expect("build");
    assert_eq!(kinds(&set), ["ServiceAccount"]);
    assert_eq!(set.items[0].labels().get("managed").map(String::as_str), Some("keel"));
}

#[tokio::test]
async fn dir_resolver_prefers_version_subdirectory() {
    let root = std::env::temp_dir().join(format!("keel-manifest-test-{}", std::process::id()));
    let versioned = root.join("1.2.0");
    tokio::fs::create_dir_all(&versioned).await.expect("mkdir");
    tokio::fs::write(root.join("base.yaml"), DEPS).await.expect("write base");
    tokio::fs::write(versioned.join("pinned.yml"), WORKLOAD).await.expect("write pinned");
    tokio::fs::write(versioned.join("README.md"), "ignored").await.expect("write readme");

    let resolver = DirManifestResolver::new(&root);
    let mut addon = TestAddon::new("dash");
    let files = ManifestResolver::<TestAddon>::resolve(&resolver, &addon).await.expect("resolve root");
    assert_eq!(files.len(), 1);
    assert!(files.keys().all(|k| k.ends_with("base.yaml")));

    addon.version = Some("1.2.0".into());
    let files = ManifestResolver::<TestAddon>::resolve(&resolver, &addon).await.expect("resolve versioned");
    assert_eq!(files.len(), 1);
    assert!(files.keys().all(|k| k.ends_with("pinned.yml")));

    let _ = tokio::fs::remove_dir_all(&root).await;
}
