//! Ordered collection of manifest objects plus unparsed blobs.

use tracing::debug;

use crate::{order, ManifestObject, ObjectOrder, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestObjectSet {
    pub items: Vec<ManifestObject>,
    /// Documents the parser could not interpret structurally; still applied verbatim.
    pub blobs: Vec<Vec<u8>>,
    /// Directory the manifests were loaded from (may be empty).
    pub path: String,
}

impl ManifestObjectSet {
    pub fn new(items: Vec<ManifestObject>) -> Self { Self { items, ..Default::default() } }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() && self.blobs.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &ManifestObject> { self.items.iter() }

    /// Append another set, keeping item and blob order.
    pub fn extend(&mut self, other: ManifestObjectSet) {
        self.items.extend(other.items);
        self.blobs.extend(other.blobs);
    }

    /// Stable sort into apply order.
    pub fn sort(&mut self, order: ObjectOrder) {
        self.items.sort_by(|a, b| order::compare(order, a, b));
    }

    /// Replace every `List` in place with its elements. Nested lists are expanded too.
    pub fn expand_lists(&mut self) -> Result<()> {
        if !self.items.iter().any(ManifestObject::is_list) {
            return Ok(());
        }
        let mut out = Vec::with_capacity(self.items.len());
        let mut pending: Vec<ManifestObject> = std::mem::take(&mut self.items);
        pending.reverse();
        while let Some(item) = pending.pop() {
            if item.is_list() {
                let children = item.list_items()?;
                debug!(count = children.len(), "expanding List");
                pending.extend(children.into_iter().rev());
            } else {
                out.push(item);
            }
        }
        self.items = out;
        Ok(())
    }

    /// Multi-document YAML of all items followed by the raw blobs.
    pub fn to_yaml(&self) -> Result<String> {
        let mut docs = Vec::with_capacity(self.items.len() + self.blobs.len());
        for item in &self.items {
            docs.push(item.to_yaml()?);
        }
        for blob in &self.blobs {
            docs.push(String::from_utf8_lossy(blob).into_owned());
        }
        let mut out = String::new();
        for doc in docs {
            out.push_str("---\n");
            out.push_str(doc.trim_start_matches("---\n"));
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_object_order;
    use serde_json::json;

    fn obj(api_version: &str, kind: &str, name: &str) -> ManifestObject {
        ManifestObject::from_value(json!({"apiVersion": api_version, "kind": kind, "metadata": {"name": name}}))
            .expect("valid")
    }

    #[test]
    fn expand_lists_preserves_relative_order() {
        let list = ManifestObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "l1"}},
                {"apiVersion": "v1", "kind": "List", "items": [
                    {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "l2"}}
                ]},
                {"apiVersion": "v1", "kind": "Service", "metadata": {"name": "l3"}}
            ]
        }))
        .expect("list");
        let mut set = ManifestObjectSet::new(vec![obj("v1", "ConfigMap", "before"), list, obj("v1", "ConfigMap", "after")]);
        set.expand_lists().expect("expand");
        let names: Vec<_> = set.iter().map(|o| o.name()).collect();
        assert_eq!(names, ["before", "l1", "l2", "l3", "after"]);
        assert!(set.iter().all(|o| !o.is_list()));
    }

    #[test]
    fn sort_is_independent_of_input_order() {
        let a = vec![
            obj("apps/v1", "Deployment", "web"),
            obj("v1", "Service", "web"),
            obj("v1", "ServiceAccount", "web"),
            obj("v1", "Namespace", "prod"),
        ];
        let mut b = a.clone();
        b.reverse();
        let mut sa = ManifestObjectSet::new(a);
        let mut sb = ManifestObjectSet::new(b);
        sa.sort(default_object_order);
        sb.sort(default_object_order);
        assert_eq!(sa, sb);
        let kinds: Vec<_> = sa.iter().map(|o| o.kind()).collect();
        assert_eq!(kinds, ["Namespace", "ServiceAccount", "Deployment", "Service"]);
    }

    #[test]
    fn to_yaml_emits_one_document_per_item_and_blob() {
        let mut set = ManifestObjectSet::new(vec![obj("v1", "ConfigMap", "a")]);
        set.blobs.push(b"not: [valid".to_vec());
        let y = set.to_yaml().expect("yaml");
        assert_eq!(y.matches("---\n").count(), 2);
        assert!(y.contains("name: a"));
        assert!(y.contains("not: [valid"));
    }
}
