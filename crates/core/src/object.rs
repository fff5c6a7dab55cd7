//! One parsed resource document.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::{Gvk, ManifestError, ObjectKey, Result};

/// A resource extracted from a rendered manifest.
///
/// Identity (group/version/kind/namespace/name) is captured at parse time and
/// cannot be changed afterwards; mutators refuse paths that would rewrite it.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    gvk: Gvk,
    namespace: Option<String>,
    name: String,
    raw: Json,
}

impl ManifestObject {
    /// Build from a raw JSON tree. `List` objects may omit `metadata.name`.
    pub fn from_value(raw: Json) -> Result<Self> {
        if !raw.is_object() {
            return Err(ManifestError::NotAnObject(truncate(&raw.to_string())));
        }
        let api_version = raw
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing("apiVersion", &raw))?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or_else(|| missing("kind", &raw))?;
        let gvk = Gvk::from_api_version(api_version, kind);
        let meta = raw.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str());
        let name = match name {
            Some(n) => n.to_string(),
            None if kind == "List" => String::new(),
            None => return Err(missing("metadata.name", &raw)),
        };
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Self { gvk, namespace, name, raw })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn group(&self) -> &str { &self.gvk.group }
    pub fn version(&self) -> &str { &self.gvk.version }
    pub fn kind(&self) -> &str { &self.gvk.kind }
    pub fn name(&self) -> &str { &self.name }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn key(&self) -> ObjectKey { ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() } }
    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    pub fn is_list(&self) -> bool { self.gvk.kind == "List" }

    pub fn annotations(&self) -> BTreeMap<String, String> { string_map(&self.raw, "annotations") }
    pub fn labels(&self) -> BTreeMap<String, String> { string_map(&self.raw, "labels") }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn nested_field(&self, path: &[&str]) -> Option<&Json> {
        path.iter().try_fold(&self.raw, |cur, seg| cur.get(*seg))
    }

    /// Set a nested field, creating intermediate objects. Identity paths are rejected.
    pub fn set_nested_field(&mut self, path: &[&str], value: Json) -> Result<()> {
        if touches_identity(path) {
            return Err(ManifestError::IdentityField(path.join(".")));
        }
        let Some((last, parents)) = path.split_last() else {
            return Err(ManifestError::IdentityField(String::new()));
        };
        let mut cur = &mut self.raw;
        for (i, seg) in parents.iter().enumerate() {
            let obj = cur
                .as_object_mut()
                .ok_or_else(|| ManifestError::NotTraversable { path: parents[..i].join(".") })?;
            cur = obj.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
        }
        let obj = cur
            .as_object_mut()
            .ok_or_else(|| ManifestError::NotTraversable { path: parents.join(".") })?;
        obj.insert(last.to_string(), value);
        Ok(())
    }

    /// Merge labels into `metadata.labels`; existing keys are overwritten, others kept.
    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let mut merged = match self.nested_field(&["metadata", "labels"]) {
            Some(Json::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        for (k, v) in labels {
            merged.insert(k.clone(), Json::String(v.clone()));
        }
        self.set_nested_field(&["metadata", "labels"], Json::Object(merged))
    }

    /// Element objects of a `List`; empty for any other kind.
    pub fn list_items(&self) -> Result<Vec<ManifestObject>> {
        if !self.is_list() {
            return Ok(Vec::new());
        }
        match self.raw.get("items") {
            None | Some(Json::Null) => Ok(Vec::new()),
            Some(Json::Array(items)) => items.iter().cloned().map(ManifestObject::from_value).collect(),
            Some(_) => Err(ManifestError::NotTraversable { path: "items".into() }),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(&self.raw)?) }
    pub fn to_yaml(&self) -> Result<String> { Ok(serde_yaml::to_string(&self.raw)?) }
}

fn touches_identity(path: &[&str]) -> bool {
    match path {
        [] => true,
        ["apiVersion", ..] | ["kind", ..] => true,
        ["metadata"] => true,
        ["metadata", "name", ..] | ["metadata", "namespace", ..] => true,
        _ => false,
    }
}

fn string_map(raw: &Json, field: &str) -> BTreeMap<String, String> {
    raw.get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn missing(field: &'static str, raw: &Json) -> ManifestError {
    ManifestError::MissingField { field, context: truncate(&raw.to_string()) }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 120;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) { end -= 1; }
    format!("{}…", &s[..end])
}
