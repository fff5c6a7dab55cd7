//! Permissive multi-document parser.
//!
//! Documents that are valid YAML mappings with `apiVersion` and `kind` become
//! [`ManifestObject`]s. Anything else that is not empty (broken YAML, bare
//! scalars, template leftovers) is kept verbatim as a blob so it still reaches
//! the applier.

use keel_core::{ManifestError, ManifestObject, ManifestObjectSet};
use serde_json::Value as Json;
use tracing::debug;

pub fn parse_objects(text: &str) -> Result<ManifestObjectSet, ManifestError> {
    let mut set = ManifestObjectSet::default();
    for doc in split_documents(text) {
        if is_blank(&doc) {
            continue;
        }
        match classify(&doc)? {
            Parsed::Object(o) => set.items.push(o),
            Parsed::Blob => {
                debug!(bytes = doc.len(), "keeping unstructured document as blob");
                set.blobs.push(doc.into_bytes());
            }
            Parsed::Empty => {}
        }
    }
    Ok(set)
}

enum Parsed {
    Object(ManifestObject),
    Blob,
    Empty,
}

fn classify(doc: &str) -> Result<Parsed, ManifestError> {
    let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(doc) else {
        return Ok(Parsed::Blob);
    };
    if yaml.is_null() {
        return Ok(Parsed::Empty);
    }
    let Ok(json) = serde_json::to_value(yaml) else {
        return Ok(Parsed::Blob);
    };
    if !looks_like_object(&json) {
        return Ok(Parsed::Blob);
    }
    ManifestObject::from_value(json).map(Parsed::Object)
}

fn looks_like_object(v: &Json) -> bool {
    v.get("apiVersion").map_or(false, Json::is_string) && v.get("kind").map_or(false, Json::is_string)
}

fn is_blank(doc: &str) -> bool {
    doc.lines().all(|l| {
        let t = l.trim();
        t.is_empty() || t.starts_with('#')
    })
}

/// Split on `---` separator lines. Content following `--- ` on the same line
/// belongs to the next document.
fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut cur = String::new();
    for line in text.lines() {
        if let Some(rest) = separator(line) {
            docs.push(std::mem::take(&mut cur));
            let rest = rest.trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                cur.push_str(rest);
                cur.push('\n');
            }
            continue;
        }
        if line.trim_end() == "..." {
            continue;
        }
        cur.push_str(line);
        cur.push('\n');
    }
    docs.push(cur);
    docs
}

fn separator(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("---")?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest),
        _ => None,
    }
}
