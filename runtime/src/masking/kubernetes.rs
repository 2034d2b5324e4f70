//! Structural masking for Kubernetes Secret manifests.
//!
//! Regexes cannot reliably find every value inside a Secret, so this
//! masker parses the manifest and replaces the whole `data`/`stringData`
//! sections with a single placeholder. Replacing the sections wholesale
//! also keeps key names like `tls.crt` out of the output. ConfigMaps and
//! other kinds pass through untouched.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

use super::{CodeMasker, MaskingError};
use crate::masking::patterns::KUBERNETES_SECRET_MASKER;

/// Placeholder substituted for the entire data/stringData section.
pub const MASKED_SECRET_DATA: &str = "[MASKED_SECRET_DATA]";

static KIND_YAML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^kind:\s*Secret(List)?\s*$").expect("invalid kind yaml regex")
});

static KIND_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""kind"\s*:\s*"Secret(List)?""#).expect("invalid kind json regex")
});

/// Parse-aware masker for Kubernetes `Secret` and `SecretList` manifests,
/// JSON or YAML (including multi-document streams separated by `---`).
pub struct KubernetesSecretMasker;

impl CodeMasker for KubernetesSecretMasker {
    fn name(&self) -> &'static str {
        KUBERNETES_SECRET_MASKER
    }

    /// Cheap filter before any parsing happens: the content must mention
    /// `Secret` and carry a Secret-ish `kind` marker.
    fn applies_to(&self, content: &str) -> bool {
        content.contains("Secret")
            && (KIND_YAML_RE.is_match(content) || KIND_JSON_RE.is_match(content))
    }

    /// Mask every Secret in the content. Defensive by contract: any parse
    /// or serialization problem returns the input unchanged.
    fn mask(&self, content: &str) -> Result<String, MaskingError> {
        let trimmed = content.trim_start();
        let masked = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            mask_json(content)
        } else {
            mask_yaml(content)
        };
        Ok(masked.unwrap_or_else(|| content.to_string()))
    }
}

fn mask_json(content: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(content).ok()?;
    if !mask_resource(&mut value) {
        return None;
    }
    let mut out = serde_json::to_string_pretty(&value).ok()?;
    if content.ends_with('\n') && !out.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

fn mask_yaml(content: &str) -> Option<String> {
    let mut documents = Vec::new();
    let mut changed = false;
    for document in serde_yaml::Deserializer::from_str(content) {
        let mut value = Value::deserialize(document).ok()?;
        changed |= mask_resource(&mut value);
        documents.push(value);
    }
    if !changed || documents.is_empty() {
        return None;
    }

    let mut rendered = Vec::new();
    for value in &documents {
        // serde_yaml terminates each document with a newline already.
        rendered.push(serde_yaml::to_string(value).ok()?);
    }
    let mut out = rendered.join("---\n");
    if !content.ends_with('\n') {
        out.truncate(out.trim_end_matches('\n').len());
    }
    Some(out)
}

/// Mask one decoded resource in place. Returns whether anything changed.
fn mask_resource(value: &mut Value) -> bool {
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or_default()
        .to_string();

    if kind == "Secret" {
        return mask_secret(value);
    }

    // SecretList, ConfigMapList, List: walk the items and mask any Secret
    // found inside.
    if kind == "List" || kind.ends_with("List") {
        let Some(items) = value.get_mut("items").and_then(|i| i.as_array_mut()) else {
            return false;
        };
        let mut changed = false;
        for item in items {
            if item.get("kind").and_then(|k| k.as_str()) == Some("Secret") {
                changed |= mask_secret(item);
            }
        }
        return changed;
    }

    false
}

fn mask_secret(value: &mut Value) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    for section in ["data", "stringData"] {
        if obj.contains_key(section) {
            obj.insert(section.to_string(), Value::String(MASKED_SECRET_DATA.to_string()));
            changed = true;
        }
    }

    // Annotations can smuggle a serialized Secret (kubectl's
    // last-applied-configuration being the usual offender).
    if let Some(annotations) = obj
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(|a| a.as_object_mut())
    {
        for annotation in annotations.values_mut() {
            let Some(text) = annotation.as_str() else { continue };
            if !text.contains("Secret") {
                continue;
            }
            let Ok(mut nested) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            if nested.get("kind").and_then(|k| k.as_str()) == Some("Secret")
                && mask_secret(&mut nested)
            {
                if let Ok(serialized) = serde_json::to_string(&nested) {
                    *annotation = Value::String(serialized);
                    changed = true;
                }
            }
        }
    }

    changed
}
