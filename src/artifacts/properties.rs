//! The `properties` file of an artifact record

use crate::pipeline::License;
use std::collections::BTreeMap;

/// Applies a dynamic properties file over `properties`
///
/// Each non-blank line is `key=value` (split on the first `=`) or a bare
/// `key`, which removes the key. Removing an absent key is not an error.
pub fn merge_dynamic(properties: &mut BTreeMap<String, String>, text: &str) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                properties.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                properties.remove(line);
            }
        }
    }
}

/// Builds the JSON document written to a record's `properties` file
#[must_use]
pub fn to_document(
    properties: &BTreeMap<String, String>,
    license: Option<&License>,
) -> serde_json::Value {
    let mut document: serde_json::Map<String, serde_json::Value> = properties
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    if let Some(license) = license {
        document.insert("license".to_string(), license.to_json());
    }
    serde_json::Value::Object(document)
}
