//! (De)serialization helpers for the JSON/BLOB-encoded composite columns.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pim_api::AttributeMap;
use pim_core::{CachePolicy, ListPreferences};

pub fn encode_attributes(attrs: &AttributeMap) -> Vec<u8> {
    let as_b64: HashMap<&String, String> = attrs
        .iter()
        .map(|(k, v)| (k, BASE64.encode(v)))
        .collect();
    serde_json::to_vec(&as_b64).unwrap_or_default()
}

pub fn decode_attributes(bytes: &[u8]) -> AttributeMap {
    if bytes.is_empty() {
        return AttributeMap::new();
    }
    let as_b64: HashMap<String, String> = serde_json::from_slice(bytes).unwrap_or_default();
    as_b64
        .into_iter()
        .filter_map(|(k, v)| BASE64.decode(v).ok().map(|bytes| (k, bytes)))
        .collect()
}

pub fn encode_string_set(set: &HashSet<String>) -> String {
    let mut v: Vec<&String> = set.iter().collect();
    v.sort();
    serde_json::to_string(&v).unwrap_or_else(|_| "[]".into())
}

pub fn decode_string_set(s: &str) -> HashSet<String> {
    serde_json::from_str::<Vec<String>>(s)
        .unwrap_or_default()
        .into_iter()
        .collect()
}

pub fn encode_string_vec(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".into())
}

pub fn decode_string_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

pub fn encode_cache_policy(policy: &CachePolicy) -> String {
    serde_json::to_string(policy).unwrap_or_else(|_| "{}".into())
}

pub fn decode_cache_policy(s: &str) -> CachePolicy {
    serde_json::from_str(s).unwrap_or_default()
}

pub fn encode_list_preferences(prefs: &ListPreferences) -> String {
    serde_json::to_string(prefs).unwrap_or_else(|_| "{}".into())
}

pub fn decode_list_preferences(s: &str) -> ListPreferences {
    serde_json::from_str(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_roundtrip() {
        let mut attrs = AttributeMap::new();
        attrs.insert("mime".into(), vec![1, 2, 3, 255, 0]);
        attrs.insert("empty".into(), vec![]);
        let encoded = encode_attributes(&attrs);
        let decoded = decode_attributes(&encoded);
        assert_eq!(attrs, decoded);
    }

    #[test]
    fn string_set_roundtrip() {
        let mut set = HashSet::new();
        set.insert("SEEN".to_string());
        set.insert("X".to_string());
        let encoded = encode_string_set(&set);
        assert_eq!(decode_string_set(&encoded), set);
    }
}
