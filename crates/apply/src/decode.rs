//! Manifest stream decoding: a `---` separated YAML stream, or concatenated JSON values.

use serde::Deserialize;
use serde_json::Value as Json;

/// Size and shape bounds for one manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self { max_bytes: 1 << 20, max_nodes: 100_000 }
    }
}

impl ManifestLimits {
    /// Defaults overridden by `EPHEMERA_MAX_MANIFEST_BYTES` / `EPHEMERA_MAX_MANIFEST_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bytes: env_usize("EPHEMERA_MAX_MANIFEST_BYTES").unwrap_or(d.max_bytes),
            max_nodes: env_usize("EPHEMERA_MAX_MANIFEST_NODES").unwrap_or(d.max_nodes),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

pub(crate) fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter, bail early once max is passed
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Decode `manifest` into documents, in order. Decoding stops at the first failure, which is the
/// last item returned.
pub(crate) fn documents(manifest: &str) -> Vec<Result<Json, String>> {
    let decoded: Box<dyn Iterator<Item = Result<Json, String>> + '_> = if manifest.trim_start().starts_with('{') {
        Box::new(
            serde_json::Deserializer::from_str(manifest)
                .into_iter::<Json>()
                .map(|r| r.map_err(|e| format!("parsing JSON: {}", e))),
        )
    } else {
        Box::new(serde_yaml::Deserializer::from_str(manifest).map(|de| {
            let val = serde_yaml::Value::deserialize(de).map_err(|e| format!("parsing YAML: {}", e))?;
            serde_json::to_value(val).map_err(|e| format!("converting YAML to JSON: {}", e))
        }))
    };
    // the YAML deserializer keeps yielding the same error once it hit one
    let mut docs = Vec::new();
    for doc in decoded {
        let failed = doc.is_err();
        docs.push(doc);
        if failed {
            break;
        }
    }
    docs
}
