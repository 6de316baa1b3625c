//! PRD configuration overlay resolution.
//!
//! Merge order: project config → framework config → PRD-set config → PRD
//! config → phase config. Objects deep-merge; the named list fields are
//! unioned; every other array is replaced by the higher layer.

use serde_json::Value;

/// Dotted paths whose arrays are unioned instead of replaced.
const UNION_ARRAY_PATHS: &[&str] = &[
    "framework.rules",
    "codebase.searchDirs",
    "codebase.excludeDirs",
    "codebase.ignoreGlobs",
    "hooks.preTest",
    "hooks.postApply",
];

/// Merge overlay layers in order (earliest is the base, later layers win).
pub fn merge_overlays(layers: &[Value]) -> Value {
    let mut merged = Value::Object(serde_json::Map::new());
    for layer in layers {
        deep_merge(&mut merged, layer, "");
    }
    merged
}

fn deep_merge(base: &mut Value, overlay: &Value, path: &str) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value, &child_path),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (Value::Array(base_arr), Value::Array(overlay_arr))
            if UNION_ARRAY_PATHS.contains(&path) =>
        {
            for item in overlay_arr {
                if !base_arr.contains(item) {
                    base_arr.push(item.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
