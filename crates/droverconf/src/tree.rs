//! Loading and merging of JSON config trees.

use crate::ConfigError;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Load a list of JSON config files into one merged tree.
///
/// Files are applied in order; later files win. Objects merge key by key,
/// everything else (arrays included) is replaced wholesale.
pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Value, ConfigError> {
    let mut tree = Value::Object(Default::default());
    for path in paths {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                message: "top level must be a JSON object".to_string(),
            });
        }
        merge_values(&mut tree, value);
    }
    Ok(tree)
}

/// Merge `overlay` into `base`. Objects merge recursively, all other
/// values replace.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_values(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
