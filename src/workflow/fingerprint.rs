/// Deterministic content fingerprint of a task identity
///
/// SHA-256 over a canonical JSON rendering of (workflow_id, node_id, input).
/// Object keys are sorted recursively so logically equal inputs hash equally
/// no matter how the map was built.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprint of `(workflow_id, node_id, input)` as lowercase hex
pub fn fingerprint(workflow_id: &str, node_id: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(node_id.as_bytes());
    hasher.update([0u8]);

    let mut canonical = String::new();
    write_canonical(input, &mut canonical);
    hasher.update(canonical.as_bytes());

    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
