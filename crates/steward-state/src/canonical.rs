use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes a JSON value with object keys sorted at every depth so the
/// same logical document always hashes to the same checksum, independent
/// of map insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub fn checksum_hex(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
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
        leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_checksum() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).expect("parse");
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).expect("parse");
        assert_eq!(checksum_hex(&a), checksum_hex(&b));
    }

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let value = json!({"b": [1, {"z": true, "a": null}], "a": "s"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":[1,{"a":null,"z":true}]}"#
        );
    }

    #[test]
    fn different_payloads_hash_differently() {
        assert_ne!(
            checksum_hex(&json!({"n": 1})),
            checksum_hex(&json!({"n": 2}))
        );
    }
}
