//! Content addressing: SHA-256 over canonical JSON.
//!
//! Canonical form is compact JSON with object keys sorted lexicographically at
//! every depth. The same logical value always yields the same bytes regardless
//! of how the map was built.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Result;

/// Serialize a JSON value in canonical form.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

/// Canonical bytes of any serializable value.
pub fn canonical_bytes_of<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json_bytes(&value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars (strings, numbers, bools, null) serialize infallibly into a Vec.
    if serde_json::to_writer(&mut *out, value).is_err() {
        out.extend_from_slice(b"null");
    }
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256:<hex>` address of a canonical JSON value.
pub fn content_address(value: &Value) -> String {
    format!("sha256:{}", sha256_hex(&canonical_json_bytes(value)))
}

/// Hash of a stage's inputs, bound to the stage id.
pub fn compute_input_hash(stage_id: &str, inputs: &Value) -> String {
    let payload = serde_json::json!({ "stage_id": stage_id, "inputs": inputs });
    sha256_hex(&canonical_json_bytes(&payload))
}

/// Hash of a stage's outputs, bound to the stage id.
pub fn compute_output_hash(stage_id: &str, outputs: &Value) -> String {
    let payload = serde_json::json!({ "stage_id": stage_id, "outputs": outputs });
    sha256_hex(&canonical_json_bytes(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let value = json!({ "b": 1, "a": { "z": true, "m": [ { "y": null, "x": "s" } ] } });
        let bytes = canonical_json_bytes(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"m":[{"x":"s","y":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn insertion_order_does_not_change_hash() {
        let mut first = serde_json::Map::new();
        first.insert("alpha".into(), json!(1));
        first.insert("beta".into(), json!("two"));
        let mut second = serde_json::Map::new();
        second.insert("beta".into(), json!("two"));
        second.insert("alpha".into(), json!(1));
        assert_eq!(
            content_address(&Value::Object(first)),
            content_address(&Value::Object(second))
        );
    }

    #[test]
    fn strings_are_escaped() {
        let bytes = canonical_json_bytes(&json!({ "q\"k": "line\nbreak" }));
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"q\"k":"line\nbreak"}"#);
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_address_has_prefix() {
        let addr = content_address(&json!({}));
        assert!(addr.starts_with("sha256:"));
        assert_eq!(addr.len(), "sha256:".len() + 64);
    }

    #[test]
    fn input_hash_is_bound_to_stage() {
        let inputs = json!({ "repo": "demo" });
        assert_ne!(
            compute_input_hash("s0_intake", &inputs),
            compute_input_hash("s1_prerequisites", &inputs)
        );
        assert_ne!(
            compute_input_hash("s0_intake", &inputs),
            compute_output_hash("s0_intake", &inputs)
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn canonical_form_ignores_insertion_order(
                pairs in proptest::collection::btree_map("[a-z]{1,8}", -1000i64..1000, 0..12)
            ) {
                let forward: serde_json::Map<String, Value> =
                    pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
                let reverse: serde_json::Map<String, Value> =
                    pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
                let forward = Value::Object(forward);
                let reverse = Value::Object(reverse);

                let bytes = canonical_json_bytes(&forward);
                prop_assert_eq!(&bytes, &canonical_json_bytes(&reverse));

                // Source text in reverse key order canonicalizes the same way.
                let reversed_text = format!(
                    "{{ {} }}",
                    pairs.iter().rev().map(|(k, v)| format!("\"{k}\" : {v}")).collect::<Vec<_>>().join(" , ")
                );
                let parsed: Value = serde_json::from_str(&reversed_text).unwrap();
                prop_assert_eq!(&bytes, &canonical_json_bytes(&parsed));

                // Keys come out sorted with no whitespace.
                let expected = format!(
                    "{{{}}}",
                    pairs.iter().map(|(k, v)| format!("\"{k}\":{v}")).collect::<Vec<_>>().join(",")
                );
                prop_assert_eq!(String::from_utf8(bytes.clone()).unwrap(), expected);

                let nested_forward = json!({ "inner": forward, "list": [parsed.clone()] });
                let nested_reverse = json!({ "list": [parsed], "inner": reverse });
                prop_assert_eq!(canonical_json_bytes(&nested_forward), canonical_json_bytes(&nested_reverse));
            }
        }
    }
}
