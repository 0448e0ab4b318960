//! Deterministic JSON encoding and SHA-256 hashing.
//!
//! Every cross-process integrity check in this service (decision hashes,
//! turn proof hashes, attestation payload hashes, policy hashes) derives
//! from the same canonical byte encoding. Changing this module changes
//! every hash this service has ever produced.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` to its canonical byte encoding: object keys sorted by
/// code-point order, arrays preserved in order, numbers emitted in their
/// shortest round-trip form.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    let json = serde_json::to_value(value).expect("canonical types must serialize");
    let mut buf = Vec::new();
    write_value(&json, &mut buf);
    buf
}

/// SHA-256 of the canonical encoding of `value`, as lowercase hex.
pub fn hash_hex<T: Serialize>(value: &T) -> String {
    hex::encode(hash_bytes(value))
}

/// SHA-256 of the canonical encoding of `value`, as raw bytes.
pub fn hash_bytes<T: Serialize>(value: &T) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(encode(value));
    hasher.finalize().into()
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(shortest_number(n).as_bytes()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(key, out);
                out.push(b':');
                write_value(&map[*key], out);
            }
            out.push(b'}');
        }
    }
}

/// Render a JSON number in the shortest form that round-trips: integral
/// values without a trailing `.0`, everything else via `serde_json`'s own
/// minimal `f64` formatting.
fn shortest_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    // Fall back to serde_json's own (already shortest round-trip) float
    // formatting; re-parse to strip a redundant trailing ".0" when the
    // value is mathematically integral but was only representable as f64.
    let raw = n.to_string();
    if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
            return format!("{}", f as i64);
        }
    }
    raw
}

fn write_json_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": 2, "c": 3});
        assert_eq!(encode(&v), br#"{"a":2,"b":1,"c":3}"#);
    }

    #[test]
    fn preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(encode(&v), b"[3,1,2]");
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let v = json!({"z": {"y": 1, "x": 2}, "a": [1, {"n": 1, "m": 2}]});
        assert_eq!(
            encode(&v),
            br#"{"a":[1,{"m":2,"n":1}],"z":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn integers_have_no_trailing_zero() {
        let v = json!({"price": 100.0, "qty": 3});
        assert_eq!(encode(&v), br#"{"price":100,"qty":3}"#);
    }

    #[test]
    fn fractional_numbers_keep_decimals() {
        let v = json!({"price": 100.25});
        assert_eq!(encode(&v), br#"{"price":100.25}"#);
    }

    #[test]
    fn empty_containers() {
        assert_eq!(encode(&json!({})), b"{}");
        assert_eq!(encode(&json!([])), b"[]");
    }

    #[test]
    fn unicode_keys_and_escapes() {
        let v = json!({"café": "line1\nline2\t\"quoted\""});
        let out = encode(&v);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"caf\u{e9}\":\"line1\\nline2\\t\\\"quoted\\\"\"}"
        );
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(hash_hex(&a), hash_hex(&b));

        let c = json!({"a": 1, "b": 3});
        assert_ne!(hash_hex(&a), hash_hex(&c));
    }
}
