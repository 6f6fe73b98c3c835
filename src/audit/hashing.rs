// =============================================================================
// Canonical hashing — SHA-256 over normalised JSON
// =============================================================================
//
// Every floating-point number is rounded to 8 fractional digits (banker's
// rounding) before serialisation and object keys are emitted in sorted
// order, so two structurally equal values always hash identically no matter
// how they were built.
// =============================================================================

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::baseline::stats::round_half_even;

const HASH_DECIMALS: u32 = 8;

/// Round every float inside `value` to [`HASH_DECIMALS`] places.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => match (n.is_f64(), n.as_f64()) {
            (true, Some(f)) => {
                let rounded = round_half_even(f, HASH_DECIMALS);
                Number::from_f64(rounded).map_or(Value::Null, Value::Number)
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        // serde_json's default Map is a BTreeMap, so keys come back sorted.
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        other => other,
    }
}

/// Canonical JSON text of `value`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> String {
    let json = match serde_json::to_value(value) {
        Ok(v) => normalize(v),
        Err(e) => {
            warn!(error = %e, "value not representable as JSON, hashing null");
            Value::Null
        }
    };
    json.to_string()
}

/// Hex-encoded SHA-256 of the canonical JSON of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn key_order_does_not_change_hash() {
        let mut a = HashMap::new();
        a.insert("zeta", 1.0);
        a.insert("alpha", 2.0);
        let b = json!({ "alpha": 2.0, "zeta": 1.0 });
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn sub_precision_noise_is_normalised_away() {
        let a = json!({ "score": 41.666_666_664 });
        let b = json!({ "score": 41.666_666_661 });
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
        let c = json!({ "score": 41.666_667 });
        assert_ne!(canonical_hash(&a), canonical_hash(&c));
    }

    #[test]
    fn integers_pass_through() {
        assert_eq!(canonical_json(&json!({ "n": 3, "s": "x" })), r#"{"n":3,"s":"x"}"#);
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = canonical_hash(&json!(null));
        assert_eq!(h.len(), 64);
        assert_eq!(h, sha256_hex(b"null"));
    }
}
