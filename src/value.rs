//! A tagged value tree for free-form extrinsic args / event data, with a
//! canonical JSON encoding used both for persistence and for size checks.

use serde::{Deserialize, Serialize};

pub const MAX_SERIALIZED_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
	Null,
	Bool(bool),
	Number(f64),
	String(String),
	Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
	Array(Vec<Value>),
	Map(std::collections::BTreeMap<String, Value>),
}

mod hex_bytes {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&format!("0x{}", hex::encode(bytes)))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(d)?;
		hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
	}
}

/// Canonical JSON encoding: `Map` keys are sorted (guaranteed by `BTreeMap`),
/// no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
	serde_json::to_string(value).expect("Value serialization is infallible")
}

pub fn serialized_len(value: &Value) -> usize {
	canonical_json(value).len()
}

/// Replaces oversized values with an `{oversized: true, originalBytes: N}`
/// marker. A fixed point: re-truncating an already-truncated value is a
/// no-op, and values at or under the limit pass through unchanged.
pub fn truncate(value: Value) -> Value {
	let len = serialized_len(&value);
	if len <= MAX_SERIALIZED_BYTES {
		return value;
	}

	let mut map = std::collections::BTreeMap::new();
	map.insert("oversized".to_string(), Value::Bool(true));
	map.insert("originalBytes".to_string(), Value::Number(len as f64));
	Value::Map(map)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn big_string_value(len: usize) -> Value {
		Value::String("x".repeat(len))
	}

	#[test]
	fn truncate_is_identity_under_limit() {
		let v = big_string_value(10);
		assert_eq!(truncate(v.clone()), v);
	}

	#[test]
	fn truncate_is_a_fixed_point() {
		let v = big_string_value(5000);
		let once = truncate(v.clone());
		let twice = truncate(once.clone());
		assert_eq!(once, twice);
	}

	#[test]
	fn boundary_exactly_at_limit_is_preserved() {
		// `"..."` contributes 2 quote bytes; pick content length so total == 4096.
		let v = big_string_value(MAX_SERIALIZED_BYTES - 2);
		assert_eq!(serialized_len(&v), MAX_SERIALIZED_BYTES);
		assert_eq!(truncate(v.clone()), v);
	}

	#[test]
	fn boundary_one_byte_over_is_replaced() {
		let v = big_string_value(MAX_SERIALIZED_BYTES - 1);
		let len = serialized_len(&v);
		assert_eq!(len, MAX_SERIALIZED_BYTES + 1);
		let truncated = truncate(v);
		match truncated {
			Value::Map(m) => {
				assert_eq!(m.get("oversized"), Some(&Value::Bool(true)));
				assert_eq!(m.get("originalBytes"), Some(&Value::Number(len as f64)));
			},
			other => panic!("expected Map, got {other:?}"),
		}
	}
}
