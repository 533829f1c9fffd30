//! Chain-facing data model: the in-flight entities the core holds
//! invariants over (persistent shape lives in `crate::store::schema`).

use serde::{Deserialize, Serialize};

use crate::value::Value;

pub type Height = u32;
pub type Hash = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
	Best,
	Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
	ApplyExtrinsic(u32),
	Finalization,
	Initialization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExtrinsic {
	pub index_in_block: u32,
	pub hash: Option<Hash>,
	pub signer: Option<String>,
	pub module: String,
	pub call: String,
	pub args: Value,
	pub success: bool,
	pub fee: Option<u128>,
	pub tip: Option<u128>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
	pub index_in_block: u32,
	pub extrinsic_index: Option<u32>,
	pub module: String,
	pub event: String,
	pub data: Value,
	pub phase: Phase,
}

impl RawEvent {
	pub fn event_key(&self) -> String {
		format!("{}.{}", self.module, self.event)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
	pub height: Height,
	pub hash: Hash,
	pub parent_hash: Hash,
	pub state_root: Hash,
	pub extrinsics_root: Hash,
	pub timestamp: Option<u64>,
	pub validator_id: Option<String>,
	pub spec_version: u32,
	pub digest_logs: Vec<Value>,
	pub extrinsics: Vec<RawExtrinsic>,
	pub events: Vec<RawEvent>,
}

impl RawBlock {
	/// Checks the invariant `blockAt(h+1).parentHash == blockAt(h).hash` for
	/// this block against its claimed predecessor.
	pub fn links_to(&self, parent: &RawBlock) -> bool {
		self.parent_hash == parent.hash && self.height == parent.height + 1
	}
}

/// A header as delivered by `chain_subscribeNewHeads` /
/// `chain_subscribeFinalizedHeads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
	pub height: Height,
	pub hash: Hash,
	pub parent_hash: Hash,
}

/// Per-pallet summary computed once per spec version and cached by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalletSummary {
	pub calls: usize,
	pub events: usize,
	pub storage: usize,
	pub constants: usize,
	pub errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSummary {
	pub spec_version: u32,
	pub pallets: std::collections::BTreeMap<String, PalletSummary>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn block(height: Height, hash: &str, parent_hash: &str) -> RawBlock {
		RawBlock {
			height,
			hash: hash.to_string(),
			parent_hash: parent_hash.to_string(),
			state_root: "0x0".to_string(),
			extrinsics_root: "0x0".to_string(),
			timestamp: None,
			validator_id: None,
			spec_version: 1,
			digest_logs: vec![],
			extrinsics: vec![],
			events: vec![],
		}
	}

	#[test]
	fn links_to_checks_height_and_hash() {
		let a = block(10, "0xa", "0x9");
		let b = block(11, "0xb", "0xa");
		assert!(b.links_to(&a));
		assert!(!a.links_to(&b));
	}

	#[test]
	fn event_key_joins_module_and_event() {
		let event = RawEvent {
			index_in_block: 0,
			extrinsic_index: Some(0),
			module: "Balances".to_string(),
			event: "Transfer".to_string(),
			data: Value::Null,
			phase: Phase::ApplyExtrinsic(0),
		};
		assert_eq!(event.event_key(), "Balances.Transfer");
	}
}
