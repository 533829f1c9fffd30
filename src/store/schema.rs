//! Row shapes matching `migrations/V1__init.sql`. These exist to satisfy the
//! Block Processor's persistence contract; they are not a query API.

use sqlx::types::Json;

use crate::chain::{BlockStatus, Phase};
use crate::value::Value;

#[derive(Debug, sqlx::FromRow)]
pub struct BlockRow {
	pub height: i64,
	pub hash: String,
	pub parent_hash: String,
	pub state_root: String,
	pub extrinsics_root: String,
	pub timestamp: Option<i64>,
	pub validator_id: Option<String>,
	pub spec_version: i32,
	pub digest_logs: Json<Vec<Value>>,
	pub status: String,
}

impl BlockRow {
	pub fn status(&self) -> BlockStatus {
		match self.status.as_str() {
			"finalized" => BlockStatus::Finalized,
			_ => BlockStatus::Best,
		}
	}
}

pub fn status_to_str(status: BlockStatus) -> &'static str {
	match status {
		BlockStatus::Best => "best",
		BlockStatus::Finalized => "finalized",
	}
}

pub fn phase_to_str(phase: &Phase) -> String {
	match phase {
		Phase::ApplyExtrinsic(i) => format!("ApplyExtrinsic({i})"),
		Phase::Finalization => "Finalization".to_string(),
		Phase::Initialization => "Initialization".to_string(),
	}
}
