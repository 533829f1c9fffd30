//! RPC Pool: N WebSocket JSON-RPC endpoints with health/latency routing and
//! automatic failover, plus the chain-facing convenience methods the
//! ingestion pipeline needs.

pub mod pool;

pub use pool::{EndpointState, RpcPool};

use serde_json::json;

use crate::chain::{Hash, Header, Height};
use crate::errors::RpcError;

/// The subset of Substrate RPC methods the pipeline consumes
/// (`chain_subscribeNewHeads`, `chain_subscribeFinalizedHeads`,
/// `chain_getBlockHash`, `chain_getBlock`, `chain_getHeader`,
/// `state_getMetadata`, `state_getStorage`). Payload shapes are the chain
/// protocol's; this crate only consumes them.
pub struct ChainRpc {
	pool: std::sync::Arc<RpcPool>,
}

impl ChainRpc {
	pub fn new(pool: std::sync::Arc<RpcPool>) -> Self {
		Self { pool }
	}

	pub async fn block_hash(&self, height: Height) -> Result<Hash, RpcError> {
		self.pool.call("chain_getBlockHash", vec![json!(height)]).await
	}

	pub async fn header(&self, hash: &Hash) -> Result<Header, RpcError> {
		self.pool.call("chain_getHeader", vec![json!(hash)]).await
	}

	pub async fn finalized_head(&self) -> Result<Hash, RpcError> {
		self.pool.call("chain_getFinalizedHead", vec![]).await
	}

	pub async fn metadata(&self, at: &Hash) -> Result<String, RpcError> {
		self.pool.call("state_getMetadata", vec![json!(at)]).await
	}

	pub async fn storage(&self, key: &str, at: &Hash) -> Result<Option<String>, RpcError> {
		self.pool.call("state_getStorage", vec![json!(key), json!(at)]).await
	}
}
