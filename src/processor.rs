//! Block Processor: writes one decoded block (block + extrinsics + events +
//! account upserts) inside one transaction, invoking plugin handlers within
//! that transaction, retrying the whole transaction on deadlock.

use std::time::Duration;

use rand::Rng;

use crate::chain::{BlockStatus, RawBlock};
use crate::errors::{PipelineError, StoreError};
use crate::plugins::{HandlerContext, PluginRegistry};
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 3;

/// Runs `process_once` up to `MAX_ATTEMPTS` times total, retrying on a
/// store-reported deadlock or a handler failure (§7: "retried up to 3 times
/// total, same policy as deadlocks") with delay `50 + rand(0..150) * attempt`
/// ms. Any other error propagates immediately without a retry.
pub async fn process(
	store: &Store,
	registry: &PluginRegistry,
	block: &RawBlock,
	status: BlockStatus,
) -> anyhow::Result<()> {
	let mut attempt = 0u32;
	loop {
		attempt += 1;
		match process_once(store, registry, block, status).await {
			Ok(()) => return Ok(()),
			Err(err) => {
				let is_deadlock = err
					.downcast_ref::<StoreError>()
					.map(|e| matches!(e, StoreError::Deadlock))
					.unwrap_or(false);
				let is_handler_failure = err
					.downcast_ref::<PipelineError>()
					.map(|e| matches!(e, PipelineError::HandlerFailed(_)))
					.unwrap_or(false);

				if !(is_deadlock || is_handler_failure) || attempt >= MAX_ATTEMPTS {
					return Err(err);
				}

				let jitter_ms = rand::thread_rng().gen_range(0..150);
				let delay = Duration::from_millis(50 + jitter_ms * attempt as u64);
				tracing::warn!(height = block.height, attempt, "retrying after {delay:?}");
				tokio::time::sleep(delay).await;
			},
		}
	}
}

async fn process_once(
	store: &Store,
	registry: &PluginRegistry,
	block: &RawBlock,
	status: BlockStatus,
) -> anyhow::Result<()> {
	let mut tx = match store.begin_block_transaction().await {
		Ok(tx) => tx,
		Err(err) => return Err(classify(err).into()),
	};

	let result: anyhow::Result<()> = async {
		Store::upsert_block(&mut tx, block, status).await.map_err(classify)?;

		{
			let mut ctx = HandlerContext { tx: &mut tx };
			registry.invoke_block_handlers(&mut ctx, block).await?;
		}

		let mut extrinsic_ids = std::collections::HashMap::new();
		for extrinsic in &block.extrinsics {
			let truncated = crate::value::truncate(extrinsic.args.clone());
			Store::upsert_extrinsic(&mut tx, block.height, extrinsic, &truncated)
				.await
				.map_err(classify)?;
			extrinsic_ids
				.insert(extrinsic.index_in_block, format!("{}-{}", block.height, extrinsic.index_in_block));

			if let Some(signer) = &extrinsic.signer {
				Store::upsert_account(&mut tx, signer, block.height).await.map_err(classify)?;
			}

			let mut ctx = HandlerContext { tx: &mut tx };
			registry.invoke_extrinsic_handlers(&mut ctx, extrinsic).await?;
		}

		for event in &block.events {
			if let crate::chain::Phase::ApplyExtrinsic(i) = event.phase {
				anyhow::ensure!(
					extrinsic_ids.contains_key(&i),
					"event {} references extrinsic index {i} with no matching extrinsic in block {}",
					event.index_in_block,
					block.height
				);
			}
			let extrinsic_id = match event.phase {
				crate::chain::Phase::ApplyExtrinsic(i) => extrinsic_ids.get(&i).map(String::as_str),
				_ => None,
			};
			Store::upsert_event(&mut tx, block.height, event, extrinsic_id).await.map_err(classify)?;

			for account in extract_accounts(&event.data) {
				Store::upsert_account(&mut tx, &account, block.height).await.map_err(classify)?;
			}

			let mut ctx = HandlerContext { tx: &mut tx };
			registry.invoke_event_handlers(&mut ctx, event).await?;
		}

		Ok(())
	}
	.await;

	match result {
		Ok(()) => {
			tx.commit().await.map_err(|e| classify(StoreError::from(e)))?;
			Ok(())
		},
		Err(err) => {
			tx.rollback().await.ok();
			Err(err)
		},
	}
}

fn classify(err: StoreError) -> anyhow::Error {
	if let StoreError::Connection(sqlx_err) = &err {
		if StoreError::is_deadlock(sqlx_err) {
			return StoreError::Deadlock.into();
		}
	}
	err.into()
}

/// Account-extraction heuristic (Open Question #3, resolved in DESIGN.md):
/// walk map keys matching a known set of account-ish field names whose value
/// looks like an address (32-byte `bytes` node or a hex/SS58-shaped string).
fn extract_accounts(data: &crate::value::Value) -> Vec<String> {
	const ACCOUNT_FIELD_NAMES: &[&str] =
		&["account", "who", "from", "to", "beneficiary", "stash", "controller"];

	let mut found = Vec::new();
	walk_for_accounts(data, ACCOUNT_FIELD_NAMES, &mut found);
	found
}

fn walk_for_accounts(value: &crate::value::Value, field_names: &[&str], out: &mut Vec<String>) {
	use crate::value::Value;
	match value {
		Value::Map(map) => {
			for (key, v) in map {
				if field_names.iter().any(|name| key.eq_ignore_ascii_case(name)) {
					if let Some(account) = account_like(v) {
						out.push(account);
					}
				}
				walk_for_accounts(v, field_names, out);
			}
		},
		Value::Array(items) => {
			for item in items {
				walk_for_accounts(item, field_names, out);
			}
		},
		_ => {},
	}
}

fn account_like(value: &crate::value::Value) -> Option<String> {
	use crate::value::Value;
	match value {
		Value::Bytes(bytes) if bytes.len() == 32 => Some(format!("0x{}", hex::encode(bytes))),
		Value::String(s) if s.starts_with("0x") && s.len() == 66 => Some(s.clone()),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::value::Value;

	#[test]
	fn extracts_account_like_bytes_under_known_field_names() {
		let mut inner = std::collections::BTreeMap::new();
		inner.insert("who".to_string(), Value::Bytes(vec![1u8; 32]));
		inner.insert("amount".to_string(), Value::Number(10.0));
		let data = Value::Map(inner);

		let accounts = extract_accounts(&data);
		assert_eq!(accounts.len(), 1);
		assert!(accounts[0].starts_with("0x"));
	}

	#[test]
	fn ignores_unrelated_fields() {
		let mut inner = std::collections::BTreeMap::new();
		inner.insert("amount".to_string(), Value::Number(10.0));
		let data = Value::Map(inner);
		assert!(extract_accounts(&data).is_empty());
	}
}
