//! The relational store: the Data Model (§3) and the transactional Block
//! Processor contract (§4.5) against PostgreSQL via `sqlx`, with `refinery`
//! embedded migrations.

pub mod schema;

use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::chain::{BlockStatus, Height, RawEvent, RawExtrinsic};
use crate::errors::StoreError;
use crate::settings::DatabaseSettings;
use crate::value::Value;

mod embedded {
	refinery::embed_migrations!("migrations");
}

pub struct Store {
	pool: PgPool,
}

impl Store {
	/// Connects the `sqlx` pool used for all subsequent queries. Call
	/// `migrate` separately before `connect` on first startup (or any time
	/// new migrations ship) — they use separate driver stacks by design, the
	/// same way `refinery`/`sqlx` are split in `hotshot-query-service`.
	pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
		let pool = PgPoolOptions::new()
			.max_connections(settings.max_connections)
			.connect(&settings.url)
			.await?;
		Ok(Self { pool })
	}

	/// Applies any migrations under `migrations/` not yet recorded as run,
	/// matching the check-then-apply shape of the teacher's own
	/// `open_and_migrate_to_version`, reimplemented on top of `refinery`'s
	/// embedded-migration runner (which needs its own `tokio_postgres`
	/// connection, separate from the `sqlx` pool used for everything else).
	pub async fn migrate(settings: &DatabaseSettings) -> Result<(), StoreError> {
		let (mut client, connection) =
			tokio_postgres::connect(&settings.url, tokio_postgres::NoTls)
				.await
				.map_err(|err| StoreError::Connection(sqlx::Error::Configuration(Box::new(err))))?;

		tokio::spawn(async move {
			if let Err(err) = connection.await {
				tracing::error!(error = %err, "migration connection closed with error");
			}
		});

		embedded::migrations::runner()
			.run_async(&mut client)
			.await
			.map_err(StoreError::Migration)?;
		Ok(())
	}

	pub async fn begin_block_transaction(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
		Ok(self.pool.begin().await?)
	}

	pub async fn highest_finalized_height(&self) -> Result<Option<Height>, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as(
			"SELECT height FROM blocks WHERE status = 'finalized' ORDER BY height DESC LIMIT 1",
		)
		.fetch_optional(&self.pool)
		.await?;
		Ok(row.map(|(h,)| h as Height))
	}

	pub async fn upsert_block(
		tx: &mut Transaction<'static, Postgres>,
		block: &crate::chain::RawBlock,
		status: BlockStatus,
	) -> Result<(), StoreError> {
		sqlx::query(
			r#"
			INSERT INTO blocks (height, hash, parent_hash, state_root, extrinsics_root, timestamp,
				validator_id, spec_version, digest_logs, status)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
			ON CONFLICT (height) DO UPDATE SET
				hash = EXCLUDED.hash,
				parent_hash = EXCLUDED.parent_hash,
				state_root = EXCLUDED.state_root,
				extrinsics_root = EXCLUDED.extrinsics_root,
				timestamp = EXCLUDED.timestamp,
				validator_id = EXCLUDED.validator_id,
				spec_version = EXCLUDED.spec_version,
				digest_logs = EXCLUDED.digest_logs,
				status = CASE WHEN blocks.status = 'finalized' THEN 'finalized' ELSE EXCLUDED.status END
			"#,
		)
		.bind(block.height as i64)
		.bind(&block.hash)
		.bind(&block.parent_hash)
		.bind(&block.state_root)
		.bind(&block.extrinsics_root)
		.bind(block.timestamp.map(|t| t as i64))
		.bind(&block.validator_id)
		.bind(block.spec_version as i32)
		.bind(Json(&block.digest_logs))
		.bind(schema::status_to_str(status))
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn upsert_extrinsic(
		tx: &mut Transaction<'static, Postgres>,
		height: Height,
		extrinsic: &RawExtrinsic,
		truncated_args: &Value,
	) -> Result<(), StoreError> {
		let id = format!("{}-{}", height, extrinsic.index_in_block);
		sqlx::query(
			r#"
			INSERT INTO extrinsics (id, height, index_in_block, hash, signer, module, call, args,
				success, fee, tip)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
			ON CONFLICT (id) DO UPDATE SET
				hash = EXCLUDED.hash, signer = EXCLUDED.signer, module = EXCLUDED.module,
				call = EXCLUDED.call, args = EXCLUDED.args, success = EXCLUDED.success,
				fee = EXCLUDED.fee, tip = EXCLUDED.tip
			"#,
		)
		.bind(&id)
		.bind(height as i64)
		.bind(extrinsic.index_in_block as i32)
		.bind(&extrinsic.hash)
		.bind(&extrinsic.signer)
		.bind(&extrinsic.module)
		.bind(&extrinsic.call)
		.bind(Json(truncated_args))
		.bind(extrinsic.success)
		.bind(extrinsic.fee.map(|f| f as i64))
		.bind(extrinsic.tip.map(|t| t as i64))
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn upsert_event(
		tx: &mut Transaction<'static, Postgres>,
		height: Height,
		event: &RawEvent,
		extrinsic_id: Option<&str>,
	) -> Result<(), StoreError> {
		let id = format!("{}-{}", height, event.index_in_block);
		sqlx::query(
			r#"
			INSERT INTO events (id, height, index_in_block, extrinsic_id, module, event, data, phase)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
			ON CONFLICT (id) DO UPDATE SET
				extrinsic_id = EXCLUDED.extrinsic_id, module = EXCLUDED.module, event = EXCLUDED.event,
				data = EXCLUDED.data, phase = EXCLUDED.phase
			"#,
		)
		.bind(&id)
		.bind(height as i64)
		.bind(event.index_in_block as i32)
		.bind(extrinsic_id)
		.bind(&event.module)
		.bind(&event.event)
		.bind(Json(&event.data))
		.bind(schema::phase_to_str(&event.phase))
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	pub async fn upsert_account(
		tx: &mut Transaction<'static, Postgres>,
		public_key: &str,
		height: Height,
	) -> Result<(), StoreError> {
		sqlx::query(
			r#"
			INSERT INTO accounts (public_key, first_seen_height, last_seen_height)
			VALUES ($1, $2, $2)
			ON CONFLICT (public_key) DO UPDATE SET
				last_seen_height = GREATEST(accounts.last_seen_height, EXCLUDED.last_seen_height)
			"#,
		)
		.bind(public_key)
		.bind(height as i64)
		.execute(&mut **tx)
		.await?;
		Ok(())
	}

	/// Upgrades every committed block in `(from, to]` from `best` to
	/// `finalized`; idempotent by construction.
	pub async fn upgrade_best_to_finalized(&self, from: Height, to: Height) -> Result<(), StoreError> {
		sqlx::query(
			"UPDATE blocks SET status = 'finalized' WHERE height > $1 AND height <= $2 AND status = 'best'",
		)
		.bind(from as i64)
		.bind(to as i64)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Deletes the stored `best` block at `height` if its hash differs from
	/// `finalized_hash`, and every `best` block above it whose parent chain
	/// does not terminate at `finalized_hash`, cascading children first (by
	/// descending height) per §4.6.6.
	pub async fn prune_forked_descendants(
		&self,
		height: Height,
		finalized_hash: &str,
	) -> Result<Vec<Height>, StoreError> {
		let candidates: Vec<(i64, String, String)> = sqlx::query_as(
			"SELECT height, hash, parent_hash FROM blocks WHERE height >= $1 AND status = 'best' ORDER BY height ASC",
		)
		.bind(height as i64)
		.fetch_all(&self.pool)
		.await?;

		// Walk upward from `height`: a row survives only while its hash chain
		// still agrees with the finalized anchor; once a row diverges, every
		// row above it (its descendants) is stale too.
		let mut canonical_hash = finalized_hash.to_string();
		let mut stale_ascending = Vec::new();
		let mut diverged = false;

		for (row_height, hash, parent_hash) in &candidates {
			if *row_height as Height == height {
				if hash != &canonical_hash {
					diverged = true;
					stale_ascending.push(*row_height as Height);
				}
				continue;
			}

			if diverged || parent_hash != &canonical_hash {
				diverged = true;
				stale_ascending.push(*row_height as Height);
			} else {
				canonical_hash = hash.clone();
			}
		}

		let mut deleted = stale_ascending;
		deleted.reverse(); // descending height: children before parents

		for row_height in &deleted {
			sqlx::query("DELETE FROM blocks WHERE height = $1 AND status = 'best'")
				.bind(*row_height as i64)
				.execute(&self.pool)
				.await?;
		}

		Ok(deleted)
	}

	pub async fn block_at(&self, height: Height) -> Result<Option<schema::BlockRow>, StoreError> {
		let row = sqlx::query_as::<_, schema::BlockRow>("SELECT * FROM blocks WHERE height = $1")
			.bind(height as i64)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row)
	}

	/// Walks `from_height..=to_height`, returning heights that are missing or
	/// whose `parent_hash` does not match the previous block's `hash`.
	pub async fn consistency_check(
		&self,
		from_height: Height,
		to_height: Height,
	) -> Result<Vec<Height>, StoreError> {
		let rows: Vec<(i64, String, String)> = sqlx::query_as(
			"SELECT height, hash, parent_hash FROM blocks WHERE height >= $1 AND height <= $2 ORDER BY height",
		)
		.bind(from_height as i64)
		.bind(to_height as i64)
		.fetch_all(&self.pool)
		.await?;

		let mut by_height = std::collections::BTreeMap::new();
		for (h, hash, parent_hash) in rows {
			by_height.insert(h as Height, (hash, parent_hash));
		}

		let mut bad = Vec::new();
		let mut previous_hash: Option<String> = None;
		for height in from_height..=to_height {
			match by_height.get(&height) {
				None => bad.push(height),
				Some((hash, parent_hash)) => {
					if let Some(prev) = &previous_hash {
						if parent_hash != prev {
							bad.push(height);
						}
					}
					previous_hash = Some(hash.clone());
				},
			}
		}
		Ok(bad)
	}

	pub async fn has_applied_migration(&self, extension_id: &str) -> Result<bool, StoreError> {
		let row: Option<(i64,)> =
			sqlx::query_as("SELECT 1 FROM plugin_migrations WHERE extension_id = $1")
				.bind(extension_id)
				.fetch_optional(&self.pool)
				.await?;
		Ok(row.is_some())
	}

	/// Executes `migration_text` once per `extension_id`: a reapplied
	/// migration for an id already recorded is a no-op.
	pub async fn apply_extension_migration_once(
		&self,
		extension_id: &str,
		migration_text: &str,
	) -> Result<(), StoreError> {
		if self.has_applied_migration(extension_id).await? {
			return Ok(());
		}

		let mut tx = self.pool.begin().await?;
		for statement in migration_text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
			sqlx::query(statement).execute(&mut *tx).await?;
		}
		sqlx::query("INSERT INTO plugin_migrations (extension_id) VALUES ($1) ON CONFLICT DO NOTHING")
			.bind(extension_id)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_to_str_round_trips_on_str_compare() {
		assert_eq!(schema::status_to_str(BlockStatus::Best), "best");
		assert_eq!(schema::status_to_str(BlockStatus::Finalized), "finalized");
	}
}
