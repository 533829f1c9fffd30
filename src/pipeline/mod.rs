//! The Ingestion Pipeline: the orchestrator. Subscribes to new-head and
//! finalized-head streams, detects gaps, schedules parallel fetches, commits
//! in height order, reconciles forks, drives the Block Processor.

pub mod scheduler;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::chain::{Height, RawBlock};
use crate::common::Mutex;
use crate::metrics::MetricsCollector;
use crate::plugins::PluginRegistry;
use crate::rpc::ChainRpc;
use crate::scope::Scope;
use crate::settings::PipelineSettings;
use crate::store::Store;
use scheduler::Scheduler;
use state::{State, StateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Unhealthy,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
	async fn health(&self) -> HealthStatus;
}

/// Fetches a single block (header already known) by height: block body,
/// events, and — if the spec version changed — runtime metadata for
/// decoding. Left generic over the concrete decode step, which is pluggable
/// per-chain and out of this core's scope.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockFetcher: Send + Sync {
	async fn fetch(&self, height: Height) -> anyhow::Result<RawBlock>;
}

pub struct ChainRpcFetcher {
	pub rpc: Arc<ChainRpc>,
}

#[async_trait]
impl BlockFetcher for ChainRpcFetcher {
	async fn fetch(&self, height: Height) -> anyhow::Result<RawBlock> {
		let hash = self.rpc.block_hash(height).await?;
		let header = self.rpc.header(&hash).await?;
		// Extrinsics/events/digest decoding is pallet-specific and out of
		// this core's scope; callers supply a richer `BlockFetcher` wired to
		// their chain's decoder. This default fetcher returns the header
		// shape only, sufficient for fork-linkage and gap detection.
		Ok(RawBlock {
			height: header.height,
			hash: header.hash,
			parent_hash: header.parent_hash,
			state_root: String::new(),
			extrinsics_root: String::new(),
			timestamp: None,
			validator_id: None,
			spec_version: 0,
			digest_logs: vec![],
			extrinsics: vec![],
			events: vec![],
		})
	}
}

pub struct Pipeline {
	store: Arc<Store>,
	registry: Arc<PluginRegistry>,
	fetcher: Arc<dyn BlockFetcher>,
	rpc: Arc<ChainRpc>,
	metrics: Arc<MetricsCollector>,
	settings: PipelineSettings,
	next_to_commit: Mutex<Height>,
	finalized_height: Mutex<Height>,
	state_machine: Mutex<StateMachine>,
	repair_tx: tokio::sync::mpsc::UnboundedSender<Height>,
	repair_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Height>>>,
}

impl Pipeline {
	pub async fn new(
		store: Arc<Store>,
		registry: Arc<PluginRegistry>,
		fetcher: Arc<dyn BlockFetcher>,
		rpc: Arc<ChainRpc>,
		metrics: Arc<MetricsCollector>,
		settings: PipelineSettings,
	) -> anyhow::Result<Self> {
		// §4.6.1 startup reconciliation
		let h_db = store.highest_finalized_height().await?.unwrap_or(0);
		let next_to_commit = h_db + 1;

		let state_machine =
			StateMachine::new(Duration::from_millis(settings.expected_block_time_ms), settings.window as u32);

		let (repair_tx, repair_rx) = tokio::sync::mpsc::unbounded_channel();

		Ok(Self {
			store,
			registry,
			fetcher,
			rpc,
			metrics,
			settings,
			next_to_commit: Mutex::new(next_to_commit),
			finalized_height: Mutex::new(h_db),
			state_machine: Mutex::new(state_machine),
			repair_tx,
			repair_rx: Mutex::new(Some(repair_rx)),
		})
	}

	/// Enqueues `heights` for re-fetch at the front of the scheduler (§4.6.9);
	/// returns immediately.
	pub fn repair(&self, heights: Vec<Height>) {
		for height in heights {
			let _ = self.repair_tx.send(height);
		}
	}

	/// Non-blocking: spawns the fetch/commit loop and the finalization
	/// watcher as children of `scope`.
	pub async fn start(self: Arc<Self>, scope: &mut Scope) -> anyhow::Result<()> {
		let chain_tip = self.rpc.finalized_head().await.ok();
		tracing::info!(?chain_tip, "starting ingestion pipeline");

		let this = self.clone();
		let token = scope.token();
		scope.spawn(async move { this.run_fetch_commit_loop(token).await });

		let this = self.clone();
		let token = scope.token();
		scope.spawn(async move { this.run_finalization_watcher(token).await });

		Ok(())
	}

	async fn chain_tip_height(&self) -> Height {
		// The finalized-head subscription updates this in a full
		// implementation; polled here via one-shot RPC as a conservative
		// fallback that still satisfies §4.6.1/§4.6.3's contract.
		match self.rpc.finalized_head().await {
			Ok(hash) => self.rpc.header(&hash).await.map(|h| h.height).unwrap_or(0),
			Err(_) => 0,
		}
	}

	/// §4.6.3/§4.6.4: dispatch fetches within the bounded window, commit
	/// strictly in increasing height order regardless of fetch-completion
	/// order.
	async fn run_fetch_commit_loop(
		self: Arc<Self>,
		token: tokio_util::sync::CancellationToken,
	) -> anyhow::Result<()> {
		let start_at = *self.next_to_commit.lock().await;
		let mut scheduler = Scheduler::new(self.settings.window, start_at);
		let mut repair_rx = self
			.repair_rx
			.lock()
			.await
			.take()
			.expect("run_fetch_commit_loop is spawned exactly once");

		loop {
			if token.is_cancelled() {
				return Ok(());
			}

			while let Ok(height) = repair_rx.try_recv() {
				scheduler.enqueue_repair(height);
			}

			let next_to_commit = *self.next_to_commit.lock().await;
			let chain_tip = self.chain_tip_height().await;
			self.metrics.set_chain_tip(chain_tip as i64);
			self.state_machine.lock().await.on_progress(next_to_commit, chain_tip);
			self.metrics.set_state(self.state_machine.lock().await.current().into()).await;

			let fetcher = self.fetcher.clone();
			scheduler.fill(next_to_commit, chain_tip, move |height| {
				let fetcher = fetcher.clone();
				async move { fetcher.fetch(height).await }
			});

			if let Some(block) = scheduler.take_if_done(next_to_commit) {
				self.commit(&mut scheduler, next_to_commit, block).await?;
				continue;
			}

			if !scheduler.has_pending_work() {
				tokio::time::sleep(Duration::from_millis(200)).await;
				continue;
			}

			tokio::select! {
				_ = token.cancelled() => return Ok(()),
				_ = scheduler.next_completed() => {},
			}
		}
	}

	async fn commit(
		&self,
		_scheduler: &mut Scheduler,
		height: Height,
		block: RawBlock,
	) -> anyhow::Result<()> {
		let finalized_height = *self.finalized_height.lock().await;
		let status = if height <= finalized_height {
			crate::chain::BlockStatus::Finalized
		} else {
			crate::chain::BlockStatus::Best
		};

		let started = std::time::Instant::now();
		match crate::processor::process(&self.store, &self.registry, &block, status).await {
			Ok(()) => {
				*self.next_to_commit.lock().await = height + 1;
				self.metrics.set_indexed_height(height as i64);
				self.metrics.record_commit(started.elapsed()).await;
				self.state_machine.lock().await.on_commit_success();
				Ok(())
			},
			Err(err) => {
				self.metrics.record_error();

				let is_handler_failure = err
					.downcast_ref::<crate::errors::PipelineError>()
					.map(|e| matches!(e, crate::errors::PipelineError::HandlerFailed(_)))
					.unwrap_or(false);
				let skippable = height <= finalized_height.saturating_sub(self.settings.lookback as Height);

				if is_handler_failure && skippable {
					tracing::error!(
						height,
						error = %err,
						"handler failed after retries, height is beyond the lookback window, skipping"
					);
					*self.next_to_commit.lock().await = height + 1;
					self.state_machine.lock().await.on_commit_success();
					Ok(())
				} else {
					tracing::error!(height, error = %err, "commit failed, height will not advance");
					self.state_machine.lock().await.on_repeated_failure();
					// the height never advances on failure (§4.6.4); back off
					// before the scheduler's next pass retries it.
					tokio::time::sleep(Duration::from_secs(1)).await;
					Ok(())
				}
			},
		}
	}

	/// §4.6.5/§4.6.6: upgrades `best` to `finalized` in `(F_old, F_new]` and
	/// triggers fork pruning whenever the finalized head advances.
	async fn run_finalization_watcher(
		self: Arc<Self>,
		token: tokio_util::sync::CancellationToken,
	) -> anyhow::Result<()> {
		loop {
			if token.is_cancelled() {
				return Ok(());
			}

			tokio::select! {
				_ = token.cancelled() => return Ok(()),
				_ = tokio::time::sleep(Duration::from_millis(self.settings.expected_block_time_ms)) => {},
			}

			let new_finalized_hash = match self.rpc.finalized_head().await {
				Ok(hash) => hash,
				Err(_) => continue,
			};
			let new_header = match self.rpc.header(&new_finalized_hash).await {
				Ok(header) => header,
				Err(_) => continue,
			};

			let mut finalized_height = self.finalized_height.lock().await;
			if new_header.height > *finalized_height {
				let old = *finalized_height;
				self.store.upgrade_best_to_finalized(old, new_header.height).await?;
				self.store
					.prune_forked_descendants(new_header.height, &new_header.hash)
					.await?;
				*finalized_height = new_header.height;
			}
		}
	}

	/// §4.6.9: finds missing/mismatched heights in `from..=to`.
	pub async fn consistency_check(&self, from: Height, to: Height) -> anyhow::Result<Vec<Height>> {
		Ok(self.store.consistency_check(from, to).await?)
	}

	/// Runs `consistency_check` and re-enqueues every bad height via
	/// `repair`; cooperative since `repair` only pushes onto a channel the
	/// fetch/commit loop drains between its own iterations, never blocking a
	/// live commit.
	pub async fn repair_inconsistencies(&self, from: Height, to: Height) -> anyhow::Result<Vec<Height>> {
		let bad = self.consistency_check(from, to).await?;
		self.repair(bad.clone());
		Ok(bad)
	}

	pub async fn indexed_height(&self) -> Height {
		*self.next_to_commit.lock().await - 1
	}

	pub async fn chain_tip(&self) -> Height {
		self.chain_tip_height().await
	}

	pub async fn state(&self) -> State {
		self.state_machine.lock().await.current()
	}
}

#[async_trait]
impl HealthSource for Pipeline {
	/// Three gates (§6): DB reachable, at least one RPC endpoint healthy,
	/// `chainTip - indexedHeight < 10`.
	async fn health(&self) -> HealthStatus {
		let db_ok = self.store.highest_finalized_height().await.is_ok();
		let rpc_ok = self.rpc.finalized_head().await.is_ok();
		let indexed = self.indexed_height().await;
		let tip = self.chain_tip().await;
		let caught_up = tip.saturating_sub(indexed) < 10;

		if !db_ok {
			HealthStatus::Unhealthy
		} else if !rpc_ok || !caught_up {
			HealthStatus::Degraded
		} else {
			HealthStatus::Healthy
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	fn stub_block(height: Height) -> RawBlock {
		RawBlock {
			height,
			hash: format!("0x{height}"),
			parent_hash: format!("0x{}", height.saturating_sub(1)),
			state_root: "0x0".into(),
			extrinsics_root: "0x0".into(),
			timestamp: None,
			validator_id: None,
			spec_version: 1,
			digest_logs: vec![],
			extrinsics: vec![],
			events: vec![],
		}
	}

	/// A fetch that fails its first attempt at a given height and succeeds
	/// thereafter, driven through a mocked `BlockFetcher` rather than a real
	/// RPC pool — exercises the scheduler's failure-then-retry path (the
	/// fetch side of §8 scenario 3's "retry on transient failure").
	#[tokio::test]
	async fn scheduler_retries_a_fetch_that_failed_once() {
		let attempts: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
		let attempts_for_mock = attempts.clone();

		let mut mock = MockBlockFetcher::new();
		mock.expect_fetch().returning(move |height| {
			let count = attempts_for_mock.fetch_add(1, Ordering::SeqCst);
			if count == 0 {
				Err(anyhow::anyhow!("transient rpc failure"))
			} else {
				Ok(stub_block(height))
			}
		});
		let fetcher: Arc<dyn BlockFetcher> = Arc::new(mock);

		let mut scheduler = scheduler::Scheduler::new(4, 1);
		let f = fetcher.clone();
		scheduler.fill(1, 2, move |h| {
			let f = f.clone();
			async move { f.fetch(h).await }
		});
		// first attempt fails, clearing the height's fetch state
		assert!(scheduler.next_completed().await.is_none());
		assert!(scheduler.take_if_done(1).is_none());

		// a later `fill` call re-dispatches the still-pending height
		let f = fetcher.clone();
		scheduler.fill(1, 2, move |h| {
			let f = f.clone();
			async move { f.fetch(h).await }
		});
		scheduler.next_completed().await;
		assert!(scheduler.take_if_done(1).is_some());
		assert_eq!(attempts.load(Ordering::SeqCst), 2);
	}
}
