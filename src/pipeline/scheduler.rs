//! Work scheduling (§4.6.3): a bounded inflight window of heights fetched
//! concurrently, using a bounded `FuturesUnordered` plus an overflow queue to
//! cap concurrent fetches at the window size.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::chain::{Height, RawBlock};

type FetchFuture = Pin<Box<dyn Future<Output = (Height, anyhow::Result<RawBlock>)> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
	Pending,
	Done,
}

/// Tracks `nextToFetch`, the bounded window `[nextToCommit, nextToCommit+W)`,
/// and completed-but-uncommitted fetch results.
pub struct Scheduler {
	window: usize,
	next_to_fetch: Height,
	running: FuturesUnordered<FetchFuture>,
	overflow: VecDeque<(Height, FetchFuture)>,
	results: BTreeMap<Height, RawBlock>,
	states: BTreeMap<Height, FetchState>,
	/// Heights re-enqueued at the front by consistency repair (§4.6.9).
	priority_queue: VecDeque<Height>,
}

impl Scheduler {
	pub fn new(window: usize, start_at: Height) -> Self {
		Self {
			window,
			next_to_fetch: start_at,
			running: FuturesUnordered::new(),
			overflow: VecDeque::new(),
			results: BTreeMap::new(),
			states: BTreeMap::new(),
			priority_queue: VecDeque::new(),
		}
	}

	pub fn enqueue_repair(&mut self, height: Height) {
		self.priority_queue.push_front(height);
	}

	/// Dispatches fetches for every height the window currently admits,
	/// `fetch` building the future for a given height.
	pub fn fill<F, Fut>(&mut self, next_to_commit: Height, chain_tip: Height, fetch: F)
	where
		F: Fn(Height) -> Fut,
		Fut: Future<Output = anyhow::Result<RawBlock>> + Send + 'static,
	{
		while let Some(height) = self.priority_queue.pop_front() {
			self.dispatch(height, &fetch);
		}

		let ceiling = chain_tip.min(next_to_commit.saturating_add(self.window as Height));
		while self.next_to_fetch < ceiling {
			let height = self.next_to_fetch;
			self.dispatch(height, &fetch);
			self.next_to_fetch += 1;
		}
	}

	fn dispatch<F, Fut>(&mut self, height: Height, fetch: &F)
	where
		F: Fn(Height) -> Fut,
		Fut: Future<Output = anyhow::Result<RawBlock>> + Send + 'static,
	{
		if self.states.get(&height) == Some(&FetchState::Done) {
			return;
		}
		self.states.insert(height, FetchState::Pending);
		let fut: FetchFuture = {
			let inner = fetch(height);
			Box::pin(async move { (height, inner.await) })
		};
		if self.running.len() < self.window {
			self.running.push(fut);
		} else {
			self.overflow.push_back((height, fut));
		}
	}

	/// Awaits the next fetch completion (success or failure), refilling the
	/// running set from the overflow buffer. A failed fetch clears its state
	/// and re-enqueues the height on the priority queue, since `next_to_fetch`
	/// has already moved past it and an ordinary `fill` call would otherwise
	/// never revisit it.
	pub async fn next_completed(&mut self) -> Option<Height> {
		let (height, result) = self.running.next().await?;

		if let Some((_, fut)) = self.overflow.pop_front() {
			self.running.push(fut);
		}

		match result {
			Ok(block) => {
				self.states.insert(height, FetchState::Done);
				self.results.insert(height, block);
				Some(height)
			},
			Err(err) => {
				tracing::warn!(height, error = %err, "fetch failed, will retry");
				self.states.remove(&height);
				self.priority_queue.push_back(height);
				None
			},
		}
	}

	pub fn has_pending_work(&self) -> bool {
		!self.running.is_empty() || !self.overflow.is_empty()
	}

	/// Waits until `height` is done, returning its fetched block.
	pub fn take_if_done(&mut self, height: Height) -> Option<RawBlock> {
		if self.states.get(&height) == Some(&FetchState::Done) {
			self.states.remove(&height);
			self.results.remove(&height)
		} else {
			None
		}
	}

	pub fn next_to_fetch(&self) -> Height {
		self.next_to_fetch
	}
}

#[cfg(test)]
mod tests {
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

	#[tokio::test]
	async fn fill_respects_window_bound() {
		let mut scheduler = Scheduler::new(4, 1);
		scheduler.fill(1, 100, |h| async move { Ok(stub_block(h)) });
		assert_eq!(scheduler.next_to_fetch(), 5);
	}

	#[tokio::test]
	async fn completed_fetch_is_retrievable() {
		let mut scheduler = Scheduler::new(4, 1);
		scheduler.fill(1, 2, |h| async move { Ok(stub_block(h)) });
		scheduler.next_completed().await;
		let block = scheduler.take_if_done(1);
		assert!(block.is_some());
	}
}
