//! Pipeline state machine (§4.6.7): idle/syncing/live/error, monotone with
//! respect to `indexedHeight <= chainTip`.

use std::time::{Duration, Instant};

use crate::chain::Height;
use crate::metrics::PipelineState as ExposedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Idle,
	Syncing,
	Live,
	Error,
}

impl From<State> for ExposedState {
	fn from(s: State) -> Self {
		match s {
			State::Idle => ExposedState::Idle,
			State::Syncing => ExposedState::Syncing,
			State::Live => ExposedState::Live,
			State::Error => ExposedState::Error,
		}
	}
}

pub struct StateMachine {
	current: State,
	last_commit_at: Option<Instant>,
	expected_block_time: Duration,
	window: u32,
}

impl StateMachine {
	pub fn new(expected_block_time: Duration, window: u32) -> Self {
		Self { current: State::Idle, last_commit_at: None, expected_block_time, window }
	}

	pub fn current(&self) -> State {
		self.current
	}

	/// Called whenever `nextToCommit`/`chainTip` change (a new head, a
	/// successful commit) to re-evaluate the transition table.
	pub fn on_progress(&mut self, next_to_commit: Height, chain_tip: Height) {
		if self.current == State::Error {
			return;
		}

		if next_to_commit < chain_tip {
			if chain_tip - next_to_commit > self.window {
				self.current = State::Syncing;
			} else if self.current == State::Idle {
				self.current = State::Syncing;
			}
		} else if next_to_commit == chain_tip {
			let recently_committed = self
				.last_commit_at
				.map(|t| t.elapsed() < self.expected_block_time * 2)
				.unwrap_or(false);
			if recently_committed || self.current == State::Idle {
				self.current = State::Live;
			}
		}
	}

	pub fn on_commit_success(&mut self) {
		self.last_commit_at = Some(Instant::now());
		if self.current == State::Error {
			self.current = State::Syncing;
		}
	}

	pub fn on_repeated_failure(&mut self) {
		self.current = State::Error;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn idle_to_syncing_on_gap() {
		let mut sm = StateMachine::new(Duration::from_secs(6), 32);
		sm.on_progress(0, 100);
		assert_eq!(sm.current(), State::Syncing);
	}

	#[test]
	fn syncing_to_live_when_caught_up() {
		let mut sm = StateMachine::new(Duration::from_secs(6), 32);
		sm.on_progress(0, 100);
		sm.on_commit_success();
		sm.on_progress(100, 100);
		assert_eq!(sm.current(), State::Live);
	}

	#[test]
	fn live_to_syncing_when_falls_behind_window() {
		let mut sm = StateMachine::new(Duration::from_secs(6), 32);
		sm.on_progress(100, 100);
		sm.on_commit_success();
		sm.on_progress(0, 100);
		assert_eq!(sm.current(), State::Syncing);
	}

	#[test]
	fn error_recovers_to_syncing_on_next_commit() {
		let mut sm = StateMachine::new(Duration::from_secs(6), 32);
		sm.on_repeated_failure();
		assert_eq!(sm.current(), State::Error);
		sm.on_commit_success();
		assert_eq!(sm.current(), State::Syncing);
	}
}
