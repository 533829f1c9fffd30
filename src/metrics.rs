//! Process-wide metrics: counters, and ring buffers for blocks/minute and
//! processing-time percentiles, exposed in Prometheus text format by
//! `crate::api`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::sync::RwLock;

use crate::common::Mutex;

const COMMIT_TIMESTAMPS_CAPACITY: usize = 7200;
const PROCESSING_TIME_SAMPLES_CAPACITY: usize = 1000;

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	static ref RPC_CALLS: IntCounterVec = IntCounterVec::new(
		Opts::new("rpc_calls_total", "Count of rpc calls made per endpoint"),
		&["endpoint", "method"]
	)
	.expect("metric definition is valid");
	static ref BLOCKS_PROCESSED: IntCounter =
		IntCounter::new("blocks_processed_total", "Count of blocks committed").expect("metric definition is valid");
	static ref ERROR_COUNT: IntCounter =
		IntCounter::new("errors_total", "Count of errors surfaced by the pipeline").expect("metric definition is valid");
	static ref INDEXED_HEIGHT: IntGauge =
		IntGauge::new("indexed_height", "Highest committed block height").expect("metric definition is valid");
	static ref CHAIN_TIP: IntGauge =
		IntGauge::new("chain_tip", "Current known finalized chain tip").expect("metric definition is valid");
}

pub fn register_metrics() {
	REGISTRY.register(Box::new(RPC_CALLS.clone())).expect("metric registers once");
	REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone())).expect("metric registers once");
	REGISTRY.register(Box::new(ERROR_COUNT.clone())).expect("metric registers once");
	REGISTRY.register(Box::new(INDEXED_HEIGHT.clone())).expect("metric registers once");
	REGISTRY.register(Box::new(CHAIN_TIP.clone())).expect("metric registers once");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
	Idle,
	Syncing,
	Live,
	Error,
}

pub struct MetricsCollector {
	started_at: Instant,
	state: RwLock<PipelineState>,
	indexed_height: AtomicI64,
	chain_tip: AtomicI64,
	blocks_processed: AtomicU64,
	error_count: AtomicU64,
	commit_timestamps: Mutex<VecDeque<Instant>>,
	processing_time_samples_ms: Mutex<VecDeque<f64>>,
}

#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
	pub started_at_unix: u64,
	pub uptime_secs: u64,
	pub state: PipelineState,
	pub blocks_processed: u64,
	pub indexed_height: i64,
	pub chain_tip: i64,
	pub error_count: u64,
	pub blocks_per_minute: f64,
	pub blocks_per_hour: f64,
	pub avg_processing_ms: f64,
	pub p50_processing_ms: f64,
	pub p95_processing_ms: f64,
	pub max_processing_ms: f64,
	pub process_memory_bytes: u64,
}

impl MetricsCollector {
	pub fn new() -> Self {
		Self {
			started_at: Instant::now(),
			state: RwLock::new(PipelineState::Idle),
			indexed_height: AtomicI64::new(0),
			chain_tip: AtomicI64::new(0),
			blocks_processed: AtomicU64::new(0),
			error_count: AtomicU64::new(0),
			commit_timestamps: Mutex::new(VecDeque::with_capacity(COMMIT_TIMESTAMPS_CAPACITY)),
			processing_time_samples_ms: Mutex::new(VecDeque::with_capacity(
				PROCESSING_TIME_SAMPLES_CAPACITY,
			)),
		}
	}

	pub async fn set_state(&self, state: PipelineState) {
		*self.state.write().await = state;
	}

	pub async fn state(&self) -> PipelineState {
		*self.state.read().await
	}

	pub fn set_indexed_height(&self, height: i64) {
		self.indexed_height.store(height, Ordering::Relaxed);
		INDEXED_HEIGHT.set(height);
	}

	pub fn set_chain_tip(&self, tip: i64) {
		self.chain_tip.store(tip, Ordering::Relaxed);
		CHAIN_TIP.set(tip);
	}

	pub fn indexed_height(&self) -> i64 {
		self.indexed_height.load(Ordering::Relaxed)
	}

	pub fn chain_tip(&self) -> i64 {
		self.chain_tip.load(Ordering::Relaxed)
	}

	pub fn record_error(&self) {
		self.error_count.fetch_add(1, Ordering::Relaxed);
		ERROR_COUNT.inc();
	}

	pub fn error_count(&self) -> u64 {
		self.error_count.load(Ordering::Relaxed)
	}

	pub fn record_rpc_call(&self, endpoint: &str, method: &str) {
		RPC_CALLS.with_label_values(&[endpoint, method]).inc();
	}

	/// Records a committed block: bumps `blocksProcessed` (monotone
	/// non-decreasing) and pushes a commit timestamp / processing-time sample.
	pub async fn record_commit(&self, processing_time: Duration) {
		self.blocks_processed.fetch_add(1, Ordering::Relaxed);
		BLOCKS_PROCESSED.inc();

		let mut timestamps = self.commit_timestamps.lock().await;
		if timestamps.len() == COMMIT_TIMESTAMPS_CAPACITY {
			timestamps.pop_front();
		}
		timestamps.push_back(Instant::now());
		drop(timestamps);

		let mut samples = self.processing_time_samples_ms.lock().await;
		if samples.len() == PROCESSING_TIME_SAMPLES_CAPACITY {
			samples.pop_front();
		}
		samples.push_back(processing_time.as_secs_f64() * 1000.0);
	}

	pub fn blocks_processed(&self) -> u64 {
		self.blocks_processed.load(Ordering::Relaxed)
	}

	async fn blocks_per(&self, window: Duration) -> f64 {
		let now = Instant::now();
		let timestamps = self.commit_timestamps.lock().await;
		timestamps.iter().filter(|t| now.duration_since(**t) <= window).count() as f64
	}

	pub async fn snapshot(&self) -> MetricsSnapshot {
		let blocks_per_minute = self.blocks_per(Duration::from_secs(60)).await;
		let blocks_per_hour = self.blocks_per(Duration::from_secs(3600)).await;

		let samples = self.processing_time_samples_ms.lock().await;
		let mut sorted: Vec<f64> = samples.iter().copied().collect();
		drop(samples);
		sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

		let avg = if sorted.is_empty() { 0.0 } else { sorted.iter().sum::<f64>() / sorted.len() as f64 };
		let percentile = |p: f64| -> f64 {
			if sorted.is_empty() {
				return 0.0;
			}
			let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
			sorted[idx]
		};

		MetricsSnapshot {
			started_at_unix: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_secs()
				.saturating_sub(self.started_at.elapsed().as_secs()),
			uptime_secs: self.started_at.elapsed().as_secs(),
			state: self.state().await,
			blocks_processed: self.blocks_processed(),
			indexed_height: self.indexed_height(),
			chain_tip: self.chain_tip(),
			error_count: self.error_count(),
			blocks_per_minute,
			blocks_per_hour,
			avg_processing_ms: avg,
			p50_processing_ms: percentile(0.50),
			p95_processing_ms: percentile(0.95),
			max_processing_ms: sorted.last().copied().unwrap_or(0.0),
			process_memory_bytes: current_process_memory_bytes(),
		}
	}
}

impl Default for MetricsCollector {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(target_os = "linux")]
fn current_process_memory_bytes() -> u64 {
	std::fs::read_to_string("/proc/self/statm")
		.ok()
		.and_then(|s| s.split_whitespace().nth(1).map(|s| s.to_string()))
		.and_then(|pages| pages.parse::<u64>().ok())
		.map(|pages| pages * 4096)
		.unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_process_memory_bytes() -> u64 {
	0
}

/// Prometheus text exposition of every registered metric; served at
/// `/metrics` by `crate::api`.
pub fn metrics_text() -> String {
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!(error = %err, "failed to encode prometheus metrics");
	}
	String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn blocks_processed_is_monotone() {
		let collector = MetricsCollector::new();
		collector.record_commit(Duration::from_millis(5)).await;
		collector.record_commit(Duration::from_millis(5)).await;
		assert_eq!(collector.blocks_processed(), 2);
	}

	#[tokio::test]
	async fn snapshot_reports_percentiles() {
		let collector = MetricsCollector::new();
		for ms in [10, 20, 30, 40, 50] {
			collector.record_commit(Duration::from_millis(ms)).await;
		}
		let snapshot = collector.snapshot().await;
		assert_eq!(snapshot.blocks_processed, 5);
		assert!(snapshot.p95_processing_ms >= snapshot.p50_processing_ms);
		assert_eq!(snapshot.max_processing_ms, 50.0);
	}
}
