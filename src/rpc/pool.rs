//! The RPC Pool: N WebSocket JSON-RPC endpoints, health/latency-weighted
//! selection, automatic failover within a call, and subscription
//! re-establishment on socket drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use jsonrpsee::core::client::{ClientT, SubscriptionClientT};
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::common::Mutex;
use crate::errors::RpcError;

const LATENCY_RING_SIZE: usize = 32;
const CONSECUTIVE_FAILURES_FOR_COOLDOWN: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS_PER_CALL: usize = 3;
const EPSILON_MILLIS: f64 = 1.0;

/// Per-endpoint health and latency bookkeeping. Mutation is confined to this
/// struct's own lock, so pool-wide selection only needs read access to the
/// (immutable) endpoint list.
pub struct EndpointState {
	pub url: String,
	client: RwLock<Option<Arc<WsClient>>>,
	successes: AtomicU64,
	failures: AtomicU64,
	consecutive_failures: AtomicU64,
	latencies_ms: Mutex<VecDeque<f64>>,
	ewma_latency_ms: Mutex<f64>,
	unhealthy_until: Mutex<Option<Instant>>,
}

impl EndpointState {
	fn new(url: String) -> Self {
		Self {
			url,
			client: RwLock::new(None),
			successes: AtomicU64::new(0),
			failures: AtomicU64::new(0),
			consecutive_failures: AtomicU64::new(0),
			latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_RING_SIZE)),
			ewma_latency_ms: Mutex::new(0.0),
			unhealthy_until: Mutex::new(None),
		}
	}

	pub async fn is_healthy(&self) -> bool {
		match *self.unhealthy_until.lock().await {
			Some(until) => Instant::now() >= until,
			None => true,
		}
	}

	pub fn successes(&self) -> u64 {
		self.successes.load(Ordering::Relaxed)
	}

	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	async fn record_success(&self, elapsed: Duration) {
		self.successes.fetch_add(1, Ordering::Relaxed);
		self.consecutive_failures.store(0, Ordering::Relaxed);
		*self.unhealthy_until.lock().await = None;

		let sample = elapsed.as_secs_f64() * 1000.0;
		let mut latencies = self.latencies_ms.lock().await;
		if latencies.len() == LATENCY_RING_SIZE {
			latencies.pop_front();
		}
		latencies.push_back(sample);

		let mut ewma = self.ewma_latency_ms.lock().await;
		*ewma = if *ewma == 0.0 { sample } else { 0.2 * sample + 0.8 * *ewma };
	}

	async fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
		let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
		if consecutive as u32 >= CONSECUTIVE_FAILURES_FOR_COOLDOWN {
			*self.unhealthy_until.lock().await = Some(Instant::now() + COOLDOWN);
		}
	}

	async fn weight(&self) -> f64 {
		if !self.is_healthy().await {
			return 0.0;
		}
		let ewma = *self.ewma_latency_ms.lock().await;
		1.0 / (ewma + EPSILON_MILLIS)
	}

	async fn connection(&self) -> anyhow::Result<Arc<WsClient>> {
		if let Some(client) = self.client.read().await.as_ref() {
			return Ok(client.clone());
		}
		let mut guard = self.client.write().await;
		if let Some(client) = guard.as_ref() {
			return Ok(client.clone());
		}
		let client = Arc::new(WsClientBuilder::default().build(&self.url).await?);
		*guard = Some(client.clone());
		Ok(client)
	}
}

/// A pool of WebSocket JSON-RPC endpoints backing `call`/`subscribe`. The
/// first URL supplied is reserved as the stable socket for header
/// subscriptions; the full list backs `call` and failover.
pub struct RpcPool {
	endpoints: Vec<Arc<EndpointState>>,
	call_timeout: Duration,
}

impl RpcPool {
	pub fn new(urls: Vec<String>, call_timeout: Duration) -> anyhow::Result<Self> {
		if urls.is_empty() {
			anyhow::bail!("rpc pool requires at least one endpoint");
		}
		for url in &urls {
			let parsed = url::Url::parse(url)
				.map_err(|err| anyhow::anyhow!("invalid rpc endpoint {url}: {err}"))?;
			anyhow::ensure!(
				matches!(parsed.scheme(), "ws" | "wss"),
				"rpc endpoint {url} must use ws:// or wss://"
			);
		}
		Ok(Self {
			endpoints: urls.into_iter().map(|u| Arc::new(EndpointState::new(u))).collect(),
			call_timeout,
		})
	}

	pub fn endpoints(&self) -> &[Arc<EndpointState>] {
		&self.endpoints
	}

	pub fn primary_subscription_url(&self) -> &str {
		&self.endpoints[0].url
	}

	pub async fn any_healthy(&self) -> bool {
		for endpoint in &self.endpoints {
			if endpoint.is_healthy().await {
				return true;
			}
		}
		false
	}

	/// Weighted-random order over currently-healthy endpoints; unhealthy
	/// endpoints are excluded from the draw but remain in the pool for probing.
	async fn weighted_order(&self) -> Vec<Arc<EndpointState>> {
		let mut candidates: Vec<(Arc<EndpointState>, f64)> = Vec::with_capacity(self.endpoints.len());
		for endpoint in &self.endpoints {
			let w = endpoint.weight().await;
			if w > 0.0 {
				candidates.push((endpoint.clone(), w));
			}
		}

		let mut order = Vec::with_capacity(candidates.len());
		let mut rng = rand::thread_rng();
		while !candidates.is_empty() {
			let total: f64 = candidates.iter().map(|(_, w)| w).sum();
			let mut pick = rng.gen_range(0.0..total);
			let mut chosen_index = candidates.len() - 1;
			for (i, (_, w)) in candidates.iter().enumerate() {
				if pick < *w {
					chosen_index = i;
					break;
				}
				pick -= w;
			}
			order.push(candidates.remove(chosen_index).0);
		}
		order
	}

	/// Calls `method` on one endpoint, failing over to the next in weighted
	/// order. Fails with `RpcError::AllEndpointsFailed` only when every
	/// endpoint tried in this pass returned an error.
	pub async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Vec<JsonValue>,
	) -> Result<T, RpcError> {
		let order = self.weighted_order().await;
		let order = if order.is_empty() { self.endpoints.clone() } else { order };

		let mut last_err = None;
		for endpoint in order.iter().take(MAX_ATTEMPTS_PER_CALL) {
			let started = Instant::now();
			let attempt = async {
				let client = endpoint
					.connection()
					.await
					.map_err(|e| RpcError::Transport(e.to_string()))?;
				client
					.request::<T, _>(method, rpc_params_from(&params))
					.await
					.map_err(|e| RpcError::Transport(e.to_string()))
			};
			let result = match tokio::time::timeout(self.call_timeout, attempt).await {
				Ok(result) => result,
				Err(_) => Err(RpcError::Timeout),
			};

			match result {
				Ok(value) => {
					endpoint.record_success(started.elapsed()).await;
					return Ok(value);
				},
				Err(err) => {
					endpoint.record_failure().await;
					last_err = Some(err);
				},
			}
		}

		tracing::error!(method, error = ?last_err, "all endpoints failed for rpc call");
		Err(RpcError::AllEndpointsFailed)
	}

	/// Subscribes to `subscribe_method`, reconnecting with exponential
	/// backoff (base 1s, cap 30s) on socket drop. Reconnection moves to the
	/// next healthy endpoint; callers must dedup by height/hash across a
	/// reconnect since the stream re-emits from the new connection point.
	pub async fn subscribe<T: DeserializeOwned + Send + 'static>(
		self: Arc<Self>,
		subscribe_method: &'static str,
		unsubscribe_method: &'static str,
		notif_method: &'static str,
	) -> tokio::sync::mpsc::Receiver<T> {
		let (tx, rx) = tokio::sync::mpsc::channel(256);
		tokio::spawn(async move {
			let mut backoff = Duration::from_secs(1);
			loop {
				let endpoint = self.endpoints[0].clone();
				let attempt = async {
					let client = endpoint.connection().await?;
					let mut sub = client
						.subscribe::<T, _>(subscribe_method, rpc_params_from(&[]), unsubscribe_method)
						.await?;
					backoff = Duration::from_secs(1);
					while let Some(item) = sub.next().await {
						let item = item?;
						if tx.send(item).await.is_err() {
							return Ok::<(), anyhow::Error>(());
						}
					}
					anyhow::Ok(())
				}
				.await;

				if let Err(err) = attempt {
					tracing::warn!(subscribe_method, notif_method, error = %err, "subscription dropped, reconnecting");
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(Duration::from_secs(30));
				} else {
					break;
				}
			}
		});
		rx
	}
}

fn rpc_params_from(values: &[JsonValue]) -> jsonrpsee::core::params::ArrayParams {
	let mut builder = jsonrpsee::core::params::ArrayParams::new();
	for value in values {
		builder.insert(value).expect("JsonValue is always serializable");
	}
	builder
}

#[cfg(test)]
mod tests {
	use super::*;

	const TEST_TIMEOUT: Duration = Duration::from_secs(15);

	#[test]
	fn new_pool_requires_at_least_one_endpoint() {
		assert!(RpcPool::new(vec![], TEST_TIMEOUT).is_err());
		assert!(RpcPool::new(vec!["ws://localhost:9944".to_string()], TEST_TIMEOUT).is_ok());
	}

	#[test]
	fn new_pool_rejects_non_websocket_schemes() {
		assert!(RpcPool::new(vec!["http://localhost:9944".to_string()], TEST_TIMEOUT).is_err());
	}

	#[tokio::test]
	async fn weight_is_zero_for_unhealthy_endpoint() {
		let endpoint = EndpointState::new("ws://x".to_string());
        for _ in 0..CONSECUTIVE_FAILURES_FOR_COOLDOWN {
            endpoint.record_failure().await;
        }
		assert!(!endpoint.is_healthy().await);
		assert_eq!(endpoint.weight().await, 0.0);
	}

	#[tokio::test]
	async fn success_resets_consecutive_failure_count() {
		let endpoint = EndpointState::new("ws://x".to_string());
		endpoint.record_failure().await;
		endpoint.record_failure().await;
		endpoint.record_success(Duration::from_millis(10)).await;
		assert!(endpoint.is_healthy().await);
		assert_eq!(endpoint.successes(), 1);
		assert_eq!(endpoint.failures(), 2);
	}
}
