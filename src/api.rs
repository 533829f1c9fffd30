//! The API Surface to the Outside (§7): the small set of operations the
//! pipeline/registry expose to the read API — `status`, `consistencyCheck`,
//! `repair`, `health` — served over `warp` alongside the Prometheus
//! `/metrics` endpoint, the same server shape as `engine/src/metrics.rs`'s
//! `warp::serve(...).bind_with_graceful_shutdown(...)`.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warp::Filter;

use crate::chain::Height;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pipeline::{HealthSource, HealthStatus, Pipeline};
use crate::rpc::RpcPool;
use crate::scope::Scope;

#[derive(Debug, Serialize)]
pub struct EndpointHealth {
	pub url: String,
	pub healthy: bool,
	pub successes: u64,
	pub failures: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
	pub state: crate::metrics::PipelineState,
	pub indexed_height: Height,
	pub chain_tip: Height,
	pub percent_caught_up: f64,
	pub metrics: MetricsSnapshot,
	pub rpc_endpoints: Vec<EndpointHealth>,
}

#[derive(Debug, Deserialize)]
pub struct ConsistencyCheckQuery {
	pub from: Height,
	pub to: Height,
}

#[derive(Debug, Deserialize)]
pub struct RepairRequest {
	pub heights: Vec<Height>,
}

pub struct Api {
	pipeline: Arc<Pipeline>,
	metrics: Arc<MetricsCollector>,
	rpc: Arc<RpcPool>,
}

impl Api {
	pub fn new(pipeline: Arc<Pipeline>, metrics: Arc<MetricsCollector>, rpc: Arc<RpcPool>) -> Self {
		Self { pipeline, metrics, rpc }
	}

	pub async fn status(&self) -> StatusResponse {
		let indexed_height = self.pipeline.indexed_height().await;
		let chain_tip = self.pipeline.chain_tip().await;
		let percent_caught_up =
			if chain_tip == 0 { 100.0 } else { (indexed_height as f64 / chain_tip as f64) * 100.0 };

		let mut rpc_endpoints = Vec::with_capacity(self.rpc.endpoints().len());
		for endpoint in self.rpc.endpoints() {
			rpc_endpoints.push(EndpointHealth {
				url: endpoint.url.clone(),
				healthy: endpoint.is_healthy().await,
				successes: endpoint.successes(),
				failures: endpoint.failures(),
			});
		}

		StatusResponse {
			state: self.pipeline.state().await.into(),
			indexed_height,
			chain_tip,
			percent_caught_up,
			metrics: self.metrics.snapshot().await,
			rpc_endpoints,
		}
	}

	pub async fn consistency_check(&self, from: Height, to: Height) -> anyhow::Result<Vec<Height>> {
		self.pipeline.consistency_check(from, to).await
	}

	/// Enqueues `heights` for re-fetch at the front of the scheduler;
	/// returns immediately. Idempotent: re-enqueuing an already-correct
	/// height just re-fetches and re-upserts the same row.
	pub fn repair(&self, heights: Vec<Height>) {
		self.pipeline.repair(heights);
	}

	pub async fn health(&self) -> HealthStatus {
		self.pipeline.health().await
	}
}

/// Starts the `/metrics`, `/health`, `/status`, `/consistency-check`, and
/// `/repair` warp server as a weak child of `scope` (its failure does not
/// bring down the pipeline).
pub fn start(scope: &mut Scope, host: IpAddr, port: u16, api: Arc<Api>) -> anyhow::Result<()> {
	crate::metrics::register_metrics();

	let metrics_route =
		warp::path("metrics").and(warp::path::end()).map(crate::metrics::metrics_text);

	let api_for_health = api.clone();
	let health_route = warp::path("health").and(warp::path::end()).then(move || {
		let api = api_for_health.clone();
		async move {
			let status = api.health().await;
			let code = if matches!(status, HealthStatus::Unhealthy) {
				warp::http::StatusCode::SERVICE_UNAVAILABLE
			} else {
				warp::http::StatusCode::OK
			};
			warp::reply::with_status(warp::reply::json(&status), code)
		}
	});

	let api_for_status = api.clone();
	let status_route = warp::path("status").and(warp::path::end()).then(move || {
		let api = api_for_status.clone();
		async move { warp::reply::json(&api.status().await) }
	});

	let api_for_check = api.clone();
	let consistency_check_route = warp::path("consistency-check")
		.and(warp::path::end())
		.and(warp::query::<ConsistencyCheckQuery>())
		.then(move |q: ConsistencyCheckQuery| {
			let api = api_for_check.clone();
			async move {
				match api.consistency_check(q.from, q.to).await {
					Ok(bad) => warp::reply::with_status(warp::reply::json(&bad), warp::http::StatusCode::OK),
					Err(err) => warp::reply::with_status(
						warp::reply::json(&err.to_string()),
						warp::http::StatusCode::INTERNAL_SERVER_ERROR,
					),
				}
			}
		});

	let api_for_repair = api.clone();
	let repair_route = warp::path("repair")
		.and(warp::path::end())
		.and(warp::post())
		.and(warp::body::json())
		.map(move |req: RepairRequest| {
			api_for_repair.repair(req.heights);
			warp::reply::with_status(warp::reply::json(&"accepted"), warp::http::StatusCode::ACCEPTED)
		});

	let routes = metrics_route.or(health_route).or(status_route).or(consistency_check_route).or(repair_route);
	let (_, future) = warp::serve(routes).bind_with_graceful_shutdown((host, port), {
		let token = scope.token();
		async move { token.cancelled().await }
	});

	scope.spawn_weak(async move {
		future.await;
		Ok(())
	});

	Ok(())
}
