//! Process entry point: load configuration, bring up the store, RPC pool,
//! plugin registry and metrics server, then run the ingestion pipeline until
//! a shutdown signal or a fatal child task error.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use substrate_indexer::api::{self, Api};
use substrate_indexer::logging;
use substrate_indexer::metrics::MetricsCollector;
use substrate_indexer::pipeline::{ChainRpcFetcher, Pipeline};
use substrate_indexer::plugins::{manifest, Extension, PluginRegistry};
use substrate_indexer::rpc::{ChainRpc, RpcPool};
use substrate_indexer::scope::Scope;
use substrate_indexer::settings::{Cli, Settings};
use substrate_indexer::store::Store;

const EXTENSIONS_DIR: &str = "extensions";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	logging::init(cli.log_format);

	let settings = Settings::load(&cli.config)?;
	tracing::info!(endpoints = ?settings.rpc.endpoints, "loaded settings");

	Store::migrate(&settings.database).await?;
	let store = Arc::new(Store::connect(&settings.database).await?);

	let extensions = load_extensions(EXTENSIONS_DIR)?;
	let registry = Arc::new(PluginRegistry::build(extensions, &store).await?);

	let pool = Arc::new(RpcPool::new(
		settings.rpc.endpoints.clone(),
		std::time::Duration::from_millis(settings.rpc.call_timeout_ms),
	)?);
	let rpc = Arc::new(ChainRpc::new(pool.clone()));

	let metrics = Arc::new(MetricsCollector::new());

	let pipeline = Arc::new(
		Pipeline::new(
			store.clone(),
			registry,
			Arc::new(ChainRpcFetcher { rpc: rpc.clone() }),
			rpc,
			metrics.clone(),
			settings.pipeline.clone(),
		)
		.await?,
	);

	let mut scope = Scope::new();

	let api = Arc::new(Api::new(pipeline.clone(), metrics.clone(), pool));
	api::start(&mut scope, settings.metrics.host.parse()?, settings.metrics.port, api)?;

	pipeline.clone().start(&mut scope).await?;

	let token = scope.token();
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received shutdown signal");
		},
		_ = token.cancelled() => {
			tracing::warn!("a task cancelled the scope before shutdown was requested");
		},
	}

	scope.cancel();
	scope.join(std::time::Duration::from_secs(settings.pipeline.stop_deadline_secs)).await?;
	Ok(())
}

/// Loads and topologically validates every `manifest.json` under `dir`. A
/// missing directory means no extensions are installed, not an error.
fn load_extensions(dir: &str) -> anyhow::Result<Vec<Extension>> {
	let path = Path::new(dir);
	if !path.is_dir() {
		return Ok(Vec::new());
	}

	let discovered = manifest::discover(path)?;
	let mut extensions = Vec::with_capacity(discovered.len());
	for (manifest_path, manifest) in discovered {
		let migration_path = manifest_path.with_file_name("migration.sql");
		let migration = if migration_path.is_file() {
			Some(std::fs::read_to_string(&migration_path)?)
		} else {
			None
		};

		tracing::info!(extension = %manifest.id, "discovered extension");
		extensions.push(Extension {
			manifest,
			block_handler: None,
			extrinsic_handler: None,
			event_handler: None,
			migration,
		});
	}
	Ok(extensions)
}
