//! Layered settings: a default TOML file merged with `INDEXER_`-prefixed
//! environment variables, then a small CLI overlay for process-level flags.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::logging::LogFormat;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
	pub url: String,
	#[serde(default = "default_pool_size")]
	pub max_connections: u32,
}

fn default_pool_size() -> u32 {
	10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
	/// Comma-separated in the environment; split at load time. A local node
	/// URL, if any, should be first — the weighted router naturally prefers it.
	pub endpoints: Vec<String>,
	#[serde(default = "default_call_timeout_ms")]
	pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
	15_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
	#[serde(default = "default_window")]
	pub window: usize,
	#[serde(default = "default_expected_block_time_ms")]
	pub expected_block_time_ms: u64,
	#[serde(default = "default_lookback")]
	pub lookback: u32,
	#[serde(default = "default_stop_deadline_secs")]
	pub stop_deadline_secs: u64,
}

fn default_window() -> usize {
	32
}
fn default_expected_block_time_ms() -> u64 {
	6_000
}
fn default_lookback() -> u32 {
	100
}
fn default_stop_deadline_secs() -> u64 {
	30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
	#[serde(default = "default_metrics_host")]
	pub host: String,
	#[serde(default = "default_metrics_port")]
	pub port: u16,
}

fn default_metrics_host() -> String {
	"127.0.0.1".to_string()
}
fn default_metrics_port() -> u16 {
	5566
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub database: DatabaseSettings,
	pub rpc: RpcSettings,
	#[serde(default = "PipelineSettings::default_from_serde")]
	pub pipeline: PipelineSettings,
	#[serde(default = "MetricsSettings::default_from_serde")]
	pub metrics: MetricsSettings,
}

impl PipelineSettings {
	fn default_from_serde() -> Self {
		Self {
			window: default_window(),
			expected_block_time_ms: default_expected_block_time_ms(),
			lookback: default_lookback(),
			stop_deadline_secs: default_stop_deadline_secs(),
		}
	}
}

impl MetricsSettings {
	fn default_from_serde() -> Self {
		Self { host: default_metrics_host(), port: default_metrics_port() }
	}
}

impl Settings {
	pub fn load(config_path: &str) -> Result<Self, ConfigError> {
		let s = Config::builder()
			.add_source(File::with_name(config_path).required(false))
			.add_source(
				Environment::with_prefix("INDEXER")
					.separator("__")
					.list_separator(",")
					.with_list_parse_key("rpc.endpoints"),
			)
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Parser, Debug)]
#[command(name = "substrate-indexer", about = "Substrate-style chain indexer")]
pub struct Cli {
	#[arg(long, default_value = "config/default.toml")]
	pub config: String,

	#[arg(long, value_enum, default_value = "pretty")]
	pub log_format: LogFormat,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pipeline_defaults_match_spec() {
		let defaults = PipelineSettings::default_from_serde();
		assert_eq!(defaults.window, 32);
		assert_eq!(defaults.lookback, 100);
	}
}
