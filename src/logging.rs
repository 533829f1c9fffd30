//! Structured logging initialization: one subscriber, installed once at
//! process start, before anything else runs.

use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum LogFormat {
	Pretty,
	Json,
}

pub fn init(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	match format {
		LogFormat::Pretty => {
			tracing_subscriber::fmt().with_env_filter(filter).init();
		},
		LogFormat::Json => {
			tracing_subscriber::fmt().json().with_env_filter(filter).init();
		},
	}
}
