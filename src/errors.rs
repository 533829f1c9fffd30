//! Typed error taxonomy. Each module owns a `thiserror` enum matched on at
//! retry/decision sites; `IndexerError` composes them for the outer
//! `anyhow::Result` boundary.

use thiserror::Error;

/// Wraps an `anyhow::Error` with the call site it was raised at, for context
/// that survives conversion to a boxed trait object.
#[macro_export]
macro_rules! here {
	() => {
		concat!("at ", file!(), " line ", line!(), " column ", column!())
	};
}

#[derive(Error, Debug)]
pub enum RpcError {
	#[error("all endpoints in the pool failed")]
	AllEndpointsFailed,
	#[error("rpc call timed out")]
	Timeout,
	#[error("transport error: {0}")]
	Transport(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("deadlock detected")]
	Deadlock,
	#[error("database connection error: {0}")]
	Connection(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] refinery::Error),
}

impl StoreError {
	/// True for the Postgres `40P01` deadlock_detected SQLSTATE class.
	pub fn is_deadlock(err: &sqlx::Error) -> bool {
		matches!(
			err,
			sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("40P01")
		)
	}
}

#[derive(Error, Debug)]
pub enum ManifestError {
	#[error("invalid manifest: {0}")]
	InvalidManifest(String),
	#[error("dependency cycle detected among extensions")]
	DependencyCycle,
	#[error("missing dependency: {0}")]
	MissingDependency(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
	#[error("data integrity violation: {0}")]
	DataIntegrity(String),
	#[error("handler failed: {0}")]
	HandlerFailed(String),
	#[error("fatal: {0}")]
	Fatal(String),
}

#[derive(Error, Debug)]
pub enum IndexerError {
	#[error(transparent)]
	Rpc(#[from] RpcError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Manifest(#[from] ManifestError),
	#[error(transparent)]
	Pipeline(#[from] PipelineError),
	#[error(transparent)]
	Config(#[from] config::ConfigError),
}
