//! Structured concurrency: a root cancellation token plus a join set of
//! children, so `stop()` can cancel and await the whole task tree with a
//! deadline instead of leaking detached tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owns a cancellation token and the set of tasks spawned under it. Dropping
/// a `Scope` does not cancel its children; call `cancel()` explicitly.
pub struct Scope {
	token: CancellationToken,
	tasks: JoinSet<anyhow::Result<()>>,
}

impl Scope {
	pub fn new() -> Self {
		Self { token: CancellationToken::new(), tasks: JoinSet::new() }
	}

	pub fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	/// Spawn a child whose failure should be observed when the scope is run.
	pub fn spawn<F>(&mut self, fut: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.tasks.spawn(fut);
	}

	/// Spawn a child whose failure is logged but does not fail the scope run
	/// (used for best-effort servers like the metrics endpoint).
	pub fn spawn_weak<F>(&mut self, fut: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.tasks.spawn(async move {
			if let Err(err) = fut.await {
				tracing::warn!(error = %err, "weak task exited with error");
			}
			Ok(())
		});
	}

	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Waits for every spawned child to finish, up to `deadline`. Returns the
	/// first error observed, if any.
	pub async fn join(mut self, deadline: Duration) -> anyhow::Result<()> {
		let join_all = async {
			let mut first_err = None;
			while let Some(result) = self.tasks.join_next().await {
				match result {
					Ok(Ok(())) => {},
					Ok(Err(err)) if first_err.is_none() => first_err = Some(err),
					Err(join_err) if first_err.is_none() => {
						first_err = Some(anyhow::anyhow!("task panicked: {join_err}"))
					},
					_ => {},
				}
			}
			first_err
		};

		match tokio::time::timeout(deadline, join_all).await {
			Ok(Some(err)) => Err(err),
			Ok(None) => Ok(()),
			Err(_) => Err(anyhow::anyhow!("scope did not shut down within {deadline:?}")),
		}
	}
}

impl Default for Scope {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn join_propagates_first_error() {
		let mut scope = Scope::new();
		scope.spawn(async { Err(anyhow::anyhow!("boom")) });
		let result = scope.join(Duration::from_secs(1)).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn join_succeeds_when_all_children_succeed() {
		let mut scope = Scope::new();
		scope.spawn(async { Ok(()) });
		scope.spawn(async { Ok(()) });
		scope.join(Duration::from_secs(1)).await.unwrap();
	}

	#[tokio::test]
	async fn cancel_signals_token() {
		let scope = Scope::new();
		let token = scope.token();
		assert!(!token.is_cancelled());
		scope.cancel();
		assert!(token.is_cancelled());
	}
}
