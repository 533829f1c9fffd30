//! Plugin Registry: discovers extension manifests, orders them by
//! dependency, runs each extension's migration once, and builds the
//! dispatch maps used by the Block Processor.

pub mod manifest;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{RawBlock, RawEvent, RawExtrinsic};
use crate::errors::{ManifestError, PipelineError};
use manifest::ExtensionManifest;

/// Handle given to a plugin handler inside the block's transaction. Kept
/// opaque here; `crate::store` supplies the concrete transactional context.
pub struct HandlerContext<'a> {
	pub tx: &'a mut sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
	async fn on_block(&self, ctx: &mut HandlerContext<'_>, block: &RawBlock) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ExtrinsicHandler: Send + Sync {
	async fn on_extrinsic(
		&self,
		ctx: &mut HandlerContext<'_>,
		extrinsic: &RawExtrinsic,
	) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
	async fn on_event(&self, ctx: &mut HandlerContext<'_>, event: &RawEvent) -> anyhow::Result<()>;
}

pub struct Extension {
	pub manifest: ExtensionManifest,
	pub block_handler: Option<Arc<dyn BlockHandler>>,
	pub extrinsic_handler: Option<Arc<dyn ExtrinsicHandler>>,
	pub event_handler: Option<Arc<dyn EventHandler>>,
	pub migration: Option<String>,
}

/// Built once at startup; thereafter an immutable lookup table. No runtime
/// registration path.
pub struct PluginRegistry {
	block_handlers: Vec<Arc<dyn BlockHandler>>,
	extrinsic_handlers_by_pallet: HashMap<String, Vec<Arc<dyn ExtrinsicHandler>>>,
	event_handlers_by_key: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl PluginRegistry {
	/// Orders `extensions` by manifest dependency (topological), applies each
	/// migration exactly once via `store`, and builds the dispatch maps.
	pub async fn build(
		extensions: Vec<Extension>,
		store: &crate::store::Store,
	) -> Result<Self, ManifestError> {
		let ordered = topological_order(&extensions)?;

		let mut block_handlers = Vec::new();
		let mut extrinsic_handlers_by_pallet: HashMap<String, Vec<Arc<dyn ExtrinsicHandler>>> =
			HashMap::new();
		let mut event_handlers_by_key: HashMap<String, Vec<Arc<dyn EventHandler>>> = HashMap::new();

		for index in ordered {
			let extension = &extensions[index];

			if let Some(migration) = &extension.migration {
				store
					.apply_extension_migration_once(&extension.manifest.id, migration)
					.await
					.map_err(|err| {
						ManifestError::InvalidManifest(format!(
							"migration for {} failed: {err}",
							extension.manifest.id
						))
					})?;
			}

			if let Some(handler) = &extension.block_handler {
				block_handlers.push(handler.clone());
			}
			if let Some(handler) = &extension.extrinsic_handler {
				extrinsic_handlers_by_pallet
					.entry(extension.manifest.pallet_id.clone())
					.or_default()
					.push(handler.clone());
			}
			if let Some(handler) = &extension.event_handler {
				for event_key in &extension.manifest.supported_events {
					event_handlers_by_key.entry(event_key.clone()).or_default().push(handler.clone());
				}
			}
		}

		Ok(Self { block_handlers, extrinsic_handlers_by_pallet, event_handlers_by_key })
	}

	pub async fn invoke_block_handlers(
		&self,
		ctx: &mut HandlerContext<'_>,
		block: &RawBlock,
	) -> Result<(), PipelineError> {
		for handler in &self.block_handlers {
			handler
				.on_block(ctx, block)
				.await
				.map_err(|err| PipelineError::HandlerFailed(err.to_string()))?;
		}
		Ok(())
	}

	pub async fn invoke_extrinsic_handlers(
		&self,
		ctx: &mut HandlerContext<'_>,
		extrinsic: &RawExtrinsic,
	) -> Result<(), PipelineError> {
		if let Some(handlers) = self.extrinsic_handlers_by_pallet.get(&extrinsic.module) {
			for handler in handlers {
				handler
					.on_extrinsic(ctx, extrinsic)
					.await
					.map_err(|err| PipelineError::HandlerFailed(err.to_string()))?;
			}
		}
		Ok(())
	}

	pub async fn invoke_event_handlers(
		&self,
		ctx: &mut HandlerContext<'_>,
		event: &RawEvent,
	) -> Result<(), PipelineError> {
		if let Some(handlers) = self.event_handlers_by_key.get(&event.event_key()) {
			for handler in handlers {
				handler
					.on_event(ctx, event)
					.await
					.map_err(|err| PipelineError::HandlerFailed(err.to_string()))?;
			}
		}
		Ok(())
	}
}

fn topological_order(extensions: &[Extension]) -> Result<Vec<usize>, ManifestError> {
	let ids_to_index: HashMap<&str, usize> = extensions
		.iter()
		.enumerate()
		.map(|(i, e)| (e.manifest.id.as_str(), i))
		.collect();

	for extension in extensions {
		for dep in &extension.manifest.dependencies {
			if !ids_to_index.contains_key(dep.as_str()) {
				return Err(ManifestError::MissingDependency(dep.clone()));
			}
		}
	}

	let mut order = Vec::with_capacity(extensions.len());
	let mut visited = vec![false; extensions.len()];
	let mut in_progress = vec![false; extensions.len()];

	fn visit(
		index: usize,
		extensions: &[Extension],
		ids_to_index: &HashMap<&str, usize>,
		visited: &mut [bool],
		in_progress: &mut [bool],
		order: &mut Vec<usize>,
	) -> Result<(), ManifestError> {
		if visited[index] {
			return Ok(());
		}
		if in_progress[index] {
			return Err(ManifestError::DependencyCycle);
		}
		in_progress[index] = true;
		for dep in &extensions[index].manifest.dependencies {
			let dep_index = ids_to_index[dep.as_str()];
			visit(dep_index, extensions, ids_to_index, visited, in_progress, order)?;
		}
		in_progress[index] = false;
		visited[index] = true;
		order.push(index);
		Ok(())
	}

	for index in 0..extensions.len() {
		visit(index, extensions, &ids_to_index, &mut visited, &mut in_progress, &mut order)?;
	}

	let seen: HashSet<usize> = order.iter().copied().collect();
	debug_assert_eq!(seen.len(), extensions.len());

	Ok(order)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manifest(id: &str, deps: &[&str]) -> ExtensionManifest {
		ExtensionManifest {
			id: id.to_string(),
			name: id.to_string(),
			version: "0.1.0".to_string(),
			description: None,
			pallet_id: "Test".to_string(),
			supported_events: vec![],
			supported_calls: vec![],
			dependencies: deps.iter().map(|s| s.to_string()).collect(),
		}
	}

	fn extension(id: &str, deps: &[&str]) -> Extension {
		Extension {
			manifest: manifest(id, deps),
			block_handler: None,
			extrinsic_handler: None,
			event_handler: None,
			migration: None,
		}
	}

	#[test]
	fn topological_order_respects_dependencies() {
		let extensions = vec![extension("a", &["b"]), extension("b", &[])];
		let order = topological_order(&extensions).unwrap();
		let pos_a = order.iter().position(|&i| i == 0).unwrap();
		let pos_b = order.iter().position(|&i| i == 1).unwrap();
		assert!(pos_b < pos_a);
	}

	#[test]
	fn missing_dependency_is_an_error() {
		let extensions = vec![extension("a", &["ghost"])];
		assert!(matches!(
			topological_order(&extensions),
			Err(ManifestError::MissingDependency(_))
		));
	}

	#[test]
	fn dependency_cycle_is_an_error() {
		let extensions = vec![extension("a", &["b"]), extension("b", &["a"])];
		assert!(matches!(topological_order(&extensions), Err(ManifestError::DependencyCycle)));
	}
}
