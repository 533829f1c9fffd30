//! Extension manifest: discovery, parsing, and validation.

use std::path::Path;

use serde::Deserialize;

use crate::errors::ManifestError;

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionManifest {
	pub id: String,
	pub name: String,
	pub version: String,
	pub description: Option<String>,
	#[serde(rename = "palletId")]
	pub pallet_id: String,
	#[serde(rename = "supportedEvents")]
	pub supported_events: Vec<String>,
	#[serde(rename = "supportedCalls")]
	pub supported_calls: Vec<String>,
	#[serde(default)]
	pub dependencies: Vec<String>,
}

/// Validates the raw JSON shape before attempting a typed deserialize, so
/// validation error messages name the specific offending field the way
/// scenario 6 requires ("supportedEvents must contain only strings").
pub fn validate(raw: &serde_json::Value) -> Result<(), ManifestError> {
	let obj = raw
		.as_object()
		.ok_or_else(|| ManifestError::InvalidManifest("manifest must be a JSON object".to_string()))?;

	for field in ["id", "name", "version", "palletId"] {
		match obj.get(field) {
			Some(serde_json::Value::String(s)) if !s.is_empty() => {},
			Some(serde_json::Value::String(_)) => {
				return Err(ManifestError::InvalidManifest(format!("{field} must be non-empty")))
			},
			_ => return Err(ManifestError::InvalidManifest(format!("{field} must be a non-empty string"))),
		}
	}

	for field in ["supportedEvents", "supportedCalls"] {
		match obj.get(field) {
			Some(serde_json::Value::Array(items)) => {
				if !items.iter().all(|v| v.is_string()) {
					return Err(ManifestError::InvalidManifest(format!(
						"{field} must contain only strings"
					)));
				}
			},
			_ => return Err(ManifestError::InvalidManifest(format!("{field} must be a string array"))),
		}
	}

	if let Some(deps) = obj.get("dependencies") {
		match deps {
			serde_json::Value::Array(items) if items.iter().all(|v| v.is_string()) => {},
			_ => {
				return Err(ManifestError::InvalidManifest(
					"dependencies must be a string array".to_string(),
				))
			},
		}
	}

	if let Some(description) = obj.get("description") {
		if !description.is_string() {
			return Err(ManifestError::InvalidManifest("description must be a string".to_string()));
		}
	}

	Ok(())
}

pub fn parse(raw: &serde_json::Value) -> Result<ExtensionManifest, ManifestError> {
	validate(raw)?;
	serde_json::from_value(raw.clone())
		.map_err(|err| ManifestError::InvalidManifest(format!("manifest deserialize failed: {err}")))
}

/// Scans `dir` for `manifest.json` files, one per extension subdirectory.
pub fn discover(dir: &Path) -> Result<Vec<(std::path::PathBuf, ExtensionManifest)>, ManifestError> {
	let mut found = Vec::new();
	let entries = std::fs::read_dir(dir)
		.map_err(|err| ManifestError::InvalidManifest(format!("cannot read {}: {err}", dir.display())))?;

	for entry in entries {
		let entry = entry
			.map_err(|err| ManifestError::InvalidManifest(format!("directory entry error: {err}")))?;
		let manifest_path = entry.path().join("manifest.json");
		if !manifest_path.is_file() {
			continue;
		}
		let text = std::fs::read_to_string(&manifest_path).map_err(|err| {
			ManifestError::InvalidManifest(format!("cannot read {}: {err}", manifest_path.display()))
		})?;
		let raw: serde_json::Value = serde_json::from_str(&text)
			.map_err(|err| ManifestError::InvalidManifest(format!("invalid JSON in {}: {err}", manifest_path.display())))?;
		found.push((manifest_path, parse(&raw)?));
	}

	Ok(found)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn non_string_supported_events_is_invalid_manifest() {
		let raw = json!({
			"id": "ext",
			"name": "Ext",
			"version": "1.0.0",
			"palletId": "Balances",
			"supportedEvents": [123],
			"supportedCalls": []
		});
		let err = validate(&raw).unwrap_err();
		assert!(matches!(err, ManifestError::InvalidManifest(msg) if msg.contains("supportedEvents must contain only strings")));
	}

	#[test]
	fn valid_manifest_parses() {
		let raw = json!({
			"id": "ext",
			"name": "Ext",
			"version": "1.0.0",
			"palletId": "Balances",
			"supportedEvents": ["Balances.Transfer"],
			"supportedCalls": ["transfer"],
			"dependencies": []
		});
		let manifest = parse(&raw).unwrap();
		assert_eq!(manifest.id, "ext");
		assert_eq!(manifest.pallet_id, "Balances");
	}

	#[test]
	fn empty_id_is_invalid() {
		let raw = json!({
			"id": "",
			"name": "Ext",
			"version": "1.0.0",
			"palletId": "Balances",
			"supportedEvents": [],
			"supportedCalls": []
		});
		assert!(validate(&raw).is_err());
	}

	#[test]
	fn discover_scans_one_manifest_per_subdirectory() {
		let root = tempfile::tempdir().unwrap();

		let ext_dir = root.path().join("balances_watcher");
		std::fs::create_dir(&ext_dir).unwrap();
		std::fs::write(
			ext_dir.join("manifest.json"),
			json!({
				"id": "balances_watcher",
				"name": "Balances Watcher",
				"version": "1.0.0",
				"palletId": "Balances",
				"supportedEvents": ["Balances.Transfer"],
				"supportedCalls": []
			})
			.to_string(),
		)
		.unwrap();

		// a subdirectory with no manifest.json is silently skipped
		std::fs::create_dir(root.path().join("not_an_extension")).unwrap();

		let found = discover(root.path()).unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].1.id, "balances_watcher");
	}
}
