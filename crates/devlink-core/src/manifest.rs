//! Package manifest (`package.json`) model and helpers.
//!
//! Manifests are read fresh from disk on demand — they are the primary signal
//! of change, so caching them across watch iterations would hide edits.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Dependency block of a manifest: name → version specifier.
pub type DependencyMap = BTreeMap<String, String>;

/// The subset of `package.json` devlink cares about. Unknown fields are kept
/// in `extra` so a manifest survives a parse/serialize round trip intact
/// (required when rewriting versions during publishing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyMap>,
    #[serde(rename = "devDependencies", skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<DependencyMap>,
    #[serde(rename = "peerDependencies", skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<DependencyMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Workspaces>,
    #[serde(rename = "packageManager", skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The `workspaces` field comes in two shapes: a plain pattern list or an
/// object with a `packages` key (old yarn style).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Workspaces {
    Patterns(Vec<String>),
    Detailed { packages: Vec<String> },
}

impl Workspaces {
    pub fn patterns(&self) -> &[String] {
        match self {
            Workspaces::Patterns(patterns) => patterns,
            Workspaces::Detailed { packages } => packages,
        }
    }
}

impl PackageJson {
    /// Dependency block, defaulting to empty. Diffing must never see a null
    /// block.
    pub fn dependencies_or_default(&self) -> DependencyMap {
        self.dependencies.clone().unwrap_or_default()
    }

    /// Names declared in `dependencies` and `devDependencies`.
    pub fn declared_dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for block in [&self.dependencies, &self.dev_dependencies].into_iter().flatten() {
            for name in block.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }
}

/// Read and parse a manifest from disk.
pub fn read_package_json(path: &Path) -> Result<PackageJson> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Path to the source manifest of `package_name`, if the package is tracked.
pub fn source_package_json_path(
    package_name: &str,
    package_paths: &BTreeMap<String, PathBuf>,
) -> Option<PathBuf> {
    package_paths
        .get(package_name)
        .map(|root| root.join("package.json"))
}

/// Version of `package_name` pinned by the manifest in `dir`, falling back to
/// `latest` when the package or a version for it cannot be found.
pub fn pinned_package_version(dir: &Path, package_name: &str) -> String {
    read_package_json(&dir.join("package.json"))
        .ok()
        .and_then(|pkg| {
            pkg.dependencies
                .as_ref()
                .and_then(|deps| deps.get(package_name))
                .or_else(|| {
                    pkg.dev_dependencies
                        .as_ref()
                        .and_then(|deps| deps.get(package_name))
                })
                .cloned()
        })
        .unwrap_or_else(|| "latest".to_string())
}
