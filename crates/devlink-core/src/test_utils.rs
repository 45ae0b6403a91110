//! Test fixtures for devlink-core

use std::fs;
use std::path::{Path, PathBuf};

/// Build a minimal manifest string with a dependency block.
pub fn manifest_json(name: &str, version: &str, deps: &[(&str, &str)]) -> String {
    let mut dependencies = serde_json::Map::new();
    for (dep, dep_version) in deps {
        dependencies.insert(
            dep.to_string(),
            serde_json::Value::String(dep_version.to_string()),
        );
    }
    serde_json::json!({
        "name": name,
        "version": version,
        "dependencies": dependencies,
    })
    .to_string()
}

/// Create a package directory with a `package.json` under `root`.
pub fn write_package(root: &Path, dir_name: &str, manifest: &str) -> PathBuf {
    let dir = root.join(dir_name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("package.json"), manifest).unwrap();
    dir
}
