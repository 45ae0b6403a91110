//! Publishing source packages to the local registry.
//!
//! Each publish temporarily rewrites the package's manifest to a unique
//! session version and repoints co-published source dependencies at their
//! session versions, so the destination install resolves everything against
//! the local registry. The rewrite is registered with the ignored-manifest
//! set before touching disk and reverted once `npm publish` returns.

use crate::spawn::{CommandSpec, run_command};
use anyhow::{Context, Result};
use devlink_core::{
    CLI_NAME, DIST_TAG, IgnoredManifests, IgnoredManifestsGuard, PackageJson, PackagePaths,
    read_package_json, source_package_json_path,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Session-unique version postfix shared by every package published in one
/// publish-and-install cycle.
pub fn version_postfix() -> String {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    format!(
        "{}-{:04x}",
        now.timestamp_millis(),
        now.nanosecond() & 0xffff
    )
}

pub struct PublishPackageArgs<'a> {
    pub registry_url: &'a str,
    pub package_name: &'a str,
    pub packages_to_publish: &'a [String],
    pub package_paths: &'a PackagePaths,
    pub version_postfix: &'a str,
    pub ignored_manifests: &'a IgnoredManifests,
    pub source_path: &'a Path,
    pub verbose: bool,
}

/// Publish one package, returning the session version it was published as.
pub async fn publish_package(args: PublishPackageArgs<'_>) -> Result<String> {
    let manifest_path = source_package_json_path(args.package_name, args.package_paths)
        .with_context(|| {
            format!(
                "couldn't find package.json for `{}` during publishing",
                args.package_name
            )
        })?;
    let pkg_dir = manifest_path
        .parent()
        .context("manifest path has no parent directory")?
        .to_path_buf();

    let adjusted = adjust_package_json(AdjustManifestArgs {
        manifest_path: &manifest_path,
        package_name: args.package_name,
        packages_to_publish: args.packages_to_publish,
        package_paths: args.package_paths,
        version_postfix: args.version_postfix,
        ignored_manifests: args.ignored_manifests,
    })?;
    let _npmrc = TempNpmRc::create(&pkg_dir, args.source_path, args.registry_url)?;

    info!(
        "Publishing `{}@{}` to local registry...",
        args.package_name, adjusted.new_version
    );

    let publish = CommandSpec::new(
        "npm",
        [
            "publish".to_string(),
            "--tag".to_string(),
            DIST_TAG.to_string(),
            format!("--registry={}", args.registry_url),
        ],
    )
    .current_dir(&pkg_dir);
    run_command(&publish, args.verbose).await.with_context(|| {
        format!(
            "failed to publish `{}@{}` to local registry",
            args.package_name, adjusted.new_version
        )
    })?;

    info!(
        "Published `{}@{}` to local registry",
        args.package_name, adjusted.new_version
    );
    Ok(adjusted.new_version)
}

struct AdjustManifestArgs<'a> {
    manifest_path: &'a Path,
    package_name: &'a str,
    packages_to_publish: &'a [String],
    package_paths: &'a PackagePaths,
    version_postfix: &'a str,
    ignored_manifests: &'a IgnoredManifests,
}

struct AdjustedManifest {
    new_version: String,
    _restore: ManifestRestoreGuard,
}

/// Writes the original manifest back on drop, then lifts the
/// ignored-manifest entry (fields drop in declaration order, so the restore
/// write is still suppressed).
struct ManifestRestoreGuard {
    path: PathBuf,
    original: String,
    _ignore: IgnoredManifestsGuard,
}

impl Drop for ManifestRestoreGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::write(&self.path, &self.original) {
            warn!("Failed to restore `{}`: {}", self.path.display(), e);
        }
    }
}

/// Rewrite the manifest to its session version and repoint co-published
/// source dependencies. Both the original and adjusted contents are
/// registered as ignored before the file is written.
fn adjust_package_json(args: AdjustManifestArgs<'_>) -> Result<AdjustedManifest> {
    let original = std::fs::read_to_string(args.manifest_path)
        .with_context(|| format!("failed to read {}", args.manifest_path.display()))?;
    let mut manifest: PackageJson = serde_json::from_str(&original)
        .with_context(|| format!("failed to parse {}", args.manifest_path.display()))?;

    let base_version = manifest.version.clone().with_context(|| {
        format!("`{}` has no version field, cannot publish", args.package_name)
    })?;
    let new_version = session_version(&base_version, args.version_postfix);
    manifest.version = Some(new_version.clone());

    if let Some(deps) = manifest.dependencies.as_mut() {
        for pkg_to_publish in args.packages_to_publish {
            if !deps.contains_key(pkg_to_publish) {
                continue;
            }
            let Some(dep_manifest_path) =
                source_package_json_path(pkg_to_publish, args.package_paths)
            else {
                continue;
            };
            if let Ok(PackageJson {
                version: Some(dep_version),
                ..
            }) = read_package_json(&dep_manifest_path)
            {
                deps.insert(
                    pkg_to_publish.clone(),
                    session_version(&dep_version, args.version_postfix),
                );
            }
        }
    }

    let adjusted =
        serde_json::to_string(&manifest).context("failed to serialize adjusted manifest")?;
    let ignore_guard = args.ignored_manifests.ignore(
        args.package_name,
        vec![original.clone(), adjusted.clone()],
    );
    std::fs::write(args.manifest_path, &adjusted)
        .with_context(|| format!("failed to write {}", args.manifest_path.display()))?;

    Ok(AdjustedManifest {
        new_version,
        _restore: ManifestRestoreGuard {
            path: args.manifest_path.to_path_buf(),
            original,
            _ignore: ignore_guard,
        },
    })
}

fn session_version(base_version: &str, version_postfix: &str) -> String {
    format!("{base_version}-{CLI_NAME}-{version_postfix}")
}

/// Anonymous publishing requires a dummy `.npmrc`, both next to the package
/// and at the source root. Removed again on drop.
struct TempNpmRc {
    paths: Vec<PathBuf>,
}

impl TempNpmRc {
    fn create(pkg_dir: &Path, source_path: &Path, registry_url: &str) -> Result<Self> {
        let content = format!(
            "{}/:_authToken=\"{CLI_NAME}\"",
            registry_url.trim_start_matches("http:")
        );
        let paths = vec![pkg_dir.join(".npmrc"), source_path.join(".npmrc")];
        for path in &paths {
            std::fs::write(path, &content)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(TempNpmRc { paths })
    }
}

impl Drop for TempNpmRc {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove `{}`: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_package(root: &Path, dir_name: &str, manifest: serde_json::Value) -> PathBuf {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
        dir
    }

    #[test]
    fn session_versions_embed_the_cli_name() {
        assert_eq!(session_version("1.2.3", "99-ab"), "1.2.3-devlink-99-ab");
    }

    #[test]
    fn version_postfixes_are_unique_per_call() {
        assert_ne!(version_postfix(), version_postfix());
    }

    #[test]
    fn adjust_rewrites_version_and_co_published_deps() {
        let temp = TempDir::new().unwrap();
        let pkg_a = write_package(
            temp.path(),
            "pkg-a",
            serde_json::json!({
                "name": "pkg-a",
                "version": "1.0.0",
                "dependencies": { "pkg-b": "^2.0.0", "lodash": "^4.0.0" },
            }),
        );
        let pkg_b = write_package(
            temp.path(),
            "pkg-b",
            serde_json::json!({ "name": "pkg-b", "version": "2.1.0" }),
        );
        let package_paths: PackagePaths = BTreeMap::from([
            ("pkg-a".to_string(), pkg_a.clone()),
            ("pkg-b".to_string(), pkg_b),
        ]);
        let ignored = IgnoredManifests::new();

        let to_publish = vec!["pkg-a".to_string(), "pkg-b".to_string()];
        let adjusted = adjust_package_json(AdjustManifestArgs {
            manifest_path: &pkg_a.join("package.json"),
            package_name: "pkg-a",
            packages_to_publish: &to_publish,
            package_paths: &package_paths,
            version_postfix: "77-ff",
            ignored_manifests: &ignored,
        })
        .unwrap();
        assert_eq!(adjusted.new_version, "1.0.0-devlink-77-ff");

        let on_disk = read_package_json(&pkg_a.join("package.json")).unwrap();
        assert_eq!(on_disk.version.as_deref(), Some("1.0.0-devlink-77-ff"));
        let deps = on_disk.dependencies_or_default();
        assert_eq!(deps.get("pkg-b").map(String::as_str), Some("2.1.0-devlink-77-ff"));
        assert_eq!(deps.get("lodash").map(String::as_str), Some("^4.0.0"));

        // Both manifest states are suppressed while the publish is in flight.
        let raw = std::fs::read_to_string(pkg_a.join("package.json")).unwrap();
        assert!(ignored.is_ignored("pkg-a", &raw));

        drop(adjusted);
        let restored = read_package_json(&pkg_a.join("package.json")).unwrap();
        assert_eq!(restored.version.as_deref(), Some("1.0.0"));
        assert!(!ignored.is_ignored("pkg-a", &raw));
    }

    #[test]
    fn temp_npmrc_is_written_and_removed() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("pkg-a");
        std::fs::create_dir_all(&pkg_dir).unwrap();

        let npmrc = TempNpmRc::create(&pkg_dir, temp.path(), "http://localhost:4873").unwrap();
        let content = std::fs::read_to_string(pkg_dir.join(".npmrc")).unwrap();
        assert_eq!(content, "//localhost:4873/:_authToken=\"devlink\"");
        assert!(temp.path().join(".npmrc").exists());

        drop(npmrc);
        assert!(!pkg_dir.join(".npmrc").exists());
        assert!(!temp.path().join(".npmrc").exists());
    }
}
