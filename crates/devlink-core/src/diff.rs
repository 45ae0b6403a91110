//! Dependency change detection between a source manifest and the copy
//! installed in the destination's `node_modules`.
//!
//! Decides whether a manifest edit requires a republish-and-install cycle.
//! The engine errs on the side of publishing: an unreadable manifest or a
//! failed registry fallback reports a change rather than silently assuming
//! none.

use crate::manifest::{
    DependencyMap, PackageJson, pinned_package_version, source_package_json_path,
};
use crate::setup::PackagePaths;
use crate::{CLI_NAME, DIST_TAG};
use anyhow::{Context, Result, bail};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// CDN serving published package manifests for the initial-scan fallback.
pub const PUBLISHED_MANIFEST_BASE_URL: &str = "https://unpkg.com";

/// Manifest contents written by the publish flow itself. A watcher event
/// whose content matches an entry here is devlink's own write-back, not a
/// user change. Entries must be registered strictly before the write.
#[derive(Debug, Clone, Default)]
pub struct IgnoredManifests {
    inner: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl IgnoredManifests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transient manifest contents for a package. The returned
    /// guard removes the entry when the publish step completes (or is
    /// abandoned on error).
    pub fn ignore(&self, package_name: &str, contents: Vec<String>) -> IgnoredManifestsGuard {
        self.inner
            .lock()
            .expect("ignored manifests lock poisoned")
            .insert(package_name.to_string(), contents);
        IgnoredManifestsGuard {
            inner: Arc::clone(&self.inner),
            package_name: package_name.to_string(),
        }
    }

    pub fn is_ignored(&self, package_name: &str, content: &str) -> bool {
        self.inner
            .lock()
            .expect("ignored manifests lock poisoned")
            .get(package_name)
            .is_some_and(|contents| contents.iter().any(|known| known == content))
    }
}

/// Removes the package's ignored-manifest entry on drop.
#[derive(Debug)]
pub struct IgnoredManifestsGuard {
    inner: Arc<Mutex<HashMap<String, Vec<String>>>>,
    package_name: String,
}

impl Drop for IgnoredManifestsGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .expect("ignored manifests lock poisoned")
            .remove(&self.package_name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepsChangeResult {
    /// A republish-and-install cycle is required.
    pub did_deps_change: bool,
    /// The package was absent from the destination's `node_modules`.
    pub pkg_not_installed: bool,
}

/// Owned inputs so a check can run as a spawned task during the initial scan.
#[derive(Debug, Clone)]
pub struct CheckDepsArgs {
    /// Manifest of the installed copy inside `node_modules`.
    pub installed_manifest_path: PathBuf,
    pub package_name: String,
    pub source_packages: Arc<Vec<String>>,
    pub package_paths: Arc<PackagePaths>,
    /// Destination project root, used to resolve the pinned version for the
    /// registry fallback.
    pub destination_path: PathBuf,
    pub is_initial_scan: bool,
    pub ignored_manifests: IgnoredManifests,
    /// Base URL for the published-manifest fallback. `None` uses
    /// [`PUBLISHED_MANIFEST_BASE_URL`].
    pub fallback_registry_url: Option<String>,
}

/// Compare the destination-installed manifest against the source manifest's
/// dependency block and decide whether the package must be republished.
pub async fn check_deps_changes(args: CheckDepsArgs) -> DepsChangeResult {
    let mut pkg_not_installed = false;

    let installed: PackageJson = match tokio::fs::read_to_string(&args.installed_manifest_path)
        .await
    {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(err) => {
                error!(
                    "Failed to parse {}: {err}",
                    args.installed_manifest_path.display()
                );
                return DepsChangeResult {
                    did_deps_change: true,
                    pkg_not_installed,
                };
            }
        },
        Err(_) => {
            pkg_not_installed = true;

            if !args.is_initial_scan {
                info!(
                    "`{}` does not seem to be installed. Restart {CLI_NAME} to publish it.",
                    args.package_name
                );
                return DepsChangeResult {
                    did_deps_change: false,
                    pkg_not_installed,
                };
            }

            // Best-effort fallback: fetch the published manifest for the
            // pinned version so a comparison baseline exists without forcing
            // a republish.
            match fetch_published_manifest(&args).await {
                Ok(manifest) => manifest,
                Err(err) => {
                    error!(
                        "`{}` does not seem to be installed and is also not published on npm. Error: {err:#}",
                        args.package_name
                    );
                    return DepsChangeResult {
                        did_deps_change: true,
                        pkg_not_installed,
                    };
                }
            }
        }
    };

    let Some(source_manifest_path) =
        source_package_json_path(&args.package_name, &args.package_paths)
    else {
        // Package isn't tracked; nothing actionable.
        return DepsChangeResult {
            did_deps_change: false,
            pkg_not_installed,
        };
    };

    let source_raw = match tokio::fs::read_to_string(&source_manifest_path).await {
        Ok(raw) => raw,
        Err(err) => {
            error!("Failed to read {}: {err}", source_manifest_path.display());
            return DepsChangeResult {
                did_deps_change: true,
                pkg_not_installed,
            };
        }
    };
    let source: PackageJson = match serde_json::from_str(&source_raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("Failed to parse {}: {err}", source_manifest_path.display());
            return DepsChangeResult {
                did_deps_change: true,
                pkg_not_installed,
            };
        }
    };

    if args
        .ignored_manifests
        .is_ignored(&args.package_name, &source_raw)
    {
        // Mid-publish content written by devlink itself.
        return DepsChangeResult {
            did_deps_change: false,
            pkg_not_installed,
        };
    }

    let source_deps = source.dependencies_or_default();
    let installed_deps = installed.dependencies_or_default();

    if source_deps == installed_deps {
        return DepsChangeResult {
            did_deps_change: false,
            pkg_not_installed,
        };
    }

    let forward = difference(&source_deps, &installed_deps);
    let backward = difference(&installed_deps, &source_deps);
    let changed_keys: BTreeSet<&String> = forward.keys().chain(backward.keys()).collect();

    let mut needs_publishing = false;
    let mut is_publishing = false;
    let mut changelog: Vec<String> = Vec::new();

    for key in changed_keys {
        if source_deps.get(key).map(String::as_str) == Some(DIST_TAG) {
            // Mid-publish to the local registry.
            is_publishing = true;
            continue;
        }
        if installed_deps.get(key).map(String::as_str) == Some(DIST_TAG) {
            // Expected artifact of a prior publish in the destination.
            continue;
        }

        match (installed_deps.get(key), source_deps.get(key)) {
            (Some(old), Some(new)) => {
                // Version changes of source-tracked packages are handled by
                // direct file copy, not by republishing.
                if !args.source_packages.contains(key) {
                    changelog.push(format!(" - `{key}` changed version from {old} to {new}"));
                    needs_publishing = true;
                }
            }
            (None, Some(new)) => {
                changelog.push(format!(" - `{key}@{new}` was added"));
                needs_publishing = true;
            }
            (Some(old), None) => {
                // A removal in source doesn't need installing.
                changelog.push(format!(" - `{key}@{old}` was removed"));
            }
            (None, None) => unreachable!("key came from the symmetric difference"),
        }
    }

    if !is_publishing && !changelog.is_empty() {
        info!(
            "Dependencies of `{}` changed:\n{}",
            args.package_name,
            changelog.join("\n")
        );

        if args.is_initial_scan {
            info!(
                "Will {}publish to local registry.",
                if needs_publishing { "" } else { "not " }
            );
        } else {
            warn!("Installation of dependencies after initial scan is not supported in {CLI_NAME}.");
        }

        return DepsChangeResult {
            did_deps_change: needs_publishing,
            pkg_not_installed,
        };
    }

    DepsChangeResult {
        did_deps_change: false,
        pkg_not_installed,
    }
}

/// Entries of `a` whose value differs from (or is absent in) `b`. Calling
/// this both ways covers the symmetric difference.
pub fn difference(a: &DependencyMap, b: &DependencyMap) -> DependencyMap {
    a.iter()
        .filter(|(key, value)| b.get(*key) != Some(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

async fn fetch_published_manifest(args: &CheckDepsArgs) -> Result<PackageJson> {
    let version = pinned_package_version(&args.destination_path, &args.package_name);
    let base = args
        .fallback_registry_url
        .as_deref()
        .unwrap_or(PUBLISHED_MANIFEST_BASE_URL);
    let url = format!("{base}/{}@{}/package.json", args.package_name, version);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("request to {url} failed"))?;
    if !response.status().is_success() {
        bail!("no response or non-200 response from {url}");
    }
    response
        .json::<PackageJson>()
        .await
        .with_context(|| format!("invalid manifest returned from {url}"))
}
