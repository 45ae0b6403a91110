//! Removal of stale compiled artifacts from installed packages.

use anyhow::{Context, Result};
use devlink_core::PackagePaths;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::Path;
use tracing::{debug, warn};

fn artifact_globs() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new("**/*.js")?);
    builder.add(Glob::new("**/*.js.map")?);
    Ok(builder.build()?)
}

/// Delete compiled `.js` and `.js.map` files under `node_modules/<pkg>` for
/// each named package, so freshly installed output is not shadowed by files
/// a previous session copied in. Nested `node_modules` and `src` trees are
/// left alone.
pub fn clear_stale_artifacts(
    destination_path: &Path,
    package_names: impl IntoIterator<Item = String>,
    package_paths: &PackagePaths,
) -> Result<()> {
    let globs = artifact_globs()?;
    for package_name in package_names {
        if !package_paths.contains_key(&package_name) {
            continue;
        }
        let installed_dir = destination_path.join("node_modules").join(&package_name);
        if !installed_dir.exists() {
            continue;
        }
        debug!(
            "Clearing stale artifacts from `{}`",
            installed_dir.display()
        );
        let walk = WalkBuilder::new(&installed_dir)
            .standard_filters(false)
            .filter_entry(|entry| {
                let skip_dir = entry.file_type().is_some_and(|t| t.is_dir())
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name == "node_modules" || name == "src");
                !skip_dir
            })
            .build();
        for entry in walk.flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&installed_dir)
                .context("walked outside the installed package")?;
            if globs.is_match(relative)
                && let Err(e) = std::fs::remove_file(entry.path())
            {
                warn!("Failed to remove `{}`: {}", entry.path().display(), e);
            }
        }
    }
    Ok(())
}
