//! Source and destination discovery.
//!
//! Enumerates packages in the source repository (single package or
//! workspaces), builds the name → path map the rest of devlink relies on, and
//! figures out which of those packages the destination actually depends on.
//! The name → path map is populated once here and treated as read-only by the
//! watch session.

use crate::manifest::{PackageJson, read_package_json};
use crate::{CLI_NAME, CONFIG_FILE_NAME};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name → absolute package root, populated once during setup.
pub type PackagePaths = BTreeMap<String, PathBuf>;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(
        "no `{CONFIG_FILE_NAME}` file found in {}\n\nRun `{CLI_NAME} init` to create one, or set the DEVLINK_SOURCE_PATH environment variable.",
        dir.display()
    )]
    MissingConfig { dir: PathBuf },
    #[error("errors parsing `{}`: {reason}", file.display())]
    InvalidConfig { file: PathBuf, reason: String },
    #[error("`source.path` must be an absolute path, got {}", path.display())]
    RelativeSourcePath { path: PathBuf },
    #[error(
        "no `package.json` found in {}\n\nThe directory must contain a `package.json` file.",
        dir.display()
    )]
    NoPackageJson { dir: PathBuf },
    #[error(
        "failed to detect the package manager in {}\n\nIf you have control over the destination, add the `packageManager` key to its `package.json`.",
        dir.display()
    )]
    NoPackageManager { dir: PathBuf },
}

/// Supported destination package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmKind {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PmKind {
    pub fn command(&self) -> &'static str {
        match self {
            PmKind::Npm => "npm",
            PmKind::Pnpm => "pnpm",
            PmKind::Yarn => "yarn",
            PmKind::Bun => "bun",
        }
    }

    /// Subcommand used to add new dependencies.
    pub fn add_subcommand(&self) -> &'static str {
        match self {
            PmKind::Npm => "install",
            _ => "add",
        }
    }
}

impl std::fmt::Display for PmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

#[derive(Debug, Clone)]
pub struct PackageManager {
    pub kind: PmKind,
    pub major_version: Option<u32>,
}

impl PackageManager {
    /// Yarn 3/4 cannot take `--registry` on the command line and needs its
    /// config rewritten instead.
    pub fn is_yarn_berry(&self) -> bool {
        self.kind == PmKind::Yarn && matches!(self.major_version, Some(3) | Some(4))
    }
}

/// Detect the package manager used in `dir` via the `packageManager` manifest
/// field, falling back to lockfiles.
pub fn detect_package_manager(dir: &Path) -> Option<PackageManager> {
    if let Ok(pkg) = read_package_json(&dir.join("package.json"))
        && let Some(spec) = pkg.package_manager
    {
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (spec.as_str(), None),
        };
        let kind = match name {
            "npm" => Some(PmKind::Npm),
            "pnpm" => Some(PmKind::Pnpm),
            "yarn" => Some(PmKind::Yarn),
            "bun" => Some(PmKind::Bun),
            _ => None,
        };
        if let Some(kind) = kind {
            let major_version =
                version.and_then(|v| v.split('.').next()).and_then(|m| m.parse().ok());
            return Some(PackageManager {
                kind,
                major_version,
            });
        }
    }

    let lockfiles = [
        ("package-lock.json", PmKind::Npm),
        ("pnpm-lock.yaml", PmKind::Pnpm),
        ("yarn.lock", PmKind::Yarn),
        ("bun.lockb", PmKind::Bun),
        ("bun.lock", PmKind::Bun),
    ];
    for (lockfile, kind) in lockfiles {
        if dir.join(lockfile).exists() {
            return Some(PackageManager {
                kind,
                major_version: None,
            });
        }
    }
    None
}

/// The repository containing the packages under active development.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: PathBuf,
    pub has_workspaces: bool,
    /// All package names found in the source.
    pub packages: Vec<String>,
    pub package_paths: PackagePaths,
    pub pm: Option<PackageManager>,
}

impl Source {
    pub fn discover(path: &Path) -> Result<Self, SetupError> {
        if !path.join("package.json").exists() {
            return Err(SetupError::NoPackageJson {
                dir: path.to_path_buf(),
            });
        }

        let patterns = workspace_patterns(path);
        let has_workspaces = !patterns.is_empty();
        let mut packages = Vec::new();
        let mut package_paths = PackagePaths::new();

        if has_workspaces {
            for member in expand_workspace_globs(path, &patterns) {
                let name = match read_package_json(&member.join("package.json")) {
                    Ok(PackageJson {
                        name: Some(name), ..
                    }) => name,
                    // Fall back to the directory name when the manifest has no
                    // name or cannot be parsed.
                    _ => match member.file_name().and_then(|n| n.to_str()) {
                        Some(dir_name) => dir_name.to_string(),
                        None => continue,
                    },
                };
                package_paths.insert(name.clone(), member);
                packages.push(name);
            }
        } else if let Ok(PackageJson {
            name: Some(name), ..
        }) = read_package_json(&path.join("package.json"))
        {
            package_paths.insert(name.clone(), path.to_path_buf());
            packages.push(name);
        }

        debug!(
            "Found {} package(s) in source {}",
            packages.len(),
            path.display()
        );

        Ok(Source {
            path: path.to_path_buf(),
            has_workspaces,
            packages,
            package_paths,
            pm: detect_package_manager(path),
        })
    }
}

/// The consumer project where source packages are installed for testing.
#[derive(Debug, Clone)]
pub struct Destination {
    pub path: PathBuf,
    pub has_workspaces: bool,
    /// Source packages the destination depends on, in source order.
    pub packages: Vec<String>,
    /// Roots of destination workspace members that declare source packages
    /// (just the destination root for non-workspace projects).
    pub package_dirs: Vec<PathBuf>,
    pub pm: PackageManager,
}

impl Destination {
    pub fn discover(path: &Path, source: &Source) -> Result<Self, SetupError> {
        if !path.join("package.json").exists() {
            return Err(SetupError::NoPackageJson {
                dir: path.to_path_buf(),
            });
        }
        let pm = detect_package_manager(path).ok_or_else(|| SetupError::NoPackageManager {
            dir: path.to_path_buf(),
        })?;

        let patterns = workspace_patterns(path);
        let has_workspaces = !patterns.is_empty();

        let mut member_dirs = vec![path.to_path_buf()];
        if has_workspaces {
            member_dirs.extend(expand_workspace_globs(path, &patterns));
        }

        let mut declared: Vec<String> = Vec::new();
        let mut package_dirs: Vec<PathBuf> = Vec::new();
        for dir in &member_dirs {
            let Ok(pkg) = read_package_json(&dir.join("package.json")) else {
                continue;
            };
            let names = pkg.declared_dependency_names();
            let mut declares_source_package = false;
            for name in names {
                if source.packages.contains(&name) {
                    declares_source_package = true;
                    if !declared.contains(&name) {
                        declared.push(name);
                    }
                }
            }
            if declares_source_package {
                package_dirs.push(dir.clone());
            }
        }

        // Keep source ordering, matching the traversal order used later.
        let packages: Vec<String> = source
            .packages
            .iter()
            .filter(|name| declared.contains(name))
            .cloned()
            .collect();

        debug!(
            "Found {} source package(s) used by destination {}",
            packages.len(),
            path.display()
        );

        Ok(Destination {
            path: path.to_path_buf(),
            has_workspaces,
            packages,
            package_dirs,
            pm,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PnpmWorkspaceFile {
    packages: Option<Vec<String>>,
}

/// Workspace glob patterns declared by a project, from either the manifest's
/// `workspaces` field or `pnpm-workspace.yaml`.
fn workspace_patterns(root: &Path) -> Vec<String> {
    let mut patterns = Vec::new();
    if let Ok(pkg) = read_package_json(&root.join("package.json"))
        && let Some(workspaces) = pkg.workspaces
    {
        patterns.extend(workspaces.patterns().iter().cloned());
    }
    let pnpm_workspace = root.join("pnpm-workspace.yaml");
    if let Ok(raw) = std::fs::read_to_string(&pnpm_workspace)
        && let Ok(file) = serde_yaml::from_str::<PnpmWorkspaceFile>(&raw)
    {
        patterns.extend(file.packages.unwrap_or_default());
    }
    patterns
}

/// Expand workspace globs into package roots: directories matching a pattern
/// that contain a `package.json`.
fn expand_workspace_globs(root: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let Some(glob_set) = build_glob_set(patterns) else {
        return Vec::new();
    };

    let mut members = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .hidden(true)
        .follow_links(false)
        .max_depth(Some(4))
        .filter_entry(|entry| entry.file_name() != "node_modules")
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_dir() || path == root {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if glob_set.is_match(relative) && path.join("package.json").exists() {
            members.push(path.to_path_buf());
        }
    }
    members.sort();
    members
}

fn build_glob_set(patterns: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // Negations are rare in workspace globs; skip them rather than match
        // the wrong directories.
        if pattern.starts_with('!') {
            continue;
        }
        let normalized = pattern.trim_end_matches('/');
        if let Ok(glob) = Glob::new(normalized) {
            builder.add(glob);
        }
    }
    builder.build().ok()
}
