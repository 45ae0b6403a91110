//! Installing locally published packages into the destination.

use crate::spawn::{CommandSpec, run_command};
use anyhow::{Context, Result};
use devlink_core::{DIST_TAG, DependencyMap, Destination, PackageJson, PmKind, read_package_json};
use std::collections::BTreeMap;
use tracing::{debug, info};

const BUN_REGISTRY_ENV: &str = "BUN_CONFIG_REGISTRY";

pub struct InstallArgs<'a> {
    pub registry_url: &'a str,
    pub packages_to_install: Vec<String>,
    pub new_versions: BTreeMap<String, String>,
    pub destination: &'a Destination,
    pub verbose: bool,
}

/// Install the newly published versions into the destination project using
/// its own package manager.
pub async fn install_packages(args: InstallArgs<'_>) -> Result<()> {
    let destination = args.destination;
    let listing: Vec<String> = args
        .packages_to_install
        .iter()
        .map(|name| format!(" - {name}"))
        .collect();
    info!(
        "Installing packages from local registry:\n{}",
        listing.join("\n")
    );

    let mut external_registry = false;
    let mut env: Vec<(String, String)> = Vec::new();

    if destination.pm.is_yarn_berry() {
        // Yarn 3/4 reject --registry on the command line; point its config at
        // the local registry instead.
        external_registry = true;
        run_command(
            &CommandSpec::new(
                "yarn",
                ["config", "set", "npmRegistryServer", args.registry_url],
            )
            .current_dir(&destination.path),
            args.verbose,
        )
        .await?;
        run_command(
            &CommandSpec::new(
                "yarn",
                ["config", "set", "unsafeHttpWhitelist", "--json", "[\"localhost\"]"],
            )
            .current_dir(&destination.path),
            args.verbose,
        )
        .await?;
    }

    if destination.pm.kind == PmKind::Bun {
        external_registry = true;
        env.push((BUN_REGISTRY_ENV.to_string(), args.registry_url.to_string()));
    }

    let mut cmd = if destination.has_workspaces {
        retag_workspace_manifests(destination, &args.packages_to_install, &args.new_versions)?;
        install_cmd(&destination.pm.kind, external_registry, args.registry_url)
    } else {
        let packages: Vec<String> = args
            .packages_to_install
            .iter()
            .map(|name| {
                let version = args
                    .new_versions
                    .get(name)
                    .map(String::as_str)
                    .unwrap_or(DIST_TAG);
                format!("{name}@{version}")
            })
            .collect();
        add_dependencies_cmd(
            &packages,
            &destination.pm.kind,
            external_registry,
            args.registry_url,
        )
    };
    cmd = cmd.current_dir(&destination.path);
    for (key, value) in env {
        cmd = cmd.env(key, value);
    }

    run_command(&cmd, args.verbose)
        .await
        .context("installation failed")?;
    info!("Installation finished successfully!");
    Ok(())
}

/// Install whatever the destination already declares, straight from the
/// public registry. Used when nothing needs publishing but a package is
/// missing from `node_modules`.
pub async fn install_from_public_registry(
    destination: &Destination,
    verbose: bool,
) -> Result<()> {
    info!("Installing dependencies from public npm registry...");
    let cmd = CommandSpec::new(destination.pm.kind.command(), ["install"])
        .current_dir(&destination.path);
    run_command(&cmd, verbose)
        .await
        .context("installation from public registry failed")?;
    info!("Installation complete");
    Ok(())
}

/// `<pm> add pkg@version --exact`, pointed at the local registry unless the
/// package manager is configured out-of-band.
pub fn add_dependencies_cmd(
    packages: &[String],
    pm: &PmKind,
    external_registry: bool,
    registry_url: &str,
) -> CommandSpec {
    let mut args: Vec<String> = vec![pm.add_subcommand().to_string()];
    args.extend(packages.iter().cloned());
    args.push("--exact".to_string());
    if !external_registry {
        args.push(format!("--registry={registry_url}"));
    }
    CommandSpec::new(pm.command(), args)
}

/// Plain `<pm> install`, used when the destination has workspaces and the
/// member manifests have already been repointed.
pub fn install_cmd(pm: &PmKind, external_registry: bool, registry_url: &str) -> CommandSpec {
    let mut args: Vec<String> = vec!["install".to_string()];
    if !external_registry {
        args.push(format!("--registry={registry_url}"));
    }
    CommandSpec::new(pm.command(), args)
}

/// Repoint source-package versions in a manifest at the newly published
/// session versions. Returns whether anything changed.
pub fn set_dist_tag_in_deps(
    manifest: &mut PackageJson,
    packages_to_install: &[String],
    new_versions: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    let blocks = [
        manifest.dependencies.as_mut(),
        manifest.dev_dependencies.as_mut(),
        manifest.peer_dependencies.as_mut(),
    ];
    for deps in blocks.into_iter().flatten() {
        changed |= adjust_deps(deps, packages_to_install, new_versions);
    }
    changed
}

fn adjust_deps(
    deps: &mut DependencyMap,
    packages_to_install: &[String],
    new_versions: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for name in packages_to_install {
        if deps.contains_key(name)
            && let Some(version) = new_versions.get(name)
        {
            deps.insert(name.clone(), version.clone());
            changed = true;
        }
    }
    changed
}

/// Rewrite every destination workspace member that declares a source
/// package, so a plain install resolves them from the local registry.
fn retag_workspace_manifests(
    destination: &Destination,
    packages_to_install: &[String],
    new_versions: &BTreeMap<String, String>,
) -> Result<()> {
    for dir in &destination.package_dirs {
        let manifest_path = dir.join("package.json");
        let mut manifest = read_package_json(&manifest_path)?;
        if set_dist_tag_in_deps(&mut manifest, packages_to_install, new_versions) {
            debug!(
                "Adjusting dependencies in {} to use newly published versions.",
                manifest_path.display()
            );
            let raw = serde_json::to_string_pretty(&manifest)
                .context("failed to serialize adjusted manifest")?;
            std::fs::write(&manifest_path, raw)
                .with_context(|| format!("failed to write {}", manifest_path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_versions() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("pkg-a".to_string(), "1.0.0-devlink-7".to_string()),
            ("pkg-b".to_string(), "2.0.0-devlink-7".to_string()),
        ])
    }

    #[test]
    fn npm_uses_install_subcommand_with_registry() {
        let cmd = add_dependencies_cmd(
            &["pkg-a@1.0.0-devlink-7".to_string()],
            &PmKind::Npm,
            false,
            "http://localhost:4873",
        );
        assert_eq!(cmd.program, "npm");
        assert_eq!(
            cmd.args,
            vec![
                "install",
                "pkg-a@1.0.0-devlink-7",
                "--exact",
                "--registry=http://localhost:4873",
            ]
        );
    }

    #[test]
    fn pnpm_uses_add_subcommand() {
        let cmd = add_dependencies_cmd(
            &["pkg-a@1.0.0-devlink-7".to_string()],
            &PmKind::Pnpm,
            false,
            "http://localhost:4873",
        );
        assert_eq!(cmd.program, "pnpm");
        assert_eq!(cmd.args[0], "add");
    }

    #[test]
    fn external_registry_drops_the_registry_flag() {
        let cmd = add_dependencies_cmd(
            &["pkg-a@1.0.0-devlink-7".to_string()],
            &PmKind::Yarn,
            true,
            "http://localhost:4873",
        );
        assert!(!cmd.args.iter().any(|arg| arg.starts_with("--registry")));

        let cmd = install_cmd(&PmKind::Bun, true, "http://localhost:4873");
        assert_eq!(cmd.args, vec!["install"]);
    }

    #[test]
    fn set_dist_tag_rewrites_all_dependency_blocks() {
        let mut manifest: PackageJson = serde_json::from_value(serde_json::json!({
            "name": "consumer",
            "dependencies": { "pkg-a": "^1.0.0", "lodash": "^4.0.0" },
            "devDependencies": { "pkg-b": "^2.0.0" },
            "peerDependencies": { "pkg-a": ">=1" },
        }))
        .unwrap();

        let changed = set_dist_tag_in_deps(
            &mut manifest,
            &["pkg-a".to_string(), "pkg-b".to_string()],
            &new_versions(),
        );
        assert!(changed);
        assert_eq!(
            manifest.dependencies_or_default().get("pkg-a").map(String::as_str),
            Some("1.0.0-devlink-7")
        );
        assert_eq!(
            manifest.dependencies_or_default().get("lodash").map(String::as_str),
            Some("^4.0.0")
        );
        assert_eq!(
            manifest
                .dev_dependencies
                .as_ref()
                .and_then(|deps| deps.get("pkg-b"))
                .map(String::as_str),
            Some("2.0.0-devlink-7")
        );
        assert_eq!(
            manifest
                .peer_dependencies
                .as_ref()
                .and_then(|deps| deps.get("pkg-a"))
                .map(String::as_str),
            Some("1.0.0-devlink-7")
        );
    }

    #[test]
    fn set_dist_tag_reports_untouched_manifests() {
        let mut manifest: PackageJson = serde_json::from_value(serde_json::json!({
            "name": "consumer",
            "dependencies": { "lodash": "^4.0.0" },
        }))
        .unwrap();
        assert!(!set_dist_tag_in_deps(
            &mut manifest,
            &["pkg-a".to_string()],
            &new_versions(),
        ));
    }
}
