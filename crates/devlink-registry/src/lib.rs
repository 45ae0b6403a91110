//! Devlink Registry — local Verdaccio lifecycle, publishing, and installation

pub mod install;
pub mod publish;
pub mod server;
pub mod spawn;

pub use install::{InstallArgs, install_from_public_registry, install_packages};
pub use publish::{PublishPackageArgs, publish_package, version_postfix};
pub use server::{DEFAULT_REGISTRY_PORT, PORT_ENV, RegistryController};
pub use spawn::{CommandSpec, run_command};

use anyhow::Result;
use devlink_core::{Destination, IgnoredManifests, PackagePaths, Source};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct PublishInstallArgs<'a> {
    pub packages_to_publish: Vec<String>,
    pub package_paths: Arc<PackagePaths>,
    pub ignored_manifests: IgnoredManifests,
    pub source: &'a Source,
    pub destination: &'a Destination,
    pub verbose: bool,
}

/// Publish every given package to the local registry under one session
/// version postfix, then install the subset the destination declares.
pub async fn publish_packages_and_install(
    registry: &RegistryController,
    args: PublishInstallArgs<'_>,
) -> Result<()> {
    registry.ensure_started().await?;

    let registry_url = registry.registry_url();
    let version_postfix = publish::version_postfix();
    let mut new_versions: BTreeMap<String, String> = BTreeMap::new();

    for package_name in &args.packages_to_publish {
        let new_version = publish::publish_package(PublishPackageArgs {
            registry_url: &registry_url,
            package_name,
            packages_to_publish: &args.packages_to_publish,
            package_paths: &args.package_paths,
            version_postfix: &version_postfix,
            ignored_manifests: &args.ignored_manifests,
            source_path: &args.source.path,
            verbose: args.verbose,
        })
        .await?;
        new_versions.insert(package_name.clone(), new_version);
    }

    let packages_to_install: Vec<String> = args
        .packages_to_publish
        .iter()
        .filter(|name| args.destination.packages.contains(name))
        .cloned()
        .collect();

    install::install_packages(InstallArgs {
        registry_url: &registry_url,
        packages_to_install,
        new_versions,
        destination: args.destination,
        verbose: args.verbose,
    })
    .await
}
