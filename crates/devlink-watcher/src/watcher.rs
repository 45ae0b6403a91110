//! The watch session: dependency traversal, initial scan, publish/install,
//! then steady-state file copying.
//!
//! A session moves through three phases. During the initial scan every
//! existing file is replayed as an event; manifest checks run concurrently
//! and their verdicts are collected when the scan completes. If any check
//! demands a republish the session publishes the affected packages (plus
//! their dependants) before releasing the queued copies. After that the
//! session stays in the watching phase, copying changed files directly into
//! the destination's `node_modules`.

use crate::copy_queue::{CopyJob, CopyQueue, CopyTicket};
use crate::events::{FileWatcher, IgnoreRules, WatchEvent};
use crate::stale::clear_stale_artifacts;
use anyhow::{Result, bail};
use devlink_core::{
    CheckDepsArgs, DepTree, DepsChangeResult, Destination, IgnoredManifests, PackagePaths, Source,
    build_dep_graph, check_deps_changes, dependant_packages, find_owning_package,
    read_package_json, should_include_file,
};
use devlink_registry::{PublishInstallArgs, RegistryController, publish_packages_and_install};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Copy everything once and exit instead of watching.
    pub scan_once: bool,
    /// Publish the whole watch set through the local registry up front.
    pub force_registry: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitialScan,
    Publishing,
    Watching,
}

pub struct WatchSession {
    source: Source,
    destination: Destination,
    options: WatchOptions,
    registry: RegistryController,
    queue: CopyQueue,
    ignored_manifests: IgnoredManifests,
    phase: Phase,
    dep_tree: DepTree,
    /// Every known source package, for event-to-package matching. A watched
    /// root may contain packages outside the watch set.
    watch_entries: Vec<(String, PathBuf)>,
    source_packages: Arc<Vec<String>>,
    package_paths: Arc<PackagePaths>,
    /// `files` inclusion patterns per package, read lazily.
    files_patterns: HashMap<String, Option<Vec<String>>>,
    pending_checks: Vec<(String, JoinHandle<DepsChangeResult>)>,
    packages_to_publish: BTreeSet<String>,
    any_package_not_installed: bool,
    all_copies: Vec<CopyTicket>,
}

impl WatchSession {
    pub fn new(source: Source, destination: Destination, options: WatchOptions) -> Self {
        let queue = CopyQueue::new(&source.path);
        let watch_entries: Vec<(String, PathBuf)> = source
            .package_paths
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        let source_packages = Arc::new(source.packages.clone());
        let package_paths = Arc::new(source.package_paths.clone());
        WatchSession {
            source,
            destination,
            registry: RegistryController::from_env(options.verbose),
            options,
            queue,
            ignored_manifests: IgnoredManifests::new(),
            phase: Phase::InitialScan,
            dep_tree: DepTree::new(),
            watch_entries,
            source_packages,
            package_paths,
            files_patterns: HashMap::new(),
            pending_checks: Vec::new(),
            packages_to_publish: BTreeSet::new(),
            any_package_not_installed: false,
            all_copies: Vec::new(),
        }
    }

    /// Run the session until the event stream ends, or until the initial
    /// copies finish when `scan_once` is set. `packages` narrows the watch
    /// set to the named packages.
    pub async fn run(mut self, packages: Option<Vec<String>>) -> Result<()> {
        // The destination's source dependencies may depend on further source
        // packages; those need watching too.
        let mut start_packages = self.destination.packages.clone();
        start_packages.dedup();
        let graph = build_dep_graph(&start_packages, &self.source_packages, &self.package_paths);
        self.dep_tree = graph.dep_tree;

        let watch_set: Vec<String> = match &packages {
            Some(named) => graph
                .seen_packages
                .iter()
                .filter(|name| named.contains(name))
                .cloned()
                .collect(),
            None => graph.seen_packages.clone(),
        };

        let force_registry = self.options.force_registry || self.destination.has_workspaces;
        if force_registry {
            debug!(
                "Publishing through the local registry up front. Packages to watch: {}",
                watch_set.join(", ")
            );
            let outcome = if watch_set.is_empty() {
                devlink_registry::install_from_public_registry(
                    &self.destination,
                    self.options.verbose,
                )
                .await
            } else {
                self.publish_and_install(watch_set.clone()).await
            };
            if let Err(err) = outcome {
                error!("{err:#}");
            }
            if self.options.scan_once {
                info!("Copied {} files. Exiting...", self.queue.num_copied());
                return Ok(());
            }
        }

        if watch_set.is_empty() {
            bail!("No packages to watch");
        }

        let mut watch_roots: Vec<PathBuf> = Vec::new();
        for name in &watch_set {
            if let Some(root) = self.package_paths.get(name)
                && root.exists()
                && !watch_roots.contains(root)
            {
                watch_roots.push(root.clone());
            }
        }

        let rules = IgnoreRules::new(&watch_roots);
        let mut watcher = FileWatcher::new(watch_roots, rules)?;
        watcher.start()?;

        while let Some(event) = watcher.next_event().await {
            match event {
                WatchEvent::Added(path) | WatchEvent::Changed(path) => {
                    self.on_file(path).await;
                }
                WatchEvent::Ready => {
                    self.on_ready().await;
                    if self.options.scan_once {
                        for ticket in self.all_copies.drain(..) {
                            // Per-copy failures were already logged.
                            let _ = ticket.await;
                        }
                        info!("Copied {} files. Exiting...", self.queue.num_copied());
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_file(&mut self, path: PathBuf) {
        let Some((package_name, package_root)) = find_owning_package(&path, &self.watch_entries)
        else {
            return;
        };
        let package_name = package_name.to_string();
        let Ok(relative) = path.strip_prefix(package_root) else {
            return;
        };
        let relative_str = relative.to_string_lossy().into_owned();
        let installed_path = self
            .destination
            .path
            .join("node_modules")
            .join(&package_name)
            .join(relative);

        if relative_str == "package.json" {
            self.on_manifest_event(package_name, installed_path).await;
            // Manifest changes are handled by publish/install, never by a
            // plain copy into node_modules.
            return;
        }

        if !self.file_included(&package_name, &relative_str) {
            return;
        }

        let ticket = self.queue.enqueue(CopyJob {
            old_path: path,
            new_path: installed_path,
            package_name,
        });
        if self.options.scan_once {
            // Only scan-once waits for copies; tracking tickets in watch mode
            // would accumulate them for the whole session.
            self.all_copies.push(ticket);
        }
    }

    async fn on_manifest_event(&mut self, package_name: String, installed_path: PathBuf) {
        // The manifest's `files` patterns may have changed with it.
        self.files_patterns.remove(&package_name);

        // Manifests change under devlink's own hands during publishing.
        if self.phase == Phase::Publishing {
            return;
        }

        let args = CheckDepsArgs {
            installed_manifest_path: installed_path,
            package_name: package_name.clone(),
            source_packages: Arc::clone(&self.source_packages),
            package_paths: Arc::clone(&self.package_paths),
            destination_path: self.destination.path.clone(),
            is_initial_scan: self.phase == Phase::InitialScan,
            ignored_manifests: self.ignored_manifests.clone(),
            fallback_registry_url: None,
        };

        if self.phase == Phase::InitialScan {
            // Checks may hit the network; run them concurrently and collect
            // the verdicts when the scan completes.
            let handle = tokio::spawn(check_deps_changes(args));
            self.pending_checks.push((package_name, handle));
        } else {
            let result = check_deps_changes(args).await;
            if result.pkg_not_installed {
                self.any_package_not_installed = true;
            }
        }
    }

    async fn on_ready(&mut self) {
        self.resolve_pending_checks().await;

        if self.phase != Phase::InitialScan {
            return;
        }
        debug!("Initial scan complete.");

        if !self.packages_to_publish.is_empty() {
            self.phase = Phase::Publishing;
            let to_publish: Vec<String> = self.packages_to_publish.iter().cloned().collect();
            debug!("Trying to publish: {}", to_publish.join(", "));
            // A failed cycle is logged, not fatal; the user can fix the
            // manifest and restart.
            if let Err(err) = self.publish_and_install(to_publish).await {
                error!("Publish and install failed: {err:#}");
            }
            self.packages_to_publish.clear();
        } else if self.any_package_not_installed
            && let Err(err) = devlink_registry::install_from_public_registry(
                &self.destination,
                self.options.verbose,
            )
            .await
        {
            error!("{err:#}");
        }

        // Collect the names before draining empties the queue.
        let queued_packages = self.queue.queued_package_names();
        if let Err(err) =
            clear_stale_artifacts(&self.destination.path, queued_packages, &self.package_paths)
        {
            warn!("Failed to clear stale artifacts: {err:#}");
        }
        self.queue.process_queue();
        self.phase = Phase::Watching;
    }

    /// Collect the verdicts of the manifest checks spawned during the
    /// initial scan. A change to one package pulls in every package that
    /// transitively depends on it.
    async fn resolve_pending_checks(&mut self) {
        for (package_name, handle) in self.pending_checks.drain(..) {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    warn!("Dependency check for `{package_name}` failed: {err}");
                    continue;
                }
            };
            if result.pkg_not_installed {
                self.any_package_not_installed = true;
            }
            if result.did_deps_change {
                for pkg in dependant_packages(&package_name, &self.dep_tree) {
                    self.packages_to_publish.insert(pkg);
                }
            }
        }
    }

    async fn publish_and_install(&self, packages_to_publish: Vec<String>) -> Result<()> {
        publish_packages_and_install(
            &self.registry,
            PublishInstallArgs {
                packages_to_publish,
                package_paths: Arc::clone(&self.package_paths),
                ignored_manifests: self.ignored_manifests.clone(),
                source: &self.source,
                destination: &self.destination,
                verbose: self.options.verbose,
            },
        )
        .await
    }

    fn file_included(&mut self, package_name: &str, relative_path: &str) -> bool {
        let patterns = self
            .files_patterns
            .entry(package_name.to_string())
            .or_insert_with(|| {
                self.package_paths
                    .get(package_name)
                    .and_then(|root| read_package_json(&root.join("package.json")).ok())
                    .and_then(|manifest| manifest.files)
            });
        should_include_file(relative_path, patterns.as_deref())
    }
}
