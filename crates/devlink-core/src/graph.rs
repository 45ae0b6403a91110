//! Cross-package dependency graph.
//!
//! Built once per watch session from the destination's source dependencies.
//! `seen_packages` is the transitive closure of packages to watch;
//! `dep_tree` holds reverse edges (package → packages depending on it) used
//! to compute publish cascades.

use crate::manifest::read_package_json;
use crate::setup::PackagePaths;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::error;

/// Reverse dependency edges: package name → set of packages depending on it.
pub type DepTree = HashMap<String, BTreeSet<String>>;

#[derive(Debug, Default)]
pub struct DepGraph {
    /// Every package reachable via manifest dependency edges from the start
    /// set (including the start set itself), in discovery order.
    pub seen_packages: Vec<String>,
    pub dep_tree: DepTree,
}

/// Walk manifests starting from `start_packages`, following dependencies that
/// are themselves source packages.
///
/// A package's own dependency list is expanded at most once per run, so
/// cycles terminate while still recording every reverse edge. A package whose
/// path cannot be resolved (or whose manifest is unreadable) is reported and
/// dropped from the seen set; the rest of the run continues.
pub fn build_dep_graph(
    start_packages: &[String],
    source_packages: &[String],
    package_paths: &PackagePaths,
) -> DepGraph {
    let mut seen_packages: Vec<String> = Vec::new();
    for name in start_packages {
        if !seen_packages.contains(name) {
            seen_packages.push(name.clone());
        }
    }

    let mut dep_tree = DepTree::new();
    let mut expanded: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<String> = seen_packages.iter().cloned().collect();

    while let Some(package) = frontier.pop_front() {
        if !expanded.insert(package.clone()) {
            continue;
        }

        let manifest = package_paths
            .get(&package)
            .ok_or(())
            .and_then(|root| read_package_json(&root.join("package.json")).map_err(|_| ()));
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(()) => {
                error!("\"{package}\" doesn't exist in source location");
                seen_packages.retain(|seen| seen != &package);
                continue;
            }
        };

        let from_source: Vec<String> = manifest
            .dependencies_or_default()
            .keys()
            .filter(|name| source_packages.contains(name))
            .cloned()
            .collect();

        for dependency in from_source {
            dep_tree
                .entry(dependency.clone())
                .or_default()
                .insert(package.clone());
            if !seen_packages.contains(&dependency) {
                seen_packages.push(dependency.clone());
            }
            // Re-queue even previously seen targets; the expanded set keeps
            // this from looping on cycles.
            frontier.push_back(dependency);
        }
    }

    DepGraph {
        seen_packages,
        dep_tree,
    }
}

/// The publish cascade for `package_name`: the package itself plus everything
/// that transitively depends on it.
pub fn dependant_packages(package_name: &str, dep_tree: &DepTree) -> BTreeSet<String> {
    let mut packages_to_publish = BTreeSet::new();
    collect_dependants(package_name, dep_tree, &mut packages_to_publish);
    packages_to_publish
}

fn collect_dependants(package_name: &str, dep_tree: &DepTree, acc: &mut BTreeSet<String>) {
    // Bail early if the package was already handled (cycle safety).
    if !acc.insert(package_name.to_string()) {
        return;
    }
    if let Some(dependants) = dep_tree.get(package_name) {
        for dependant in dependants {
            collect_dependants(dependant, dep_tree, acc);
        }
    }
}
