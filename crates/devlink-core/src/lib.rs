//! Devlink Core — manifest model, configuration, dependency graph, and change detection

pub mod config;
pub mod diff;
pub mod graph;
pub mod manifest;
pub mod matcher;
pub mod setup;


#[cfg(test)]
pub mod test_utils;

/// Name of the CLI. Also used as the npm dist-tag and as part of the
/// temporary versions written during a publish cycle.
pub const CLI_NAME: &str = "devlink";

/// Version specifier written into destination manifests by a previous publish
/// cycle. A dependency carrying this value is an artifact of devlink itself,
/// never a user change.
pub const DIST_TAG: &str = CLI_NAME;

/// Config file looked up in the destination project.
pub const CONFIG_FILE_NAME: &str = ".devlinkrc";

pub use config::{Config, SOURCE_PATH_ENV, SourceConfig};
pub use diff::{
    CheckDepsArgs, DepsChangeResult, IgnoredManifests, IgnoredManifestsGuard, check_deps_changes,
    difference,
};
pub use graph::{DepGraph, DepTree, build_dep_graph, dependant_packages};
pub use manifest::{
    DependencyMap, PackageJson, Workspaces, pinned_package_version, read_package_json,
    source_package_json_path,
};
pub use matcher::{find_owning_package, should_include_file};
pub use setup::{
    Destination, PackageManager, PackagePaths, PmKind, SetupError, Source, detect_package_manager,
};
