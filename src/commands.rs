//! CLI command implementations

use anyhow::{Result, bail};
use devlink_core::{CLI_NAME, CONFIG_FILE_NAME, Config, Destination, Source, SourceConfig};
use devlink_watcher::{WatchOptions, WatchSession};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Default command: discover both projects and start the watch session.
pub async fn watch(package_names: Option<Vec<String>>, options: WatchOptions) -> Result<()> {
    let destination_path = std::env::current_dir()?;
    let config = Config::load(&destination_path)?;
    debug!(
        "Successfully loaded configuration: source path is {}",
        config.source.path.display()
    );

    let source = Source::discover(&config.source.path)?;
    let destination = Destination::discover(&destination_path, &source)?;

    debug!(
        "Detected package manager in source: {:?}",
        source.pm.as_ref().map(|pm| pm.kind)
    );
    debug!(
        "Detected package manager in destination: {:?}",
        destination.pm.kind
    );
    debug!("Source has workspaces: {}", source.has_workspaces);
    debug!(
        "Destination has workspaces: {}",
        destination.has_workspaces
    );

    if package_names.is_none() && destination.packages.is_empty() {
        error!(
            "You haven't got any source dependencies in your current `package.json`.\n\
             You probably want to use the packages command to start developing. Example:\n\n\
             {CLI_NAME} packages package-a package-b\n\n\
             If you only want to use `{CLI_NAME}` you'll need to add the dependencies to your `package.json`."
        );
        if !options.force_registry {
            bail!("no source dependencies in the destination");
        }
        info!("Continuing dependency installation due to `--force-registry` flag");
    }

    WatchSession::new(source, destination, options)
        .run(package_names)
        .await
}

/// Write a fresh `.devlinkrc` into the current directory.
pub fn init(source: Option<PathBuf>) -> Result<()> {
    let destination_path = std::env::current_dir()?;
    if destination_path.join(CONFIG_FILE_NAME).exists() {
        warn!("{CONFIG_FILE_NAME} file already exists in this directory and will be overwritten.");
    }

    let Some(path) = source else {
        bail!("You need to provide the source directory via the --source flag.");
    };
    if !path.is_absolute() {
        bail!("You need to provide an absolute path for the --source flag.");
    }

    let config = Config {
        source: SourceConfig { path },
    };
    config.save(&destination_path)?;
    info!("Successfully created {CONFIG_FILE_NAME}");
    Ok(())
}
