//! `.devlinkrc` configuration loading.
//!
//! The source path can come from the `DEVLINK_SOURCE_PATH` environment
//! variable (takes precedence) or from a `.devlinkrc` TOML file in the
//! destination project.

use crate::CONFIG_FILE_NAME;
use crate::setup::SetupError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file.
pub const SOURCE_PATH_ENV: &str = "DEVLINK_SOURCE_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Absolute path to the source repository.
    pub path: PathBuf,
}

impl Config {
    /// Load the configuration for a destination directory.
    pub fn load(dir: &Path) -> Result<Self, SetupError> {
        if let Ok(value) = std::env::var(SOURCE_PATH_ENV) {
            let path = PathBuf::from(value.trim());
            return Self::validated(Config {
                source: SourceConfig { path },
            });
        }

        let file = dir.join(CONFIG_FILE_NAME);
        let raw = std::fs::read_to_string(&file).map_err(|_| SetupError::MissingConfig {
            dir: dir.to_path_buf(),
        })?;
        let config: Config = toml::from_str(&raw).map_err(|err| SetupError::InvalidConfig {
            file,
            reason: err.to_string(),
        })?;
        Self::validated(config)
    }

    fn validated(config: Config) -> Result<Self, SetupError> {
        if !config.source.path.is_absolute() {
            return Err(SetupError::RelativeSourcePath {
                path: config.source.path,
            });
        }
        Ok(config)
    }

    /// Write the configuration to `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = dir.join(CONFIG_FILE_NAME);
        let raw = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&file, raw)
            .with_context(|| format!("failed to write {}", file.display()))?;
        Ok(())
    }
}
