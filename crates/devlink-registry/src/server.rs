//! Lifecycle of the local Verdaccio registry.
//!
//! The registry is started lazily on the first publish and kept alive for
//! the rest of the session. Startup clears the storage directory so earlier
//! sessions' temporary versions cannot leak into the current one.

use crate::spawn::CommandSpec;
use anyhow::{Context, Result, bail};
use devlink_core::CLI_NAME;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Environment variable overriding the registry port.
pub const PORT_ENV: &str = "DEVLINK_VERDACCIO_PORT";
pub const DEFAULT_REGISTRY_PORT: u16 = 4873;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct RegistryController {
    port: u16,
    verbose: bool,
    handle: Mutex<Option<RegistryHandle>>,
}

struct RegistryHandle {
    child: tokio::process::Child,
}

impl RegistryController {
    /// Build a controller using `DEVLINK_VERDACCIO_PORT` when set.
    pub fn from_env(verbose: bool) -> Self {
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_REGISTRY_PORT);
        RegistryController {
            port,
            verbose,
            handle: Mutex::new(None),
        }
    }

    pub fn registry_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Start the registry unless it is already running.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        info!("[Verdaccio] Starting server...");
        debug!("[Verdaccio] Port: {}", self.port);

        let work_dir = std::env::temp_dir().join(format!("{CLI_NAME}-verdaccio"));
        let storage_dir = work_dir.join("storage");
        match std::fs::remove_dir_all(&storage_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to clear {}", storage_dir.display()));
            }
        }
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed to create {}", work_dir.display()))?;

        let config_path = work_dir.join("config.yaml");
        std::fs::write(&config_path, registry_config(&storage_dir)?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;

        let spec = CommandSpec::new(
            "npx",
            [
                "verdaccio".to_string(),
                "--config".to_string(),
                config_path.display().to_string(),
                "--listen".to_string(),
                self.port.to_string(),
            ],
        );
        let stdio = if self.verbose {
            Stdio::inherit
        } else {
            Stdio::null
        };
        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdio())
            .stderr(stdio())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn verdaccio, is npx available?")?;

        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait().context("failed to poll verdaccio")? {
                bail!("[Verdaccio] exited during startup with {status}");
            }
            if registry_is_ready(&self.registry_url()).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                bail!("[Verdaccio] TIMEOUT - Verdaccio didn't start within 10s");
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }

        info!("[Verdaccio] Started successfully!");
        *handle = Some(RegistryHandle { child });
        Ok(())
    }

    /// Stop the registry if it is running.
    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(mut running) = handle.take() {
            let _ = running.child.kill().await;
        }
    }
}

async fn registry_is_ready(registry_url: &str) -> bool {
    match reqwest::get(format!("{registry_url}/-/ping")).await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

fn registry_config(storage_dir: &std::path::Path) -> Result<String> {
    let config = json!({
        "storage": storage_dir.display().to_string(),
        "max_body_size": "100mb",
        "web": {
            "enable": true,
            "title": CLI_NAME,
        },
        "logs": {
            "type": "stdout",
            "format": "pretty-timestamped",
            "level": "warn",
        },
        "packages": {
            "**": {
                "access": ["$all"],
                "publish": ["$all"],
                "proxy": ["npmjs"],
            },
        },
        "uplinks": {
            "npmjs": {
                "url": "https://registry.npmjs.org/",
                // Flaky networks hit the default of 2 max_fails quickly.
                "max_fails": 10,
            },
        },
    });
    serde_yaml::to_string(&config).context("failed to render verdaccio config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn registry_url_uses_configured_port() {
        let controller = RegistryController {
            port: 5000,
            verbose: false,
            handle: Mutex::new(None),
        };
        assert_eq!(controller.registry_url(), "http://localhost:5000");
    }

    #[test]
    fn config_covers_storage_and_uplink() {
        let rendered = registry_config(PathBuf::from("/tmp/storage").as_path()).unwrap();
        assert!(rendered.contains("/tmp/storage"));
        assert!(rendered.contains("https://registry.npmjs.org/"));
        assert!(rendered.contains("max_fails: 10"));
    }
}
