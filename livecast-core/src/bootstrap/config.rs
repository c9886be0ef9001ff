//! Configuration loading

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE};
use crate::Config;

/// Load and validate configuration.
///
/// Config file search order:
/// 1. `LIVECAST_CONFIG_PATH` (explicit path)
/// 2. `./config.yaml`
/// 3. environment variables only
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            Path::new(DEFAULT_CONFIG_FILE)
                .exists()
                .then(|| DEFAULT_CONFIG_FILE.to_string())
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated");
    Ok(config)
}
