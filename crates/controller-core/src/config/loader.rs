use std::path::{Path, PathBuf};

use controller_common::config::SystemConfig;

use super::validation;

/// Load `system.toml` from the given config directory, parse it, and
/// validate the result. Refuses to return a config that fails validation
/// rather than letting the caller discover a bad setting at runtime.
pub fn load_config(config_dir: &Path) -> Result<SystemConfig, ConfigError> {
    let path = config_dir.join("system.toml");
    tracing::info!(path = %path.display(), "loading configuration");

    let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
        path: path.clone(),
        source: e,
    })?;

    let config: SystemConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.clone(),
        detail: e.to_string(),
    })?;

    validation::validate(&config)?;

    tracing::info!(
        num_workers = config.pool.num_workers,
        queue_max_size = config.queue.max_size,
        "configuration loaded"
    );

    Ok(config)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    FileRead { path: PathBuf, source: std::io::Error },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("validation failed: {0}")]
    Validation(String),
}
