use anyhow::{Context, Result};
use std::path::PathBuf;

/// Centralized path management for adsynq

/// Get the adsynq config directory
pub fn adsynq_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Unable to determine user config directory")?
        .join("adsynq");

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating config directory at {}", config_dir.display()))?;

    Ok(config_dir)
}

/// Default location of the config file
pub fn config_file_path() -> Result<PathBuf> {
    Ok(adsynq_config_dir()?.join("config.toml"))
}

/// Data directory without touching the filesystem; used for config defaults
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
            home.join(".local/share")
        })
        .join("adsynq")
}

/// Default root for generated artifacts
pub fn default_output_dir() -> PathBuf {
    default_data_dir().join("output")
}

/// Default attempt ledger database
pub fn default_database_path() -> PathBuf {
    default_data_dir().join("ledger.db")
}
