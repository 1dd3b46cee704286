// Run configuration loading for the Refinery Worker
use anyhow::{bail, Context, Result};
use refinery_common::config::{RunConfig, DEFAULT_CONFIG_PATH};
use std::path::{Path, PathBuf};
use tracing::info;

pub const ENV_CONFIG: &str = "REFINERY_CONFIG";
pub const ENV_DATASET: &str = "REFINERY_DATASET";
pub const ENV_OUTPUT_DIR: &str = "REFINERY_OUTPUT_DIR";

/// Load the run configuration from `REFINERY_CONFIG` (or the default
/// path), apply environment overrides, then validate it.
///
/// A missing default file falls back to built-in defaults; a missing file
/// named explicitly is an error.
pub fn load_run_config() -> Result<RunConfig> {
    let explicit = std::env::var(ENV_CONFIG).ok();
    let path = PathBuf::from(explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()));

    let config = load_or_default(&path, explicit.is_some())?;
    let config = apply_overrides(config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

pub fn load_or_default(path: &Path, required: bool) -> Result<RunConfig> {
    if path.exists() {
        let config = RunConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        info!("Loaded run configuration from {}", path.display());
        return Ok(config);
    }
    if required {
        bail!("Run config file not found: {}", path.display());
    }
    info!("No config at {}, using defaults", path.display());
    Ok(RunConfig::default())
}

/// Layer environment variables over the file configuration.
pub fn apply_overrides<F>(mut config: RunConfig, lookup: F) -> RunConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dataset) = lookup(ENV_DATASET) {
        config.dataset_path = PathBuf::from(dataset);
    }
    if let Some(output_dir) = lookup(ENV_OUTPUT_DIR) {
        config.output_dir = PathBuf::from(output_dir);
    }
    config
}

pub fn validate(config: &RunConfig) -> Result<()> {
    config.validate().context("Invalid run configuration")?;
    config
        .validate_paths()
        .context("Make sure the dataset file exists or set REFINERY_DATASET")?;
    Ok(())
}
