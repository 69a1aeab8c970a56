//! Settings and snapshot loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ProxySettings, RawConfig};
use crate::config::validation::{validate_settings, ValidationError};

/// Error type for loading settings or a config snapshot.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<ProxySettings, SettingsError> {
    let content = fs::read_to_string(path)?;
    parse_settings(&content)
}

/// Parse and validate settings from TOML text.
pub fn parse_settings(content: &str) -> Result<ProxySettings, SettingsError> {
    let settings: ProxySettings = toml::from_str(content)?;
    validate_settings(&settings).map_err(SettingsError::Validation)?;
    Ok(settings)
}

/// Load a raw config snapshot from a JSON file.
pub fn load_snapshot(path: &Path) -> Result<RawConfig, SettingsError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
