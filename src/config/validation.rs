//! Settings validation.
//!
//! # Responsibilities
//! - Semantic validation of [`ProxySettings`] (serde handles syntactic)
//! - Validate value ranges (intervals > 0, buffer sizes > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxySettings → Result<(), Vec<ValidationError>>
//! - Runs before settings are accepted into the system

use thiserror::Error;

use crate::config::schema::ProxySettings;

/// A single settings validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate process settings.
pub fn validate_settings(settings: &ProxySettings) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if settings.reconciliation.interval_ms == 0 {
        errors.push(ValidationError::new("reconciliation.interval_ms", "must be greater than 0"));
    }
    if settings.health.max_concurrent_probes == 0 {
        errors.push(ValidationError::new("health.max_concurrent_probes", "must be greater than 0"));
    }
    if settings.health.default_probe_interval_ms == 0 {
        errors.push(ValidationError::new("health.default_probe_interval_ms", "must be greater than 0"));
    }
    if settings.health.default_probe_timeout_ms == 0 {
        errors.push(ValidationError::new("health.default_probe_timeout_ms", "must be greater than 0"));
    }
    if !settings.health.default_probe_path.starts_with('/') {
        errors.push(ValidationError::new(
            "health.default_probe_path",
            format!("'{}' must start with '/'", settings.health.default_probe_path),
        ));
    }
    if settings.proxy.request_timeout_ms == 0 {
        errors.push(ValidationError::new("proxy.request_timeout_ms", "must be greater than 0"));
    }
    if settings.proxy.stream_buffer_size == 0 {
        errors.push(ValidationError::new("proxy.stream_buffer_size", "must be greater than 0"));
    }
    if !matches!(
        settings.observability.log_level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", settings.observability.log_level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
