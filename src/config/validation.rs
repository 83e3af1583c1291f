//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`PipelineConfig`] that cannot
//! be expressed through the type system alone: range checks, and cross-field
//! invariants between routing, the model catalog, and the prompt library.
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::PipelineConfig;
use crate::routing::config as routing_config;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "extraction.max_attempts").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate every semantic constraint of a [`PipelineConfig`].
///
/// # Returns
///
/// - `Ok(())` when the config is usable.
/// - `Err(errors)` with one entry per violated rule.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &PipelineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // -- pipeline ---------------------------------------------------------

    if config.pipeline.name.trim().is_empty() {
        errors.push(invalid("pipeline.name", "\"\"", "must not be empty"));
    }
    if config.pipeline.max_description_chars == 0 {
        errors.push(invalid(
            "pipeline.max_description_chars",
            0,
            "must be at least 1",
        ));
    }
    if config.pipeline.deadline_ms == Some(0) {
        errors.push(invalid("pipeline.deadline_ms", 0, "must be positive when set"));
    }

    // -- routing ----------------------------------------------------------

    for problem in routing_config::validate(&config.routing) {
        errors.push(ConfigError::Validation(format!("routing: {problem}")));
    }

    // -- extraction -------------------------------------------------------

    let ex = &config.extraction;
    if ex.max_attempts == 0 {
        errors.push(invalid("extraction.max_attempts", 0, "must be at least 1"));
    }
    if ex.call_timeout_ms == 0 {
        errors.push(invalid("extraction.call_timeout_ms", 0, "must be positive"));
    }
    if ex.classifier_timeout_ms == 0 {
        errors.push(invalid(
            "extraction.classifier_timeout_ms",
            0,
            "must be positive",
        ));
    }
    if ex.classifier_max_tokens == 0 {
        errors.push(invalid(
            "extraction.classifier_max_tokens",
            0,
            "must be positive",
        ));
    }

    // -- metering ---------------------------------------------------------

    if let Some(limit) = config.metering.alert_threshold_usd {
        if !limit.is_finite() || limit <= 0.0 {
            errors.push(invalid(
                "metering.alert_threshold_usd",
                limit,
                "must be a positive amount",
            ));
        }
    }

    // -- storage ----------------------------------------------------------

    if let Some(url) = &config.storage.url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(invalid("storage.url", url, "must be an http(s) URL"));
        }
    }
    for (field, name) in config.storage.tables.all() {
        if name.trim().is_empty() {
            errors.push(invalid(&format!("storage.tables.{field}"), "\"\"", "must not be empty"));
        }
    }

    // -- models / prompts (cross-field) ----------------------------------

    match config.build_catalog() {
        Ok(catalog) => {
            for problem in routing_config::validate_against_catalog(&config.routing, &catalog) {
                errors.push(ConfigError::Validation(format!("routing: {problem}")));
            }
        }
        Err(e) => errors.push(e),
    }
    if let Err(e) = config.build_prompts() {
        errors.push(e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
