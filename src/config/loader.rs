//! Pipeline config loading.
//!
//! ## Responsibility
//! Turn TOML text (a file or an in-memory string) into a [`PipelineConfig`]
//! that has passed every check in `validation`.
//!
//! ## Guarantees
//! - Nothing unvalidated leaves this module.
//! - Every error names its source: the file path, or the label passed to
//!   [`load_from_str`].
//!
//! ## NOT Responsible For
//! - Following edits (that belongs to `watcher`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::PipelineConfig;

/// Read, parse and validate the config at `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] for an unreadable file, otherwise whatever
/// [`load_from_str`] returns.
///
/// # Example
///
/// ```rust,ignore
/// use nutriwealth_pipeline::config::loader::load_from_file;
///
/// let config = load_from_file(Path::new("pipeline.toml"))?;
/// assert!(config.routing.low_confidence_threshold <= 1.0);
/// ```
pub fn load_from_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Parse and validate TOML held in memory. `source_name` labels errors.
///
/// # Errors
///
/// - [`ConfigError::Parse`] for malformed TOML or a mistyped field.
/// - [`ConfigError::Validation`] listing every semantic problem, one per
///   line, including model ids the catalog does not register.
pub fn load_from_str(content: &str, source_name: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    if let Err(problems) = validation::validate(&config) {
        let joined: Vec<String> = problems.iter().map(ToString::to_string).collect();
        return Err(ConfigError::Validation(joined.join("\n")));
    }
    Ok(config)
}

// ── Tests ────────────────────────────────────────────────────────────────
