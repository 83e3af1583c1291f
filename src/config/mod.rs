//! # Stage: Declarative Pipeline Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload TOML pipeline configuration files. A
//! single file describes routing thresholds, extraction attempt bounds, the
//! model catalog, prompt overrides, and storage tables:
//! ```text
//! nutriwealth-pipeline --config pipeline.toml --description "..."
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `PipelineConfig`
//! - Total: every field is defaulted, so an empty file is a valid config
//! - Validated: cross-field constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Installing a config into a running coordinator (that belongs to `coordinator`)
//! - Reading provider credentials (that belongs to `worker`)

pub mod loader;
pub mod validation;
pub mod watcher;

pub use validation::ConfigError;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::classifier::ClassifierSettings;
use crate::extract::ExtractionSettings;
use crate::persist::TableNames;
use crate::prompts::{PromptLibrary, PromptTemplate};
use crate::retry::RetryPolicy;
use crate::routing::RoutingConfig;

// ── Default value functions ──────────────────────────────────────────────

fn default_name() -> String {
    "nutriwealth".to_string()
}

/// Longest accepted description, in characters.
fn default_max_description_chars() -> usize {
    1000
}

/// Two model calls per extraction: the first attempt and one repair.
fn default_max_attempts() -> u32 {
    2
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_classifier_timeout_ms() -> u64 {
    10_000
}

fn default_classifier_max_tokens() -> u32 {
    100
}

fn default_namespace() -> String {
    "nutriwealth".to_string()
}

fn default_api_key_env() -> String {
    "STORAGE_API_KEY".to_string()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a pipeline instance.
///
/// Deserialized from a TOML file and validated before use.
///
/// # Example
///
/// ```toml
/// [pipeline]
/// name = "prod"
/// deadline_ms = 60000
///
/// [routing]
/// low_confidence_threshold = 0.6
/// cheap_model = "gpt-4o-mini"
///
/// [extraction]
/// max_attempts = 2
/// call_timeout_ms = 30000
///
/// [metering]
/// alert_threshold_usd = 25.0
///
/// [storage]
/// url = "https://storage.internal/api"
///
/// [[models]]
/// id = "gpt-4o-mini"
/// provider = "openai"
/// capabilities = { images = true, structured_output = true }
/// cost_per_1k_input = 0.00015
/// cost_per_1k_output = 0.0006
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    /// Pipeline identity and request limits.
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Stage-2 model selection policy.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Attempt bounds and per-call timeouts.
    #[serde(default)]
    pub extraction: ExtractionSection,
    /// Usage statistics alerting.
    #[serde(default)]
    pub metering: MeteringSection,
    /// Structured storage endpoint and table names.
    #[serde(default)]
    pub storage: StorageSection,
    /// Model catalog. Empty means the built-in catalog.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    /// Prompt overrides. Use cases not listed fall back to built-in prompts.
    #[serde(default)]
    pub prompts: Vec<PromptTemplate>,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSection {
    /// Human-readable pipeline name, used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Default end-to-end deadline for `analyze`, when the caller supplies none.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Longest accepted description, in characters.
    #[serde(default = "default_max_description_chars")]
    pub max_description_chars: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            deadline_ms: None,
            max_description_chars: default_max_description_chars(),
        }
    }
}

/// `[extraction]` section; also carries the classification call bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionSection {
    /// Model calls per extraction, including the repair attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bounded wait per extraction call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Pause before retrying after a transport error.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How the pause grows between attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Bounded wait per classification call.
    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,
    /// Completion token cap for the classification call.
    #[serde(default = "default_classifier_max_tokens")]
    pub classifier_max_tokens: u32,
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            classifier_timeout_ms: default_classifier_timeout_ms(),
            classifier_max_tokens: default_classifier_max_tokens(),
        }
    }
}

impl ExtractionSection {
    /// Retry policy allowing `attempts` calls, paced by `backoff`.
    pub fn retry_policy(&self, attempts: u32) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        match self.backoff {
            Backoff::Fixed => RetryPolicy::fixed(attempts, delay),
            Backoff::Exponential => RetryPolicy::exponential(attempts, delay),
        }
    }
}

/// Pause growth between model call attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `retry_delay_ms` before every retry.
    #[default]
    Fixed,
    /// `retry_delay_ms` doubled per retry, capped at 10 s.
    Exponential,
}

/// `[metering]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MeteringSection {
    /// Cumulative spend that triggers a one-shot warning.
    #[serde(default)]
    pub alert_threshold_usd: Option<f64>,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StorageSection {
    /// HTTP table store endpoint. Absent means in-memory storage.
    #[serde(default)]
    pub url: Option<String>,
    /// Namespace sent with every storage request.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Environment variable holding the storage API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Table names.
    #[serde(default)]
    pub tables: TableNames,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_namespace(),
            api_key_env: default_api_key_env(),
            tables: TableNames::default(),
        }
    }
}

impl PipelineConfig {
    /// Build the model catalog, using the built-in one when `models` is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for duplicate ids or bad prices.
    pub fn build_catalog(&self) -> Result<ModelCatalog, ConfigError> {
        if self.models.is_empty() {
            return Ok(ModelCatalog::builtin());
        }
        ModelCatalog::new(self.models.clone()).map_err(|e| ConfigError::InvalidField {
            field: "models".to_string(),
            value: format!("{} entries", self.models.len()),
            reason: e.to_string(),
        })
    }

    /// Build the prompt library, filling unlisted use cases with built-ins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for duplicate use cases or a
    /// template without a description slot.
    pub fn build_prompts(&self) -> Result<PromptLibrary, ConfigError> {
        PromptLibrary::new(self.prompts.clone(), true).map_err(|e| ConfigError::InvalidField {
            field: "prompts".to_string(),
            value: format!("{} entries", self.prompts.len()),
            reason: e.to_string(),
        })
    }

    /// Classification call bounds.
    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            max_tokens: self.extraction.classifier_max_tokens,
            timeout: Duration::from_millis(self.extraction.classifier_timeout_ms),
            retry: self.extraction.retry_policy(2),
        }
    }

    /// Extraction attempt bound and per-call timeout.
    pub fn extraction_settings(&self) -> ExtractionSettings {
        ExtractionSettings {
            retry: self.extraction.retry_policy(self.extraction.max_attempts),
            call_timeout: Duration::from_millis(self.extraction.call_timeout_ms),
        }
    }

    /// Default deadline for a synchronous `analyze`, if configured.
    pub fn default_deadline(&self) -> Option<Duration> {
        self.pipeline.deadline_ms.map(Duration::from_millis)
    }
}

/// Export the JSON Schema for [`PipelineConfig`].
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(PipelineConfig);
    serde_json::to_value(schema).unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::UseCase;

    #[test]
    fn test_empty_toml_is_default_config() {
        let cfg: PipelineConfig = toml::from_str("")
            .unwrap_or_else(|e| std::panic::panic_any(format!("parse: {e}")));
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.pipeline.max_description_chars, 1000);
        assert_eq!(cfg.extraction.max_attempts, 2);
    }

    #[test]
    fn test_build_catalog_empty_models_uses_builtin() {
        let catalog = PipelineConfig::default()
            .build_catalog()
            .unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        assert!(catalog.contains("gpt-4o-mini"));
        assert!(catalog.contains("gpt-5.2"));
    }

    #[test]
    fn test_build_catalog_from_models_section() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
[[models]]
id = "local"
provider = "ollama"
cost_per_1k_input = 0.0
cost_per_1k_output = 0.0
"#,
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("parse: {e}")));
        let catalog = cfg
            .build_catalog()
            .unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        assert_eq!(catalog.models().len(), 1);
        assert!(!catalog.models()[0].capabilities.images);
    }

    #[test]
    fn test_build_prompts_override_keeps_builtins_for_others() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
[[prompts]]
use_case = "receipt"
version = 7
system = "You read receipts."
template = "Receipt: {description}"
schema_hint = "{}"
"#,
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("parse: {e}")));
        let prompts = cfg
            .build_prompts()
            .unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        assert_eq!(prompts.get(UseCase::Receipt).prompt_id(), "receipt@v7");
        assert_eq!(prompts.get(UseCase::Food).use_case, UseCase::Food);
    }

    #[test]
    fn test_extraction_settings_follow_section() {
        let mut cfg = PipelineConfig::default();
        cfg.extraction.max_attempts = 3;
        cfg.extraction.call_timeout_ms = 1500;
        let settings = cfg.extraction_settings();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.call_timeout, Duration::from_millis(1500));
        assert_eq!(settings.retry.calculate_delay(2), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_applies_to_both_stages() {
        let cfg: PipelineConfig = toml::from_str(
            "[extraction]\nbackoff = \"exponential\"\nretry_delay_ms = 50\n",
        )
        .unwrap();
        let extraction = cfg.extraction_settings().retry;
        assert_eq!(extraction.calculate_delay(1), Duration::from_millis(50));
        assert_eq!(extraction.calculate_delay(3), Duration::from_millis(200));
        let classifier = cfg.classifier_settings().retry;
        assert_eq!(classifier.max_attempts, 2);
        assert_eq!(classifier.calculate_delay(2), Duration::from_millis(100));
    }

    #[test]
    fn test_export_schema_names_every_section() {
        let schema = export_schema();
        let props = &schema["properties"];
        for key in ["pipeline", "routing", "extraction", "metering", "storage", "models", "prompts"] {
            assert!(props.get(key).is_some(), "schema missing {key}");
        }
    }
}
