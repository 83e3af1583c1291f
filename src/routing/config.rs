//! Routing configuration types.
//!
//! Provides [`RoutingConfig`]: the low-confidence threshold and the model ids
//! bound to each routing role. All fields have defaults matching the built-in
//! catalog and are (de)serialisable via serde for TOML config files.

use crate::catalog::ModelCatalog;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default confidence below which receipt/workout routing upgrades.
fn default_low_confidence_threshold() -> f64 {
    0.5
}

/// Default stage-1 classifier model.
fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default cheap/fast extraction model.
fn default_cheap_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default high-quality extraction model.
fn default_high_quality_model() -> String {
    "gpt-5.2".to_string()
}

/// Default model for content the classifier could not place.
fn default_general_model() -> String {
    "gpt-5.2".to_string()
}

// ── RoutingConfig ──────────────────────────────────────────────────────

/// Configuration for the model routing layer.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Confidence strictly below this forces the high-quality model.
    ///
    /// Range: `0.0..=1.0`.  Default: `0.5`.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,

    /// Pinned stage-1 model. Used even when the catalog holds a cheaper
    /// model; "cheapest capable" selection only applies when this model
    /// cannot take the submission (e.g. it lacks image support).
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,

    /// Model for receipts and workouts.
    #[serde(default = "default_cheap_model")]
    pub cheap_model: String,

    /// Model for food and low-confidence upgrades.
    #[serde(default = "default_high_quality_model")]
    pub high_quality_model: String,

    /// Model for the `unknown` category.
    #[serde(default = "default_general_model")]
    pub general_model: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: default_low_confidence_threshold(),
            classifier_model: default_classifier_model(),
            cheap_model: default_cheap_model(),
            high_quality_model: default_high_quality_model(),
            general_model: default_general_model(),
        }
    }
}

impl RoutingConfig {
    /// Every model id this config refers to, labelled by role.
    pub fn model_roles(&self) -> [(&'static str, &str); 4] {
        [
            ("classifier_model", self.classifier_model.as_str()),
            ("cheap_model", self.cheap_model.as_str()),
            ("high_quality_model", self.high_quality_model.as_str()),
            ("general_model", self.general_model.as_str()),
        ]
    }
}

/// Validate a [`RoutingConfig`] on its own, returning human-readable errors.
///
/// # Returns
///
/// An empty `Vec` on success, or one error string per violated constraint.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RoutingConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let t = config.low_confidence_threshold;
    if !t.is_finite() || !(0.0..=1.0).contains(&t) {
        errors.push(format!(
            "low_confidence_threshold must be in [0.0, 1.0], got {t}"
        ));
    }

    for (role, id) in config.model_roles() {
        if id.trim().is_empty() {
            errors.push(format!("{role} must not be empty"));
        }
    }

    errors
}

/// Check that every routed model exists and that images can be served.
///
/// # Panics
///
/// This function never panics.
pub fn validate_against_catalog(config: &RoutingConfig, catalog: &ModelCatalog) -> Vec<String> {
    let mut errors = Vec::new();

    for (role, id) in config.model_roles() {
        if !id.trim().is_empty() && !catalog.contains(id) {
            errors.push(format!("{role} `{id}` is not registered in the model catalog"));
        }
    }

    if catalog.cheapest_image_capable().is_none() {
        errors.push("model catalog has no image-capable model".to_string());
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Capabilities, ModelDescriptor, Provider};

    // -- defaults --------------------------------------------------------

    #[test]
    fn test_default_low_confidence_threshold_returns_0_5() {
        assert!((default_low_confidence_threshold() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: RoutingConfig = toml::from_str("")
            .unwrap_or_else(|e| std::panic::panic_any(format!("parse: {e}")));
        assert_eq!(cfg, RoutingConfig::default());
    }

    // -- validate --------------------------------------------------------

    #[test]
    fn test_validate_default_is_clean() {
        assert!(validate(&RoutingConfig::default()).is_empty());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let cfg = RoutingConfig {
            low_confidence_threshold: 1.5,
            ..RoutingConfig::default()
        };
        let errors = validate(&cfg);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("low_confidence_threshold"));
    }

    #[test]
    fn test_validate_rejects_nan_threshold() {
        let cfg = RoutingConfig {
            low_confidence_threshold: f64::NAN,
            ..RoutingConfig::default()
        };
        assert_eq!(validate(&cfg).len(), 1);
    }

    #[test]
    fn test_validate_collects_every_empty_role() {
        let cfg = RoutingConfig {
            cheap_model: String::new(),
            general_model: " ".into(),
            ..RoutingConfig::default()
        };
        assert_eq!(validate(&cfg).len(), 2);
    }

    // -- validate_against_catalog ----------------------------------------

    #[test]
    fn test_default_config_matches_builtin_catalog() {
        let errors = validate_against_catalog(&RoutingConfig::default(), &ModelCatalog::builtin());
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_catalog_check_reports_unknown_model_and_missing_vision() {
        let catalog = ModelCatalog::new(vec![ModelDescriptor {
            id: "gpt-4o-mini".into(),
            provider: Provider::OpenAi,
            capabilities: Capabilities {
                images: false,
                structured_output: true,
            },
            cost_per_1k_input: 0.1,
            cost_per_1k_output: 0.1,
            max_output_tokens: 100,
            avg_latency_ms: 10,
        }])
        .unwrap_or_else(|e| std::panic::panic_any(e.to_string()));

        let errors = validate_against_catalog(&RoutingConfig::default(), &catalog);
        assert!(errors.iter().any(|e| e.contains("high_quality_model")));
        assert!(errors.iter().any(|e| e.contains("image-capable")));
    }
}
