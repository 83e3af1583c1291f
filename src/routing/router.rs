//! Model routing logic.
//!
//! The [`ModelRouter`] maps `(category, confidence, has_image)` to the model
//! and prompt used for extraction. It holds only immutable data, so the same
//! inputs always produce the same [`RoutingDecision`].
//!
//! Policy, in order:
//! 1. `unknown` → general-purpose model.
//! 2. `food` → high-quality model.
//! 3. `receipt` / `workout` → cheap model, unless
//! 4. confidence is below the threshold → high-quality model
//!    (`low-confidence-upgrade`).
//! 5. An image-bearing submission whose selected model lacks image support
//!    moves to the cheapest image-capable model (`image-required-upgrade`).

use crate::catalog::{ModelCatalog, ModelDescriptor, Provider};
use crate::category::Category;
use crate::prompts::{PromptLibrary, UseCase};
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::config::RoutingConfig;

/// Why a model was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// The category's default model.
    Default,
    /// Receipt/workout confidence below threshold forced the high-quality model.
    LowConfidenceUpgrade,
    /// The submission has an image and the selected model could not take it.
    ImageRequiredUpgrade,
}

impl ReasonCode {
    /// Kebab-case label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Default => "default",
            ReasonCode::LowConfidenceUpgrade => "low-confidence-upgrade",
            ReasonCode::ImageRequiredUpgrade => "image-required-upgrade",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (model, prompt) pair chosen for extraction.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Category that was routed.
    pub category: Category,
    /// Chosen model id.
    pub model_id: String,
    /// Provider of the chosen model.
    pub provider: Provider,
    /// Extraction use case (and thus schema).
    pub use_case: UseCase,
    /// Versioned prompt id, e.g. `food@v1`.
    pub prompt_id: String,
    /// Why this model was chosen.
    pub reason: ReasonCode,
}

impl RoutingDecision {
    /// Return `true` if a rule moved the decision off the category default.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_upgrade(&self) -> bool {
        self.reason != ReasonCode::Default
    }
}

/// Deterministic model router.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    catalog: Arc<ModelCatalog>,
    prompts: Arc<PromptLibrary>,
    config: RoutingConfig,
}

impl ModelRouter {
    /// Create a router over an immutable catalog and prompt library.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(catalog: Arc<ModelCatalog>, prompts: Arc<PromptLibrary>, config: RoutingConfig) -> Self {
        Self {
            catalog,
            prompts,
            config,
        }
    }

    /// Routing thresholds and model roles in effect.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Decide which model and prompt serve extraction.
    ///
    /// Non-finite confidence is treated as `0.0`; values outside `[0, 1]`
    /// are clamped.
    ///
    /// # Errors
    ///
    /// [`PipelineError::RoutingPolicyViolation`] when a configured model is
    /// missing from the catalog, or an image-bearing submission cannot be
    /// served by any registered model.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn route(
        &self,
        category: Category,
        confidence: f64,
        has_image: bool,
    ) -> Result<RoutingDecision, PipelineError> {
        let confidence = sanitize_confidence(confidence);
        let low = confidence < self.config.low_confidence_threshold;

        let (model_id, mut reason) = match category {
            Category::Unknown => (&self.config.general_model, ReasonCode::Default),
            Category::Food => (&self.config.high_quality_model, ReasonCode::Default),
            Category::Receipt | Category::Workout if low => (
                &self.config.high_quality_model,
                ReasonCode::LowConfidenceUpgrade,
            ),
            Category::Receipt | Category::Workout => {
                (&self.config.cheap_model, ReasonCode::Default)
            }
        };

        let mut model = self.lookup(model_id)?;
        if has_image && !model.capabilities.images {
            model = self.catalog.cheapest_image_capable().ok_or_else(|| {
                PipelineError::RoutingPolicyViolation(
                    "no image-capable model registered".to_string(),
                )
            })?;
            reason = ReasonCode::ImageRequiredUpgrade;
        }

        let use_case = UseCase::for_category(category);
        Ok(RoutingDecision {
            category,
            model_id: model.id.clone(),
            provider: model.provider,
            use_case,
            prompt_id: self.prompts.get(use_case).prompt_id(),
            reason,
        })
    }

    /// Model for stage-1 classification.
    ///
    /// The pinned `classifier_model` wins whenever it can take the
    /// submission, regardless of price. Otherwise the cheapest capable model
    /// is chosen, preferring ones with structured output.
    ///
    /// # Errors
    ///
    /// [`PipelineError::RoutingPolicyViolation`] when no registered model can
    /// take an image-bearing submission.
    pub fn classifier_model(&self, has_image: bool) -> Result<&ModelDescriptor, PipelineError> {
        let fits = |m: &ModelDescriptor| !has_image || m.capabilities.images;

        if let Some(m) = self.catalog.get(&self.config.classifier_model) {
            if fits(m) {
                return Ok(m);
            }
        }
        self.catalog
            .cheapest_where(|m| fits(m) && m.capabilities.structured_output)
            .or_else(|| self.catalog.cheapest_where(fits))
            .ok_or_else(|| {
                PipelineError::RoutingPolicyViolation(
                    "no registered model can classify this submission".to_string(),
                )
            })
    }

    /// Descriptor for a model id.
    ///
    /// # Errors
    ///
    /// [`PipelineError::RoutingPolicyViolation`] if the id is not registered.
    pub fn lookup(&self, model_id: &str) -> Result<&ModelDescriptor, PipelineError> {
        self.catalog.get(model_id).ok_or_else(|| {
            PipelineError::RoutingPolicyViolation(format!(
                "model `{model_id}` is not registered in the catalog"
            ))
        })
    }
}

fn sanitize_confidence(c: f64) -> f64 {
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
