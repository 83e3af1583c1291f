//! # Model catalog
//!
//! ## Responsibility
//! Registry of the inference models the pipeline may call: capability flags,
//! pricing and latency hints. Pure data plus lookup.
//!
//! ## Guarantees
//! - Immutable after construction; shared read-only across concurrent runs.
//! - Model ids are unique (enforced by [`ModelCatalog::new`]).
//! - Pricing is advisory: it feeds metering, never routing correctness.
//!
//! ## NOT Responsible For
//! - Choosing a model for a submission (see [`crate::routing`])
//! - Calling a model (see [`crate::worker`])

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

fn default_max_output_tokens() -> u32 {
    2048
}

/// Inference provider hosting a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat completions.
    OpenAi,
    /// Groq (OpenAI-compatible endpoint).
    Groq,
    /// Anthropic messages API.
    Anthropic,
    /// Local Ollama server (OpenAI-compatible endpoint).
    Ollama,
}

impl Provider {
    /// Lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a model can accept and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Capabilities {
    /// Accepts image input alongside the prompt.
    #[serde(default)]
    pub images: bool,
    /// Supports a JSON / structured output mode.
    #[serde(default)]
    pub structured_output: bool,
}

/// One registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelDescriptor {
    /// Provider-facing model id, e.g. `gpt-4o-mini`.
    pub id: String,
    /// Hosting provider.
    pub provider: Provider,
    /// Capability flags.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// USD per 1 000 prompt tokens.
    pub cost_per_1k_input: f64,
    /// USD per 1 000 completion tokens.
    pub cost_per_1k_output: f64,
    /// Upper bound on completion tokens requested from this model.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Observed average latency, informational only.
    #[serde(default)]
    pub avg_latency_ms: u64,
}

impl ModelDescriptor {
    /// Cost in nano-dollars of a call with the given token counts.
    ///
    /// Integer arithmetic so that summing many calls never drifts.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn cost_nanos(&self, tokens_in: u64, tokens_out: u64) -> u64 {
        let input = tokens_in as u128 * usd_to_nanos(self.cost_per_1k_input) as u128 / 1000;
        let output = tokens_out as u128 * usd_to_nanos(self.cost_per_1k_output) as u128 / 1000;
        u64::try_from(input + output).unwrap_or(u64::MAX)
    }

    /// Cost in USD of a call with the given token counts.
    pub fn cost_usd(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        nanos_to_usd(self.cost_nanos(tokens_in, tokens_out))
    }

    /// Price used to rank models by cheapness: input plus output rate.
    fn blended_rate(&self) -> f64 {
        self.cost_per_1k_input + self.cost_per_1k_output
    }
}

/// Errors raised while building a catalog.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    /// Two descriptors share an id.
    #[error("duplicate model id `{0}` in catalog")]
    DuplicateId(String),
    /// No descriptors were supplied.
    #[error("model catalog is empty")]
    Empty,
    /// A descriptor carries a negative or non-finite price.
    #[error("model `{0}` has an invalid price")]
    InvalidPrice(String),
}

/// Immutable registry of [`ModelDescriptor`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Build a catalog, rejecting duplicate ids, empty input and bad prices.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] describing the first problem found.
    pub fn new(models: Vec<ModelDescriptor>) -> Result<Self, CatalogError> {
        if models.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for m in &models {
            if !seen.insert(m.id.as_str()) {
                return Err(CatalogError::DuplicateId(m.id.clone()));
            }
            let prices = [m.cost_per_1k_input, m.cost_per_1k_output];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(CatalogError::InvalidPrice(m.id.clone()));
            }
        }
        Ok(Self { models })
    }

    /// Look up a model by id.
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Whether a model with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All registered models in registration order.
    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Cheapest model satisfying `pred`. Ties keep registration order.
    pub fn cheapest_where<P>(&self, pred: P) -> Option<&ModelDescriptor>
    where
        P: Fn(&ModelDescriptor) -> bool,
    {
        self.models
            .iter()
            .filter(|m| pred(m))
            .fold(None, |best: Option<&ModelDescriptor>, m| match best {
                Some(b) if b.blended_rate() <= m.blended_rate() => Some(b),
                _ => Some(m),
            })
    }

    /// Cheapest model that accepts images.
    pub fn cheapest_image_capable(&self) -> Option<&ModelDescriptor> {
        self.cheapest_where(|m| m.capabilities.images)
    }

    /// Built-in catalog used when configuration lists no models.
    pub fn builtin() -> Self {
        Self {
            models: builtin_models(),
        }
    }
}

/// Models registered when configuration supplies none.
pub fn builtin_models() -> Vec<ModelDescriptor> {
    let full = Capabilities {
        images: true,
        structured_output: true,
    };
    vec![
        ModelDescriptor {
            id: "gpt-4o-mini".into(),
            provider: Provider::OpenAi,
            capabilities: full,
            cost_per_1k_input: 0.00015,
            cost_per_1k_output: 0.0006,
            max_output_tokens: 2000,
            avg_latency_ms: 1200,
        },
        ModelDescriptor {
            id: "gpt-4o".into(),
            provider: Provider::OpenAi,
            capabilities: full,
            cost_per_1k_input: 0.0025,
            cost_per_1k_output: 0.01,
            max_output_tokens: 2000,
            avg_latency_ms: 2500,
        },
        ModelDescriptor {
            id: "gpt-5.2".into(),
            provider: Provider::OpenAi,
            capabilities: full,
            cost_per_1k_input: 0.005,
            cost_per_1k_output: 0.015,
            max_output_tokens: 2000,
            avg_latency_ms: 3000,
        },
        ModelDescriptor {
            id: "llama-3.2-90b-vision-preview".into(),
            provider: Provider::Groq,
            capabilities: full,
            cost_per_1k_input: 0.0009,
            cost_per_1k_output: 0.0009,
            max_output_tokens: 2000,
            avg_latency_ms: 800,
        },
        ModelDescriptor {
            id: "claude-3-haiku-20240307".into(),
            provider: Provider::Anthropic,
            capabilities: Capabilities {
                images: true,
                structured_output: false,
            },
            cost_per_1k_input: 0.00025,
            cost_per_1k_output: 0.00125,
            max_output_tokens: 2000,
            avg_latency_ms: 1500,
        },
        ModelDescriptor {
            id: "llama3.2".into(),
            provider: Provider::Ollama,
            capabilities: Capabilities {
                images: false,
                structured_output: true,
            },
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_output_tokens: 2000,
            avg_latency_ms: 5000,
        },
    ]
}

/// Convert USD to nano-dollars (1 USD = 1e9 nano-dollars), rounding to nearest.
pub(crate) fn usd_to_nanos(usd: f64) -> u64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * 1_000_000_000.0).round() as u64
}

/// Convert nano-dollars to USD.
pub(crate) fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}
