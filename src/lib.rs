//! # nutriwealth-pipeline
//!
//! Two-stage classification and extraction pipeline that turns a free-form
//! submission (text plus optional image) into typed food, receipt or workout
//! records.
//!
//! ## Architecture
//!
//! ```text
//! Submission → Classifier → ModelRouter → Extractor → fan-out persistence
//!                  │             │            │               │
//!                  └── CostMeter (atomic totals shared by all runs) ──┘
//! ```
//!
//! [`coordinator::SubmissionCoordinator`] owns one run per submission and
//! is the only externally callable surface (`analyze`, `submit`, `status`).

// ── Lint policy ────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub mod catalog;
pub mod category;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod extract;
pub mod metrics;
pub mod middleware;
pub mod persist;
pub mod prompts;
pub mod retry;
pub mod routing;
pub mod storage;
pub mod usage;
pub mod worker;

// Re-exports for convenience
pub use catalog::{ModelCatalog, ModelDescriptor, Provider};
pub use category::Category;
pub use coordinator::{AnalyzeResponse, SubmissionCoordinator, SubmissionState};
pub use prompts::{PromptLibrary, UseCase};
pub use routing::{CostMeter, ModelRouter, RoutingDecision};
pub use worker::{ModelWorker, ScriptedWorker};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output with span context
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), PipelineError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| PipelineError::Config(format!("tracing init failed: {e}")))
}

/// Pipeline stage that performs I/O and can fail or time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Stage 1 model call.
    Classification,
    /// Stage 2 model call(s).
    Extraction,
    /// Fan-out writes to structured storage.
    Persistence,
}

impl Stage {
    /// Lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classification => "classification",
            Stage::Extraction => "extraction",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, finite set of error kinds reported to callers.
///
/// The first three kinds marked *soft* never abort a run; they appear as
/// warnings on a successful [`AnalyzeResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Soft: the classifier fell back to the keyword heuristic.
    ClassificationDegraded,
    /// Soft: both extraction attempts produced output that failed validation.
    ExtractionParseFailure,
    /// Soft: the parent record was written but some children were not.
    PersistencePartialFailure,
    /// No model satisfies the routing policy; a configuration bug.
    RoutingPolicyViolation,
    /// Network or provider failure after the single retry.
    ModelTransportError,
    /// The provider asked us to slow down. Retryable by the caller.
    RateLimited,
    /// The caller's deadline elapsed before extraction finished.
    Timeout,
    /// Submission rejected before any model call.
    InvalidSubmission,
    /// The parent record write failed; nothing was persisted.
    PersistenceFatalFailure,
    /// Configuration could not be loaded or applied.
    Configuration,
}

impl ErrorKind {
    /// Snake-case label for logs, metrics and status records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClassificationDegraded => "classification_degraded",
            ErrorKind::ExtractionParseFailure => "extraction_parse_failure",
            ErrorKind::PersistencePartialFailure => "persistence_partial_failure",
            ErrorKind::RoutingPolicyViolation => "routing_policy_violation",
            ErrorKind::ModelTransportError => "model_transport_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidSubmission => "invalid_submission",
            ErrorKind::PersistenceFatalFailure => "persistence_fatal_failure",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard failures returned by the pipeline.
///
/// Messages are stable and never embed raw provider text; provider details
/// are logged through `tracing` at the point of failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The submission failed request validation.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// No registered model satisfies the routing policy.
    #[error("routing policy violation: {0}")]
    RoutingPolicyViolation(String),

    /// Transport or provider failure that survived the single retry.
    #[error("model transport failure during {stage}")]
    ModelTransport {
        /// Stage whose model call failed.
        stage: Stage,
    },

    /// The provider rate-limited us.
    #[error("model provider rate limited the request during {stage}")]
    RateLimited {
        /// Stage whose model call was throttled.
        stage: Stage,
    },

    /// The caller-supplied deadline elapsed.
    #[error("deadline exceeded during {stage}")]
    Timeout {
        /// Stage in progress when the deadline fired.
        stage: Stage,
    },

    /// The parent record could not be written.
    #[error("failed to write parent record to `{table}`")]
    PersistenceFatal {
        /// Target table of the failed parent write.
        table: String,
    },

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction or reload time, never per request.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Caller-facing kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidSubmission(_) => ErrorKind::InvalidSubmission,
            PipelineError::RoutingPolicyViolation(_) => ErrorKind::RoutingPolicyViolation,
            PipelineError::ModelTransport { .. } => ErrorKind::ModelTransportError,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::PersistenceFatal { .. } => ErrorKind::PersistenceFatalFailure,
            PipelineError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether resubmitting the same input later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited { .. } | PipelineError::Timeout { .. }
        )
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(e: config::ConfigError) -> Self {
        PipelineError::Config(e.to_string())
    }
}

/// Unique identifier of a submission, carried on every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tenant scope for storage calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(
    /// Raw tenant identifier.
    pub String,
);

impl TenantId {
    /// Create a tenant id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of the user who made a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(
    /// Raw user identifier.
    pub String,
);

impl UserId {
    /// Create a user id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Image attached to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImageRef {
    /// Publicly reachable URL.
    Url(String),
    /// Inline bytes with their media type.
    Inline {
        /// MIME type, e.g. `image/jpeg`.
        media_type: String,
        /// Raw image bytes.
        data: Vec<u8>,
    },
}

impl ImageRef {
    /// URL form accepted by model providers: the URL itself or a
    /// base64 `data:` URL for inline bytes.
    pub fn to_model_url(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Inline { media_type, data } => format!(
                "data:{media_type};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
        }
    }
}

/// Input unit of the pipeline. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    id: SubmissionId,
    description: String,
    image: Option<ImageRef>,
    submitter: UserId,
    tenant: TenantId,
    received_at: DateTime<Utc>,
}

impl Submission {
    /// New text submission received now.
    pub fn new(tenant: TenantId, submitter: UserId, description: impl Into<String>) -> Self {
        Self {
            id: SubmissionId::new(),
            description: description.into(),
            image: None,
            submitter,
            tenant,
            received_at: Utc::now(),
        }
    }

    /// Attach an image.
    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }

    /// Override the receive timestamp.
    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: SubmissionId) -> Self {
        self.id = id;
        self
    }

    /// Submission id.
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Free-form description, possibly empty.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Attached image, if any.
    pub fn image(&self) -> Option<&ImageRef> {
        self.image.as_ref()
    }

    /// Whether an image is attached.
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Submitting user.
    pub fn submitter(&self) -> &UserId {
        &self.submitter
    }

    /// Owning tenant.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// When the submission was accepted.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
