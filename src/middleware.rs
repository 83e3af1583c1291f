//! # Stage: Request Middleware
//!
//! ## Responsibility
//! Cross-cutting checks composed explicitly around
//! [`SubmissionCoordinator::analyze`]: request validation before any model
//! call and a structured log line per finished request.
//!
//! ## Guarantees
//! - Middleware runs in registration order before the call and in reverse
//!   order after it
//! - A rejecting `before` hook stops the chain; the coordinator is not called
//! - `after` hooks observe the result but cannot change it
//!
//! ## NOT Responsible For
//! - Authentication (the host resolves tenant and user before building a
//!   [`Submission`])
//! - Rate limiting (provider back-pressure surfaces as `RateLimited`)

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::coordinator::{AnalyzeResponse, SubmissionCoordinator};
use crate::{PipelineError, Submission};

/// Default description limit, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Hook pair run around one `analyze` call.
pub trait AnalyzeMiddleware: Send + Sync {
    /// Inspect the submission before the pipeline runs.
    ///
    /// # Errors
    ///
    /// Any error aborts the request and is returned to the caller as is.
    fn before(&self, _submission: &Submission) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Observe the outcome once the pipeline has finished.
    fn after(
        &self,
        _submission: &Submission,
        _result: &Result<AnalyzeResponse, PipelineError>,
    ) {
    }
}

// ── Validation ───────────────────────────────────────────────────────────

/// Rejects submissions the pipeline cannot analyze.
///
/// A submission must carry a non-blank description or an image, and the
/// description must not exceed `max_chars` characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionValidator {
    max_chars: usize,
}

impl Default for SubmissionValidator {
    fn default() -> Self {
        Self::new(MAX_DESCRIPTION_CHARS)
    }
}

impl SubmissionValidator {
    /// Validator with the given description limit.
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Check `submission`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidSubmission`] naming the violated rule.
    pub fn check(&self, submission: &Submission) -> Result<(), PipelineError> {
        let description = submission.description();
        if description.trim().is_empty() && !submission.has_image() {
            return Err(PipelineError::InvalidSubmission(
                "a description or an image is required".to_string(),
            ));
        }
        let chars = description.chars().count();
        if chars > self.max_chars {
            return Err(PipelineError::InvalidSubmission(format!(
                "description is {chars} characters; the limit is {}",
                self.max_chars
            )));
        }
        Ok(())
    }
}

impl AnalyzeMiddleware for SubmissionValidator {
    fn before(&self, submission: &Submission) -> Result<(), PipelineError> {
        self.check(submission)
    }
}

// ── Logging ──────────────────────────────────────────────────────────────

/// Emits one `tracing` event per finished request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

impl AnalyzeMiddleware for RequestLogger {
    fn after(&self, submission: &Submission, result: &Result<AnalyzeResponse, PipelineError>) {
        match result {
            Ok(resp) => info!(
                submission_id = %submission.id(),
                tenant = submission.tenant().as_str(),
                category = %resp.category,
                model = %resp.routing.model_id,
                cost_usd = resp.cost.cost_usd,
                warnings = ?resp.warnings(),
                "analyze completed"
            ),
            Err(e) => warn!(
                submission_id = %submission.id(),
                tenant = submission.tenant().as_str(),
                kind = %e.kind(),
                retryable = e.is_retryable(),
                "analyze failed"
            ),
        }
    }
}

// ── Chain ────────────────────────────────────────────────────────────────

/// Ordered middleware around a coordinator.
#[derive(Default, Clone)]
pub struct MiddlewareStack {
    layers: Vec<Arc<dyn AnalyzeMiddleware>>,
}

impl MiddlewareStack {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validation followed by request logging.
    pub fn standard(max_description_chars: usize) -> Self {
        Self::new()
            .add(SubmissionValidator::new(max_description_chars))
            .add(RequestLogger)
    }

    /// Append a layer.
    pub fn add<M: AnalyzeMiddleware + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run every `before` hook, the coordinator, then every `after` hook.
    ///
    /// # Errors
    ///
    /// The first `before` rejection, or the coordinator's error.
    pub async fn run(
        &self,
        coordinator: &SubmissionCoordinator,
        submission: Submission,
    ) -> Result<AnalyzeResponse, PipelineError> {
        for layer in &self.layers {
            layer.before(&submission)?;
        }

        let started = Instant::now();
        let result = coordinator.analyze(submission.clone()).await;
        tracing::debug!(
            submission_id = %submission.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "middleware chain finished"
        );

        for layer in self.layers.iter().rev() {
            layer.after(&submission, &result);
        }
        result
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageRef, TenantId, UserId};
    use parking_lot::Mutex;

    fn submission(desc: &str) -> Submission {
        Submission::new(TenantId::new("t1"), UserId::new("u1"), desc)
    }

    #[test]
    fn test_validator_accepts_normal_description() {
        assert!(SubmissionValidator::default().check(&submission("two eggs")).is_ok());
    }

    #[test]
    fn test_validator_accepts_image_without_description() {
        let sub = submission("").with_image(ImageRef::Url("https://img/1.jpg".into()));
        assert!(SubmissionValidator::default().check(&sub).is_ok());
    }

    #[test]
    fn test_validator_rejects_blank_without_image() {
        let err = SubmissionValidator::default()
            .check(&submission("   "))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSubmission(_)));
    }

    #[test]
    fn test_validator_limit_is_inclusive_and_counts_chars() {
        let v = SubmissionValidator::new(5);
        assert!(v.check(&submission("ééééé")).is_ok());
        let err = v.check(&submission("éééééé")).unwrap_err();
        assert!(err.to_string().contains("6 characters"));
    }

    #[test]
    fn test_default_limit_is_1000() {
        let v = SubmissionValidator::default();
        assert!(v.check(&submission(&"a".repeat(1000))).is_ok());
        assert!(v.check(&submission(&"a".repeat(1001))).is_err());
    }

    struct Trace(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl AnalyzeMiddleware for Trace {
        fn before(&self, _s: &Submission) -> Result<(), PipelineError> {
            self.0.lock().push(self.1);
            Ok(())
        }
    }

    struct Reject;

    impl AnalyzeMiddleware for Reject {
        fn before(&self, _s: &Submission) -> Result<(), PipelineError> {
            Err(PipelineError::InvalidSubmission("blocked".into()))
        }
    }

    #[test]
    fn test_stack_standard_has_two_layers() {
        let stack = MiddlewareStack::standard(1000);
        assert_eq!(stack.len(), 2);
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_before_hooks_run_in_order_until_rejection() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stack = MiddlewareStack::new()
            .add(Trace(Arc::clone(&seen), "a"))
            .add(Reject)
            .add(Trace(Arc::clone(&seen), "c"));

        let sub = submission("x");
        let rejected = stack.layers.iter().try_for_each(|l| l.before(&sub));
        assert!(rejected.is_err());
        assert_eq!(*seen.lock(), vec!["a"]);
    }
}
