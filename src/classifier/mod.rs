//! # Stage: Classification
//!
//! ## Responsibility
//! Decide `{category, confidence, rationale}` for a submission using the
//! cheapest capable model.
//!
//! ## Guarantees
//! - Total: `classify` always yields a category. Any call failure or
//!   malformed answer degrades to the keyword heuristic with confidence
//!   `0.0` and rationale `fallback-heuristic`.
//! - Transport errors are retried once before degrading.
//! - Every model attempt, and the heuristic fallback, is metered.
//!
//! ## NOT Responsible For
//! - Picking the extraction model (see [`crate::routing`])

pub mod heuristic;

pub use heuristic::{KeywordClassifier, KeywordScores};

use crate::category::Category;
use crate::extract::coerce::parse_numeric_text;
use crate::extract::schema::locate_json;
use crate::prompts::{PromptContext, PromptLibrary, UseCase};
use crate::retry::{retry_if, RetryPolicy};
use crate::routing::cost_meter::HEURISTIC_MODEL_ID;
use crate::routing::{CallOutcome, CallRecord, ModelRouter, RunLedger};
use crate::worker::{invoke_bounded, InvocationRequest, InvokeError, ModelResponse, ModelWorker};
use crate::{Stage, Submission};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rationale recorded on heuristic classifications.
pub const HEURISTIC_RATIONALE: &str = "fallback-heuristic";

/// Confidence assumed when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Classifier call tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    /// Completion token cap for the classification call.
    pub max_tokens: u32,
    /// Bounded wait per call.
    pub timeout: Duration,
    /// Transport retry policy.
    pub retry: RetryPolicy,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Stage-1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Chosen category.
    pub category: Category,
    /// Self-reported certainty in `[0, 1]`.
    pub confidence: f64,
    /// Short justification.
    pub rationale: String,
    /// Model that answered, or the heuristic id.
    pub model_id: String,
    /// Latency of the successful call.
    pub latency_ms: u64,
    /// Prompt plus completion tokens of the successful call.
    pub tokens: u64,
}

/// Classification plus whether it came from the heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    /// The classification.
    pub result: ClassificationResult,
    /// `true` when the keyword heuristic stood in for the model.
    pub degraded: bool,
}

/// Stage-1 classifier, borrowed for one run.
pub struct Classifier<'a> {
    worker: &'a dyn ModelWorker,
    router: &'a ModelRouter,
    prompts: &'a PromptLibrary,
    settings: &'a ClassifierSettings,
}

impl<'a> Classifier<'a> {
    /// Classifier over the given collaborators.
    pub fn new(
        worker: &'a dyn ModelWorker,
        router: &'a ModelRouter,
        prompts: &'a PromptLibrary,
        settings: &'a ClassifierSettings,
    ) -> Self {
        Self {
            worker,
            router,
            prompts,
            settings,
        }
    }

    /// Classify `submission`. Never fails.
    pub async fn classify(
        &self,
        submission: &Submission,
        ledger: &RunLedger<'_>,
    ) -> ClassificationOutcome {
        let model = match self.router.classifier_model(submission.has_image()) {
            Ok(m) => m,
            Err(e) => {
                warn!(submission_id = %submission.id(), error = %e, "no classifier model; using heuristic");
                return self.fallback(submission, ledger);
            }
        };

        let prompt = self.prompts.get(UseCase::Classify).render(&PromptContext {
            description: submission.description(),
            received_at: submission.received_at(),
        });
        let request = InvocationRequest {
            provider: model.provider,
            model_id: model.id.clone(),
            use_case: UseCase::Classify,
            system: prompt.system,
            prompt: prompt.user,
            image_url: submission.image().map(|i| i.to_model_url()),
            max_tokens: self.settings.max_tokens.min(model.max_output_tokens),
            timeout: self.settings.timeout,
            json_mode: model.capabilities.structured_output,
        };

        let response = retry_if(
            &self.settings.retry,
            || self.attempt(&request, ledger),
            InvokeError::is_transport,
        )
        .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(submission_id = %submission.id(), model = %model.id, error = %e, "classification call failed");
                return self.fallback(submission, ledger);
            }
        };

        match parse_classification(&response.text) {
            Ok((category, confidence, rationale)) => {
                ledger.record(CallRecord::from_response(
                    Stage::Classification,
                    model,
                    &response,
                    CallOutcome::Success,
                ));
                info!(
                    submission_id = %submission.id(),
                    model = %model.id,
                    %category,
                    confidence,
                    "classified"
                );
                ClassificationOutcome {
                    result: ClassificationResult {
                        category,
                        confidence,
                        rationale,
                        model_id: model.id.clone(),
                        latency_ms: millis(response.latency),
                        tokens: response.tokens_in + response.tokens_out,
                    },
                    degraded: false,
                }
            }
            Err(reason) => {
                ledger.record(CallRecord::from_response(
                    Stage::Classification,
                    model,
                    &response,
                    CallOutcome::ParseFailure,
                ));
                warn!(submission_id = %submission.id(), model = %model.id, %reason, "classification answer unusable");
                self.fallback(submission, ledger)
            }
        }
    }

    async fn attempt(
        &self,
        request: &InvocationRequest,
        ledger: &RunLedger<'_>,
    ) -> Result<ModelResponse, InvokeError> {
        let started = Instant::now();
        let result = invoke_bounded(self.worker, request).await;
        if let Err(e) = &result {
            ledger.record(CallRecord::from_error(
                Stage::Classification,
                &request.model_id,
                started.elapsed(),
                e,
            ));
        }
        result
    }

    fn fallback(&self, submission: &Submission, ledger: &RunLedger<'_>) -> ClassificationOutcome {
        ledger.record(CallRecord::heuristic(Stage::Classification));
        let category = KeywordClassifier.classify(submission.description());
        info!(submission_id = %submission.id(), %category, "classified by keyword heuristic");
        ClassificationOutcome {
            result: ClassificationResult {
                category,
                confidence: 0.0,
                rationale: HEURISTIC_RATIONALE.to_string(),
                model_id: HEURISTIC_MODEL_ID.to_string(),
                latency_ms: 0,
                tokens: 0,
            },
            degraded: true,
        }
    }
}

/// Read `{category, confidence, reasoning}` out of a classification answer.
///
/// Confidence may be a number, a numeric string or a percentage; it is
/// clamped to `[0, 1]` and defaults to 0.5 when absent.
fn parse_classification(text: &str) -> Result<(Category, f64, String), String> {
    let obj = locate_json(text).map_err(|v| v.to_string())?;

    let category = match obj.get("category") {
        Some(Value::String(label)) => label
            .parse::<Category>()
            .map_err(|e| e.to_string())?,
        _ => return Err("missing `category`".to_string()),
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => DEFAULT_CONFIDENCE,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
        Some(Value::String(s)) => {
            let n = parse_numeric_text(s).ok_or_else(|| format!("unreadable confidence `{s}`"))?;
            if s.trim_end().ends_with('%') {
                n / 100.0
            } else {
                n
            }
        }
        Some(other) => return Err(format!("unreadable confidence {other}")),
    };
    // some models answer 85 meaning 85%
    let confidence = if confidence > 1.0 && confidence <= 100.0 {
        confidence / 100.0
    } else {
        confidence
    };
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let rationale = ["reasoning", "rationale", "reason"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok((category, confidence, rationale))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::routing::{CostMeter, RoutingConfig};
    use crate::worker::{ScriptedReply, ScriptedWorker};
    use crate::{ImageRef, TenantId, UserId};
    use std::sync::Arc;

    fn router() -> ModelRouter {
        ModelRouter::new(
            Arc::new(ModelCatalog::builtin()),
            Arc::new(PromptLibrary::builtin()),
            RoutingConfig::default(),
        )
    }

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..ClassifierSettings::default()
        }
    }

    async fn classify(worker: &ScriptedWorker, sub: &Submission) -> (ClassificationOutcome, CostMeter) {
        let meter = CostMeter::new();
        let router = router();
        let prompts = PromptLibrary::builtin();
        let settings = settings();
        let outcome = {
            let ledger = RunLedger::new(&meter);
            Classifier::new(worker, &router, &prompts, &settings)
                .classify(sub, &ledger)
                .await
        };
        (outcome, meter)
    }

    fn sub(text: &str) -> Submission {
        Submission::new(TenantId::new("t"), UserId::new("u"), text)
    }

    // -- parsing ---------------------------------------------------------

    #[test]
    fn test_parse_classification_reads_all_fields() {
        let (c, conf, why) =
            parse_classification(r#"{"category": "Receipt", "confidence": 0.92, "reasoning": "prices"}"#)
                .unwrap();
        assert_eq!(c, Category::Receipt);
        assert!((conf - 0.92).abs() < 1e-9);
        assert_eq!(why, "prices");
    }

    #[test]
    fn test_parse_classification_normalises_percentages() {
        let (_, conf, _) = parse_classification(r#"{"category": "food", "confidence": "85%"}"#).unwrap();
        assert!((conf - 0.85).abs() < 1e-9);
        let (_, conf, _) = parse_classification(r#"{"category": "food", "confidence": 70}"#).unwrap();
        assert!((conf - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_parse_classification_defaults_missing_confidence() {
        let (_, conf, _) = parse_classification(r#"{"category": "workout"}"#).unwrap();
        assert!((conf - DEFAULT_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_parse_classification_rejects_unknown_label() {
        assert!(parse_classification(r#"{"category": "shopping", "confidence": 0.9}"#).is_err());
        assert!(parse_classification("food, probably").is_err());
    }

    // -- model path ------------------------------------------------------

    #[tokio::test]
    async fn test_model_answer_is_used_and_metered() {
        let worker = ScriptedWorker::new().then(
            UseCase::Classify,
            ScriptedReply::Text(r#"{"category":"food","confidence":0.9,"reasoning":"meal"}"#.into()),
        );
        let (outcome, meter) = classify(&worker, &sub("Grilled chicken breast, 6oz")).await;
        assert!(!outcome.degraded);
        assert_eq!(outcome.result.category, Category::Food);
        assert_eq!(outcome.result.model_id, "gpt-4o-mini");
        assert_eq!(outcome.result.tokens, 150);
        let s = meter.snapshot();
        assert_eq!(s.classification_calls, 1);
        assert!(s.total_cost_nanos > 0);
    }

    #[tokio::test]
    async fn test_max_tokens_is_capped_for_classification() {
        let worker = ScriptedWorker::new().then(
            UseCase::Classify,
            ScriptedReply::Text(r#"{"category":"food"}"#.into()),
        );
        classify(&worker, &sub("toast")).await;
        assert_eq!(worker.calls()[0].max_tokens, 100);
    }

    // -- fallback --------------------------------------------------------

    #[tokio::test]
    async fn test_transport_error_retried_once_then_heuristic() {
        let worker = ScriptedWorker::new().always(UseCase::Classify, ScriptedReply::TransportError);
        let (outcome, meter) = classify(&worker, &sub("Walmart receipt, Milk $4.50")).await;
        assert!(outcome.degraded);
        assert_eq!(outcome.result.category, Category::Receipt);
        assert_eq!(outcome.result.confidence, 0.0);
        assert_eq!(outcome.result.rationale, HEURISTIC_RATIONALE);
        assert_eq!(worker.call_count(UseCase::Classify), 2);
        let s = meter.snapshot();
        // two failed attempts plus one zero-cost heuristic record
        assert_eq!(s.classification_calls, 3);
        assert_eq!(s.heuristic_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_transport_error_then_answer_is_not_degraded() {
        let worker = ScriptedWorker::new()
            .then(UseCase::Classify, ScriptedReply::TransportError)
            .then(
                UseCase::Classify,
                ScriptedReply::Text(r#"{"category":"workout","confidence":0.8}"#.into()),
            );
        let (outcome, _) = classify(&worker, &sub("ran 3 miles")).await;
        assert!(!outcome.degraded);
        assert_eq!(outcome.result.category, Category::Workout);
    }

    #[tokio::test]
    async fn test_malformed_answer_degrades_without_retry() {
        let worker =
            ScriptedWorker::new().always(UseCase::Classify, ScriptedReply::Text("food!".into()));
        let (outcome, _) = classify(&worker, &sub("Grilled chicken breast, 6oz")).await;
        assert!(outcome.degraded);
        assert_eq!(outcome.result.category, Category::Food);
        assert_eq!(worker.call_count(UseCase::Classify), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_degrades_to_heuristic() {
        let worker = ScriptedWorker::new().always(UseCase::Classify, ScriptedReply::RateLimited);
        let (outcome, _) = classify(&worker, &sub("ran 3 miles")).await;
        assert!(outcome.degraded);
        assert_eq!(worker.call_count(UseCase::Classify), 1);
    }

    #[tokio::test]
    async fn test_image_submission_sends_image_to_classifier() {
        let worker = ScriptedWorker::new().then(
            UseCase::Classify,
            ScriptedReply::Text(r#"{"category":"receipt","confidence":0.7}"#.into()),
        );
        let s = sub("").with_image(ImageRef::Url("https://img.example/r.jpg".into()));
        classify(&worker, &s).await;
        let call = &worker.calls()[0];
        assert_eq!(call.image_url.as_deref(), Some("https://img.example/r.jpg"));
    }
}
