//! # Stage: Extraction
//!
//! ## Responsibility
//! Call the routed model with the category prompt, validate the answer
//! against the category schema, and re-prompt once with the violation when
//! it does not fit.
//!
//! ## Guarantees
//! - Bounded: at most `max_attempts` model calls per submission (default 2).
//! - Lossless: when every attempt fails validation the result carries a
//!   parse-failure marker holding the last raw response verbatim.
//! - Metered: every attempt lands in the run ledger the moment it finishes.
//!
//! ## NOT Responsible For
//! - Choosing the model (see [`crate::routing`])
//! - Writing results to storage (see [`crate::persist`])

pub mod coerce;
pub mod schema;

pub use coerce::{FieldFlag, FlagIssue, SchemaViolation};
pub use schema::{
    AnalysisPayload, Exercise, FoodAnalysis, FoodItem, GeneralAnalysis, MealType, ParseFailure,
    ReceiptAnalysis, ReceiptItem, WorkoutAnalysis,
};

use crate::category::Category;
use crate::prompts::{PromptContext, PromptLibrary};
use crate::retry::{with_jitter, RetryPolicy};
use crate::routing::{CallOutcome, CallRecord, ModelRouter, RoutingDecision, RunLedger};
use crate::worker::{invoke_bounded, InvocationRequest, InvokeError, ModelWorker};
use crate::{PipelineError, Stage, Submission};
use coerce::Coercer;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extraction tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    /// Attempt bound and the pause between attempts after a call error.
    pub retry: RetryPolicy,
    /// Bounded wait for each model call.
    pub call_timeout: Duration,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Metering envelope of an extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metering {
    /// Model that served the extraction.
    pub model_id: String,
    /// Prompt tokens over every attempt.
    pub tokens_in: u64,
    /// Completion tokens over every attempt.
    pub tokens_out: u64,
    /// Spend over every attempt, nano-dollars.
    pub cost_nanos: u64,
    /// Spend over every attempt, USD.
    pub cost_usd: f64,
    /// Model latency over every attempt.
    pub latency_ms: u64,
    /// Model calls made.
    pub attempts: u32,
}

/// Typed extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Category the payload belongs to.
    pub category: Category,
    /// Schema-conforming payload or a parse-failure marker.
    pub payload: AnalysisPayload,
    /// Values that were coerced, clamped or derived.
    pub flags: Vec<FieldFlag>,
    /// Cost and latency of the extraction.
    pub metering: Metering,
}

impl AnalysisResult {
    /// Whether the payload is a parse-failure marker.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self.payload, AnalysisPayload::ParseFailure(_))
    }
}

/// Why the previous attempt did not produce a payload.
enum Failure {
    Invalid { raw: String, violation: SchemaViolation },
    Call(InvokeError),
}

/// Stage-2 extractor, borrowed for one run.
pub struct Extractor<'a> {
    worker: &'a dyn ModelWorker,
    router: &'a ModelRouter,
    prompts: &'a PromptLibrary,
    settings: &'a ExtractionSettings,
}

impl<'a> Extractor<'a> {
    /// Extractor over the given collaborators.
    pub fn new(
        worker: &'a dyn ModelWorker,
        router: &'a ModelRouter,
        prompts: &'a PromptLibrary,
        settings: &'a ExtractionSettings,
    ) -> Self {
        Self {
            worker,
            router,
            prompts,
            settings,
        }
    }

    /// Run extraction for `submission` with the routed model.
    ///
    /// A per-call timeout counts as a failed validation and consumes one
    /// attempt. A transport failure is retried once; a second consecutive
    /// transport failure is returned as an error.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::RoutingPolicyViolation`] if the routed model is not registered
    /// - [`PipelineError::RateLimited`] if the provider throttles the call
    /// - [`PipelineError::ModelTransport`] if no attempt reached the model
    pub async fn extract(
        &self,
        submission: &Submission,
        decision: &RoutingDecision,
        ledger: &RunLedger<'_>,
    ) -> Result<AnalysisResult, PipelineError> {
        let model = self.router.lookup(&decision.model_id)?;
        let template = self.prompts.get(decision.use_case);
        let ctx = PromptContext {
            description: submission.description(),
            received_at: submission.received_at(),
        };
        let image_url = submission.image().map(|i| i.to_model_url());

        let mut last_invalid: Option<(String, SchemaViolation)> = None;
        let mut previous: Option<Failure> = None;

        for attempt in 1..=self.settings.retry.max_attempts {
            let prompt = match &previous {
                Some(Failure::Invalid { violation, .. }) => {
                    template.render_repair(&ctx, &violation.to_string())
                }
                _ => template.render(&ctx),
            };
            let request = InvocationRequest {
                provider: model.provider,
                model_id: model.id.clone(),
                use_case: decision.use_case,
                system: prompt.system,
                prompt: prompt.user,
                image_url: image_url.clone(),
                max_tokens: model.max_output_tokens,
                timeout: self.settings.call_timeout,
                json_mode: model.capabilities.structured_output,
            };

            let started = Instant::now();
            let failure = match invoke_bounded(self.worker, &request).await {
                Ok(response) => {
                    let mut coercer = Coercer::new();
                    match schema::parse_payload(decision.category, &response.text, &mut coercer) {
                        Ok(payload) => {
                            ledger.record(CallRecord::from_response(
                                Stage::Extraction,
                                model,
                                &response,
                                CallOutcome::Success,
                            ));
                            let flags = coercer.into_flags();
                            info!(
                                submission_id = %submission.id(),
                                model = %model.id,
                                attempt,
                                flags = flags.len(),
                                "extraction succeeded"
                            );
                            return Ok(AnalysisResult {
                                category: decision.category,
                                payload,
                                flags,
                                metering: metering(&model.id, ledger),
                            });
                        }
                        Err(violation) => {
                            ledger.record(CallRecord::from_response(
                                Stage::Extraction,
                                model,
                                &response,
                                CallOutcome::ParseFailure,
                            ));
                            warn!(
                                submission_id = %submission.id(),
                                model = %model.id,
                                attempt,
                                %violation,
                                "extraction output failed validation"
                            );
                            last_invalid = Some((response.text.clone(), violation.clone()));
                            Failure::Invalid {
                                raw: response.text,
                                violation,
                            }
                        }
                    }
                }
                Err(err) => {
                    ledger.record(CallRecord::from_error(
                        Stage::Extraction,
                        &model.id,
                        started.elapsed(),
                        &err,
                    ));
                    warn!(
                        submission_id = %submission.id(),
                        model = %model.id,
                        attempt,
                        error = %err,
                        "extraction call failed"
                    );
                    match err {
                        InvokeError::RateLimited { .. } => {
                            return Err(PipelineError::RateLimited {
                                stage: Stage::Extraction,
                            })
                        }
                        InvokeError::Timeout => Failure::Invalid {
                            raw: String::new(),
                            violation: SchemaViolation::new("$", "no answer within the time limit"),
                        },
                        e if e.is_transport() => {
                            if matches!(previous, Some(Failure::Call(_))) {
                                break;
                            }
                            Failure::Call(e)
                        }
                        _ => {
                            return Err(PipelineError::ModelTransport {
                                stage: Stage::Extraction,
                            })
                        }
                    }
                }
            };

            if let Failure::Call(_) = failure {
                if self.settings.retry.allows_another(attempt) {
                    let delay = with_jitter(self.settings.retry.calculate_delay(attempt));
                    debug!(delay_ms = delay.as_millis() as u64, "extraction: retrying after call error");
                    tokio::time::sleep(delay).await;
                }
            }
            previous = Some(failure);
        }

        let marker = match (last_invalid, previous) {
            (Some((raw_response, violation)), _) => ParseFailure {
                raw_response,
                violation,
            },
            (None, Some(Failure::Invalid { raw, violation })) => ParseFailure {
                raw_response: raw,
                violation,
            },
            (None, _) => {
                return Err(PipelineError::ModelTransport {
                    stage: Stage::Extraction,
                })
            }
        };

        warn!(
            submission_id = %submission.id(),
            model = %model.id,
            violation = %marker.violation,
            "extraction exhausted attempts; keeping raw response for review"
        );
        Ok(AnalysisResult {
            category: decision.category,
            payload: AnalysisPayload::ParseFailure(marker),
            flags: Vec::new(),
            metering: metering(&model.id, ledger),
        })
    }
}

fn metering(model_id: &str, ledger: &RunLedger<'_>) -> Metering {
    let s = ledger.stage_summary(Stage::Extraction);
    Metering {
        model_id: model_id.to_string(),
        tokens_in: s.tokens_in,
        tokens_out: s.tokens_out,
        cost_nanos: s.cost_nanos,
        cost_usd: s.cost_usd,
        latency_ms: s.latency_ms,
        attempts: s.calls,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::prompts::UseCase;
    use crate::routing::{CostMeter, RoutingConfig};
    use crate::worker::{ScriptedReply, ScriptedWorker};
    use crate::{TenantId, UserId};
    use std::sync::Arc;

    struct Fixture {
        router: ModelRouter,
        prompts: PromptLibrary,
        settings: ExtractionSettings,
        meter: CostMeter,
    }

    fn fixture() -> Fixture {
        let prompts = PromptLibrary::builtin();
        Fixture {
            router: ModelRouter::new(
                Arc::new(ModelCatalog::builtin()),
                Arc::new(prompts.clone()),
                RoutingConfig::default(),
            ),
            prompts,
            settings: ExtractionSettings {
                retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
                call_timeout: Duration::from_millis(200),
            },
            meter: CostMeter::new(),
        }
    }

    fn submission(text: &str) -> Submission {
        Submission::new(TenantId::new("t"), UserId::new("u"), text)
    }

    async fn run(
        fx: &Fixture,
        worker: &ScriptedWorker,
        category: Category,
        text: &str,
    ) -> (Result<AnalysisResult, PipelineError>, u32) {
        let decision = fx
            .router
            .route(category, 0.9, false)
            .unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        let ledger = RunLedger::new(&fx.meter);
        let extractor = Extractor::new(worker, &fx.router, &fx.prompts, &fx.settings);
        let r = extractor.extract(&submission(text), &decision, &ledger).await;
        (r, ledger.attempts(Stage::Extraction))
    }

    const RECEIPT_JSON: &str = r#"{"merchant_name": "Walmart", "items": [
        {"name": "Milk", "price": 4.50}, {"name": "Bread", "price": "$3.25"}], "total_amount": 7.75}"#;

    #[tokio::test]
    async fn test_valid_first_answer_uses_one_call() {
        let fx = fixture();
        let worker = ScriptedWorker::new()
            .then(UseCase::Receipt, ScriptedReply::Text(RECEIPT_JSON.into()));
        let (r, attempts) = run(&fx, &worker, Category::Receipt, "Walmart receipt").await;
        let r = r.unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(r.metering.attempts, 1);
        assert!(!r.is_parse_failure());
        assert_eq!(r.flags.len(), 1, "price string should be flagged: {:?}", r.flags);
    }

    #[tokio::test]
    async fn test_invalid_then_valid_uses_repair_prompt() {
        let fx = fixture();
        let worker = ScriptedWorker::new()
            .then(UseCase::Receipt, ScriptedReply::Text(r#"{"items": "none"}"#.into()))
            .then(UseCase::Receipt, ScriptedReply::Text(RECEIPT_JSON.into()));
        let (r, attempts) = run(&fx, &worker, Category::Receipt, "Walmart receipt").await;
        assert!(!r.unwrap().is_parse_failure());
        assert_eq!(attempts, 2);
        let calls = worker.calls();
        assert!(calls[1].prompt.contains("previous answer was rejected"));
        assert!(calls[1].prompt.contains("`items` must be an array"));
    }

    #[tokio::test]
    async fn test_two_invalid_answers_yield_marker_with_raw_text() {
        let fx = fixture();
        let worker = ScriptedWorker::new()
            .always(UseCase::Food, ScriptedReply::Text("I think it was tasty!".into()));
        let (r, attempts) = run(&fx, &worker, Category::Food, "lunch").await;
        let r = r.unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(worker.call_count(UseCase::Food), 2);
        let AnalysisPayload::ParseFailure(marker) = r.payload else {
            panic!("expected marker");
        };
        assert_eq!(marker.raw_response, "I think it was tasty!");
    }

    #[tokio::test]
    async fn test_two_transport_errors_are_fatal() {
        let fx = fixture();
        let worker = ScriptedWorker::new().always(UseCase::Workout, ScriptedReply::TransportError);
        let (r, attempts) = run(&fx, &worker, Category::Workout, "ran 3 miles").await;
        assert!(matches!(
            r,
            Err(PipelineError::ModelTransport {
                stage: Stage::Extraction
            })
        ));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_transport_error_then_valid_answer_recovers() {
        let fx = fixture();
        let worker = ScriptedWorker::new()
            .then(UseCase::Receipt, ScriptedReply::TransportError)
            .then(UseCase::Receipt, ScriptedReply::Text(RECEIPT_JSON.into()));
        let (r, _) = run(&fx, &worker, Category::Receipt, "Walmart").await;
        let r = r.unwrap();
        assert_eq!(r.metering.attempts, 2);
        // the retry after a call error is not a repair
        assert!(!worker.calls()[1].prompt.contains("previous answer was rejected"));
    }

    #[tokio::test]
    async fn test_timeout_consumes_an_attempt() {
        let fx = fixture();
        let worker = ScriptedWorker::new()
            .then(UseCase::Receipt, ScriptedReply::Stall(5_000))
            .then(UseCase::Receipt, ScriptedReply::Text("still not json".into()));
        let (r, attempts) = run(&fx, &worker, Category::Receipt, "Walmart").await;
        assert!(r.unwrap().is_parse_failure());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_is_surfaced_immediately() {
        let fx = fixture();
        let worker = ScriptedWorker::new().always(UseCase::Receipt, ScriptedReply::RateLimited);
        let (r, attempts) = run(&fx, &worker, Category::Receipt, "Walmart").await;
        let err = r.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_attempt_bound_is_configurable() {
        let mut fx = fixture();
        fx.settings.retry = RetryPolicy::fixed(3, Duration::from_millis(1));
        let worker = ScriptedWorker::new().always(UseCase::Food, ScriptedReply::Text("nope".into()));
        let (r, attempts) = run(&fx, &worker, Category::Food, "soup").await;
        assert!(r.unwrap().is_parse_failure());
        assert_eq!(attempts, 3);
    }
}
