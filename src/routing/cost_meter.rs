//! Cost and latency metering.
//!
//! Every model call attempt (and every heuristic fallback) produces one
//! [`CallRecord`]. The shared [`CostMeter`] folds records into running totals
//! for alerting; [`CostSummary`] folds one run's records for the caller.
//!
//! Thread-safe: all counters use atomic operations for lock-free reads
//! and writes under concurrent pipeline access.

use crate::catalog::{nanos_to_usd, ModelDescriptor};
use crate::worker::{InvokeError, ModelResponse};
use crate::metrics;
use crate::Stage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Model id recorded for the keyword heuristic.
pub const HEURISTIC_MODEL_ID: &str = "keyword-heuristic";

/// Result of one metered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Model answered and the answer was usable.
    Success,
    /// Model answered but the answer failed validation.
    ParseFailure,
    /// Transport or provider error.
    TransportError,
    /// Provider rate limit.
    RateLimited,
    /// Bounded wait elapsed.
    Timeout,
    /// Keyword heuristic stood in for a model.
    Heuristic,
}

impl CallOutcome {
    /// Snake-case label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::ParseFailure => "parse_failure",
            CallOutcome::TransportError => "transport_error",
            CallOutcome::RateLimited => "rate_limited",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Heuristic => "heuristic",
        }
    }

    /// Whether the model produced no answer at all.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CallOutcome::TransportError | CallOutcome::RateLimited | CallOutcome::Timeout
        )
    }
}

/// One metered call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Stage that made the call.
    pub stage: Stage,
    /// Model id, or [`HEURISTIC_MODEL_ID`].
    pub model_id: String,
    /// Prompt tokens billed.
    pub tokens_in: u64,
    /// Completion tokens billed.
    pub tokens_out: u64,
    /// Cost in nano-dollars.
    pub cost_nanos: u64,
    /// Wall-clock latency.
    pub latency: Duration,
    /// How the call ended.
    pub outcome: CallOutcome,
}

impl CallRecord {
    /// Zero-cost record for a heuristic fallback.
    pub fn heuristic(stage: Stage) -> Self {
        Self {
            stage,
            model_id: HEURISTIC_MODEL_ID.to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost_nanos: 0,
            latency: Duration::ZERO,
            outcome: CallOutcome::Heuristic,
        }
    }

    /// Record for an attempt that produced no tokens.
    pub fn failed(stage: Stage, model_id: &str, latency: Duration, outcome: CallOutcome) -> Self {
        Self {
            stage,
            model_id: model_id.to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost_nanos: 0,
            latency,
            outcome,
        }
    }

    /// Record for a call that returned text, priced from the model's rates.
    pub fn from_response(
        stage: Stage,
        model: &ModelDescriptor,
        response: &ModelResponse,
        outcome: CallOutcome,
    ) -> Self {
        Self {
            stage,
            model_id: model.id.clone(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            cost_nanos: model.cost_nanos(response.tokens_in, response.tokens_out),
            latency: response.latency,
            outcome,
        }
    }

    /// Record for a call that failed before returning text.
    pub fn from_error(stage: Stage, model_id: &str, latency: Duration, error: &InvokeError) -> Self {
        let outcome = match error {
            InvokeError::RateLimited { .. } => CallOutcome::RateLimited,
            InvokeError::Timeout => CallOutcome::Timeout,
            InvokeError::Transport(_) | InvokeError::Provider { .. } | InvokeError::NoWorker(_) => {
                CallOutcome::TransportError
            }
        };
        Self::failed(stage, model_id, latency, outcome)
    }

    /// Cost in USD.
    pub fn cost_usd(&self) -> f64 {
        nanos_to_usd(self.cost_nanos)
    }
}

/// Running totals across every pipeline run in the process.
///
/// Costs are stored as nano-dollars (1 USD = 1e9) so that concurrent sums
/// are exact.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Default)]
pub struct CostMeter {
    calls: AtomicU64,
    classification_calls: AtomicU64,
    extraction_calls: AtomicU64,
    failed_calls: AtomicU64,
    heuristic_fallbacks: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    cost_nanos: AtomicU64,
    latency_ms: AtomicU64,

    alert_threshold_nanos: Option<u64>,
    alerted: AtomicBool,
}

impl CostMeter {
    /// Meter with all counters at zero and no alert threshold.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Meter that logs one warning when cumulative spend reaches `usd`.
    pub fn with_alert_threshold(usd: f64) -> Self {
        Self {
            alert_threshold_nanos: Some(crate::catalog::usd_to_nanos(usd)),
            ..Self::default()
        }
    }

    /// Fold one call into the totals.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record(&self, rec: &CallRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match rec.stage {
            Stage::Classification => self.classification_calls.fetch_add(1, Ordering::Relaxed),
            Stage::Extraction => self.extraction_calls.fetch_add(1, Ordering::Relaxed),
            Stage::Persistence => 0,
        };
        if rec.outcome.is_failure() {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        if rec.outcome == CallOutcome::Heuristic {
            self.heuristic_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens_in.fetch_add(rec.tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(rec.tokens_out, Ordering::Relaxed);
        let latency_ms = u64::try_from(rec.latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let before = self.cost_nanos.fetch_add(rec.cost_nanos, Ordering::Relaxed);
        if let Some(limit) = self.alert_threshold_nanos {
            let after = before.saturating_add(rec.cost_nanos);
            if after >= limit && !self.alerted.swap(true, Ordering::Relaxed) {
                warn!(
                    total_cost_usd = nanos_to_usd(after),
                    threshold_usd = nanos_to_usd(limit),
                    "cost meter: spend threshold reached"
                );
            }
        }

        metrics::record_model_call(rec.stage.as_str(), &rec.model_id, rec.outcome.as_str(), rec.latency);
        metrics::add_cost(rec.cost_nanos);
    }

    /// Whether cumulative spend has reached the alert threshold.
    pub fn over_threshold(&self) -> bool {
        match self.alert_threshold_nanos {
            Some(limit) => self.cost_nanos.load(Ordering::Relaxed) >= limit,
            None => false,
        }
    }

    /// Point-in-time totals.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn snapshot(&self) -> CostSnapshot {
        let calls = self.calls.load(Ordering::Relaxed);
        let total_cost_nanos = self.cost_nanos.load(Ordering::Relaxed);
        let total_latency_ms = self.latency_ms.load(Ordering::Relaxed);

        CostSnapshot {
            calls,
            classification_calls: self.classification_calls.load(Ordering::Relaxed),
            extraction_calls: self.extraction_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            heuristic_fallbacks: self.heuristic_fallbacks.load(Ordering::Relaxed),
            tokens_in: self.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.tokens_out.load(Ordering::Relaxed),
            total_cost_nanos,
            total_cost_usd: nanos_to_usd(total_cost_nanos),
            total_latency_ms,
            avg_cost_per_call_usd: if calls > 0 {
                nanos_to_usd(total_cost_nanos) / calls as f64
            } else {
                0.0
            },
            avg_latency_ms: if calls > 0 {
                total_latency_ms as f64 / calls as f64
            } else {
                0.0
            },
        }
    }

    /// Reset all counters to zero and re-arm the alert.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn reset(&self) {
        for counter in [
            &self.calls,
            &self.classification_calls,
            &self.extraction_calls,
            &self.failed_calls,
            &self.heuristic_fallbacks,
            &self.tokens_in,
            &self.tokens_out,
            &self.cost_nanos,
            &self.latency_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.alerted.store(false, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of the meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    /// Metered attempts, heuristic fallbacks included.
    pub calls: u64,
    /// Attempts made by the classifier.
    pub classification_calls: u64,
    /// Attempts made by the extractor.
    pub extraction_calls: u64,
    /// Attempts that produced no answer.
    pub failed_calls: u64,
    /// Heuristic classifications.
    pub heuristic_fallbacks: u64,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Total spend in nano-dollars.
    pub total_cost_nanos: u64,
    /// Total spend in USD.
    pub total_cost_usd: f64,
    /// Summed latency.
    pub total_latency_ms: u64,
    /// Mean spend per attempt.
    pub avg_cost_per_call_usd: f64,
    /// Mean latency per attempt.
    pub avg_latency_ms: f64,
}

/// Cost of a single pipeline run, returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    /// Metered attempts in this run.
    pub calls: u32,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Spend in nano-dollars.
    pub cost_nanos: u64,
    /// Spend in USD.
    pub cost_usd: f64,
    /// Summed model latency.
    pub latency_ms: u64,
}

impl CostSummary {
    /// Fold a run's call records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CallRecord>) -> Self {
        let mut s = CostSummary::default();
        for r in records {
            s.calls += 1;
            s.tokens_in += r.tokens_in;
            s.tokens_out += r.tokens_out;
            s.cost_nanos += r.cost_nanos;
            s.latency_ms += u64::try_from(r.latency.as_millis()).unwrap_or(u64::MAX);
        }
        s.cost_usd = nanos_to_usd(s.cost_nanos);
        s
    }
}

/// Records for one pipeline run, forwarded to the shared meter as they land.
///
/// Attempts are metered the moment they finish, so a run cancelled by its
/// deadline still accounts for every call it made, exactly once.
#[derive(Debug)]
pub struct RunLedger<'a> {
    meter: &'a CostMeter,
    records: Mutex<Vec<CallRecord>>,
}

impl<'a> RunLedger<'a> {
    /// Empty ledger forwarding to `meter`.
    pub fn new(meter: &'a CostMeter) -> Self {
        Self {
            meter,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Meter one attempt.
    pub fn record(&self, rec: CallRecord) {
        self.meter.record(&rec);
        self.records.lock().push(rec);
    }

    /// Attempts recorded for `stage` so far.
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.records.lock().iter().filter(|r| r.stage == stage).count() as u32
    }

    /// Copy of every record so far.
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    /// Summary of every record so far.
    pub fn summary(&self) -> CostSummary {
        CostSummary::from_records(self.records.lock().iter())
    }

    /// Summary restricted to `stage`.
    pub fn stage_summary(&self, stage: Stage) -> CostSummary {
        CostSummary::from_records(self.records.lock().iter().filter(|r| r.stage == stage))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
