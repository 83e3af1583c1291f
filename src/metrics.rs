//! Prometheus metrics for the analysis pipeline.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_stage_latency`, `inc_submission`, …) are no-ops if `init_metrics`
//! was never called, so the pipeline is always safe to run and observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `pipeline_submissions_total` | Counter | `category` |
//! | `pipeline_model_calls_total` | Counter | `stage`, `model`, `outcome` |
//! | `pipeline_errors_total` | Counter | `kind` |
//! | `pipeline_stage_duration_seconds` | Histogram | `stage` |
//! | `pipeline_cost_nanodollars_total` | Counter | |
//! | `pipeline_inflight_submissions` | Gauge | |

use crate::PipelineError;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the pipeline, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Completed submissions per category.
    pub submissions_total: CounterVec,
    /// Model call attempts by stage, model and outcome.
    pub model_calls_total: CounterVec,
    /// Caller-visible errors and warnings by kind.
    pub errors_total: CounterVec,
    /// Stage processing latency histogram.
    pub stage_duration: HistogramVec,
    /// Cumulative model spend in nano-dollars.
    pub cost_nanos_total: IntCounter,
    /// Submissions currently being processed.
    pub inflight: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> PipelineError {
    PipelineError::Config(format!("metrics init failed: {e}"))
}

impl Metrics {
    /// Build and register every metric under `prefix` in a fresh registry.
    fn build(prefix: &str) -> Result<Self, PipelineError> {
        let registry = Registry::new();

        let submissions_total = CounterVec::new(
            Opts::new(format!("{prefix}_submissions_total"), "Completed submissions"),
            &["category"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(submissions_total.clone()))
            .map_err(init_err)?;

        let model_calls_total = CounterVec::new(
            Opts::new(format!("{prefix}_model_calls_total"), "Model call attempts"),
            &["stage", "model", "outcome"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(model_calls_total.clone()))
            .map_err(init_err)?;

        let errors_total = CounterVec::new(
            Opts::new(format!("{prefix}_errors_total"), "Errors and warnings by kind"),
            &["kind"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(init_err)?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}_stage_duration_seconds"),
                "Processing duration per stage",
            ),
            &["stage"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(stage_duration.clone()))
            .map_err(init_err)?;

        let cost_nanos_total = IntCounter::new(
            format!("{prefix}_cost_nanodollars_total"),
            "Cumulative model spend in nano-dollars",
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(cost_nanos_total.clone()))
            .map_err(init_err)?;

        let inflight = IntGauge::new(
            format!("{prefix}_inflight_submissions"),
            "Submissions currently being processed",
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(inflight.clone()))
            .map_err(init_err)?;

        Ok(Self {
            registry,
            submissions_total,
            model_calls_total,
            errors_total,
            stage_duration,
            cost_nanos_total,
            inflight,
        })
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), PipelineError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::build("pipeline")?;
    // A concurrent initialiser may have won; both bundles are equivalent.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record the processing latency for a pipeline stage.
///
/// No-op if metrics have not been initialised.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count a finished submission under its category.
///
/// No-op if metrics have not been initialised.
pub fn inc_submission(category: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.submissions_total.get_metric_with_label_values(&[category]) {
            c.inc();
        }
    }
}

/// Count one model call attempt and observe its latency.
///
/// No-op if metrics have not been initialised.
pub fn record_model_call(stage: &str, model: &str, outcome: &str, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .model_calls_total
            .get_metric_with_label_values(&[stage, model, outcome])
        {
            c.inc();
        }
    }
    record_stage_latency(stage, latency);
}

/// Count an error or warning kind.
///
/// No-op if metrics have not been initialised.
pub fn inc_error(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Add model spend.
///
/// No-op if metrics have not been initialised.
pub fn add_cost(nanos: u64) {
    if let Some(m) = metrics() {
        m.cost_nanos_total.inc_by(nanos);
    }
}

/// Adjust the in-flight gauge by `delta`.
///
/// No-op if metrics have not been initialised.
pub fn add_inflight(delta: i64) {
    if let Some(m) = metrics() {
        m.inflight.add(delta);
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent_second_call_is_noop() {
        let _ = init_metrics();
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_before_or_after_init_do_not_panic() {
        record_stage_latency("classification", Duration::from_millis(5));
        record_model_call("extraction", "gpt-4o-mini", "success", Duration::from_millis(3));
        inc_error("timeout");
        add_cost(10);
        add_inflight(1);
        add_inflight(-1);
    }

    #[test]
    fn test_isolated_bundle_counts_model_calls() {
        let m = Metrics::build("t_calls").unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        m.model_calls_total
            .with_label_values(&["extraction", "gpt-4o", "success"])
            .inc_by(2.0);
        let value = m
            .model_calls_total
            .with_label_values(&["extraction", "gpt-4o", "success"])
            .get();
        assert!((value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_isolated_bundle_gathers_all_families() {
        let m = Metrics::build("t_gather").unwrap_or_else(|e| std::panic::panic_any(e.to_string()));
        m.submissions_total.with_label_values(&["food"]).inc();
        m.errors_total.with_label_values(&["timeout"]).inc();
        m.stage_duration.with_label_values(&["extraction"]).observe(0.2);
        m.model_calls_total
            .with_label_values(&["classification", "m", "success"])
            .inc();
        m.cost_nanos_total.inc_by(5);
        m.inflight.set(1);
        let names: Vec<String> = m
            .registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert_eq!(names.len(), 6, "{names:?}");
    }

    #[test]
    fn test_gather_metrics_after_init_mentions_prefix() {
        let _ = init_metrics();
        inc_submission("receipt");
        assert!(gather_metrics().contains("pipeline_submissions_total"));
    }
}
