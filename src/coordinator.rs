//! # Stage: Submission Coordinator
//!
//! ## Responsibility
//! Drive one submission through
//! `received → classifying → routing → extracting → persisting → done | failed`
//! and expose the pipeline to callers: synchronous [`SubmissionCoordinator::analyze`],
//! asynchronous [`SubmissionCoordinator::submit`] with status polling, and
//! hot reload of the configuration snapshot.
//!
//! ## Guarantees
//! - Deadline-bounded: both model stages run under the caller's deadline;
//!   when it fires nothing is persisted and `Timeout` names the stage
//! - Snapshot-consistent: a run loads the snapshot once, so a concurrent
//!   reload never mixes catalogs, prompts or thresholds within a run
//! - Exactly-once metering: every attempt reaches the shared [`CostMeter`]
//!   as soon as it finishes, including attempts of a cancelled run
//! - Attributed: every persisted record carries the submission id
//!
//! ## NOT Responsible For
//! - Model selection (that belongs to `routing`)
//! - Schema validation (that belongs to `extract`)
//! - Record layout (that belongs to `persist`)

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::classifier::{ClassificationResult, Classifier, ClassifierSettings};
use crate::config::{self, ConfigError, PipelineConfig};
use crate::extract::{AnalysisResult, ExtractionSettings, Extractor};
use crate::metrics;
use crate::middleware::SubmissionValidator;
use crate::persist::{attribution, FanOutWriter, PersistenceReport};
use crate::prompts::PromptLibrary;
use crate::routing::{CostMeter, CostSummary, ModelRouter, RoutingDecision, RunLedger};
use crate::storage::{Filter, TableStore, ID_FIELD};
use crate::worker::ModelWorker;
use crate::usage::{self, UsageReport};
use crate::{
    Category, ErrorKind, PipelineError, Stage, Submission, SubmissionId, TenantId, UserId,
};

// ── State machine ────────────────────────────────────────────────────────

/// Lifecycle of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    /// Accepted, not yet started.
    Received,
    /// Stage-1 model call in flight.
    Classifying,
    /// Choosing the extraction model.
    Routing,
    /// Stage-2 model call(s) in flight.
    Extracting,
    /// Writing parent and child records.
    Persisting,
    /// Finished with a result.
    Done,
    /// Finished with a typed error.
    Failed,
}

impl SubmissionState {
    /// Lowercase label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Received => "received",
            SubmissionState::Classifying => "classifying",
            SubmissionState::Routing => "routing",
            SubmissionState::Extracting => "extracting",
            SubmissionState::Persisting => "persisting",
            SubmissionState::Done => "done",
            SubmissionState::Failed => "failed",
        }
    }

    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Done | SubmissionState::Failed)
    }

    /// Whether `next` may follow `self`.
    ///
    /// Forward moves follow the pipeline order. Any non-terminal state may
    /// move to `Failed`; terminal states never move.
    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        match (self, next) {
            (Received, Classifying)
            | (Classifying, Routing)
            | (Routing, Extracting)
            | (Extracting, Persisting)
            | (Persisting, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of one run and logs every transition.
struct RunState {
    id: SubmissionId,
    current: SubmissionState,
}

impl RunState {
    fn new(id: SubmissionId) -> Self {
        Self {
            id,
            current: SubmissionState::Received,
        }
    }

    fn advance(&mut self, next: SubmissionState) {
        if !self.current.can_transition_to(next) {
            warn!(
                submission_id = %self.id,
                from = %self.current,
                to = %next,
                "unexpected state transition"
            );
        }
        debug!(submission_id = %self.id, from = %self.current, to = %next, "state");
        self.current = next;
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────

/// Immutable view of the configuration used by a run.
///
/// Reloading builds a new snapshot and swaps it in whole.
#[derive(Debug)]
pub struct PipelineSnapshot {
    /// Source configuration.
    pub config: PipelineConfig,
    /// Registered models.
    pub catalog: Arc<ModelCatalog>,
    /// Prompts for every use case.
    pub prompts: Arc<PromptLibrary>,
    /// Routing policy over `catalog` and `prompts`.
    pub router: ModelRouter,
    /// Stage-1 call bounds.
    pub classifier: ClassifierSettings,
    /// Stage-2 attempt bound and timeout.
    pub extraction: ExtractionSettings,
    /// Request validation rules.
    pub validator: SubmissionValidator,
}

impl PipelineSnapshot {
    /// Validate `config` and build a snapshot from it.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] listing every problem found.
    pub fn build(config: PipelineConfig) -> Result<Self, PipelineError> {
        config::validation::validate(&config).map_err(|errors| {
            ConfigError::Validation(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;

        let catalog = Arc::new(config.build_catalog()?);
        let prompts = Arc::new(config.build_prompts()?);
        let router = ModelRouter::new(
            Arc::clone(&catalog),
            Arc::clone(&prompts),
            config.routing.clone(),
        );

        Ok(Self {
            classifier: config.classifier_settings(),
            extraction: config.extraction_settings(),
            validator: SubmissionValidator::new(config.pipeline.max_description_chars),
            catalog,
            prompts,
            router,
            config,
        })
    }
}

// ── Responses ────────────────────────────────────────────────────────────

/// Successful result of `analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    /// Submission the result belongs to.
    pub submission_id: SubmissionId,
    /// Final category.
    pub category: Category,
    /// Stage-1 result.
    pub classification: ClassificationResult,
    /// Stage-2 model and prompt.
    pub routing: RoutingDecision,
    /// Typed payload or parse-failure marker.
    pub analysis: AnalysisResult,
    /// What the fan-out wrote.
    pub persistence: PersistenceReport,
    /// Cost of every model attempt in this run.
    pub cost: CostSummary,
    /// Whether classification fell back to the heuristic.
    pub degraded: bool,
}

impl AnalyzeResponse {
    /// Soft error kinds that apply to this result.
    pub fn warnings(&self) -> Vec<ErrorKind> {
        let mut kinds = Vec::new();
        if self.degraded {
            kinds.push(ErrorKind::ClassificationDegraded);
        }
        if self.analysis.is_parse_failure() {
            kinds.push(ErrorKind::ExtractionParseFailure);
        }
        if self.persistence.is_partial() {
            kinds.push(ErrorKind::PersistencePartialFailure);
        }
        kinds
    }
}

/// Status of an asynchronous submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// The run is in progress.
    Processing,
    /// The run finished with a result.
    Complete,
    /// The run finished with an error.
    Failed,
}

impl AnalysisStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Failed => "failed",
        }
    }
}

/// What a caller polling an asynchronous submission sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Tracking id returned by `submit`.
    pub submission_id: String,
    /// Current status.
    pub status: AnalysisStatus,
    /// Category, once complete.
    pub category: Option<Category>,
    /// Error kind, once failed.
    pub error: Option<ErrorKind>,
    /// Full response, once complete.
    pub response: Option<AnalyzeResponse>,
}

impl StatusReport {
    fn from_record(record: &crate::storage::Record) -> Option<Self> {
        let field = |name: &str| record.get(name).cloned().unwrap_or(Value::Null);
        Some(Self {
            submission_id: record.get("submission_id")?.as_str()?.to_string(),
            status: serde_json::from_value(field("status")).ok()?,
            category: serde_json::from_value(field("category")).ok().flatten(),
            error: serde_json::from_value(field("error")).ok().flatten(),
            response: serde_json::from_value(field("response")).ok().flatten(),
        })
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────

/// Owns the collaborators and runs submissions.
///
/// Cheap to share behind an [`Arc`]; no state is kept between submissions
/// apart from the cost meter and the configuration snapshot.
pub struct SubmissionCoordinator {
    worker: Arc<dyn ModelWorker>,
    store: Arc<dyn TableStore>,
    snapshot: ArcSwap<PipelineSnapshot>,
    meter: CostMeter,
}

impl fmt::Debug for SubmissionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionCoordinator")
            .field("pipeline", &self.snapshot.load().config.pipeline.name)
            .finish_non_exhaustive()
    }
}

impl SubmissionCoordinator {
    /// Build a coordinator from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if `config` fails validation. Problems such
    /// as a use case without a prompt surface here, never per request.
    pub fn new(
        worker: Arc<dyn ModelWorker>,
        store: Arc<dyn TableStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let meter = match config.metering.alert_threshold_usd {
            Some(usd) => CostMeter::with_alert_threshold(usd),
            None => CostMeter::new(),
        };
        let snapshot = PipelineSnapshot::build(config)?;
        info!(
            pipeline = %snapshot.config.pipeline.name,
            models = snapshot.catalog.models().len(),
            "coordinator ready"
        );
        Ok(Self {
            worker,
            store,
            snapshot: ArcSwap::from_pointee(snapshot),
            meter,
        })
    }

    /// Shared usage statistics.
    pub fn meter(&self) -> &CostMeter {
        &self.meter
    }

    /// Snapshot new runs will use.
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.snapshot.load_full()
    }

    /// Install a new configuration for runs started from now on.
    ///
    /// In-flight runs keep the snapshot they started with.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if `config` is invalid; the current
    /// snapshot stays in place.
    pub fn reload(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        let next = PipelineSnapshot::build(config)?;
        info!(
            pipeline = %next.config.pipeline.name,
            threshold = next.config.routing.low_confidence_threshold,
            "configuration snapshot installed"
        );
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Apply every config broadcast by a [`config::watcher::ConfigWatcher`].
    pub fn follow(self: &Arc<Self>, mut updates: broadcast::Receiver<PipelineConfig>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(config) => {
                        if let Err(e) = this.reload(config) {
                            warn!(error = %e, "config update rejected");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "config updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -- synchronous ------------------------------------------------------

    /// Analyze `submission`, bounded by the configured default deadline.
    ///
    /// # Errors
    ///
    /// One of the hard [`PipelineError`] kinds. Degraded classification,
    /// parse-failure markers and partial fan-out are reported through
    /// [`AnalyzeResponse::warnings`] instead.
    pub async fn analyze(&self, submission: Submission) -> Result<AnalyzeResponse, PipelineError> {
        let snapshot = self.snapshot.load_full();
        let deadline = snapshot.config.default_deadline().map(|d| Instant::now() + d);
        self.run(submission, snapshot, deadline).await
    }

    /// Analyze `submission`, giving up on the model stages at `deadline`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Timeout`] if the deadline fires first; nothing is
    /// persisted in that case.
    pub async fn analyze_with_deadline(
        &self,
        submission: Submission,
        deadline: Instant,
    ) -> Result<AnalyzeResponse, PipelineError> {
        let snapshot = self.snapshot.load_full();
        self.run(submission, snapshot, Some(deadline)).await
    }

    /// Analyze `submission` within `budget` from now.
    ///
    /// # Errors
    ///
    /// As [`SubmissionCoordinator::analyze_with_deadline`].
    pub async fn analyze_within(
        &self,
        submission: Submission,
        budget: Duration,
    ) -> Result<AnalyzeResponse, PipelineError> {
        self.analyze_with_deadline(submission, Instant::now() + budget)
            .await
    }

    async fn run(
        &self,
        submission: Submission,
        snapshot: Arc<PipelineSnapshot>,
        deadline: Option<Instant>,
    ) -> Result<AnalyzeResponse, PipelineError> {
        let _inflight = InflightGuard::enter();
        let mut state = RunState::new(submission.id());

        let result = self
            .execute(&submission, &snapshot, deadline, &mut state)
            .await;
        match &result {
            Ok(resp) => {
                state.advance(SubmissionState::Done);
                metrics::inc_submission(resp.category.as_str());
                for kind in resp.warnings() {
                    metrics::inc_error(kind.as_str());
                }
            }
            Err(e) => {
                state.advance(SubmissionState::Failed);
                metrics::inc_error(e.kind().as_str());
                warn!(
                    submission_id = %submission.id(),
                    kind = %e.kind(),
                    error = %e,
                    "submission failed"
                );
            }
        }
        result
    }

    async fn execute(
        &self,
        submission: &Submission,
        snap: &PipelineSnapshot,
        deadline: Option<Instant>,
        state: &mut RunState,
    ) -> Result<AnalyzeResponse, PipelineError> {
        snap.validator.check(submission)?;
        let ledger = RunLedger::new(&self.meter);

        // -- stage 1 ------------------------------------------------------
        state.advance(SubmissionState::Classifying);
        let started = std::time::Instant::now();
        let classifier = Classifier::new(
            self.worker.as_ref(),
            &snap.router,
            &snap.prompts,
            &snap.classifier,
        );
        let outcome = bounded(
            deadline,
            Stage::Classification,
            classifier.classify(submission, &ledger),
        )
        .await?;
        metrics::record_stage_latency(Stage::Classification.as_str(), started.elapsed());

        // -- routing ------------------------------------------------------
        state.advance(SubmissionState::Routing);
        let classification = outcome.result;
        let decision = snap.router.route(
            classification.category,
            classification.confidence,
            submission.has_image(),
        )?;
        info!(
            submission_id = %submission.id(),
            category = %decision.category,
            model = %decision.model_id,
            reason = %decision.reason,
            "routed"
        );

        // -- stage 2 ------------------------------------------------------
        state.advance(SubmissionState::Extracting);
        let started = std::time::Instant::now();
        let extractor = Extractor::new(
            self.worker.as_ref(),
            &snap.router,
            &snap.prompts,
            &snap.extraction,
        );
        let analysis = bounded(
            deadline,
            Stage::Extraction,
            extractor.extract(submission, &decision, &ledger),
        )
        .await??;
        metrics::record_stage_latency(Stage::Extraction.as_str(), started.elapsed());

        // -- persistence --------------------------------------------------
        state.advance(SubmissionState::Persisting);
        let started = std::time::Instant::now();
        let writer = FanOutWriter::new(self.store.as_ref(), &snap.config.storage.tables);
        let persistence = writer
            .persist(submission, &classification, &decision, &analysis)
            .await?;
        let cost = ledger.summary();
        writer
            .record_costs(submission, &classification.model_id, &decision, &cost)
            .await;
        metrics::record_stage_latency(Stage::Persistence.as_str(), started.elapsed());

        Ok(AnalyzeResponse {
            submission_id: submission.id(),
            category: classification.category,
            classification,
            routing: decision,
            analysis,
            persistence,
            cost,
            degraded: outcome.degraded,
        })
    }

    // -- asynchronous -----------------------------------------------------

    /// Accept `submission` for background analysis and return its tracking id.
    ///
    /// A `processing` status record is written before the run starts and
    /// updated to `complete` or `failed` when it ends. Poll with
    /// [`SubmissionCoordinator::status`].
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidSubmission`] before anything is written
    /// - [`PipelineError::PersistenceFatal`] if the status record cannot be written
    pub async fn submit(self: &Arc<Self>, submission: Submission) -> Result<SubmissionId, PipelineError> {
        let snapshot = self.snapshot.load_full();
        snapshot.validator.check(&submission)?;

        let table = snapshot.config.storage.tables.analysis_status.clone();
        let mut record = attribution(&submission);
        record.insert("status".into(), json!(AnalysisStatus::Processing.as_str()));
        record.insert("description".into(), json!(submission.description()));
        let tenant = submission.tenant().clone();
        let status_id = self
            .store
            .create(&tenant, &table, record)
            .await
            .map_err(|e| {
                warn!(submission_id = %submission.id(), error = %e, "status record write failed");
                PipelineError::PersistenceFatal {
                    table: table.clone(),
                }
            })?;

        let id = submission.id();
        let deadline = snapshot.config.default_deadline().map(|d| Instant::now() + d);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run(submission, snapshot, deadline).await;
            this.finish_status(&tenant, &table, &status_id, id, &result)
                .await;
        });

        info!(submission_id = %id, "accepted for background analysis");
        Ok(id)
    }

    async fn finish_status(
        &self,
        tenant: &TenantId,
        table: &str,
        status_id: &str,
        id: SubmissionId,
        result: &Result<AnalyzeResponse, PipelineError>,
    ) {
        let mut fields = crate::storage::Record::new();
        match result {
            Ok(resp) => {
                fields.insert("status".into(), json!(AnalysisStatus::Complete.as_str()));
                fields.insert("category".into(), json!(resp.category));
                fields.insert("warnings".into(), json!(resp.warnings()));
                fields.insert(
                    "response".into(),
                    serde_json::to_value(resp).unwrap_or(Value::Null),
                );
            }
            Err(e) => {
                fields.insert("status".into(), json!(AnalysisStatus::Failed.as_str()));
                fields.insert("error".into(), json!(e.kind()));
                fields.insert("retryable".into(), json!(e.is_retryable()));
                fields.insert("message".into(), json!(e.to_string()));
            }
        }
        if let Err(e) = self.store.update(tenant, table, status_id, fields).await {
            warn!(submission_id = %id, error = %e, "status update failed");
        }
    }

    /// Current status of an asynchronous submission.
    ///
    /// # Errors
    ///
    /// [`PipelineError::PersistenceFatal`] if the status table cannot be read.
    pub async fn status(
        &self,
        tenant: &TenantId,
        id: SubmissionId,
    ) -> Result<Option<StatusReport>, PipelineError> {
        let table = self.snapshot.load().config.storage.tables.analysis_status.clone();
        let rows = self
            .store
            .query(tenant, &table, &[Filter::eq("submission_id", id.to_string())])
            .await
            .map_err(|e| {
                warn!(submission_id = %id, error = %e, "status query failed");
                PipelineError::PersistenceFatal {
                    table: table.clone(),
                }
            })?;
        Ok(rows.iter().find_map(|row| {
            let report = StatusReport::from_record(row);
            if report.is_none() {
                debug!(record = ?row.get(ID_FIELD), "unreadable status record");
            }
            report
        }))
    }

    // -- usage ------------------------------------------------------------

    /// Usage report for `user` over the last `window`, built from the cost
    /// log. Savings are priced against the configured high-quality model.
    ///
    /// # Errors
    ///
    /// [`PipelineError::PersistenceFatal`] when the cost log cannot be
    /// queried.
    pub async fn usage_stats(
        &self,
        tenant: &TenantId,
        user: &UserId,
        window: Duration,
    ) -> Result<UsageReport, PipelineError> {
        let snapshot = self.snapshot.load_full();
        let table = snapshot.config.storage.tables.api_costs.clone();
        let baseline_id = &snapshot.router.config().high_quality_model;
        let baseline = snapshot.catalog.get(baseline_id).ok_or_else(|| {
            PipelineError::RoutingPolicyViolation(format!(
                "baseline model `{baseline_id}` is not registered"
            ))
        })?;

        let rows = self
            .store
            .query(tenant, &table, &[Filter::eq("user_id", user.as_str())])
            .await
            .map_err(|e| {
                warn!(user = user.as_str(), error = %e, "usage query failed");
                PipelineError::PersistenceFatal {
                    table: table.clone(),
                }
            })?;

        // Windows too large for chrono cover all history.
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let since = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = usage::summarize(user.as_str(), &rows, since, baseline);
        debug!(
            user = user.as_str(),
            requests = report.requests,
            cost_usd = report.total_cost_usd,
            "usage report built"
        );
        Ok(report)
    }
}

/// Run `fut`, failing with `Timeout { stage }` if `deadline` passes first.
async fn bounded<F: Future>(
    deadline: Option<Instant>,
    stage: Stage,
    fut: F,
) -> Result<F::Output, PipelineError> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| PipelineError::Timeout { stage }),
        None => Ok(fut.await),
    }
}

/// Keeps the in-flight gauge balanced on every exit path.
struct InflightGuard;

impl InflightGuard {
    fn enter() -> Self {
        metrics::add_inflight(1);
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        metrics::add_inflight(-1);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::worker::{ScriptedReply, ScriptedWorker};
    use crate::{ImageRef, UseCase, UserId};

    const RECEIPT_CLASS: &str = r#"{"category":"receipt","confidence":0.92,"reasoning":"store receipt"}"#;
    const RECEIPT_JSON: &str = r#"{"merchant_name":"Walmart","items":[{"name":"Milk","price":4.50},{"name":"Bread","price":3.25}],"total_amount":7.75}"#;

    fn tenant() -> TenantId {
        TenantId::new("t1")
    }

    fn submission(desc: &str) -> Submission {
        Submission::new(tenant(), UserId::new("u1"), desc)
    }

    fn coordinator(worker: ScriptedWorker, store: Arc<InMemoryStore>) -> SubmissionCoordinator {
        SubmissionCoordinator::new(Arc::new(worker), store, PipelineConfig::default())
            .unwrap_or_else(|e| std::panic::panic_any(e.to_string()))
    }

    fn receipt_worker() -> ScriptedWorker {
        ScriptedWorker::new()
            .always(UseCase::Classify, ScriptedReply::Text(RECEIPT_CLASS.into()))
            .always(UseCase::Receipt, ScriptedReply::Text(RECEIPT_JSON.into()))
    }

    // -- state machine -------------------------------------------------

    #[test]
    fn test_forward_transitions_are_allowed() {
        use SubmissionState::*;
        let path = [Received, Classifying, Routing, Extracting, Persisting, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_skipping_and_backward_transitions_are_rejected() {
        use SubmissionState::*;
        assert!(!Received.can_transition_to(Extracting));
        assert!(!Persisting.can_transition_to(Classifying));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Received));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        use SubmissionState::*;
        for s in [Received, Classifying, Routing, Extracting, Persisting] {
            assert!(s.can_transition_to(Failed));
        }
    }

    // -- construction / reload -------------------------------------------

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut cfg = PipelineConfig::default();
        cfg.routing.cheap_model = "unknown".into();
        let err = SubmissionCoordinator::new(
            Arc::new(ScriptedWorker::new()),
            Arc::new(InMemoryStore::new()),
            cfg,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_old_on_error() {
        let coord = coordinator(ScriptedWorker::new(), Arc::new(InMemoryStore::new()));
        let before = coord.snapshot();

        let mut next = PipelineConfig::default();
        next.routing.low_confidence_threshold = 0.8;
        coord.reload(next).unwrap();
        assert!((coord.snapshot().router.config().low_confidence_threshold - 0.8).abs() < 1e-9);
        assert!((before.router.config().low_confidence_threshold - 0.5).abs() < 1e-9);

        let mut bad = PipelineConfig::default();
        bad.extraction.max_attempts = 0;
        assert!(coord.reload(bad).is_err());
        assert!((coord.snapshot().router.config().low_confidence_threshold - 0.8).abs() < 1e-9);
    }

    // -- analyze ---------------------------------------------------------

    #[tokio::test]
    async fn test_analyze_receipt_persists_parent_and_children() {
        let store = Arc::new(InMemoryStore::new());
        let coord = coordinator(receipt_worker(), Arc::clone(&store));

        let resp = coord
            .analyze(submission("Walmart receipt, Milk $4.50, Bread $3.25, Total $7.75"))
            .await
            .unwrap();

        assert_eq!(resp.category, Category::Receipt);
        assert_eq!(resp.routing.model_id, "gpt-4o-mini");
        assert!(resp.warnings().is_empty());
        assert_eq!(resp.cost.calls, 2);
        assert_eq!(store.count(&tenant(), "receipts"), 1);
        assert_eq!(store.count(&tenant(), "receipt_items"), 2);
        assert_eq!(store.count(&tenant(), "api_costs"), 1);
    }

    #[tokio::test]
    async fn test_analyze_invalid_submission_makes_no_calls() {
        let worker = Arc::new(receipt_worker());
        let coord = SubmissionCoordinator::new(
            Arc::clone(&worker) as Arc<dyn ModelWorker>,
            Arc::new(InMemoryStore::new()),
            PipelineConfig::default(),
        )
        .unwrap();

        let err = coord.analyze(submission("")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubmission);
        assert!(worker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_analyze_image_submission_accepted_without_description() {
        let store = Arc::new(InMemoryStore::new());
        let coord = coordinator(receipt_worker(), Arc::clone(&store));
        let sub = submission("").with_image(ImageRef::Url("https://img/receipt.jpg".into()));

        let resp = coord.analyze(sub).await.unwrap();
        assert_eq!(resp.category, Category::Receipt);
    }

    #[tokio::test]
    async fn test_analyze_deadline_persists_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let worker = ScriptedWorker::new()
            .always(UseCase::Classify, ScriptedReply::Text(RECEIPT_CLASS.into()))
            .always(UseCase::Receipt, ScriptedReply::Stall(5_000));
        let coord = coordinator(worker, Arc::clone(&store));

        let err = coord
            .analyze_within(submission("Walmart receipt"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Timeout { stage: Stage::Extraction }));
        assert!(err.is_retryable());
        assert_eq!(store.count(&tenant(), "receipts"), 0);
        assert_eq!(store.count(&tenant(), "api_costs"), 0);
    }

    #[tokio::test]
    async fn test_parent_failure_is_fatal() {
        let store = Arc::new(InMemoryStore::new().fail_table("receipts"));
        let coord = coordinator(receipt_worker(), Arc::clone(&store));

        let err = coord.analyze(submission("Walmart receipt")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFatalFailure);
        assert_eq!(store.count(&tenant(), "receipt_items"), 0);
    }

    // -- submit / status ---------------------------------------------------

    #[tokio::test]
    async fn test_submit_then_poll_until_complete() {
        let store = Arc::new(InMemoryStore::new());
        let coord = Arc::new(coordinator(receipt_worker(), Arc::clone(&store)));

        let id = coord.submit(submission("Walmart receipt")).await.unwrap();

        let mut report = None;
        for _ in 0..100 {
            let current = coord.status(&tenant(), id).await.unwrap();
            if current.as_ref().map(|r| r.status) == Some(AnalysisStatus::Complete) {
                report = current;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = report.expect("submission should complete");
        assert_eq!(report.category, Some(Category::Receipt));
        let response = report.response.expect("complete status carries the response");
        assert_eq!(response.submission_id, id);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_without_status_record() {
        let store = Arc::new(InMemoryStore::new());
        let coord = Arc::new(coordinator(receipt_worker(), Arc::clone(&store)));

        let err = coord.submit(submission(" ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubmission);
        assert_eq!(store.count(&tenant(), "analysis_status"), 0);
    }

    #[tokio::test]
    async fn test_status_unknown_id_is_none() {
        let coord = coordinator(ScriptedWorker::new(), Arc::new(InMemoryStore::new()));
        let status = coord.status(&tenant(), SubmissionId::new()).await.unwrap();
        assert!(status.is_none());
    }
}
