//! Concurrency, deadline, async status and hot-reload behaviour of the
//! coordinator.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nutriwealth_pipeline::config::PipelineConfig;
use nutriwealth_pipeline::coordinator::{AnalysisStatus, StatusReport};
use nutriwealth_pipeline::storage::InMemoryStore;
use nutriwealth_pipeline::worker::{ScriptedReply, ScriptedWorker};
use nutriwealth_pipeline::{
    Category, ErrorKind, PipelineError, Stage, Submission, SubmissionCoordinator, SubmissionId,
    TenantId, UseCase, UserId,
};

const RECEIPT_CLASS: &str = r#"{"category": "receipt", "confidence": 0.9, "reasoning": "receipt"}"#;
const RECEIPT_JSON: &str =
    r#"{"merchant_name": "Target", "items": [{"name": "Soap", "price": 2.00}], "total_amount": 2.00}"#;

fn tenant() -> TenantId {
    TenantId::new("tenant-c")
}

fn submission(description: &str) -> Submission {
    Submission::new(tenant(), UserId::new("user-9"), description)
}

fn receipt_worker() -> ScriptedWorker {
    ScriptedWorker::new()
        .always(UseCase::Classify, ScriptedReply::Text(RECEIPT_CLASS.into()))
        .always(UseCase::Receipt, ScriptedReply::Text(RECEIPT_JSON.into()))
}

fn coordinator(worker: ScriptedWorker, store: Arc<InMemoryStore>) -> Arc<SubmissionCoordinator> {
    Arc::new(
        SubmissionCoordinator::new(Arc::new(worker), store, PipelineConfig::default())
            .unwrap_or_else(|e| std::panic::panic_any(format!("coordinator: {e}"))),
    )
}

async fn wait_for_terminal(coord: &SubmissionCoordinator, id: SubmissionId) -> StatusReport {
    for _ in 0..200 {
        if let Some(report) = coord.status(&tenant(), id).await.unwrap() {
            if report.status != AnalysisStatus::Processing {
                return report;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("submission {id} did not finish");
}

// -- cost accounting ---------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_meter_exactly_n_times_k() {
    const N: usize = 64;
    let store = Arc::new(InMemoryStore::new());
    let coord = coordinator(receipt_worker(), store.clone());

    let runs = (0..N).map(|i| {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move { coord.analyze(submission(&format!("Target receipt {i}"))).await })
    });
    let responses: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let k = responses[0].cost.cost_nanos;
    assert!(k > 0);
    assert!(responses.iter().all(|r| r.cost.cost_nanos == k));

    let snapshot = coord.meter().snapshot();
    assert_eq!(snapshot.total_cost_nanos, k * N as u64);
    assert_eq!(snapshot.calls, 2 * N as u64);
    assert_eq!(snapshot.classification_calls, N as u64);
    assert_eq!(snapshot.extraction_calls, N as u64);
    assert_eq!(store.count(&tenant(), "receipts"), N);
    assert_eq!(store.count(&tenant(), "api_costs"), N);
}

#[tokio::test]
async fn alert_threshold_trips_once_spend_crosses_it() {
    let mut config = PipelineConfig::default();
    config.metering.alert_threshold_usd = Some(0.0000001);
    let coord = SubmissionCoordinator::new(
        Arc::new(receipt_worker()),
        Arc::new(InMemoryStore::new()),
        config,
    )
    .unwrap();

    assert!(!coord.meter().over_threshold());
    coord.analyze(submission("Target receipt")).await.unwrap();
    assert!(coord.meter().over_threshold());
}

// -- deadlines ---------------------------------------------------------------

#[tokio::test]
async fn deadline_during_classification_names_the_stage() {
    let store = Arc::new(InMemoryStore::new());
    let worker = ScriptedWorker::new().always(UseCase::Classify, ScriptedReply::Stall(5_000));
    let coord = coordinator(worker, store.clone());

    let err = coord
        .analyze_within(submission("Target receipt"), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout { stage: Stage::Classification }));
    assert_eq!(store.count(&tenant(), "receipts"), 0);
}

#[tokio::test]
async fn configured_default_deadline_applies_to_analyze() {
    let mut config = PipelineConfig::default();
    config.pipeline.deadline_ms = Some(100);
    let worker = ScriptedWorker::new()
        .always(UseCase::Classify, ScriptedReply::Text(RECEIPT_CLASS.into()))
        .always(UseCase::Receipt, ScriptedReply::Stall(5_000));
    let coord =
        SubmissionCoordinator::new(Arc::new(worker), Arc::new(InMemoryStore::new()), config)
            .unwrap();

    let err = coord.analyze(submission("Target receipt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

// -- async submission ----------------------------------------------------------

#[tokio::test]
async fn submit_returns_immediately_and_completes_in_background() {
    let store = Arc::new(InMemoryStore::new());
    let worker = receipt_worker().with_delay(Duration::from_millis(50));
    let coord = coordinator(worker, store.clone());

    let id = coord.submit(submission("Target receipt")).await.unwrap();

    let first = coord.status(&tenant(), id).await.unwrap().unwrap();
    assert_eq!(first.status, AnalysisStatus::Processing);

    let done = wait_for_terminal(&coord, id).await;
    assert_eq!(done.status, AnalysisStatus::Complete);
    assert_eq!(done.category, Some(Category::Receipt));
    assert!(done.error.is_none());
    assert_eq!(store.count(&tenant(), "analysis_status"), 1);
}

#[tokio::test]
async fn submit_failure_is_recorded_with_error_kind() {
    let store = Arc::new(InMemoryStore::new());
    let worker = ScriptedWorker::new()
        .always(UseCase::Classify, ScriptedReply::Text(RECEIPT_CLASS.into()))
        .always(UseCase::Receipt, ScriptedReply::TransportError);
    let coord = coordinator(worker, store);

    let id = coord.submit(submission("Target receipt")).await.unwrap();
    let done = wait_for_terminal(&coord, id).await;

    assert_eq!(done.status, AnalysisStatus::Failed);
    assert_eq!(done.error, Some(ErrorKind::ModelTransportError));
    assert!(done.response.is_none());
}

#[tokio::test]
async fn submit_fails_fast_when_status_table_is_down() {
    let store = Arc::new(InMemoryStore::new().fail_table("analysis_status"));
    let coord = coordinator(receipt_worker(), store);

    let err = coord.submit(submission("Target receipt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFatalFailure);
}

// -- usage statistics ----------------------------------------------------------

#[tokio::test]
async fn usage_stats_break_down_cost_log_by_category() {
    let store = Arc::new(InMemoryStore::new());
    let worker = receipt_worker()
        .then(
            UseCase::Classify,
            ScriptedReply::Text(r#"{"category": "food", "confidence": 0.9}"#.into()),
        )
        .always(
            UseCase::Food,
            ScriptedReply::Text(r#"{"food_items": [{"name": "Chicken breast", "calories": 280}]}"#.into()),
        );
    let coord = coordinator(worker, store.clone());

    let mut spent = 0;
    for description in ["Grilled chicken breast", "Target receipt", "Target receipt"] {
        spent += coord.analyze(submission(description)).await.unwrap().cost.cost_nanos;
    }
    let other = Submission::new(tenant(), UserId::new("user-2"), "Target receipt");
    coord.analyze(other).await.unwrap();

    let report = coord
        .usage_stats(&tenant(), &UserId::new("user-9"), Duration::from_secs(86_400))
        .await
        .unwrap();

    assert_eq!(report.requests, 3);
    assert_eq!(report.total_cost_nanos, spent);
    assert_eq!(report.by_category["food"].count, 1);
    assert_eq!(report.by_category["receipt"].count, 2);
    assert_eq!(report.by_category["receipt"].tokens, 2 * 2 * 150);
    assert_eq!(report.savings.baseline_model, "gpt-5.2");
    assert!(report.savings.saved_usd > 0.0);
    assert!(report.savings.saved_percent > 0.0 && report.savings.saved_percent < 100.0);
}

#[tokio::test]
async fn usage_stats_for_unknown_user_are_empty() {
    let coord = coordinator(receipt_worker(), Arc::new(InMemoryStore::new()));
    let report = coord
        .usage_stats(&tenant(), &UserId::new("nobody"), Duration::from_secs(3_600))
        .await
        .unwrap();
    assert_eq!(report.requests, 0);
    assert!(report.by_category.is_empty());
    assert_eq!(report.avg_cost_per_request_usd, 0.0);
}

// -- hot reload ----------------------------------------------------------------

#[tokio::test]
async fn reload_changes_routing_for_new_runs() {
    let store = Arc::new(InMemoryStore::new());
    let coord = coordinator(receipt_worker(), store);

    let before = coord.analyze(submission("Target receipt")).await.unwrap();
    assert_eq!(before.routing.model_id, "gpt-4o-mini");

    // Confidence 0.9 is now below the threshold, so receipts are upgraded.
    let mut stricter = PipelineConfig::default();
    stricter.routing.low_confidence_threshold = 0.95;
    coord.reload(stricter).unwrap();

    let after = coord.analyze(submission("Target receipt")).await.unwrap();
    assert_eq!(after.routing.model_id, "gpt-5.2");
}

#[tokio::test]
async fn in_flight_run_keeps_its_snapshot_across_reload() {
    let store = Arc::new(InMemoryStore::new());
    let worker = receipt_worker().with_delay(Duration::from_millis(100));
    let coord = coordinator(worker, store);

    let running = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move { coord.analyze(submission("Target receipt")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut stricter = PipelineConfig::default();
    stricter.routing.low_confidence_threshold = 0.95;
    coord.reload(stricter).unwrap();

    let resp = running.await.unwrap().unwrap();
    assert_eq!(resp.routing.model_id, "gpt-4o-mini");
}

#[tokio::test]
async fn follow_applies_broadcast_configs() {
    let coord = coordinator(receipt_worker(), Arc::new(InMemoryStore::new()));
    let (tx, rx) = tokio::sync::broadcast::channel(4);
    let task = coord.follow(rx);

    let mut next = PipelineConfig::default();
    next.pipeline.name = "reloaded".to_string();
    tx.send(next).unwrap();

    let mut bad = PipelineConfig::default();
    bad.extraction.max_attempts = 0;
    tx.send(bad).unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(coord.snapshot().config.pipeline.name, "reloaded");
}
