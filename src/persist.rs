//! # Stage: Persistence
//!
//! ## Responsibility
//! Fan one analysed submission out into a parent record plus its child
//! records (receipt items, food items, workout exercises).
//!
//! ## Guarantees
//! - Parent first: children are only written once the parent id is known,
//!   and every child carries that id in `parent_id`.
//! - Attributable: every record carries `submission_id`, `tenant_id` and
//!   `user_id`.
//! - No rollback: a failed child write leaves the parent in place and is
//!   reported by index. A failed parent write is fatal and nothing else is
//!   written.
//!
//! ## NOT Responsible For
//! - Reconciling parents with missing children

use crate::classifier::ClassificationResult;
use crate::extract::{AnalysisPayload, AnalysisResult};
use crate::routing::{CostSummary, RoutingDecision};
use crate::storage::{Record, TableStore};
use crate::{PipelineError, Submission};
use chrono::Utc;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Table names used by the fan-out writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TableNames {
    /// Food entry parents.
    #[serde(default = "default_food_entries")]
    pub food_entries: String,
    /// Food entry children.
    #[serde(default = "default_food_items")]
    pub food_items: String,
    /// Receipt parents.
    #[serde(default = "default_receipts")]
    pub receipts: String,
    /// Receipt children.
    #[serde(default = "default_receipt_items")]
    pub receipt_items: String,
    /// Workout parents.
    #[serde(default = "default_workouts")]
    pub workouts: String,
    /// Workout children.
    #[serde(default = "default_workout_exercises")]
    pub workout_exercises: String,
    /// Summaries of unknown content.
    #[serde(default = "default_general_entries")]
    pub general_entries: String,
    /// Parse-failure markers awaiting manual review.
    #[serde(default = "default_analysis_reviews")]
    pub analysis_reviews: String,
    /// Async analysis status records.
    #[serde(default = "default_analysis_status")]
    pub analysis_status: String,
    /// Per-run cost log.
    #[serde(default = "default_api_costs")]
    pub api_costs: String,
}

fn default_food_entries() -> String {
    "food_entries".into()
}
fn default_food_items() -> String {
    "food_items".into()
}
fn default_receipts() -> String {
    "receipts".into()
}
fn default_receipt_items() -> String {
    "receipt_items".into()
}
fn default_workouts() -> String {
    "workouts".into()
}
fn default_workout_exercises() -> String {
    "workout_exercises".into()
}
fn default_general_entries() -> String {
    "general_entries".into()
}
fn default_analysis_reviews() -> String {
    "analysis_reviews".into()
}
fn default_analysis_status() -> String {
    "analysis_status".into()
}
fn default_api_costs() -> String {
    "api_costs".into()
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            food_entries: default_food_entries(),
            food_items: default_food_items(),
            receipts: default_receipts(),
            receipt_items: default_receipt_items(),
            workouts: default_workouts(),
            workout_exercises: default_workout_exercises(),
            general_entries: default_general_entries(),
            analysis_reviews: default_analysis_reviews(),
            analysis_status: default_analysis_status(),
            api_costs: default_api_costs(),
        }
    }
}

impl TableNames {
    /// Every configured name, for validation.
    pub fn all(&self) -> [(&'static str, &str); 10] {
        [
            ("food_entries", self.food_entries.as_str()),
            ("food_items", self.food_items.as_str()),
            ("receipts", self.receipts.as_str()),
            ("receipt_items", self.receipt_items.as_str()),
            ("workouts", self.workouts.as_str()),
            ("workout_exercises", self.workout_exercises.as_str()),
            ("general_entries", self.general_entries.as_str()),
            ("analysis_reviews", self.analysis_reviews.as_str()),
            ("analysis_status", self.analysis_status.as_str()),
            ("api_costs", self.api_costs.as_str()),
        ]
    }
}

/// What the fan-out wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceReport {
    /// Table holding the parent record.
    pub parent_table: String,
    /// Id of the parent record.
    pub parent_id: String,
    /// Table holding the children, if the payload has any.
    pub child_table: Option<String>,
    /// Children written.
    pub children_written: usize,
    /// Indices of children whose write failed.
    pub failed_children: Vec<usize>,
}

impl PersistenceReport {
    /// Whether some children were not written.
    pub fn is_partial(&self) -> bool {
        !self.failed_children.is_empty()
    }
}

/// Parent-then-children writer.
pub struct FanOutWriter<'a> {
    store: &'a dyn TableStore,
    tables: &'a TableNames,
}

impl<'a> FanOutWriter<'a> {
    /// Writer over `store`.
    pub fn new(store: &'a dyn TableStore, tables: &'a TableNames) -> Self {
        Self { store, tables }
    }

    /// Write the parent record, then every child concurrently.
    ///
    /// # Errors
    ///
    /// [`PipelineError::PersistenceFatal`] if the parent write fails. Child
    /// failures are reported in [`PersistenceReport::failed_children`].
    pub async fn persist(
        &self,
        submission: &Submission,
        classification: &ClassificationResult,
        routing: &RoutingDecision,
        result: &AnalysisResult,
    ) -> Result<PersistenceReport, PipelineError> {
        let mut parent = attribution(submission);
        parent.insert("category".into(), json!(result.category));
        parent.insert("description".into(), json!(submission.description()));
        parent.insert("confidence".into(), json!(classification.confidence));
        parent.insert("classifier_model".into(), json!(classification.model_id));
        parent.insert("model_id".into(), json!(routing.model_id));
        parent.insert("prompt_id".into(), json!(routing.prompt_id));
        parent.insert("routing_reason".into(), json!(routing.reason));
        parent.insert("attempts".into(), json!(result.metering.attempts));
        parent.insert("cost_usd".into(), json!(result.metering.cost_usd));
        if let Some(crate::ImageRef::Url(url)) = submission.image() {
            parent.insert("image_url".into(), json!(url));
        }
        if !result.flags.is_empty() {
            parent.insert("flags".into(), json!(result.flags));
        }

        let (parent_table, child_table, children): (&str, Option<&str>, Vec<Record>) =
            match &result.payload {
                AnalysisPayload::Food(food) => {
                    parent.insert("meal_type".into(), json!(food.meal_type));
                    parent.insert("total_calories".into(), json!(food.total_calories));
                    parent.insert("total_protein_g".into(), json!(food.total_protein_g));
                    parent.insert("total_carbs_g".into(), json!(food.total_carbs_g));
                    parent.insert("total_fat_g".into(), json!(food.total_fat_g));
                    parent.insert("item_count".into(), json!(food.items.len()));
                    (
                        self.tables.food_entries.as_str(),
                        Some(self.tables.food_items.as_str()),
                        food.items.iter().map(to_record).collect(),
                    )
                }
                AnalysisPayload::Receipt(receipt) => {
                    parent.insert("merchant_name".into(), json!(receipt.merchant));
                    parent.insert("purchase_date".into(), json!(receipt.purchase_date));
                    parent.insert("currency".into(), json!(receipt.currency));
                    parent.insert("total_amount".into(), json!(receipt.total_amount));
                    parent.insert("item_count".into(), json!(receipt.items.len()));
                    (
                        self.tables.receipts.as_str(),
                        Some(self.tables.receipt_items.as_str()),
                        receipt.items.iter().map(to_record).collect(),
                    )
                }
                AnalysisPayload::Workout(workout) => {
                    parent.insert("workout_type".into(), json!(workout.workout_type));
                    parent.insert("duration_minutes".into(), json!(workout.duration_minutes));
                    parent.insert("calories_burned".into(), json!(workout.calories_burned));
                    parent.insert("workout_date".into(), json!(workout.workout_date));
                    parent.insert("notes".into(), json!(workout.notes));
                    parent.insert("exercise_count".into(), json!(workout.exercises.len()));
                    (
                        self.tables.workouts.as_str(),
                        Some(self.tables.workout_exercises.as_str()),
                        workout.exercises.iter().map(to_record).collect(),
                    )
                }
                AnalysisPayload::General(general) => {
                    parent.insert("summary".into(), json!(general.summary));
                    parent.insert("attributes".into(), Value::Object(general.attributes.clone()));
                    (self.tables.general_entries.as_str(), None, Vec::new())
                }
                AnalysisPayload::ParseFailure(marker) => {
                    parent.insert("raw_response".into(), json!(marker.raw_response));
                    parent.insert("violation_path".into(), json!(marker.violation.path));
                    parent.insert("violation_reason".into(), json!(marker.violation.reason));
                    parent.insert("review_status".into(), json!("pending"));
                    (self.tables.analysis_reviews.as_str(), None, Vec::new())
                }
            };

        let tenant = submission.tenant();
        let parent_id = self
            .store
            .create(tenant, parent_table, parent)
            .await
            .map_err(|e| {
                warn!(
                    submission_id = %submission.id(),
                    table = parent_table,
                    error = %e,
                    "parent write failed"
                );
                PipelineError::PersistenceFatal {
                    table: parent_table.to_string(),
                }
            })?;

        let mut report = PersistenceReport {
            parent_table: parent_table.to_string(),
            parent_id: parent_id.clone(),
            child_table: child_table.map(str::to_string),
            children_written: 0,
            failed_children: Vec::new(),
        };
        let Some(child_table) = child_table else {
            return Ok(report);
        };

        let writes = children.into_iter().enumerate().map(|(index, mut child)| {
            child.extend(attribution(submission));
            child.insert("parent_id".into(), json!(parent_id));
            child.insert("item_index".into(), json!(index));
            async move { (index, self.store.create(tenant, child_table, child).await) }
        });

        for (index, outcome) in join_all(writes).await {
            match outcome {
                Ok(_) => report.children_written += 1,
                Err(e) => {
                    warn!(
                        submission_id = %submission.id(),
                        table = child_table,
                        index,
                        error = %e,
                        "child write failed; parent retained"
                    );
                    report.failed_children.push(index);
                }
            }
        }

        info!(
            submission_id = %submission.id(),
            parent_table,
            parent_id = %report.parent_id,
            children = report.children_written,
            failed = report.failed_children.len(),
            "persisted"
        );
        Ok(report)
    }

    /// Append one cost-log record. Failures are logged and swallowed.
    ///
    /// The record keeps the run's category and routing reason so usage can
    /// be broken down later (see [`crate::usage`]).
    pub async fn record_costs(
        &self,
        submission: &Submission,
        classifier_model: &str,
        decision: &RoutingDecision,
        cost: &CostSummary,
    ) {
        let mut record = attribution(submission);
        record.insert("category".into(), json!(decision.category.as_str()));
        record.insert("routing_reason".into(), json!(decision.reason.as_str()));
        record.insert("classifier_model".into(), json!(classifier_model));
        record.insert("extraction_model".into(), json!(decision.model_id));
        record.insert("calls".into(), json!(cost.calls));
        record.insert("tokens_in".into(), json!(cost.tokens_in));
        record.insert("tokens_out".into(), json!(cost.tokens_out));
        record.insert("cost_nanos".into(), json!(cost.cost_nanos));
        record.insert("cost_usd".into(), json!(cost.cost_usd));
        record.insert("latency_ms".into(), json!(cost.latency_ms));

        if let Err(e) = self
            .store
            .create(submission.tenant(), &self.tables.api_costs, record)
            .await
        {
            warn!(submission_id = %submission.id(), error = %e, "cost log write failed");
        }
    }
}

/// Fields every record carries.
pub(crate) fn attribution(submission: &Submission) -> Record {
    let mut r = Record::new();
    r.insert("submission_id".into(), json!(submission.id().to_string()));
    r.insert("tenant_id".into(), json!(submission.tenant().as_str()));
    r.insert("user_id".into(), json!(submission.submitter().as_str()));
    r.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
    r
}

fn to_record<T: Serialize>(value: &T) -> Record {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Record::new(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
