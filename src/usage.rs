//! # Usage statistics
//!
//! ## Responsibility
//! Fold a user's cost-log records (`api_costs`) into a usage report:
//! totals, mean cost per request, a per-category breakdown, and the savings
//! compared with sending every token to one premium model.
//!
//! ## Guarantees
//! - Exact: costs are summed in nano-dollars, preferring the stored
//!   `cost_nanos` over the rounded `cost_usd`.
//! - Windowed: only records created at or after `since` are counted.
//! - Tolerant: a record with a missing or unreadable field contributes zero
//!   for that field; a record without a readable `created_at` is skipped.
//!
//! ## NOT Responsible For
//! - Querying storage (see `SubmissionCoordinator::usage_stats`)
//! - Live process totals (see [`crate::routing::CostMeter`])

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::catalog::{nanos_to_usd, usd_to_nanos, ModelDescriptor};
use crate::storage::Record;

/// Usage and spend for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    /// Pipeline runs.
    pub count: u64,
    /// Prompt plus completion tokens.
    pub tokens: u64,
    /// Spend in nano-dollars.
    pub cost_nanos: u64,
    /// Spend in USD.
    pub cost_usd: f64,
}

/// Spend against a single-premium-model baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Savings {
    /// Model every call is priced at for the baseline.
    pub baseline_model: String,
    /// What the routed runs actually cost.
    pub optimized_cost_usd: f64,
    /// What the same tokens would cost on the baseline model.
    pub baseline_cost_usd: f64,
    /// `baseline - optimized`; negative when routing cost more.
    pub saved_usd: f64,
    /// `saved / baseline` as a percentage, `0` for an empty baseline.
    pub saved_percent: f64,
}

/// Usage over a time window for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// User the records belong to.
    pub user_id: String,
    /// Start of the window.
    pub since: DateTime<Utc>,
    /// Pipeline runs in the window.
    pub requests: u64,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Spend in nano-dollars.
    pub total_cost_nanos: u64,
    /// Spend in USD.
    pub total_cost_usd: f64,
    /// Mean spend per run, `0` when there were none.
    pub avg_cost_per_request_usd: f64,
    /// Breakdown keyed by category label.
    pub by_category: BTreeMap<String, CategoryUsage>,
    /// Comparison with the premium baseline.
    pub savings: Savings,
}

/// Fold `records` created at or after `since` into a report.
pub fn summarize(
    user_id: &str,
    records: &[Record],
    since: DateTime<Utc>,
    baseline: &ModelDescriptor,
) -> UsageReport {
    let mut report = UsageReport {
        user_id: user_id.to_string(),
        since,
        requests: 0,
        tokens_in: 0,
        tokens_out: 0,
        total_cost_nanos: 0,
        total_cost_usd: 0.0,
        avg_cost_per_request_usd: 0.0,
        by_category: BTreeMap::new(),
        savings: Savings {
            baseline_model: baseline.id.clone(),
            optimized_cost_usd: 0.0,
            baseline_cost_usd: 0.0,
            saved_usd: 0.0,
            saved_percent: 0.0,
        },
    };
    let mut baseline_nanos: u64 = 0;

    for record in records {
        match created_at(record) {
            Some(at) if at >= since => {}
            Some(_) => continue,
            None => {
                debug!(record = ?record.get("id"), "cost record without readable created_at");
                continue;
            }
        }

        let tokens_in = count(record, "tokens_in");
        let tokens_out = count(record, "tokens_out");
        let cost = cost_nanos(record);

        report.requests += 1;
        report.tokens_in += tokens_in;
        report.tokens_out += tokens_out;
        report.total_cost_nanos += cost;
        baseline_nanos += baseline.cost_nanos(tokens_in, tokens_out);

        let label = record
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let entry = report.by_category.entry(label).or_default();
        entry.count += 1;
        entry.tokens += tokens_in + tokens_out;
        entry.cost_nanos += cost;
    }

    for entry in report.by_category.values_mut() {
        entry.cost_usd = nanos_to_usd(entry.cost_nanos);
    }
    report.total_cost_usd = nanos_to_usd(report.total_cost_nanos);
    if report.requests > 0 {
        report.avg_cost_per_request_usd = report.total_cost_usd / report.requests as f64;
    }

    let baseline_usd = nanos_to_usd(baseline_nanos);
    let saved = baseline_usd - report.total_cost_usd;
    report.savings.optimized_cost_usd = report.total_cost_usd;
    report.savings.baseline_cost_usd = baseline_usd;
    report.savings.saved_usd = saved;
    if baseline_nanos > 0 {
        report.savings.saved_percent = saved / baseline_usd * 100.0;
    }
    report
}

fn created_at(record: &Record) -> Option<DateTime<Utc>> {
    let raw = record.get("created_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn count(record: &Record, field: &str) -> u64 {
    record.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn cost_nanos(record: &Record) -> u64 {
    match record.get("cost_nanos").and_then(Value::as_u64) {
        Some(n) => n,
        None => record
            .get("cost_usd")
            .and_then(Value::as_f64)
            .map(usd_to_nanos)
            .unwrap_or(0),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
