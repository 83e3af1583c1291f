//! # Stage: Model Routing
//!
//! ## Responsibility
//! Decide which model and prompt serve stage-2 extraction for a classified
//! submission, and meter the cost of every model call the pipeline makes.
//!
//! ## Guarantees
//! - Deterministic: identical `(category, confidence, has_image)` inputs over
//!   the same catalog and thresholds always produce the same decision.
//! - Capability-safe: image-bearing submissions are only ever routed to
//!   image-capable models, or routing fails with a policy violation.
//! - Lock-free metering: `CostMeter` totals are atomic increments, so
//!   concurrent runs never lose updates.
//!
//! ## NOT Responsible For
//! - Calling the models (that belongs to `classifier` / `extract`)
//! - Pricing tables (those live in the `catalog`)

pub mod config;
pub mod cost_meter;
pub mod router;

// Re-exports for convenience
pub use config::RoutingConfig;
pub use cost_meter::{CallOutcome, CallRecord, CostMeter, CostSnapshot, CostSummary, RunLedger};
pub use router::{ModelRouter, ReasonCode, RoutingDecision};
