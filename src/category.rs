//! Closed set of submission categories.
//!
//! Every downstream decision (routing, prompt choice, schema validation,
//! persistence table) matches exhaustively on [`Category`], so a fifth
//! category cannot slip through as an unchecked string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Content-type classification of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Meals, snacks, drinks.
    Food,
    /// Purchase receipts, invoices, bills.
    Receipt,
    /// Exercise sessions.
    Workout,
    /// Anything the classifier could not place. A valid outcome, not an error.
    Unknown,
}

impl Category {
    /// All categories in declaration order.
    pub const ALL: [Category; 4] = [
        Category::Food,
        Category::Receipt,
        Category::Workout,
        Category::Unknown,
    ];

    /// Stable lowercase label used in logs, metrics and stored records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Food => "food",
            Category::Receipt => "receipt",
            Category::Workout => "workout",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a label names no known category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised category label `{0}`")]
pub struct UnknownCategoryLabel(pub String);

impl FromStr for Category {
    type Err = UnknownCategoryLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "food" | "meal" | "nutrition" => Ok(Category::Food),
            "receipt" | "receipts" | "invoice" | "bill" => Ok(Category::Receipt),
            "workout" | "workouts" | "exercise" | "fitness" => Ok(Category::Workout),
            "unknown" | "other" => Ok(Category::Unknown),
            other => Err(UnknownCategoryLabel(other.to_string())),
        }
    }
}
