//! Typed extraction payloads, one per category.
//!
//! Each schema is parsed out of a JSON object with [`Coercer`], which is
//! lenient on numeric formatting and strict on shape: a missing required
//! field or a non-numeric number is a [`SchemaViolation`], everything else
//! is normalised and flagged.

use super::coerce::{
    optional_text, required_objects, required_text, Bound, Coercer, FlagIssue, SchemaViolation,
};
use crate::category::Category;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pull the JSON object out of a model response.
///
/// Accepts a bare object, an object wrapped in a markdown code fence, or an
/// object surrounded by prose.
///
/// # Errors
///
/// [`SchemaViolation`] at path `$` if no JSON object can be found.
pub fn locate_json(text: &str) -> Result<Map<String, Value>, SchemaViolation> {
    let unfenced = strip_code_fence(text);

    let parsed = serde_json::from_str::<Value>(unfenced.trim()).ok().or_else(|| {
        let start = unfenced.find('{')?;
        let end = unfenced.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&unfenced[start..=end]).ok()
    });

    match parsed {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(SchemaViolation::new(
            "$",
            format!("must be a JSON object, got {}", json_type(&other)),
        )),
        None => Err(SchemaViolation::new("$", "is not valid JSON")),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // skip the language tag line, e.g. ```json
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after,
    };
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// -- food -------------------------------------------------------------------

/// Meal slot of a food entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    /// Morning meal.
    Breakfast,
    /// Midday meal.
    Lunch,
    /// Evening meal.
    Dinner,
    /// Anything else.
    Snack,
}

impl MealType {
    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "breakfast" => Some(MealType::Breakfast),
            "lunch" => Some(MealType::Lunch),
            "dinner" | "supper" => Some(MealType::Dinner),
            "snack" => Some(MealType::Snack),
            _ => None,
        }
    }
}

/// One food item with its nutrients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem {
    /// Item name.
    pub name: String,
    /// Free-form portion, e.g. `6 oz`.
    pub quantity: Option<String>,
    /// Energy in kcal.
    pub calories: f64,
    /// Protein in grams.
    pub protein_g: f64,
    /// Carbohydrates in grams.
    pub carbs_g: f64,
    /// Fat in grams.
    pub fat_g: f64,
    /// Fibre in grams.
    pub fiber_g: f64,
    /// Sodium in milligrams.
    pub sodium_mg: f64,
}

/// Nutrition analysis of a meal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodAnalysis {
    /// Items eaten; never empty.
    pub items: Vec<FoodItem>,
    /// Meal slot, when the model named one.
    pub meal_type: Option<MealType>,
    /// Total energy; summed from items when the model left it out.
    pub total_calories: f64,
    /// Summed protein.
    pub total_protein_g: f64,
    /// Summed carbohydrates.
    pub total_carbs_g: f64,
    /// Summed fat.
    pub total_fat_g: f64,
}

fn parse_food(obj: &Map<String, Value>, c: &mut Coercer) -> Result<FoodAnalysis, SchemaViolation> {
    let raw_items = required_objects(obj, &["food_items", "items", "foods"], "food_items")?;
    if raw_items.is_empty() {
        return Err(SchemaViolation::new("food_items", "must contain at least one item"));
    }

    let mut items = Vec::with_capacity(raw_items.len());
    for (i, item) in raw_items.into_iter().enumerate() {
        let p = |field: &str| format!("food_items[{i}].{field}");
        items.push(FoodItem {
            name: required_text(item, &["name", "food", "item"], &p("name"))?,
            quantity: optional_text(item, &["quantity", "portion", "serving_size"]),
            calories: c
                .optional_number(item, &["calories", "kcal"], &p("calories"), Bound::CALORIES)?
                .unwrap_or(0.0),
            protein_g: c
                .optional_number(item, &["protein", "protein_g"], &p("protein"), Bound::GRAMS)?
                .unwrap_or(0.0),
            carbs_g: c
                .optional_number(
                    item,
                    &["carbs", "carbohydrates", "carbs_g"],
                    &p("carbs"),
                    Bound::GRAMS,
                )?
                .unwrap_or(0.0),
            fat_g: c
                .optional_number(item, &["fat", "fat_g"], &p("fat"), Bound::GRAMS)?
                .unwrap_or(0.0),
            fiber_g: c
                .optional_number(item, &["fiber", "fibre", "fiber_g"], &p("fiber"), Bound::GRAMS)?
                .unwrap_or(0.0),
            sodium_mg: c
                .optional_number(item, &["sodium", "sodium_mg"], &p("sodium"), Bound::MILLIGRAMS)?
                .unwrap_or(0.0),
        });
    }

    let meal_type = match optional_text(obj, &["meal_type", "meal"]) {
        Some(label) => {
            let parsed = MealType::parse(&label);
            if parsed.is_none() {
                c.flag("meal_type", FlagIssue::Dropped { original: label });
            }
            parsed
        }
        None => None,
    };

    let item_calories: f64 = items.iter().map(|i| i.calories).sum();
    let total_calories = match c.optional_number(
        obj,
        &["total_calories", "calories"],
        "total_calories",
        Bound::CALORIES,
    )? {
        Some(t) if t > 0.0 => t,
        _ => {
            c.flag("total_calories", FlagIssue::Derived);
            item_calories
        }
    };

    Ok(FoodAnalysis {
        total_calories,
        total_protein_g: items.iter().map(|i| i.protein_g).sum(),
        total_carbs_g: items.iter().map(|i| i.carbs_g).sum(),
        total_fat_g: items.iter().map(|i| i.fat_g).sum(),
        items,
        meal_type,
    })
}

// -- receipt ----------------------------------------------------------------

/// One purchased line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    /// Item name as printed.
    pub name: String,
    /// Line total.
    pub price: f64,
    /// Units bought; `1` when not stated.
    pub quantity: f64,
    /// Spending category, when the model assigned one.
    pub category: Option<String>,
}

/// Structured receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptAnalysis {
    /// Store name.
    pub merchant: Option<String>,
    /// Purchase date, when legible.
    pub purchase_date: Option<NaiveDate>,
    /// ISO currency code.
    pub currency: String,
    /// Receipt total; summed from line prices when the model left it out.
    pub total_amount: f64,
    /// Purchased lines.
    pub items: Vec<ReceiptItem>,
}

impl ReceiptAnalysis {
    /// Sum of line prices.
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(|i| i.price).sum()
    }
}

fn parse_receipt(
    obj: &Map<String, Value>,
    c: &mut Coercer,
) -> Result<ReceiptAnalysis, SchemaViolation> {
    const ITEM_KEYS: &[&str] = &["items", "line_items", "receipt_items"];
    // a receipt with only a total is still a receipt
    let raw_items = if has_any(obj, ITEM_KEYS) || !has_any(obj, &["total_amount", "total"]) {
        required_objects(obj, ITEM_KEYS, "items")?
    } else {
        Vec::new()
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for (i, item) in raw_items.into_iter().enumerate() {
        let p = |field: &str| format!("items[{i}].{field}");
        items.push(ReceiptItem {
            name: required_text(item, &["name", "description", "item"], &p("name"))?,
            price: c.required_number(item, &["price", "amount", "total"], &p("price"), Bound::PRICE)?,
            quantity: c
                .optional_number(item, &["quantity", "qty"], &p("quantity"), Bound::QUANTITY)?
                .unwrap_or(1.0),
            category: optional_text(item, &["category"]),
        });
    }

    let purchase_date = match optional_text(obj, &["purchase_date", "date"]) {
        Some(raw) => {
            let parsed = parse_date(&raw);
            if parsed.is_none() {
                c.flag("purchase_date", FlagIssue::Dropped { original: raw });
            }
            parsed
        }
        None => None,
    };

    let items_total: f64 = items.iter().map(|i| i.price).sum();
    let total_amount = match c.optional_number(
        obj,
        &["total_amount", "total"],
        "total_amount",
        Bound::TOTAL,
    )? {
        Some(t) => t,
        None => {
            c.flag("total_amount", FlagIssue::Derived);
            items_total
        }
    };

    Ok(ReceiptAnalysis {
        merchant: optional_text(obj, &["merchant_name", "merchant", "vendor", "store"]),
        purchase_date,
        currency: optional_text(obj, &["currency"])
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_else(|| "USD".to_string()),
        total_amount,
        items,
    })
}

// -- workout ----------------------------------------------------------------

/// One exercise within a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    /// Exercise name.
    pub name: String,
    /// Sets performed.
    pub sets: Option<u32>,
    /// Repetitions per set.
    pub reps: Option<u32>,
    /// Load in pounds.
    pub weight_lbs: Option<f64>,
    /// Distance in miles.
    pub distance_miles: Option<f64>,
    /// Time spent.
    pub duration_minutes: Option<f64>,
}

/// Structured workout log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutAnalysis {
    /// Kind of session, e.g. `Strength`; `General` when unnamed.
    pub workout_type: String,
    /// Session length.
    pub duration_minutes: Option<f64>,
    /// Estimated energy spent.
    pub calories_burned: Option<f64>,
    /// Session date, when stated.
    pub workout_date: Option<NaiveDate>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Exercises performed.
    pub exercises: Vec<Exercise>,
}

fn parse_workout(
    obj: &Map<String, Value>,
    c: &mut Coercer,
) -> Result<WorkoutAnalysis, SchemaViolation> {
    let workout_type = optional_text(obj, &["workout_type", "type", "activity"]);
    let raw_exercises = if has_any(obj, &["exercises", "activities"]) {
        required_objects(obj, &["exercises", "activities"], "exercises")?
    } else {
        Vec::new()
    };
    if workout_type.is_none() && raw_exercises.is_empty() {
        return Err(SchemaViolation::new(
            "exercises",
            "must be non-empty when workout_type is missing",
        ));
    }

    let mut exercises = Vec::with_capacity(raw_exercises.len());
    for (i, ex) in raw_exercises.into_iter().enumerate() {
        let p = |field: &str| format!("exercises[{i}].{field}");
        exercises.push(Exercise {
            name: required_text(ex, &["name", "exercise"], &p("name"))?,
            sets: c.optional_count(ex, &["sets"], &p("sets"))?,
            reps: c.optional_count(ex, &["reps", "repetitions"], &p("reps"))?,
            weight_lbs: c.optional_number(
                ex,
                &["weight_lbs", "weight"],
                &p("weight_lbs"),
                Bound::WEIGHT_LBS,
            )?,
            distance_miles: c.optional_number(
                ex,
                &["distance_miles", "distance"],
                &p("distance_miles"),
                Bound::DISTANCE_MILES,
            )?,
            duration_minutes: c.optional_number(
                ex,
                &["duration_minutes", "duration"],
                &p("duration_minutes"),
                Bound::MINUTES,
            )?,
        });
    }

    let workout_date = match optional_text(obj, &["workout_date", "date"]) {
        Some(raw) => {
            let parsed = parse_date(&raw);
            if parsed.is_none() {
                c.flag("workout_date", FlagIssue::Dropped { original: raw });
            }
            parsed
        }
        None => None,
    };

    Ok(WorkoutAnalysis {
        workout_type: workout_type.unwrap_or_else(|| "General".to_string()),
        duration_minutes: c.optional_number(
            obj,
            &["duration_minutes", "duration"],
            "duration_minutes",
            Bound::MINUTES,
        )?,
        calories_burned: c.optional_number(
            obj,
            &["calories_burned", "calories"],
            "calories_burned",
            Bound::CALORIES,
        )?,
        workout_date,
        notes: optional_text(obj, &["notes"]),
        exercises,
    })
}

// -- general ----------------------------------------------------------------

/// Summary of content no category fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralAnalysis {
    /// One-paragraph summary.
    pub summary: String,
    /// Anything else the model reported.
    pub attributes: Map<String, Value>,
}

fn parse_general(obj: &Map<String, Value>) -> Result<GeneralAnalysis, SchemaViolation> {
    let summary = required_text(obj, &["summary", "description"], "summary")?;
    let attributes = match obj.get("attributes") {
        Some(Value::Object(m)) => m.clone(),
        _ => obj
            .iter()
            .filter(|(k, _)| k.as_str() != "summary" && k.as_str() != "description")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    Ok(GeneralAnalysis {
        summary,
        attributes,
    })
}

// -- payload ----------------------------------------------------------------

/// Model output that could not be validated after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    /// Last raw response, verbatim.
    pub raw_response: String,
    /// Why it was rejected.
    pub violation: SchemaViolation,
}

/// Category-specific result of extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisPayload {
    /// Nutrition analysis.
    Food(FoodAnalysis),
    /// Receipt line items.
    Receipt(ReceiptAnalysis),
    /// Workout log.
    Workout(WorkoutAnalysis),
    /// Free-form summary for unknown content.
    General(GeneralAnalysis),
    /// Parse-failure marker kept for manual review.
    ParseFailure(ParseFailure),
}

/// Parse `text` into the schema that belongs to `category`.
///
/// # Errors
///
/// [`SchemaViolation`] describing the first problem found.
pub fn parse_payload(
    category: Category,
    text: &str,
    coercer: &mut Coercer,
) -> Result<AnalysisPayload, SchemaViolation> {
    let obj = locate_json(text)?;
    match category {
        Category::Food => parse_food(&obj, coercer).map(AnalysisPayload::Food),
        Category::Receipt => parse_receipt(&obj, coercer).map(AnalysisPayload::Receipt),
        Category::Workout => parse_workout(&obj, coercer).map(AnalysisPayload::Workout),
        Category::Unknown => parse_general(&obj).map(AnalysisPayload::General),
    }
}

fn has_any(obj: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|k| obj.get(*k).is_some_and(|v| !v.is_null()))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

// ── Tests ──────────────────────────────────────────────────────────────
