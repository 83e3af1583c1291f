//! # Prompt library
//!
//! ## Responsibility
//! Map each use case to a versioned prompt template and a description of the
//! JSON shape the model is expected to return.
//!
//! ## Guarantees
//! - A [`PromptLibrary`] always holds a template for every [`UseCase`];
//!   a missing one is a construction error, so lookups cannot fail per request.
//! - Rendered prompts always end with the JSON-only instruction.
//!
//! ## NOT Responsible For
//! - Choosing which use case applies (see [`crate::routing`])
//! - Validating model output (see [`crate::extract`])

use crate::category::Category;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closing instruction appended to every rendered prompt.
pub const JSON_ONLY_INSTRUCTION: &str = "Return ONLY valid JSON matching the expected structure.";

/// Placeholder replaced by the submission's description.
const DESCRIPTION_SLOT: &str = "{description}";
/// Placeholder replaced by the meal-time hint on food prompts.
const MEAL_HINT_SLOT: &str = "{meal_hint}";

/// What a prompt is used for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum UseCase {
    /// Stage 1 classification.
    Classify,
    /// Food nutrition extraction.
    Food,
    /// Receipt line-item extraction.
    Receipt,
    /// Workout extraction.
    Workout,
    /// Extraction for content the classifier could not place.
    General,
}

impl UseCase {
    /// Every use case a library must cover.
    pub const ALL: [UseCase; 5] = [
        UseCase::Classify,
        UseCase::Food,
        UseCase::Receipt,
        UseCase::Workout,
        UseCase::General,
    ];

    /// Extraction use case for a category.
    pub fn for_category(category: Category) -> UseCase {
        match category {
            Category::Food => UseCase::Food,
            Category::Receipt => UseCase::Receipt,
            Category::Workout => UseCase::Workout,
            Category::Unknown => UseCase::General,
        }
    }

    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCase::Classify => "classify",
            UseCase::Food => "food",
            UseCase::Receipt => "receipt",
            UseCase::Workout => "workout",
            UseCase::General => "general",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PromptTemplate {
    /// Use case served.
    pub use_case: UseCase,
    /// Monotonic version number, bumped on every wording change.
    pub version: u32,
    /// System message.
    pub system: String,
    /// User message with `{description}` (and for food `{meal_hint}`) slots.
    pub template: String,
    /// Human-readable description of the expected JSON shape.
    pub schema_hint: String,
}

impl PromptTemplate {
    /// Identifier recorded on routing decisions, e.g. `receipt@v3`.
    pub fn prompt_id(&self) -> String {
        format!("{}@v{}", self.use_case, self.version)
    }

    /// Render the first-attempt prompt.
    pub fn render(&self, ctx: &PromptContext<'_>) -> RenderedPrompt {
        let description = if ctx.description.trim().is_empty() {
            "(no description provided; analyze the attached image)"
        } else {
            ctx.description
        };
        let body = self
            .template
            .replace(DESCRIPTION_SLOT, description)
            .replace(MEAL_HINT_SLOT, meal_hint(ctx.received_at));

        RenderedPrompt {
            system: self.system.clone(),
            user: format!(
                "{body}\n\nExpected structure:\n{}\n\n{JSON_ONLY_INSTRUCTION}",
                self.schema_hint
            ),
        }
    }

    /// Render the stricter re-prompt that embeds the previous schema violation.
    pub fn render_repair(&self, ctx: &PromptContext<'_>, violation: &str) -> RenderedPrompt {
        let mut prompt = self.render(ctx);
        prompt.user = format!(
            "{}\n\nYour previous answer was rejected: {violation}.\n\
             Answer again with a single JSON object that matches the expected structure exactly. \
             Use plain numbers (no units or currency symbols) for numeric fields and include every required field.\n\n\
             {JSON_ONLY_INSTRUCTION}",
            prompt.user
        );
        prompt
    }
}

/// Inputs available to a template at render time.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    /// Submission description, possibly empty.
    pub description: &'a str,
    /// When the submission was received.
    pub received_at: DateTime<Utc>,
}

/// A prompt ready for the model worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    /// System message.
    pub system: String,
    /// User message.
    pub user: String,
}

/// Meal type suggested by the time of day.
pub fn meal_hint(at: DateTime<Utc>) -> &'static str {
    match at.hour() {
        5..=10 => "This was likely breakfast.",
        11..=14 => "This was likely lunch.",
        17..=21 => "This was likely dinner.",
        _ => "This was likely a snack.",
    }
}

/// Errors raised while assembling a library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    /// No template registered for a use case.
    #[error("no prompt registered for use case `{0}`")]
    Missing(UseCase),
    /// More than one template registered for a use case.
    #[error("more than one prompt registered for use case `{0}`")]
    Duplicate(UseCase),
    /// Template body lacks the description slot.
    #[error("prompt for use case `{0}` has no {{description}} slot")]
    NoDescriptionSlot(UseCase),
}

/// Complete set of prompts, one per [`UseCase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptLibrary {
    classify: PromptTemplate,
    food: PromptTemplate,
    receipt: PromptTemplate,
    workout: PromptTemplate,
    general: PromptTemplate,
}

impl PromptLibrary {
    /// Build a library from templates. Any use case absent from `templates`
    /// is filled from the built-in set only when `fill_builtin` is true.
    ///
    /// # Errors
    ///
    /// [`PromptError::Missing`] if a use case has no template,
    /// [`PromptError::Duplicate`] if one has several, and
    /// [`PromptError::NoDescriptionSlot`] if a template cannot see the input.
    pub fn new(templates: Vec<PromptTemplate>, fill_builtin: bool) -> Result<Self, PromptError> {
        let mut slots: [Option<PromptTemplate>; 5] = Default::default();
        for t in templates {
            if !t.template.contains(DESCRIPTION_SLOT) {
                return Err(PromptError::NoDescriptionSlot(t.use_case));
            }
            let slot = &mut slots[index_of(t.use_case)];
            if slot.is_some() {
                return Err(PromptError::Duplicate(t.use_case));
            }
            *slot = Some(t);
        }

        let mut take = |use_case: UseCase| -> Result<PromptTemplate, PromptError> {
            match slots[index_of(use_case)].take() {
                Some(t) => Ok(t),
                None if fill_builtin => Ok(builtin_template(use_case)),
                None => Err(PromptError::Missing(use_case)),
            }
        };

        Ok(Self {
            classify: take(UseCase::Classify)?,
            food: take(UseCase::Food)?,
            receipt: take(UseCase::Receipt)?,
            workout: take(UseCase::Workout)?,
            general: take(UseCase::General)?,
        })
    }

    /// Library made entirely of built-in templates.
    pub fn builtin() -> Self {
        Self {
            classify: builtin_template(UseCase::Classify),
            food: builtin_template(UseCase::Food),
            receipt: builtin_template(UseCase::Receipt),
            workout: builtin_template(UseCase::Workout),
            general: builtin_template(UseCase::General),
        }
    }

    /// Template for a use case.
    pub fn get(&self, use_case: UseCase) -> &PromptTemplate {
        match use_case {
            UseCase::Classify => &self.classify,
            UseCase::Food => &self.food,
            UseCase::Receipt => &self.receipt,
            UseCase::Workout => &self.workout,
            UseCase::General => &self.general,
        }
    }
}

fn index_of(use_case: UseCase) -> usize {
    match use_case {
        UseCase::Classify => 0,
        UseCase::Food => 1,
        UseCase::Receipt => 2,
        UseCase::Workout => 3,
        UseCase::General => 4,
    }
}

/// Built-in template for a use case.
pub fn builtin_template(use_case: UseCase) -> PromptTemplate {
    let (system, template, schema_hint) = match use_case {
        UseCase::Classify => (
            "You sort user submissions for a health and finance tracking app.",
            "Classify this submission as one of: food, receipt, workout, unknown.\n\
             Submission: {description}",
            r#"{"category": "food|receipt|workout|unknown", "confidence": 0.0-1.0, "reasoning": "one short sentence"}"#,
        ),
        UseCase::Food => (
            "You are a nutrition analyst. Estimate nutrients per item using standard portion data.",
            "Analyze this meal and list every food item with its nutrients.\n\
             Meal: {description}\n{meal_hint}",
            r#"{"food_items": [{"name": string, "quantity": string, "calories": number, "protein": number, "carbs": number, "fat": number, "fiber": number, "sodium": number}], "meal_type": "breakfast|lunch|dinner|snack", "total_calories": number}"#,
        ),
        UseCase::Receipt => (
            "You extract structured purchase data from receipts.",
            "Extract the purchase details from this receipt.\n\
             Receipt: {description}\nExtract all visible items with prices.",
            r#"{"merchant_name": string, "purchase_date": "YYYY-MM-DD" or null, "currency": "USD", "total_amount": number, "items": [{"name": string, "price": number, "quantity": number, "category": string}]}"#,
        ),
        UseCase::Workout => (
            "You are a fitness coach who logs workouts precisely.",
            "Log this workout.\nWorkout: {description}\n\
             Include all exercises with sets, reps, and weights if visible.",
            r#"{"workout_type": string, "duration_minutes": number, "calories_burned": number, "workout_date": "YYYY-MM-DD" or null, "notes": string, "exercises": [{"name": string, "sets": number, "reps": number, "weight_lbs": number, "distance_miles": number, "duration_minutes": number}]}"#,
        ),
        UseCase::General => (
            "You summarize user submissions that do not fit a known category.",
            "Summarize this submission and list any notable attributes.\n\
             Submission: {description}",
            r#"{"summary": string, "attributes": {string: any}}"#,
        ),
    };
    PromptTemplate {
        use_case,
        version: 1,
        system: system.to_string(),
        template: template.to_string(),
        schema_hint: schema_hint.to_string(),
    }
}
