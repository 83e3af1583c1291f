//! Bounded numeric and text coercion for model output.
//!
//! Models routinely return `"$4.50"` where `4.5` was asked for, or a negative
//! calorie count. [`Coercer`] accepts the first, clamps the second to zero,
//! and records a [`FieldFlag`] for every value it had to touch. Values that
//! cannot be read as a number at all are schema violations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A value the coercer had to adjust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFlag {
    /// JSON path of the field, e.g. `items[1].price`.
    pub path: String,
    /// What was done to it.
    pub issue: FlagIssue,
}

/// Kind of adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlagIssue {
    /// Negative value replaced with zero.
    ClampedNegative {
        /// Value as received.
        original: f64,
    },
    /// Value above the plausible maximum (or non-finite) replaced with zero.
    ClampedOutOfRange {
        /// Value as received, if finite.
        original: Option<f64>,
        /// Plausible maximum for the field.
        max: f64,
    },
    /// Numeric string normalised to a number.
    Coerced {
        /// Text as received.
        original: String,
    },
    /// Field was absent and computed from other fields.
    Derived,
    /// Optional value could not be read and was dropped.
    Dropped {
        /// Text as received.
        original: String,
    },
}

/// Why a response does not fit its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON path of the offending field, `$` for the whole document.
    pub path: String,
    /// Human-readable reason, embedded in the re-prompt.
    pub reason: String,
}

impl SchemaViolation {
    /// Violation at `path`.
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.path, self.reason)
    }
}

impl std::error::Error for SchemaViolation {}

/// Plausible upper bound for a nominally positive field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound(pub f64);

impl Bound {
    /// Prices per line.
    pub const PRICE: Bound = Bound(100_000.0);
    /// Receipt totals.
    pub const TOTAL: Bound = Bound(1_000_000.0);
    /// Item counts.
    pub const QUANTITY: Bound = Bound(10_000.0);
    /// Calories per food item or workout.
    pub const CALORIES: Bound = Bound(20_000.0);
    /// Grams of a macro nutrient.
    pub const GRAMS: Bound = Bound(5_000.0);
    /// Milligrams of sodium.
    pub const MILLIGRAMS: Bound = Bound(100_000.0);
    /// Pounds lifted.
    pub const WEIGHT_LBS: Bound = Bound(2_000.0);
    /// Miles covered.
    pub const DISTANCE_MILES: Bound = Bound(500.0);
    /// Minutes in a day.
    pub const MINUTES: Bound = Bound(1_440.0);
    /// Sets or reps.
    pub const COUNT: Bound = Bound(1_000.0);
}

/// Reads typed fields out of a JSON object, collecting flags.
#[derive(Debug, Default)]
pub struct Coercer {
    flags: Vec<FieldFlag>,
}

impl Coercer {
    /// Empty coercer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags collected so far.
    pub fn flags(&self) -> &[FieldFlag] {
        &self.flags
    }

    /// Consume and return the flags.
    pub fn into_flags(self) -> Vec<FieldFlag> {
        self.flags
    }

    /// Record a flag.
    pub fn flag(&mut self, path: impl Into<String>, issue: FlagIssue) {
        self.flags.push(FieldFlag {
            path: path.into(),
            issue,
        });
    }

    /// Required non-negative number under the first present key in `keys`.
    ///
    /// # Errors
    ///
    /// [`SchemaViolation`] if the field is absent, null, or not numeric.
    pub fn required_number(
        &mut self,
        obj: &Map<String, Value>,
        keys: &[&str],
        path: &str,
        bound: Bound,
    ) -> Result<f64, SchemaViolation> {
        self.optional_number(obj, keys, path, bound)?
            .ok_or_else(|| SchemaViolation::new(path, "is a required number but is missing"))
    }

    /// Optional non-negative number; absent, null and empty strings are `None`.
    ///
    /// # Errors
    ///
    /// [`SchemaViolation`] if the field is present but not numeric.
    pub fn optional_number(
        &mut self,
        obj: &Map<String, Value>,
        keys: &[&str],
        path: &str,
        bound: Bound,
    ) -> Result<Option<f64>, SchemaViolation> {
        let Some(value) = first_present(obj, keys) else {
            return Ok(None);
        };
        let raw = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => match parse_numeric_text(s) {
                Some(n) => {
                    self.flag(path, FlagIssue::Coerced {
                        original: s.clone(),
                    });
                    Some(n)
                }
                None => None,
            },
            _ => None,
        };
        let Some(n) = raw else {
            return Err(SchemaViolation::new(
                path,
                format!("must be a number, got {value}"),
            ));
        };
        Ok(Some(self.clamp(n, path, bound)))
    }

    /// Optional whole count (sets, reps), rounded.
    ///
    /// # Errors
    ///
    /// [`SchemaViolation`] if the field is present but not numeric.
    pub fn optional_count(
        &mut self,
        obj: &Map<String, Value>,
        keys: &[&str],
        path: &str,
    ) -> Result<Option<u32>, SchemaViolation> {
        Ok(self
            .optional_number(obj, keys, path, Bound::COUNT)?
            .map(|n| n.round() as u32))
    }

    fn clamp(&mut self, n: f64, path: &str, bound: Bound) -> f64 {
        if !n.is_finite() {
            self.flag(path, FlagIssue::ClampedOutOfRange {
                original: None,
                max: bound.0,
            });
            0.0
        } else if n < 0.0 {
            self.flag(path, FlagIssue::ClampedNegative { original: n });
            0.0
        } else if n > bound.0 {
            self.flag(path, FlagIssue::ClampedOutOfRange {
                original: Some(n),
                max: bound.0,
            });
            0.0
        } else {
            n
        }
    }
}

/// Required non-empty string under the first present key in `keys`.
///
/// # Errors
///
/// [`SchemaViolation`] if absent, not a string, or blank.
pub fn required_text(
    obj: &Map<String, Value>,
    keys: &[&str],
    path: &str,
) -> Result<String, SchemaViolation> {
    match first_present(obj, keys) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(SchemaViolation::new(path, "must not be blank")),
        Some(other) => Err(SchemaViolation::new(
            path,
            format!("must be a string, got {other}"),
        )),
        None => Err(SchemaViolation::new(path, "is a required string but is missing")),
    }
}

/// Optional string; numbers are stringified, blanks are `None`.
pub fn optional_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first_present(obj, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Required array of objects.
///
/// # Errors
///
/// [`SchemaViolation`] if absent, not an array, or holding non-objects.
pub fn required_objects<'v>(
    obj: &'v Map<String, Value>,
    keys: &[&str],
    path: &str,
) -> Result<Vec<&'v Map<String, Value>>, SchemaViolation> {
    let Some(value) = first_present(obj, keys) else {
        return Err(SchemaViolation::new(path, "is a required array but is missing"));
    };
    let Value::Array(items) = value else {
        return Err(SchemaViolation::new(path, "must be an array"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object()
                .ok_or_else(|| SchemaViolation::new(format!("{path}[{i}]"), "must be an object"))
        })
        .collect()
}

/// First key in `keys` whose value is present and not null.
fn first_present<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

const CURRENCY_SYMBOLS: [char; 5] = ['$', '€', '£', '¥', '₹'];

/// Read a number out of text such as `"$4.50"`, `"-$1.00"`, `"€4,50"`,
/// `"1,234.5"` or `"120 kcal"`.
///
/// A sign may sit on either side of the currency symbol. Trailing units are
/// ignored. Separators are resolved per [`normalize_separators`]; forms that
/// stay ambiguous (`"1,2345"`) read as `None` so the caller can reject them.
pub fn parse_numeric_text(text: &str) -> Option<f64> {
    let noise = |c: char| CURRENCY_SYMBOLS.contains(&c) || c.is_whitespace();
    let mut rest = text.trim().trim_start_matches(noise);

    let mut negative = false;
    if let Some(r) = rest.strip_prefix('-') {
        negative = true;
        rest = r;
    } else if let Some(r) = rest.strip_prefix('+') {
        rest = r;
    }
    let rest = rest.trim_start_matches(noise);

    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(rest.len());
    let body = rest[..end].trim_end_matches(['.', ',']);
    if !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let n: f64 = normalize_separators(body)?.parse().ok()?;
    Some(if negative { -n } else { n })
}

/// Rewrite `body` (digits, `.` and `,` only) as a plain decimal literal.
///
/// - Both separators present: the later one is the decimal mark.
/// - Only commas: a single comma followed by one or two digits is a decimal
///   comma (`4,50`); otherwise commas group thousands.
/// - Only dots: a single dot is the decimal point; several group thousands.
///
/// Thousands groups must be three digits wide, with a leading group of one
/// to three.
fn normalize_separators(body: &str) -> Option<String> {
    let (decimal, thousands) = match (body.rfind('.'), body.rfind(',')) {
        (Some(dot), Some(comma)) if dot > comma => (Some('.'), ','),
        (Some(_), Some(_)) => (Some(','), '.'),
        (None, Some(comma)) => {
            let tail = body.len() - comma - 1;
            if body.matches(',').count() == 1 && (1..=2).contains(&tail) {
                (Some(','), '.')
            } else {
                (None, ',')
            }
        }
        (Some(_), None) if body.matches('.').count() == 1 => (Some('.'), ','),
        (Some(_), None) => (None, '.'),
        (None, None) => (None, ','),
    };

    let (int_part, frac_part) = match decimal.and_then(|d| body.rfind(d)) {
        Some(at) => (&body[..at], Some(&body[at + 1..])),
        None => (body, None),
    };
    if frac_part.is_some_and(|f| !f.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }

    let groups: Vec<&str> = int_part.split(thousands).collect();
    if groups.iter().any(|g| !g.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    if groups.len() > 1
        && (groups[0].is_empty() || groups[0].len() > 3 || groups[1..].iter().any(|g| g.len() != 3))
    {
        return None;
    }

    let mut out = groups.concat();
    if out.is_empty() {
        out.push('0');
    }
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    Some(out)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    // -- parse_numeric_text ----------------------------------------------

    #[test]
    fn test_parse_numeric_text_accepts_currency_and_units() {
        assert_eq!(parse_numeric_text("$4.50"), Some(4.5));
        assert_eq!(parse_numeric_text(" € 12"), Some(12.0));
        assert_eq!(parse_numeric_text("1,234.50"), Some(1234.5));
        assert_eq!(parse_numeric_text("120 kcal"), Some(120.0));
        assert_eq!(parse_numeric_text("-3"), Some(-3.0));
        assert_eq!(parse_numeric_text(".5"), Some(0.5));
    }

    #[test]
    fn test_parse_numeric_text_sign_on_either_side_of_currency() {
        assert_eq!(parse_numeric_text("-$1.00"), Some(-1.0));
        assert_eq!(parse_numeric_text("$-1.00"), Some(-1.0));
        assert_eq!(parse_numeric_text("- € 2,50"), Some(-2.5));
        assert_eq!(parse_numeric_text("+$3"), Some(3.0));
    }

    #[test]
    fn test_parse_numeric_text_decimal_comma() {
        assert_eq!(parse_numeric_text("€4,50"), Some(4.5));
        assert_eq!(parse_numeric_text("4,5"), Some(4.5));
        assert_eq!(parse_numeric_text("1.234,50 EUR"), Some(1234.5));
    }

    #[test]
    fn test_parse_numeric_text_thousands_groups() {
        assert_eq!(parse_numeric_text("1,234"), Some(1234.0));
        assert_eq!(parse_numeric_text("1,234,567.89"), Some(1_234_567.89));
        assert_eq!(parse_numeric_text("1.234.567"), Some(1_234_567.0));
    }

    #[test]
    fn test_parse_numeric_text_rejects_ambiguous_separators() {
        assert_eq!(parse_numeric_text("1,2345"), None);
        assert_eq!(parse_numeric_text("12.5.3"), None);
        assert_eq!(parse_numeric_text("1,23,456"), None);
    }

    #[test]
    fn test_parse_numeric_text_rejects_words() {
        assert_eq!(parse_numeric_text("about ten"), None);
        assert_eq!(parse_numeric_text("$"), None);
        assert_eq!(parse_numeric_text("N/A"), None);
    }

    // -- numbers ---------------------------------------------------------

    #[test]
    fn test_price_string_is_coerced_and_flagged() {
        let mut c = Coercer::new();
        let o = obj(json!({ "price": "$4.50" }));
        let v = c.required_number(&o, &["price"], "items[0].price", Bound::PRICE);
        assert_eq!(v, Ok(4.5));
        assert_eq!(c.flags().len(), 1);
        assert!(matches!(c.flags()[0].issue, FlagIssue::Coerced { .. }));
    }

    #[test]
    fn test_negative_value_is_clamped_not_rejected() {
        let mut c = Coercer::new();
        let o = obj(json!({ "calories": -250 }));
        let v = c.required_number(&o, &["calories"], "calories", Bound::CALORIES);
        assert_eq!(v, Ok(0.0));
        assert_eq!(
            c.flags()[0].issue,
            FlagIssue::ClampedNegative { original: -250.0 }
        );
    }

    #[test]
    fn test_out_of_range_value_is_clamped_to_zero() {
        let mut c = Coercer::new();
        let o = obj(json!({ "weight_lbs": 99_999 }));
        let v = c.optional_number(&o, &["weight_lbs"], "weight_lbs", Bound::WEIGHT_LBS);
        assert_eq!(v, Ok(Some(0.0)));
        assert!(matches!(
            c.flags()[0].issue,
            FlagIssue::ClampedOutOfRange { .. }
        ));
    }

    #[test]
    fn test_non_numeric_value_is_violation() {
        let mut c = Coercer::new();
        let o = obj(json!({ "price": "free-ish" }));
        let err = c.required_number(&o, &["price"], "items[2].price", Bound::PRICE);
        assert_eq!(err.map_err(|e| e.path), Err("items[2].price".to_string()));
    }

    #[test]
    fn test_missing_required_number_is_violation() {
        let mut c = Coercer::new();
        let o = obj(json!({ "name": "milk" }));
        assert!(c.required_number(&o, &["price"], "price", Bound::PRICE).is_err());
    }

    #[test]
    fn test_alias_keys_are_checked_in_order() {
        let mut c = Coercer::new();
        let o = obj(json!({ "carbohydrates": 30, "carbs": null }));
        let v = c.optional_number(&o, &["carbs", "carbohydrates"], "carbs", Bound::GRAMS);
        assert_eq!(v, Ok(Some(30.0)));
    }

    #[test]
    fn test_optional_count_rounds() {
        let mut c = Coercer::new();
        let o = obj(json!({ "reps": 7.6 }));
        assert_eq!(c.optional_count(&o, &["reps"], "reps"), Ok(Some(8)));
    }

    // -- text and arrays -------------------------------------------------

    #[test]
    fn test_required_text_rejects_blank() {
        let o = obj(json!({ "name": "  " }));
        assert!(required_text(&o, &["name"], "name").is_err());
    }

    #[test]
    fn test_required_objects_points_at_bad_element() {
        let o = obj(json!({ "items": [{ "name": "a" }, 3] }));
        let err = required_objects(&o, &["items"], "items");
        assert_eq!(err.map_err(|e| e.path).map(|v| v.len()), Err("items[1]".to_string()));
    }

    #[test]
    fn test_violation_display_names_path() {
        let v = SchemaViolation::new("food_items", "must be an array");
        assert_eq!(v.to_string(), "`food_items` must be an array");
    }
}
