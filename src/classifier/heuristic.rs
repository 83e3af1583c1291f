//! Keyword heuristic used when the classification model is unavailable.
//!
//! Scores the description against three keyword families and picks the
//! strongest one:
//!
//! | Signal | Weight |
//! |---|---|
//! | any currency symbol (`$ € £ ¥ ₹`) | receipt +3 |
//! | receipt/merchant word | receipt +2 each |
//! | exercise verb or unit | workout +2 each |
//! | food noun or meal word | food +1 each |
//!
//! Ties resolve receipt, then workout, then food. No signal at all yields
//! [`Category::Unknown`].

use crate::category::Category;

const CURRENCY_SYMBOLS: [char; 5] = ['$', '€', '£', '¥', '₹'];

const RECEIPT_WORDS: &[&str] = &[
    "receipt", "invoice", "bill", "total", "subtotal", "tax", "purchase", "purchased", "bought",
    "paid", "walmart", "target", "costco", "kroger", "store", "order",
];

const WORKOUT_WORDS: &[&str] = &[
    "workout", "gym", "exercise", "training", "fitness", "ran", "run", "running", "jog", "jogged",
    "lifted", "lift", "lifting", "squat", "squats", "bench", "deadlift", "deadlifts", "reps",
    "sets", "miles", "km", "cycling", "biked", "swim", "swam", "yoga", "cardio", "pushups",
    "pullups", "hiit", "treadmill",
];

const FOOD_WORDS: &[&str] = &[
    "food", "meal", "ate", "eat", "eating", "breakfast", "lunch", "dinner", "snack", "calories",
    "chicken", "rice", "salad", "egg", "eggs", "bread", "milk", "pizza", "burger", "pasta",
    "apple", "banana", "oatmeal", "coffee", "drink", "sandwich", "steak", "fish", "grilled",
    "cheese", "yogurt", "soup", "beef", "tofu",
];

/// Per-category keyword scores for one text.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeywordScores {
    /// Receipt evidence.
    pub receipt: u32,
    /// Workout evidence.
    pub workout: u32,
    /// Food evidence.
    pub food: u32,
}

impl KeywordScores {
    /// Category with the strongest evidence.
    pub fn winner(&self) -> Category {
        let best = self.receipt.max(self.workout).max(self.food);
        if best == 0 {
            Category::Unknown
        } else if self.receipt == best {
            Category::Receipt
        } else if self.workout == best {
            Category::Workout
        } else {
            Category::Food
        }
    }
}

/// Stateless keyword classifier.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Score `text` against every keyword family.
    pub fn scores(&self, text: &str) -> KeywordScores {
        let mut scores = KeywordScores::default();
        if text.contains(&CURRENCY_SYMBOLS[..]) {
            scores.receipt += 3;
        }

        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            if RECEIPT_WORDS.contains(&word) {
                scores.receipt += 2;
            }
            if WORKOUT_WORDS.contains(&word) {
                scores.workout += 2;
            }
            if FOOD_WORDS.contains(&word) {
                scores.food += 1;
            }
        }
        scores
    }

    /// Best-guess category for `text`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use nutriwealth_pipeline::classifier::KeywordClassifier;
    /// use nutriwealth_pipeline::Category;
    ///
    /// assert_eq!(KeywordClassifier.classify("ran 5 miles"), Category::Workout);
    /// ```
    pub fn classify(&self, text: &str) -> Category {
        self.scores(text).winner()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_with_food_items_is_receipt() {
        let text = "Walmart receipt, Milk $4.50, Bread $3.25, Total $7.75";
        let s = KeywordClassifier.scores(text);
        assert!(s.receipt > s.food, "{s:?}");
        assert_eq!(KeywordClassifier.classify(text), Category::Receipt);
    }

    #[test]
    fn test_currency_symbol_alone_is_receipt() {
        assert_eq!(KeywordClassifier.classify("€12.40"), Category::Receipt);
    }

    #[test]
    fn test_food_description_is_food() {
        assert_eq!(
            KeywordClassifier.classify("Grilled chicken breast, 6oz"),
            Category::Food
        );
    }

    #[test]
    fn test_exercise_verbs_are_workout() {
        assert_eq!(KeywordClassifier.classify("Lifted: squats 5x5, bench 3x8"), Category::Workout);
        assert_eq!(KeywordClassifier.classify("ran 3 miles"), Category::Workout);
    }

    #[test]
    fn test_no_signal_is_unknown() {
        assert_eq!(KeywordClassifier.classify("my cat is asleep"), Category::Unknown);
        assert_eq!(KeywordClassifier.classify(""), Category::Unknown);
    }

    #[test]
    fn test_tie_prefers_receipt_then_workout() {
        let tie = KeywordScores {
            receipt: 2,
            workout: 2,
            food: 2,
        };
        assert_eq!(tie.winner(), Category::Receipt);
        let tie = KeywordScores {
            receipt: 0,
            workout: 1,
            food: 1,
        };
        assert_eq!(tie.winner(), Category::Workout);
    }

    #[test]
    fn test_matching_ignores_case_and_punctuation() {
        assert_eq!(KeywordClassifier.classify("BREAKFAST: eggs!"), Category::Food);
    }
}
