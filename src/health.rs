//! Health Classification
//!
//! Two strategies answer the question at different pipeline stages:
//! - **Keyword**: only the raw classifier label is known. Healthy vocabulary
//!   is checked first and wins when both vocabularies match.
//! - **Threshold**: a [`NutrientRecord`] exists. Healthy only when calories,
//!   fat, fiber and sugar are all numeric and within limits. A missing value
//!   yields `Unhealthy`, never `Unknown`.
//!
//! A threshold verdict replaces an earlier keyword verdict for the same record.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::nutrition::NutrientRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLabel {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthLabel::Healthy => "Healthy",
            HealthLabel::Unhealthy => "Unhealthy",
            HealthLabel::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

pub const HEALTHY_TERMS: &[&str] = &[
    "salad", "fruit", "vegetable", "fish", "chicken", "turkey", "quinoa", "yogurt", "eggs",
    "smoothie", "soup", "nuts",
];

pub const UNHEALTHY_TERMS: &[&str] = &[
    "pizza", "burger", "fries", "cake", "ice cream", "candy", "chips", "soda", "donut", "fried",
];

pub const MAX_CALORIES: f64 = 400.0;
pub const MAX_TOTAL_FAT_G: f64 = 10.0;
pub const MIN_FIBER_G: f64 = 3.0;
pub const MAX_SUGAR_G: f64 = 10.0;

/// Which inputs the verdict is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStrategy {
    Keyword,
    Threshold,
}

/// Inputs available at the stage the verdict is requested.
pub enum HealthInput<'a> {
    Label(&'a str),
    Nutrients(&'a NutrientRecord),
}

impl HealthInput<'_> {
    pub fn strategy(&self) -> HealthStrategy {
        match self {
            HealthInput::Label(_) => HealthStrategy::Keyword,
            HealthInput::Nutrients(_) => HealthStrategy::Threshold,
        }
    }
}

pub fn classify(input: HealthInput<'_>) -> HealthLabel {
    match input {
        HealthInput::Label(label) => classify_by_keyword(label),
        HealthInput::Nutrients(record) => classify_by_threshold(record),
    }
}

pub fn classify_by_keyword(raw_label: &str) -> HealthLabel {
    let label = raw_label.to_lowercase();

    if HEALTHY_TERMS.iter().any(|term| label.contains(term)) {
        HealthLabel::Healthy
    } else if UNHEALTHY_TERMS.iter().any(|term| label.contains(term)) {
        HealthLabel::Unhealthy
    } else {
        HealthLabel::Unknown
    }
}

pub fn classify_by_threshold(record: &NutrientRecord) -> HealthLabel {
    let (Some(calories), Some(fat), Some(fiber), Some(sugar)) = (
        record.calories.amount(),
        record.total_fat.amount(),
        record.fiber.amount(),
        record.sugar.amount(),
    ) else {
        return HealthLabel::Unhealthy;
    };

    if calories <= MAX_CALORIES && fat <= MAX_TOTAL_FAT_G && fiber >= MIN_FIBER_G && sugar <= MAX_SUGAR_G {
        HealthLabel::Healthy
    } else {
        HealthLabel::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nutrition::NutrientValue::{self, Amount, NotAvailable};

    fn record(calories: NutrientValue, fat: NutrientValue, fiber: NutrientValue, sugar: NutrientValue) -> NutrientRecord {
        NutrientRecord {
            name: "test".to_string(),
            serving_size: "100g".to_string(),
            calories,
            total_fat: fat,
            saturated_fat: NotAvailable,
            cholesterol: NotAvailable,
            sodium: NotAvailable,
            carbohydrates: NotAvailable,
            fiber,
            sugar,
            protein: NotAvailable,
        }
    }

    #[test]
    fn test_keyword_mode() {
        assert_eq!(classify_by_keyword("pizza slice"), HealthLabel::Unhealthy);
        assert_eq!(classify_by_keyword("grilled chicken salad"), HealthLabel::Healthy);
        assert_eq!(classify_by_keyword("Ramen"), HealthLabel::Unknown);
        assert_eq!(classify_by_keyword("ICE CREAM"), HealthLabel::Unhealthy);
    }

    #[test]
    fn test_keyword_healthy_takes_precedence() {
        assert_eq!(classify_by_keyword("fried chicken"), HealthLabel::Healthy);
        assert_eq!(classify_by_keyword("fish and chips"), HealthLabel::Healthy);
    }

    #[test]
    fn test_threshold_mode() {
        let healthy = record(Amount(350.0), Amount(8.0), Amount(4.0), Amount(6.0));
        assert_eq!(classify_by_threshold(&healthy), HealthLabel::Healthy);

        // boundaries are inclusive
        let edge = record(Amount(400.0), Amount(10.0), Amount(3.0), Amount(10.0));
        assert_eq!(classify_by_threshold(&edge), HealthLabel::Healthy);

        let sugary = record(Amount(350.0), Amount(8.0), Amount(4.0), Amount(10.5));
        assert_eq!(classify_by_threshold(&sugary), HealthLabel::Unhealthy);
    }

    #[test]
    fn test_threshold_missing_value_is_unhealthy() {
        let fields = [
            record(NotAvailable, Amount(8.0), Amount(4.0), Amount(6.0)),
            record(Amount(350.0), NotAvailable, Amount(4.0), Amount(6.0)),
            record(Amount(350.0), Amount(8.0), NotAvailable, Amount(6.0)),
            record(Amount(350.0), Amount(8.0), Amount(4.0), NotAvailable),
        ];
        for r in &fields {
            assert_eq!(classify_by_threshold(r), HealthLabel::Unhealthy);
        }
    }

    #[test]
    fn test_classify_dispatches_on_input() {
        let r = record(Amount(100.0), Amount(1.0), Amount(5.0), Amount(2.0));
        assert_eq!(HealthInput::Label("cake").strategy(), HealthStrategy::Keyword);
        assert_eq!(classify(HealthInput::Label("cake")), HealthLabel::Unhealthy);
        assert_eq!(HealthInput::Nutrients(&r).strategy(), HealthStrategy::Threshold);
        assert_eq!(classify(HealthInput::Nutrients(&r)), HealthLabel::Healthy);
    }
}
