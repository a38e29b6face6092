// 🏷️ Rule Tables - Rules as Data
// Ordered (predicate, outcome) tables for categories and score bands.
// Top-to-bottom, first match wins, and every table ends in a default.

use crate::value::{round2, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// PREDICATES
// ============================================================================

/// A single test applied to one field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Test {
    IsNull,
    NotNull,
    Gte { value: f64 },
    Gt { value: f64 },
    Lte { value: f64 },
    Lt { value: f64 },
    /// min inclusive, max exclusive
    Between { min: f64, max: f64 },
    /// Case-insensitive text equality
    Equals { value: String },
    /// Case-insensitive membership
    OneOf { values: Vec<String> },
    IsTrue,
}

impl Test {
    /// Numeric tests never match a null or non-numeric value
    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        match self {
            Test::IsNull => value.is_none(),
            Test::NotNull => value.is_some(),
            Test::Gte { value: t } => number(value).map_or(false, |n| n >= *t),
            Test::Gt { value: t } => number(value).map_or(false, |n| n > *t),
            Test::Lte { value: t } => number(value).map_or(false, |n| n <= *t),
            Test::Lt { value: t } => number(value).map_or(false, |n| n < *t),
            Test::Between { min, max } => number(value).map_or(false, |n| n >= *min && n < *max),
            Test::Equals { value: expected } => {
                text(value).map_or(false, |s| s.eq_ignore_ascii_case(expected.trim()))
            }
            Test::OneOf { values } => text(value).map_or(false, |s| {
                values.iter().any(|v| s.eq_ignore_ascii_case(v.trim()))
            }),
            Test::IsTrue => value.and_then(|v| v.as_bool()).unwrap_or(false),
        }
    }
}

fn number(value: Option<&FieldValue>) -> Option<f64> {
    value.and_then(|v| v.as_f64())
}

fn text(value: Option<&FieldValue>) -> Option<String> {
    value.map(|v| v.display_text().trim().to_string())
}

/// Test bound to a field name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(flatten)]
    pub test: Test,
}

impl Condition {
    pub fn new(field: &str, test: Test) -> Self {
        Condition {
            field: field.to_string(),
            test,
        }
    }

    pub fn is_null(field: &str) -> Self {
        Self::new(field, Test::IsNull)
    }

    pub fn gte(field: &str, value: f64) -> Self {
        Self::new(field, Test::Gte { value })
    }

    pub fn gt(field: &str, value: f64) -> Self {
        Self::new(field, Test::Gt { value })
    }

    pub fn lt(field: &str, value: f64) -> Self {
        Self::new(field, Test::Lt { value })
    }

    pub fn lte(field: &str, value: f64) -> Self {
        Self::new(field, Test::Lte { value })
    }

    pub fn one_of(field: &str, values: &[&str]) -> Self {
        Self::new(
            field,
            Test::OneOf {
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        )
    }

    pub fn is_true(field: &str) -> Self {
        Self::new(field, Test::IsTrue)
    }

    pub fn matches(&self, fields: &BTreeMap<String, FieldValue>) -> bool {
        self.test.matches(fields.get(&self.field))
    }
}

// ============================================================================
// RULE TABLE
// ============================================================================

/// One row of a table: all conditions must hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule<T> {
    pub when: Vec<Condition>,
    pub then: T,
}

impl<T> Rule<T> {
    pub fn matches(&self, fields: &BTreeMap<String, FieldValue>) -> bool {
        self.when.iter().all(|c| c.matches(fields))
    }
}

/// Ordered rule table with a mandatory default.
///
/// Totality is structural: `default` is not optional, so `evaluate` always
/// returns exactly one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable<T> {
    #[serde(default = "Vec::new")]
    pub rules: Vec<Rule<T>>,
    pub default: T,
}

impl<T> RuleTable<T> {
    pub fn new(default: T) -> Self {
        RuleTable {
            rules: Vec::new(),
            default,
        }
    }

    /// Builder: append a single-condition rule
    pub fn when(self, condition: Condition, then: T) -> Self {
        self.when_all(vec![condition], then)
    }

    /// Builder: append a rule whose conditions must all hold
    pub fn when_all(mut self, when: Vec<Condition>, then: T) -> Self {
        self.rules.push(Rule { when, then });
        self
    }

    /// First matching rule wins; default otherwise
    pub fn evaluate(&self, fields: &BTreeMap<String, FieldValue>) -> &T {
        self.rules
            .iter()
            .find(|rule| rule.matches(fields))
            .map(|rule| &rule.then)
            .unwrap_or(&self.default)
    }

    /// Fields read by any rule (for configuration validation)
    pub fn fields_read(&self) -> Vec<&str> {
        self.rules
            .iter()
            .flat_map(|r| r.when.iter().map(|c| c.field.as_str()))
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Category lookup table
pub type CategoryTable = RuleTable<String>;

impl RuleTable<String> {
    /// Builder shorthand for category tables
    pub fn category(default: &str) -> Self {
        RuleTable::new(default.to_string())
    }

    pub fn bucket(self, condition: Condition, category: &str) -> Self {
        self.when(condition, category.to_string())
    }
}

// ============================================================================
// SCORECARD
// ============================================================================

/// One weighted sub-score: a band table mapping fields to points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponent {
    pub name: String,
    pub weight: f64,
    pub points: RuleTable<f64>,
}

/// Composite score = Σ weight × points, rounded to two decimals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub components: Vec<ScoreComponent>,
}

impl Scorecard {
    pub fn new() -> Self {
        Scorecard {
            components: Vec::new(),
        }
    }

    /// Builder: add a weighted component
    pub fn component(mut self, name: &str, weight: f64, points: RuleTable<f64>) -> Self {
        self.components.push(ScoreComponent {
            name: name.to_string(),
            weight,
            points,
        });
        self
    }

    pub fn score(&self, fields: &BTreeMap<String, FieldValue>) -> f64 {
        let total: f64 = self
            .components
            .iter()
            .map(|c| c.weight * *c.points.evaluate(fields))
            .sum();
        round2(total)
    }

    pub fn fields_read(&self) -> Vec<&str> {
        self.components
            .iter()
            .flat_map(|c| c.points.fields_read())
            .collect()
    }
}

impl Default for Scorecard {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn size_table() -> CategoryTable {
        RuleTable::category("UNKNOWN")
            .bucket(Condition::is_null("revenue"), "UNKNOWN")
            .bucket(Condition::gte("revenue", 1_000_000_000.0), "LARGE")
            .bucket(Condition::gte("revenue", 100_000_000.0), "MID")
            .bucket(Condition::gte("revenue", 0.0), "SMALL")
    }

    #[test]
    fn test_first_match_wins() {
        let table = size_table();
        let f = fields(&[("revenue", FieldValue::Number(2_000_000_000.0))]);
        assert_eq!(table.evaluate(&f), "LARGE");

        let f = fields(&[("revenue", FieldValue::Number(150_000_000.0))]);
        assert_eq!(table.evaluate(&f), "MID");
    }

    #[test]
    fn test_default_bucket_is_total() {
        let table = size_table();
        // Negative revenue matches no rule
        let f = fields(&[("revenue", FieldValue::Number(-5.0))]);
        assert_eq!(table.evaluate(&f), "UNKNOWN");
        // Wrong kind matches no numeric rule
        let f = fields(&[("revenue", FieldValue::text("n/a"))]);
        assert_eq!(table.evaluate(&f), "UNKNOWN");
    }

    #[test]
    fn test_null_never_matches_numeric_tests() {
        let empty: BTreeMap<String, FieldValue> = BTreeMap::new();
        assert!(!Test::Gte { value: 0.0 }.matches(empty.get("x")));
        assert!(!Test::Lt { value: 0.0 }.matches(empty.get("x")));
        assert!(Test::IsNull.matches(empty.get("x")));
    }

    #[test]
    fn test_one_of_is_case_insensitive() {
        let table = RuleTable::category("LOW").bucket(Condition::one_of("industry", &["ENERGY", "MINING"]), "HIGH");
        let f = fields(&[("industry", FieldValue::text("Energy"))]);
        assert_eq!(table.evaluate(&f), "HIGH");
    }

    #[test]
    fn test_when_all_requires_every_condition() {
        let table = RuleTable::category("OTHER").when_all(
            vec![Condition::gte("a", 1.0), Condition::lt("b", 5.0)],
            "BOTH".to_string(),
        );
        let f = fields(&[("a", FieldValue::Number(2.0)), ("b", FieldValue::Number(9.0))]);
        assert_eq!(table.evaluate(&f), "OTHER");
        let f = fields(&[("a", FieldValue::Number(2.0)), ("b", FieldValue::Number(1.0))]);
        assert_eq!(table.evaluate(&f), "BOTH");
    }

    #[test]
    fn test_scorecard_weighted_sum() {
        let card = Scorecard::new()
            .component(
                "size",
                0.6,
                RuleTable::new(0.0).when(Condition::gte("revenue", 100.0), 100.0),
            )
            .component(
                "margin",
                0.4,
                RuleTable::new(20.0).when(Condition::gte("margin", 0.2), 80.0),
            );

        let f = fields(&[("revenue", FieldValue::Number(500.0)), ("margin", FieldValue::Number(0.1))]);
        assert_eq!(card.score(&f), 68.0);

        let f = fields(&[]);
        assert_eq!(card.score(&f), 8.0);
    }

    #[test]
    fn test_rule_table_json_shape() {
        let json = r#"{
            "rules": [
                { "when": [ { "field": "age", "op": "lt", "value": 3 } ], "then": "STARTUP" },
                { "when": [ { "field": "age", "op": "is_null" } ], "then": "UNKNOWN" }
            ],
            "default": "MATURE"
        }"#;
        let table: CategoryTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.rule_count(), 2);
        let f = fields(&[("age", FieldValue::Number(1.0))]);
        assert_eq!(table.evaluate(&f), "STARTUP");
        assert_eq!(table.evaluate(&BTreeMap::new()), "UNKNOWN");
    }
}
