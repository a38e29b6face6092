// ✅ Data Quality & Change Detection
// Completeness, quality grade, format / variance checks and the content
// fingerprint used to tell "changed" from "unchanged" between runs.

use crate::value::{round2, FieldValue};
use crate::xref::Confidence;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// FLAGS
// ============================================================================

/// Diagnostic attached to an output record. Bad data is flagged, never fatal.
///
/// Variant order is severity order: the first variant present is the one
/// reported in the single `data_quality_flag` column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "flag", content = "field", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQualityFlag {
    InvalidFormat(String),
    MissingCrossReference,
    CalculationVariance(String),
    LowQuality,
    MissingCurrency(String),
    MissingFxRate(String),
    MissingAllocation,
}

impl DataQualityFlag {
    pub fn code(&self) -> &'static str {
        match self {
            DataQualityFlag::InvalidFormat(_) => "INVALID_FORMAT",
            DataQualityFlag::MissingCrossReference => "MISSING_CROSS_REFERENCE",
            DataQualityFlag::CalculationVariance(_) => "CALCULATION_VARIANCE",
            DataQualityFlag::LowQuality => "LOW_QUALITY",
            DataQualityFlag::MissingCurrency(_) => "MISSING_CURRENCY",
            DataQualityFlag::MissingFxRate(_) => "MISSING_FX_RATE",
            DataQualityFlag::MissingAllocation => "MISSING_ALLOCATION",
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            DataQualityFlag::InvalidFormat(f)
            | DataQualityFlag::CalculationVariance(f)
            | DataQualityFlag::MissingCurrency(f)
            | DataQualityFlag::MissingFxRate(f) => Some(f.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for DataQualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field() {
            Some(field) => write!(f, "{}({})", self.code(), field),
            None => f.write_str(self.code()),
        }
    }
}

/// Sort + dedupe so flag lists are stable inputs for storage and comparison
pub fn normalize_flags(flags: &mut Vec<DataQualityFlag>) {
    flags.sort();
    flags.dedup();
}

/// Most severe flag (flags must already be normalized)
pub fn primary_flag(flags: &[DataQualityFlag]) -> Option<&DataQualityFlag> {
    flags.first()
}

// ============================================================================
// COMPLETENESS & RATING
// ============================================================================

/// 100 × populated / required, two decimals. No required fields scores 100.
pub fn completeness_score(fields: &BTreeMap<String, FieldValue>, required: &[String]) -> f64 {
    if required.is_empty() {
        return 100.0;
    }
    let populated = required.iter().filter(|f| fields.contains_key(*f)).count();
    round2(100.0 * populated as f64 / required.len() as f64)
}

/// Declaration order is best → worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityRating::Excellent => "EXCELLENT",
            QualityRating::Good => "GOOD",
            QualityRating::Fair => "FAIR",
            QualityRating::Poor => "POOR",
        }
    }
}

/// One grade and the completeness it needs at each confidence level.
/// A confidence level absent from the map can never reach this grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    pub rating: QualityRating,
    pub min_completeness: BTreeMap<Confidence, f64>,
}

/// Step function (confidence, completeness) → rating.
///
/// Levels are scanned best first and the first satisfied one wins, so for a
/// fixed confidence a higher completeness can only keep or raise the grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGrid {
    pub levels: Vec<QualityLevel>,
}

impl QualityGrid {
    pub fn rate(&self, confidence: Confidence, completeness: f64) -> QualityRating {
        self.levels
            .iter()
            .find(|level| {
                level
                    .min_completeness
                    .get(&confidence)
                    .map_or(false, |min| completeness >= *min)
            })
            .map(|level| level.rating)
            .unwrap_or(QualityRating::Poor)
    }

    /// Levels must be listed strictly best → worst
    pub fn is_ordered(&self) -> bool {
        self.levels.windows(2).all(|w| w[0].rating < w[1].rating)
    }

    /// Builder: append a level
    pub fn level(mut self, rating: QualityRating, thresholds: &[(Confidence, f64)]) -> Self {
        self.levels.push(QualityLevel {
            rating,
            min_completeness: thresholds.iter().copied().collect(),
        });
        self
    }
}

impl Default for QualityGrid {
    /// Shared grid used by every built-in entity profile
    fn default() -> Self {
        QualityGrid { levels: Vec::new() }
            .level(QualityRating::Excellent, &[(Confidence::High, 90.0)])
            .level(
                QualityRating::Good,
                &[(Confidence::High, 70.0), (Confidence::Medium, 80.0)],
            )
            .level(
                QualityRating::Fair,
                &[
                    (Confidence::High, 50.0),
                    (Confidence::Medium, 50.0),
                    (Confidence::Low, 70.0),
                    (Confidence::Unknown, 90.0),
                ],
            )
    }
}

// ============================================================================
// FORMAT CHECKS
// ============================================================================

/// Regex a populated field must match (null is a completeness concern, not a format one)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatCheck {
    pub field: String,
    pub pattern: String,
}

impl FormatCheck {
    pub fn new(field: &str, pattern: &str) -> Self {
        FormatCheck {
            field: field.to_string(),
            pattern: pattern.to_string(),
        }
    }

    pub fn compile(&self) -> Result<CompiledFormatCheck, regex::Error> {
        Ok(CompiledFormatCheck {
            field: self.field.clone(),
            regex: Regex::new(&self.pattern)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFormatCheck {
    pub field: String,
    pub regex: Regex,
}

impl CompiledFormatCheck {
    pub fn check(&self, fields: &BTreeMap<String, FieldValue>) -> Option<DataQualityFlag> {
        let value = fields.get(&self.field)?;
        let ok = value.as_str().map_or(false, |s| self.regex.is_match(s));
        if ok {
            None
        } else {
            Some(DataQualityFlag::InvalidFormat(self.field.clone()))
        }
    }
}

// ============================================================================
// VARIANCE CHECKS
// ============================================================================

/// Compare a derived metric with the value a source reported for it.
/// Only flags; the derived value is never corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceCheck {
    pub derived: String,
    pub reported: String,
    /// Relative tolerance (0.05 = 5 %)
    pub tolerance: f64,
}

impl VarianceCheck {
    pub fn new(derived: &str, reported: &str, tolerance: f64) -> Self {
        VarianceCheck {
            derived: derived.to_string(),
            reported: reported.to_string(),
            tolerance,
        }
    }

    pub fn check(&self, fields: &BTreeMap<String, FieldValue>) -> Option<DataQualityFlag> {
        let derived = fields.get(&self.derived)?.as_f64()?;
        let reported = fields.get(&self.reported)?.as_f64()?;

        let difference = (derived - reported).abs();
        let relative = if reported == 0.0 {
            difference
        } else {
            difference / reported.abs()
        };

        if relative > self.tolerance {
            Some(DataQualityFlag::CalculationVariance(self.derived.clone()))
        } else {
            None
        }
    }
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// SHA-256 over identity, resolved fields and diagnostics.
///
/// Fields arrive in a BTreeMap, so the digest is independent of resolution
/// order. Diagnostics are (name, value) pairs such as confidence, rating and
/// flags; a change in any of them is a change of the record. Timestamps and
/// provenance are not part of the input.
pub fn content_hash(
    id: &str,
    kind: &str,
    fields: &BTreeMap<String, FieldValue>,
    diagnostics: &[(&str, String)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(kind.as_bytes());
    hasher.update([0x1e]);

    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.canonical_repr().as_bytes());
        hasher.update([0x1e]);
    }

    hasher.update([0x1d]);
    for (name, value) in diagnostics {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }

    format!("{:x}", hasher.finalize())
}

/// Flags as one hashable string (flags must already be normalized)
pub fn flags_repr(flags: &[DataQualityFlag]) -> String {
    flags.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",")
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

    fn required(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_completeness_score() {
        let f = fields(&[("name", "Acme".into()), ("country", "US".into())]);
        assert_eq!(completeness_score(&f, &required(&["name", "country", "industry"])), 66.67);
        assert_eq!(completeness_score(&f, &required(&["name"])), 100.0);
        assert_eq!(completeness_score(&f, &[]), 100.0);
        assert_eq!(completeness_score(&BTreeMap::new(), &required(&["name"])), 0.0);
    }

    #[test]
    fn test_default_grid_ratings() {
        let grid = QualityGrid::default();
        assert_eq!(grid.rate(Confidence::High, 95.0), QualityRating::Excellent);
        assert_eq!(grid.rate(Confidence::High, 75.0), QualityRating::Good);
        assert_eq!(grid.rate(Confidence::Medium, 95.0), QualityRating::Good);
        assert_eq!(grid.rate(Confidence::Low, 100.0), QualityRating::Fair);
        assert_eq!(grid.rate(Confidence::Unknown, 80.0), QualityRating::Poor);
        assert_eq!(grid.rate(Confidence::High, 10.0), QualityRating::Poor);
        assert!(grid.is_ordered());
    }

    #[test]
    fn test_rating_monotonic_in_completeness() {
        let grid = QualityGrid::default();
        for confidence in Confidence::ALL {
            let mut previous = QualityRating::Poor;
            for step in 0..=100 {
                let rating = grid.rate(confidence, step as f64);
                assert!(rating <= previous, "{:?} dropped at {}", confidence, step);
                previous = rating;
            }
        }
    }

    #[test]
    fn test_flags_sort_by_severity() {
        let mut flags = vec![
            DataQualityFlag::MissingAllocation,
            DataQualityFlag::LowQuality,
            DataQualityFlag::InvalidFormat("country".to_string()),
            DataQualityFlag::LowQuality,
        ];
        normalize_flags(&mut flags);
        assert_eq!(flags.len(), 3);
        assert_eq!(
            primary_flag(&flags).map(|f| f.to_string()),
            Some("INVALID_FORMAT(country)".to_string())
        );
    }

    #[test]
    fn test_format_check_only_on_populated_text() {
        let check = FormatCheck::new("country", "^[A-Z]{2}$").compile().unwrap();
        assert!(check.check(&fields(&[("country", "US".into())])).is_none());
        assert_eq!(
            check.check(&fields(&[("country", "USA".into())])),
            Some(DataQualityFlag::InvalidFormat("country".to_string()))
        );
        assert!(check.check(&BTreeMap::new()).is_none());
    }

    #[test]
    fn test_variance_check_tolerance() {
        let check = VarianceCheck::new("ev_to_ebitda", "reported_ev_to_ebitda", 0.05);
        let close = fields(&[("ev_to_ebitda", 10.2.into()), ("reported_ev_to_ebitda", 10.0.into())]);
        assert!(check.check(&close).is_none());

        let far = fields(&[("ev_to_ebitda", 12.0.into()), ("reported_ev_to_ebitda", 10.0.into())]);
        assert_eq!(
            check.check(&far),
            Some(DataQualityFlag::CalculationVariance("ev_to_ebitda".to_string()))
        );

        let missing = fields(&[("ev_to_ebitda", 12.0.into())]);
        assert!(check.check(&missing).is_none());
    }

    #[test]
    fn test_content_hash_sensitivity() {
        let a = fields(&[("name", "Acme".into()), ("latest_revenue", 5_000_000.0.into())]);
        let b = fields(&[("name", "Acme".into()), ("latest_revenue", 5_100_000.0.into())]);

        let ha = content_hash("COMP-CANON-0001", "company", &a, &[]);
        assert_eq!(ha, content_hash("COMP-CANON-0001", "company", &a.clone(), &[]));
        assert_ne!(ha, content_hash("COMP-CANON-0001", "company", &b, &[]));
        assert_ne!(ha, content_hash("COMP-CANON-0002", "company", &a, &[]));
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn test_content_hash_covers_diagnostics() {
        let f = fields(&[("name", "Acme".into())]);
        let high = content_hash("COMP-CANON-0001", "company", &f, &[("confidence", "HIGH".to_string())]);
        let low = content_hash("COMP-CANON-0001", "company", &f, &[("confidence", "LOW".to_string())]);
        assert_ne!(high, low);

        // A diagnostic never aliases a field of the same name
        let as_field = fields(&[("confidence", "HIGH".into()), ("name", "Acme".into())]);
        assert_ne!(high, content_hash("COMP-CANON-0001", "company", &as_field, &[]));
    }

    #[test]
    fn test_flags_repr_is_order_stable() {
        let mut a = vec![DataQualityFlag::MissingAllocation, DataQualityFlag::LowQuality];
        let mut b = vec![DataQualityFlag::LowQuality, DataQualityFlag::MissingAllocation];
        normalize_flags(&mut a);
        normalize_flags(&mut b);
        assert_eq!(flags_repr(&a), flags_repr(&b));
        assert_eq!(flags_repr(&[]), "");
    }
}
