// 🔢 Field Values - typed cells shared by every source system
// Staging hands us already-cleaned values; this module only models them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// FIELD KIND
// ============================================================================

/// Declared semantic type of a source column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Bool,
}

impl Default for FieldKind {
    fn default() -> Self {
        FieldKind::Text
    }
}

// ============================================================================
// FIELD VALUE
// ============================================================================

/// One non-null cell. Null is represented by absence from the field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text used for string predicates and concat-distinct
    pub fn display_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Type-tagged text form fed to the content hasher.
    ///
    /// `Number(1.0)` and `Text("1")` must never hash alike, so every value
    /// carries its kind prefix.
    pub fn canonical_repr(&self) -> String {
        match self {
            FieldValue::Number(n) => format!("n:{}", n),
            FieldValue::Bool(b) => format!("b:{}", b),
            FieldValue::Date(d) => format!("d:{}", d.format("%Y-%m-%d")),
            FieldValue::Text(s) => format!("t:{}", s),
        }
    }

    /// Parse a cleaned text cell into the declared kind
    ///
    /// Returns `Ok(None)` for blank cells (null).
    pub fn parse(raw: &str, kind: FieldKind) -> Result<Option<FieldValue>, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value = match kind {
            FieldKind::Text => FieldValue::Text(trimmed.to_string()),
            FieldKind::Number => {
                let n: f64 = trimmed
                    .parse()
                    .map_err(|_| format!("not a number: {}", trimmed))?;
                if !n.is_finite() {
                    return Err(format!("not a finite number: {}", trimmed));
                }
                FieldValue::Number(n)
            }
            FieldKind::Date => FieldValue::Date(
                NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                    .map_err(|_| format!("not a YYYY-MM-DD date: {}", trimmed))?,
            ),
            FieldKind::Bool => match trimmed.to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => FieldValue::Bool(true),
                "false" | "no" | "n" | "0" => FieldValue::Bool(false),
                _ => return Err(format!("not a boolean: {}", trimmed)),
            },
        };

        Ok(Some(value))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(d: NaiveDate) -> Self {
        FieldValue::Date(d)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

// ============================================================================
// ORDERING
// ============================================================================

fn kind_rank(value: &FieldValue) -> u8 {
    match value {
        FieldValue::Bool(_) => 0,
        FieldValue::Number(_) => 1,
        FieldValue::Date(_) => 2,
        FieldValue::Text(_) => 3,
    }
}

/// Total order used by min/max reducers.
///
/// Values of the same kind compare naturally; mixed kinds fall back to a
/// fixed kind rank so the result never depends on input order.
pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
    match (a, b) {
        (FieldValue::Number(x), FieldValue::Number(y)) => x.total_cmp(y),
        (FieldValue::Bool(x), FieldValue::Bool(y)) => x.cmp(y),
        (FieldValue::Date(x), FieldValue::Date(y)) => x.cmp(y),
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Round to two decimals; keeps scores and percentages byte-stable
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================
