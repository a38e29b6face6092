// 🧩 Field Consolidation - one strategy per output field
//
// Every output field is resolved by exactly one declared strategy:
//   priority_select → first non-null value in declared source order
//   aggregate       → reducer over all contributing rows
//   derived         → pure function of fields resolved earlier
//
// Rows are put into a fixed order before anything is reduced, so the result
// never depends on input order.

use crate::fx::{Conversion, FxRateTable};
use crate::quality::DataQualityFlag;
use crate::rules::{CategoryTable, Scorecard};
use crate::source::{Contribution, SourceSystem};
use crate::value::{compare_values, round2, FieldValue};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

// ============================================================================
// CONFIGURATION TYPES
// ============================================================================

/// How one output field is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    #[serde(flatten)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    PrioritySelect {
        sources: Vec<SourceSystem>,
        /// Source column to read; defaults to the output field name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_field: Option<String>,
    },
    Aggregate {
        reducer: Reducer,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_field: Option<String>,
        /// Restrict to these sources; all sources when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<Vec<SourceSystem>>,
    },
    Derived {
        derivation: Derivation,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum Reducer {
    Sum,
    /// All rows, or rows with a non-null `source_field` when one is set
    Count,
    Min,
    Max,
    ConcatDistinct {
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Value of the row with the latest date; ties → greatest natural key
    LatestByDate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date_field: Option<String>,
    },
    EarliestByDate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date_field: Option<String>,
    },
}

fn default_separator() -> String {
    ", ".to_string()
}

impl Reducer {
    pub fn name(&self) -> &'static str {
        match self {
            Reducer::Sum => "SUM",
            Reducer::Count => "COUNT",
            Reducer::Min => "MIN",
            Reducer::Max => "MAX",
            Reducer::ConcatDistinct { .. } => "CONCAT_DISTINCT",
            Reducer::LatestByDate { .. } => "LATEST_BY_DATE",
            Reducer::EarliestByDate { .. } => "EARLIEST_BY_DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum Derivation {
    /// Null or zero denominator → null
    Ratio { numerator: String, denominator: String },
    /// Null if any operand is null
    Add { fields: Vec<String> },
    Difference { minuend: String, subtrahend: String },
    /// Whole years from a date (or a year number) to the run's as-of date
    AgeInYears { from: String },
    Category { table: String },
    Score { scorecard: String },
    /// Writes `<field>` and `<field>_currency`
    ConvertCurrency {
        amount: String,
        currency: String,
        target: String,
    },
}

impl Derivation {
    pub fn name(&self) -> &'static str {
        match self {
            Derivation::Ratio { .. } => "ratio",
            Derivation::Add { .. } => "add",
            Derivation::Difference { .. } => "difference",
            Derivation::AgeInYears { .. } => "age_in_years",
            Derivation::Category { .. } => "category",
            Derivation::Score { .. } => "score",
            Derivation::ConvertCurrency { .. } => "convert_currency",
        }
    }

    /// Fields read directly (tables and scorecards are looked up separately)
    pub fn operands(&self) -> Vec<&str> {
        match self {
            Derivation::Ratio {
                numerator,
                denominator,
            } => vec![numerator.as_str(), denominator.as_str()],
            Derivation::Add { fields } => fields.iter().map(String::as_str).collect(),
            Derivation::Difference {
                minuend,
                subtrahend,
            } => vec![minuend.as_str(), subtrahend.as_str()],
            Derivation::AgeInYears { from } => vec![from.as_str()],
            Derivation::Category { .. } | Derivation::Score { .. } => Vec::new(),
            Derivation::ConvertCurrency {
                amount, currency, ..
            } => vec![amount.as_str(), currency.as_str()],
        }
    }
}

impl FieldRule {
    pub fn priority(field: &str, sources: &[SourceSystem]) -> Self {
        FieldRule {
            field: field.to_string(),
            strategy: Strategy::PrioritySelect {
                sources: sources.to_vec(),
                source_field: None,
            },
        }
    }

    pub fn aggregate(field: &str, reducer: Reducer) -> Self {
        FieldRule {
            field: field.to_string(),
            strategy: Strategy::Aggregate {
                reducer,
                source_field: None,
                sources: None,
            },
        }
    }

    pub fn derived(field: &str, derivation: Derivation) -> Self {
        FieldRule {
            field: field.to_string(),
            strategy: Strategy::Derived { derivation },
        }
    }

    /// Builder: read a differently named source column
    pub fn from_column(mut self, column: &str) -> Self {
        match &mut self.strategy {
            Strategy::PrioritySelect { source_field, .. }
            | Strategy::Aggregate { source_field, .. } => *source_field = Some(column.to_string()),
            Strategy::Derived { .. } => {}
        }
        self
    }

    /// Builder: restrict an aggregate to some sources
    pub fn only_sources(mut self, only: &[SourceSystem]) -> Self {
        if let Strategy::Aggregate { sources, .. } = &mut self.strategy {
            *sources = Some(only.to_vec());
        }
        self
    }

    /// Output fields this rule writes
    pub fn outputs(&self) -> Vec<String> {
        match &self.strategy {
            Strategy::Derived {
                derivation: Derivation::ConvertCurrency { .. },
            } => vec![self.field.clone(), currency_field(&self.field)],
            _ => vec![self.field.clone()],
        }
    }

    /// Column read from source rows (None for derived rules)
    pub fn source_column(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::PrioritySelect { source_field, .. }
            | Strategy::Aggregate { source_field, .. } => {
                Some(source_field.as_deref().unwrap_or(&self.field))
            }
            Strategy::Derived { .. } => None,
        }
    }
}

pub fn currency_field(field: &str) -> String {
    format!("{}_currency", field)
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Lookups a derivation may use besides already-resolved fields
pub struct DerivationContext<'a> {
    pub categories: &'a BTreeMap<String, CategoryTable>,
    pub scorecards: &'a BTreeMap<String, Scorecard>,
    pub fx: &'a FxRateTable,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub fields: BTreeMap<String, FieldValue>,
    /// How each populated field was produced: PRIORITY:CRM, AGGREGATE:SUM(3), DERIVED:ratio
    pub provenance: BTreeMap<String, String>,
    pub flags: Vec<DataQualityFlag>,
    /// Conversion targets still holding the original currency's amount
    unconverted: BTreeSet<String>,
}

impl Resolution {
    fn set(&mut self, field: &str, value: FieldValue, provenance: String) {
        self.fields.insert(field.to_string(), value);
        self.provenance.insert(field.to_string(), provenance);
    }
}

/// Resolve every rule, in declared order, over the rows of one canonical id
pub fn resolve_fields<R: Contribution>(
    rules: &[FieldRule],
    rows: &[&R],
    ctx: &DerivationContext,
) -> Resolution {
    let mut ordered: Vec<&R> = rows.to_vec();
    ordered.sort_by(|a, b| canonical_row_order(*a, *b));

    let mut resolution = Resolution::default();

    for rule in rules {
        match &rule.strategy {
            Strategy::PrioritySelect { sources, .. } => {
                let column = rule.source_column().unwrap_or(&rule.field);
                if let Some((value, system)) = priority_select(&ordered, sources, column) {
                    resolution.set(&rule.field, value, format!("PRIORITY:{}", system.code()));
                }
            }
            Strategy::Aggregate {
                reducer,
                source_field,
                sources,
            } => {
                let column = rule.source_column().unwrap_or(&rule.field);
                let scoped: Vec<&R> = ordered
                    .iter()
                    .copied()
                    .filter(|r| sources.as_ref().map_or(true, |s| s.contains(&r.source_system())))
                    .collect();
                let (value, used) = aggregate(reducer, &scoped, column, source_field.is_some());
                if let Some(value) = value {
                    resolution.set(&rule.field, value, format!("AGGREGATE:{}({})", reducer.name(), used));
                }
            }
            Strategy::Derived { derivation } => {
                derive_into(&mut resolution, &rule.field, derivation, ctx);
            }
        }
    }

    resolution
}

/// Fixed row order: source system, then natural key, then timestamp
fn canonical_row_order<R: Contribution>(a: &R, b: &R) -> Ordering {
    a.source_system()
        .cmp(&b.source_system())
        .then_with(|| a.natural_key().cmp(b.natural_key()))
        .then_with(|| a.last_modified().cmp(&b.last_modified()))
}

// ============================================================================
// PRIORITY SELECT
// ============================================================================

/// First non-null value scanning the declared sources in order. Several rows
/// from one source: newest `last_modified` first, then greatest natural key.
pub fn priority_select<R: Contribution>(
    rows: &[&R],
    sources: &[SourceSystem],
    column: &str,
) -> Option<(FieldValue, SourceSystem)> {
    for system in sources {
        let mut candidates: Vec<&R> = rows
            .iter()
            .copied()
            .filter(|r| r.source_system() == *system)
            .collect();
        candidates.sort_by(|a, b| {
            (Reverse(a.last_modified()), Reverse(a.natural_key()))
                .cmp(&(Reverse(b.last_modified()), Reverse(b.natural_key())))
        });

        if let Some(value) = candidates.iter().find_map(|r| r.value(column)) {
            return Some((value.clone(), *system));
        }
    }
    None
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// Apply a reducer. Returns the value and how many rows contributed.
pub fn aggregate<R: Contribution>(
    reducer: &Reducer,
    rows: &[&R],
    column: &str,
    column_declared: bool,
) -> (Option<FieldValue>, usize) {
    let present: Vec<(&R, &FieldValue)> = rows
        .iter()
        .filter_map(|r| r.value(column).map(|v| (*r, v)))
        .collect();

    match reducer {
        Reducer::Sum => {
            let numbers: Vec<f64> = present.iter().filter_map(|(_, v)| v.as_f64()).collect();
            if numbers.is_empty() {
                (None, 0)
            } else {
                (Some(FieldValue::Number(numbers.iter().sum())), numbers.len())
            }
        }
        Reducer::Count => {
            let n = if column_declared { present.len() } else { rows.len() };
            (Some(FieldValue::Number(n as f64)), n)
        }
        Reducer::Min => (
            present
                .iter()
                .map(|(_, v)| *v)
                .min_by(|a, b| compare_values(a, b))
                .cloned(),
            present.len(),
        ),
        Reducer::Max => (
            present
                .iter()
                .map(|(_, v)| *v)
                .max_by(|a, b| compare_values(a, b))
                .cloned(),
            present.len(),
        ),
        Reducer::ConcatDistinct { separator } => {
            let distinct: BTreeSet<String> = present
                .iter()
                .map(|(_, v)| v.display_text().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if distinct.is_empty() {
                (None, 0)
            } else {
                let joined = distinct.into_iter().collect::<Vec<_>>().join(separator);
                (Some(FieldValue::Text(joined)), present.len())
            }
        }
        Reducer::LatestByDate { date_field } => {
            let chosen = present.iter().max_by(|(a, _), (b, _)| {
                (a.row_date(date_field.as_deref()), a.natural_key())
                    .cmp(&(b.row_date(date_field.as_deref()), b.natural_key()))
            });
            (chosen.map(|(_, v)| (*v).clone()), present.len())
        }
        Reducer::EarliestByDate { date_field } => {
            // Undated rows sort last; equal dates → greatest natural key
            let chosen = present.iter().min_by(|(a, _), (b, _)| {
                let da = a.row_date(date_field.as_deref());
                let db = b.row_date(date_field.as_deref());
                (da.is_none(), da, Reverse(a.natural_key()))
                    .cmp(&(db.is_none(), db, Reverse(b.natural_key())))
            });
            (chosen.map(|(_, v)| (*v).clone()), present.len())
        }
    }
}

// ============================================================================
// DERIVED
// ============================================================================

fn number(fields: &BTreeMap<String, FieldValue>, name: &str) -> Option<f64> {
    fields.get(name).and_then(|v| v.as_f64())
}

/// Division that treats a null or zero denominator as undefined
pub fn safe_ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let d = denominator?;
    if d == 0.0 {
        return None;
    }
    let r = numerator? / d;
    if r.is_finite() {
        Some(r)
    } else {
        None
    }
}

/// Whole years elapsed; None when the start lies after `as_of`
pub fn age_in_years(from: &FieldValue, as_of: NaiveDate) -> Option<f64> {
    match from {
        FieldValue::Date(d) => {
            if *d > as_of {
                return None;
            }
            let mut years = as_of.year() - d.year();
            if (as_of.month(), as_of.day()) < (d.month(), d.day()) {
                years -= 1;
            }
            Some(years as f64)
        }
        FieldValue::Number(year) if year.fract() == 0.0 => {
            let years = as_of.year() as f64 - year;
            if years < 0.0 {
                None
            } else {
                Some(years)
            }
        }
        _ => None,
    }
}

fn derive_into(resolution: &mut Resolution, field: &str, derivation: &Derivation, ctx: &DerivationContext) {
    let provenance = format!("DERIVED:{}", derivation.name());

    // Derivations read unconverted amounts as null
    let view: BTreeMap<String, FieldValue>;
    let fields = if resolution.unconverted.is_empty() {
        &resolution.fields
    } else {
        view = resolution
            .fields
            .iter()
            .filter(|(name, _)| !resolution.unconverted.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        &view
    };

    let value = match derivation {
        Derivation::Ratio {
            numerator,
            denominator,
        } => safe_ratio(number(fields, numerator), number(fields, denominator)).map(FieldValue::Number),
        Derivation::Add { fields: operands } => operands
            .iter()
            .map(|f| number(fields, f))
            .sum::<Option<f64>>()
            .map(FieldValue::Number),
        Derivation::Difference {
            minuend,
            subtrahend,
        } => match (number(fields, minuend), number(fields, subtrahend)) {
            (Some(a), Some(b)) => Some(FieldValue::Number(a - b)),
            _ => None,
        },
        Derivation::AgeInYears { from } => fields
            .get(from)
            .and_then(|v| age_in_years(v, ctx.as_of))
            .map(FieldValue::Number),
        Derivation::Category { table } => ctx
            .categories
            .get(table)
            .map(|t| FieldValue::Text(t.evaluate(fields).clone())),
        Derivation::Score { scorecard } => ctx
            .scorecards
            .get(scorecard)
            .map(|card| FieldValue::Number(card.score(fields))),
        Derivation::ConvertCurrency {
            amount,
            currency,
            target,
        } => {
            convert_into(resolution, field, amount, currency, target, ctx, &provenance);
            return;
        }
    };

    if let Some(value) = value {
        resolution.set(field, value, provenance);
    }
}

/// Converted amount, or the original amount + currency and a flag when the
/// rate is missing. A missing currency never borrows another field.
fn convert_into(
    resolution: &mut Resolution,
    field: &str,
    amount: &str,
    currency: &str,
    target: &str,
    ctx: &DerivationContext,
    provenance: &str,
) {
    let value = match number(&resolution.fields, amount) {
        Some(v) => v,
        None => return,
    };
    let from = resolution
        .fields
        .get(currency)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_uppercase());
    let currency_out = currency_field(field);

    match ctx.fx.convert(value, from.as_deref(), target, ctx.as_of) {
        Conversion::Converted(converted) => {
            resolution.set(field, FieldValue::Number(round2(converted)), provenance.to_string());
            resolution.set(&currency_out, FieldValue::text(target.to_uppercase()), provenance.to_string());
        }
        Conversion::MissingRate => {
            warn!(
                field = field,
                from = from.as_deref().unwrap_or(""),
                to = target,
                as_of = %ctx.as_of,
                "no FX rate, keeping original currency"
            );
            resolution.set(field, FieldValue::Number(value), provenance.to_string());
            if let Some(code) = from {
                resolution.set(&currency_out, FieldValue::Text(code), provenance.to_string());
            }
            resolution.flags.push(DataQualityFlag::MissingFxRate(field.to_string()));
            resolution.unconverted.insert(field.to_string());
        }
        Conversion::MissingCurrency => {
            resolution.flags.push(DataQualityFlag::MissingCurrency(field.to_string()));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
