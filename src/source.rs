// 🏗️ Source Model - cleaned rows from every upstream system
// Entity rows and association rows share one read interface (Contribution)

use crate::value::FieldValue;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Kind of real-world object being consolidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Company,
    Fund,
    Investor,
    Counterparty,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Company,
        EntityType::Fund,
        EntityType::Investor,
        EntityType::Counterparty,
    ];

    /// Lowercase name, also used in snapshot file names
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Company => "company",
            EntityType::Fund => "fund",
            EntityType::Investor => "investor",
            EntityType::Counterparty => "counterparty",
        }
    }

    /// Prefix of canonical and placeholder ids (COMP-CANON-0001, COMP-UNKNOWN-42)
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EntityType::Company => "COMP",
            EntityType::Fund => "FUND",
            EntityType::Investor => "INV",
            EntityType::Counterparty => "CPTY",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Deterministic id for a record that has no cross-reference entry
    pub fn placeholder_id(&self, source_key: &str) -> String {
        format!("{}-UNKNOWN-{}", self.id_prefix(), source_key.trim())
    }

    /// Placeholder qualified by its system, for keys unmapped in several systems
    pub fn system_placeholder_id(&self, system: SourceSystem, source_key: &str) -> String {
        format!("{}-UNKNOWN-{}-{}", self.id_prefix(), system.code(), source_key.trim())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SOURCE SYSTEM
// ============================================================================

/// Upstream system a row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceSystem {
    #[serde(rename = "CRM")]
    Crm,
    #[serde(rename = "PM")]
    PortfolioManagement,
    #[serde(rename = "FA")]
    FundAdministration,
    #[serde(rename = "ACCT")]
    Accounting,
}

impl SourceSystem {
    pub const ALL: [SourceSystem; 4] = [
        SourceSystem::Crm,
        SourceSystem::PortfolioManagement,
        SourceSystem::FundAdministration,
        SourceSystem::Accounting,
    ];

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            SourceSystem::Crm => "CRM",
            SourceSystem::PortfolioManagement => "Portfolio Management",
            SourceSystem::FundAdministration => "Fund Administration",
            SourceSystem::Accounting => "Accounting",
        }
    }

    /// Short code for internal use (provenance, storage)
    pub fn code(&self) -> &'static str {
        match self {
            SourceSystem::Crm => "CRM",
            SourceSystem::PortfolioManagement => "PM",
            SourceSystem::FundAdministration => "FA",
            SourceSystem::Accounting => "ACCT",
        }
    }

    /// Lowercase code used in snapshot file and column names
    pub fn slug(&self) -> String {
        self.code().to_lowercase()
    }

    pub fn parse(s: &str) -> Option<SourceSystem> {
        SourceSystem::ALL
            .into_iter()
            .find(|sys| sys.code().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// CONTRIBUTION - shared read interface
// ============================================================================

/// Anything that can contribute field values to a consolidated record.
///
/// The consolidation strategies only see rows through this trait, which is
/// what lets associations reuse the entity machinery unchanged.
pub trait Contribution {
    fn source_system(&self) -> SourceSystem;

    /// Natural key of the row inside its source (tie-break of last resort)
    fn natural_key(&self) -> &str;

    fn last_modified(&self) -> Option<DateTime<Utc>>;

    fn value(&self, field: &str) -> Option<&FieldValue>;

    /// Business date of the row: the named date field, else `last_modified`
    fn row_date(&self, date_field: Option<&str>) -> Option<NaiveDate> {
        date_field
            .and_then(|f| self.value(f))
            .and_then(|v| v.as_date())
            .or_else(|| self.last_modified().map(|ts| ts.date_naive()))
    }
}

// ============================================================================
// SOURCE RECORD
// ============================================================================

/// One cleaned row from one source system for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub entity_type: EntityType,
    pub source_system: SourceSystem,

    /// The source's own key for the entity (may be blank in bad data)
    pub source_key: String,

    pub last_modified: Option<DateTime<Utc>>,

    /// Source-specific attributes; null cells are absent
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl SourceRecord {
    pub fn new(entity_type: EntityType, source_system: SourceSystem, source_key: impl Into<String>) -> Self {
        SourceRecord {
            entity_type,
            source_system,
            source_key: source_key.into(),
            last_modified: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: set a field value
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Builder: set last-modified timestamp
    pub fn modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_modified = Some(ts);
        self
    }

    pub fn has_key(&self) -> bool {
        !self.source_key.trim().is_empty()
    }
}

impl Contribution for SourceRecord {
    fn source_system(&self) -> SourceSystem {
        self.source_system
    }

    fn natural_key(&self) -> &str {
        &self.source_key
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

// ============================================================================
// ASSOCIATIONS
// ============================================================================

/// Many-to-many relationship kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationType {
    CompanyIndustry,
    CompanyGeography,
    FundInvestor,
    FundInvestment,
}

impl AssociationType {
    pub const ALL: [AssociationType; 4] = [
        AssociationType::CompanyIndustry,
        AssociationType::CompanyGeography,
        AssociationType::FundInvestor,
        AssociationType::FundInvestment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationType::CompanyIndustry => "company_industry",
            AssociationType::CompanyGeography => "company_geography",
            AssociationType::FundInvestor => "fund_investor",
            AssociationType::FundInvestment => "fund_investment",
        }
    }

    pub fn parse(s: &str) -> Option<AssociationType> {
        AssociationType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for AssociationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cleaned association row from one source system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationSourceRecord {
    pub association_type: AssociationType,
    pub source_system: SourceSystem,

    /// Row key inside the source
    pub source_key: String,

    /// Source key of the owning entity (side A)
    pub entity_key: String,

    /// Source key of the counterpart entity, or the category value
    pub counterpart: String,

    /// Primary hint as reported by the source
    pub is_primary: Option<bool>,

    pub last_modified: Option<DateTime<Utc>>,

    /// Typed attributes, including `allocation_percentage` when reported
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl AssociationSourceRecord {
    pub fn new(
        association_type: AssociationType,
        source_system: SourceSystem,
        source_key: impl Into<String>,
        entity_key: impl Into<String>,
        counterpart: impl Into<String>,
    ) -> Self {
        AssociationSourceRecord {
            association_type,
            source_system,
            source_key: source_key.into(),
            entity_key: entity_key.into(),
            counterpart: counterpart.into(),
            is_primary: None,
            last_modified: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: set a field value
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Builder: reported allocation percentage
    pub fn allocation(self, pct: f64) -> Self {
        self.with(ALLOCATION_FIELD, pct)
    }

    /// Builder: primary hint
    pub fn primary(mut self, is_primary: bool) -> Self {
        self.is_primary = Some(is_primary);
        self
    }

    /// Builder: set last-modified timestamp
    pub fn modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_modified = Some(ts);
        self
    }
}

/// Field name under which association rows report their allocation
pub const ALLOCATION_FIELD: &str = "allocation_percentage";

impl Contribution for AssociationSourceRecord {
    fn source_system(&self) -> SourceSystem {
        self.source_system
    }

    fn natural_key(&self) -> &str {
        &self.source_key
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

// ============================================================================
// TESTS
// ============================================================================
