// 🏛️ Strategy Registry - one table drives every entity type
// entity type → required fields, resolution rules, threshold tables,
// scorecards and quality grid. The engine has a single code path; only
// this data differs between companies, funds, investors and counterparties.

use crate::consolidation::{Derivation, FieldRule, Strategy};
use crate::entities;
use crate::error::ConfigError;
use crate::quality::{CompiledFormatCheck, FormatCheck, QualityGrid, VarianceCheck};
use crate::rules::{CategoryTable, Scorecard};
use crate::source::{AssociationType, EntityType, SourceSystem, ALLOCATION_FIELD};
use crate::value::FieldKind;
use crate::xref::ConfidenceSynonyms;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Field written on association records before risk / significance tables run
pub const IS_PRIMARY_FIELD: &str = "is_primary";
pub const COUNTERPART_FIELD: &str = "counterpart";

// ============================================================================
// ENTITY PROFILE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_type: EntityType,

    /// Valid canonical ids for this type
    pub canonical_id_pattern: String,

    /// Fields counted by the completeness score
    pub required_fields: Vec<String>,

    /// Declared kind of source columns; undeclared columns are text
    #[serde(default)]
    pub field_types: BTreeMap<String, FieldKind>,

    /// Resolved in order; derived rules only see earlier fields
    pub rules: Vec<FieldRule>,

    #[serde(default)]
    pub categories: BTreeMap<String, CategoryTable>,

    #[serde(default)]
    pub scorecards: BTreeMap<String, Scorecard>,

    #[serde(default)]
    pub quality_grid: QualityGrid,

    #[serde(default)]
    pub format_checks: Vec<FormatCheck>,

    #[serde(default)]
    pub variance_checks: Vec<VarianceCheck>,
}

impl EntityProfile {
    pub fn new(entity_type: EntityType) -> Self {
        EntityProfile {
            entity_type,
            canonical_id_pattern: format!("^{}-CANON-[0-9]{{4,}}$", entity_type.id_prefix()),
            required_fields: Vec::new(),
            field_types: BTreeMap::new(),
            rules: Vec::new(),
            categories: BTreeMap::new(),
            scorecards: BTreeMap::new(),
            quality_grid: QualityGrid::default(),
            format_checks: Vec::new(),
            variance_checks: Vec::new(),
        }
    }

    /// Builder: required fields for completeness
    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Builder: declare source column kinds
    pub fn with_types(mut self, kind: FieldKind, columns: &[&str]) -> Self {
        for column in columns {
            self.field_types.insert(column.to_string(), kind);
        }
        self
    }

    /// Builder: append a resolution rule
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Builder: register a named category table
    pub fn with_category(mut self, name: &str, table: CategoryTable) -> Self {
        self.categories.insert(name.to_string(), table);
        self
    }

    /// Builder: register a named scorecard
    pub fn with_scorecard(mut self, name: &str, card: Scorecard) -> Self {
        self.scorecards.insert(name.to_string(), card);
        self
    }

    pub fn with_format_check(mut self, field: &str, pattern: &str) -> Self {
        self.format_checks.push(FormatCheck::new(field, pattern));
        self
    }

    pub fn with_variance_check(mut self, derived: &str, reported: &str, tolerance: f64) -> Self {
        self.variance_checks.push(VarianceCheck::new(derived, reported, tolerance));
        self
    }

    pub fn field_kind(&self, column: &str) -> FieldKind {
        self.field_types.get(column).copied().unwrap_or_default()
    }

    pub fn owner(&self) -> String {
        format!("{} profile", self.entity_type)
    }

    /// All fields the rules write, in order
    pub fn output_fields(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.outputs()).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let owner = self.owner();
        compile_pattern(&owner, &self.canonical_id_pattern)?;
        for check in &self.format_checks {
            compile_pattern(&owner, &check.pattern)?;
        }

        let produced = validate_rules(&owner, &self.rules, &self.categories, &self.scorecards, BTreeSet::new())?;

        for field in self
            .required_fields
            .iter()
            .chain(self.variance_checks.iter().flat_map(|v| [&v.derived, &v.reported]))
            .chain(self.format_checks.iter().map(|c| &c.field))
        {
            if !produced.contains(field) {
                return Err(ConfigError::UnknownField {
                    owner: owner.clone(),
                    field: field.clone(),
                });
            }
        }

        if !self.quality_grid.is_ordered() {
            return Err(ConfigError::UnorderedQualityGrid { owner });
        }
        Ok(())
    }

    /// Validate and compile regexes once, before any run
    pub fn compile(&self) -> Result<CompiledEntityProfile, ConfigError> {
        self.validate()?;
        let owner = self.owner();
        let format_checks = self
            .format_checks
            .iter()
            .map(|check| {
                check.compile().map_err(|source| ConfigError::InvalidPattern {
                    owner: owner.clone(),
                    pattern: check.pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledEntityProfile {
            id_pattern: compile_pattern(&owner, &self.canonical_id_pattern)?,
            format_checks,
            profile: self.clone(),
        })
    }
}

/// Profile with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledEntityProfile {
    pub profile: EntityProfile,
    pub id_pattern: Regex,
    pub format_checks: Vec<CompiledFormatCheck>,
}

// ============================================================================
// ASSOCIATION PROFILE
// ============================================================================

/// What sits on side B of an association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterpartKind {
    /// Another canonical entity, resolved through its cross-reference index
    Entity { entity_type: EntityType },
    /// A category value (industry, country code), trimmed and upper-cased
    Category {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationProfile {
    pub association_type: AssociationType,

    /// Owning side (A)
    pub entity_type: EntityType,

    pub counterpart: CounterpartKind,

    /// Declared source order for primary selection
    pub source_priority: Vec<SourceSystem>,

    #[serde(default)]
    pub field_types: BTreeMap<String, FieldKind>,

    #[serde(default)]
    pub rules: Vec<FieldRule>,

    #[serde(default)]
    pub categories: BTreeMap<String, CategoryTable>,

    #[serde(default)]
    pub scorecards: BTreeMap<String, Scorecard>,

    /// Runs after allocation and primary flag are known
    pub risk_table: CategoryTable,
    pub significance_table: CategoryTable,
}

impl AssociationProfile {
    pub fn new(
        association_type: AssociationType,
        entity_type: EntityType,
        counterpart: CounterpartKind,
        source_priority: &[SourceSystem],
    ) -> Self {
        AssociationProfile {
            association_type,
            entity_type,
            counterpart,
            source_priority: source_priority.to_vec(),
            field_types: BTreeMap::new(),
            rules: Vec::new(),
            categories: BTreeMap::new(),
            scorecards: BTreeMap::new(),
            risk_table: CategoryTable::category("UNKNOWN"),
            significance_table: CategoryTable::category("UNKNOWN"),
        }
    }

    pub fn with_types(mut self, kind: FieldKind, columns: &[&str]) -> Self {
        for column in columns {
            self.field_types.insert(column.to_string(), kind);
        }
        self
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_risk_table(mut self, table: CategoryTable) -> Self {
        self.risk_table = table;
        self
    }

    pub fn with_significance_table(mut self, table: CategoryTable) -> Self {
        self.significance_table = table;
        self
    }

    pub fn field_kind(&self, column: &str) -> FieldKind {
        if column == ALLOCATION_FIELD {
            return FieldKind::Number;
        }
        self.field_types.get(column).copied().unwrap_or_default()
    }

    /// Rank of a source in the declared order; unlisted sources rank last
    pub fn source_rank(&self, system: SourceSystem) -> usize {
        self.source_priority
            .iter()
            .position(|s| *s == system)
            .unwrap_or(self.source_priority.len())
    }

    pub fn owner(&self) -> String {
        format!("{} association", self.association_type)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let owner = self.owner();
        if let CounterpartKind::Category {
            pattern: Some(pattern),
        } = &self.counterpart
        {
            compile_pattern(&owner, pattern)?;
        }

        let mut produced = validate_rules(&owner, &self.rules, &self.categories, &self.scorecards, BTreeSet::new())?;
        produced.insert(ALLOCATION_FIELD.to_string());
        produced.insert(IS_PRIMARY_FIELD.to_string());
        produced.insert(COUNTERPART_FIELD.to_string());

        for (name, table) in [("risk_table", &self.risk_table), ("significance_table", &self.significance_table)] {
            if let Some(missing) = table.fields_read().into_iter().find(|f| !produced.contains(*f)) {
                return Err(ConfigError::ForwardReference {
                    owner: owner.clone(),
                    field: name.to_string(),
                    reference: missing.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn compile(&self) -> Result<CompiledAssociationProfile, ConfigError> {
        self.validate()?;
        let counterpart_pattern = match &self.counterpart {
            CounterpartKind::Category {
                pattern: Some(pattern),
            } => Some(compile_pattern(&self.owner(), pattern)?),
            _ => None,
        };
        Ok(CompiledAssociationProfile {
            profile: self.clone(),
            counterpart_pattern,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledAssociationProfile {
    pub profile: AssociationProfile,
    pub counterpart_pattern: Option<Regex>,
}

// ============================================================================
// VALIDATION HELPERS
// ============================================================================

fn compile_pattern(owner: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        owner: owner.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

/// Walk rules in order; every derived input must already be produced.
/// Returns the set of produced fields.
fn validate_rules(
    owner: &str,
    rules: &[FieldRule],
    categories: &BTreeMap<String, CategoryTable>,
    scorecards: &BTreeMap<String, Scorecard>,
    mut produced: BTreeSet<String>,
) -> Result<BTreeSet<String>, ConfigError> {
    for (name, card) in scorecards {
        if let Some(component) = card.components.iter().find(|c| c.weight < 0.0) {
            return Err(ConfigError::NegativeWeight {
                owner: owner.to_string(),
                scorecard: name.clone(),
                component: component.name.clone(),
            });
        }
    }

    for rule in rules {
        if let Strategy::Derived { derivation } = &rule.strategy {
            let mut reads: Vec<&str> = derivation.operands();
            match derivation {
                Derivation::Category { table } => match categories.get(table) {
                    Some(t) => reads.extend(t.fields_read()),
                    None => {
                        return Err(ConfigError::UnknownTable {
                            owner: owner.to_string(),
                            field: rule.field.clone(),
                            kind: "category table",
                            name: table.clone(),
                        })
                    }
                },
                Derivation::Score { scorecard } => match scorecards.get(scorecard) {
                    Some(card) => reads.extend(card.fields_read()),
                    None => {
                        return Err(ConfigError::UnknownTable {
                            owner: owner.to_string(),
                            field: rule.field.clone(),
                            kind: "scorecard",
                            name: scorecard.clone(),
                        })
                    }
                },
                _ => {}
            }

            if let Some(missing) = reads.into_iter().find(|f| !produced.contains(*f)) {
                return Err(ConfigError::ForwardReference {
                    owner: owner.to_string(),
                    field: rule.field.clone(),
                    reference: missing.to_string(),
                });
            }
        }

        for output in rule.outputs() {
            if !produced.insert(output.clone()) {
                return Err(ConfigError::DuplicateField {
                    owner: owner.to_string(),
                    field: output,
                });
            }
        }
    }

    Ok(produced)
}

// ============================================================================
// REGISTRY
// ============================================================================

/// All configuration a run needs, serializable as one JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRegistry {
    pub entities: BTreeMap<EntityType, EntityProfile>,

    #[serde(default)]
    pub associations: BTreeMap<AssociationType, AssociationProfile>,

    #[serde(default)]
    pub confidence_synonyms: ConfidenceSynonyms,
}

impl StrategyRegistry {
    /// Empty registry (no profiles)
    pub fn new() -> Self {
        StrategyRegistry {
            entities: BTreeMap::new(),
            associations: BTreeMap::new(),
            confidence_synonyms: ConfidenceSynonyms::default(),
        }
    }

    /// Registry seeded with the built-in profiles
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_entity(entities::company::profile());
        registry.register_entity(entities::fund::profile());
        registry.register_entity(entities::investor::profile());
        registry.register_entity(entities::counterparty::profile());
        for profile in entities::associations::profiles() {
            registry.register_association(profile);
        }
        registry
    }

    /// Load a registry from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the registry as editable JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn register_entity(&mut self, profile: EntityProfile) {
        self.entities.insert(profile.entity_type, profile);
    }

    pub fn register_association(&mut self, profile: AssociationProfile) {
        self.associations.insert(profile.association_type, profile);
    }

    pub fn entity(&self, entity_type: EntityType) -> Option<&EntityProfile> {
        self.entities.get(&entity_type)
    }

    pub fn association(&self, association_type: AssociationType) -> Option<&AssociationProfile> {
        self.associations.get(&association_type)
    }

    /// Every entity type needs a profile; association profiles are optional
    /// but must point at registered entity types. A profile must sit under
    /// its own type's key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, profile) in &self.entities {
            if *key != profile.entity_type {
                return Err(ConfigError::MismatchedProfile {
                    key: key.to_string(),
                    declared: profile.entity_type.to_string(),
                });
            }
        }
        for (key, profile) in &self.associations {
            if *key != profile.association_type {
                return Err(ConfigError::MismatchedProfile {
                    key: key.to_string(),
                    declared: profile.association_type.to_string(),
                });
            }
        }

        for entity_type in EntityType::ALL {
            self.entity(entity_type)
                .ok_or_else(|| ConfigError::MissingProfile(entity_type.to_string()))?
                .validate()?;
        }

        for profile in self.associations.values() {
            profile.validate()?;
            if let CounterpartKind::Entity { entity_type } = profile.counterpart {
                self.entity(entity_type)
                    .ok_or_else(|| ConfigError::MissingProfile(entity_type.to_string()))?;
            }
        }
        Ok(())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::Reducer;
    use crate::rules::Condition;

    #[test]
    fn test_default_registry_is_valid() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.entities.len(), 4);
        assert_eq!(registry.associations.len(), 4);
        registry.validate().unwrap();
    }

    #[test]
    fn test_profile_under_wrong_key_rejected() {
        let mut registry = StrategyRegistry::with_defaults();
        let fund = registry.entities[&EntityType::Fund].clone();
        registry.entities.insert(EntityType::Investor, fund);
        assert!(matches!(
            registry.validate(),
            Err(ConfigError::MismatchedProfile { ref key, ref declared }) if key == "investor" && declared == "fund"
        ));

        let mut registry = StrategyRegistry::with_defaults();
        let geography = registry.associations[&AssociationType::CompanyGeography].clone();
        registry.associations.insert(AssociationType::CompanyIndustry, geography);
        assert!(matches!(registry.validate(), Err(ConfigError::MismatchedProfile { .. })));
    }

    #[test]
    fn test_json_round_trip_preserves_profiles() {
        let registry = StrategyRegistry::with_defaults();
        let json = registry.to_json().unwrap();
        let loaded = StrategyRegistry::from_json(&json).unwrap();
        loaded.validate().unwrap();
        for (entity_type, profile) in &registry.entities {
            let reloaded = loaded.entity(*entity_type).unwrap();
            assert_eq!(reloaded.rules, profile.rules);
            assert_eq!(reloaded.required_fields, profile.required_fields);
        }
        assert_eq!(loaded.associations.len(), registry.associations.len());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let profile = EntityProfile::new(EntityType::Company)
            .with_rule(FieldRule::derived(
                "margin",
                Derivation::Ratio {
                    numerator: "ebitda".to_string(),
                    denominator: "revenue".to_string(),
                },
            ))
            .with_rule(FieldRule::priority("ebitda", &[SourceSystem::Crm]))
            .with_rule(FieldRule::priority("revenue", &[SourceSystem::Crm]));

        match profile.validate() {
            Err(ConfigError::ForwardReference { field, reference, .. }) => {
                assert_eq!(field, "margin");
                assert_eq!(reference, "ebitda");
            }
            other => panic!("expected forward reference, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_table_and_duplicate_rejected() {
        let profile = EntityProfile::new(EntityType::Fund)
            .with_rule(FieldRule::derived("tier", Derivation::Category { table: "nope".to_string() }));
        assert!(matches!(profile.validate(), Err(ConfigError::UnknownTable { .. })));

        let profile = EntityProfile::new(EntityType::Fund)
            .with_rule(FieldRule::priority("name", &[SourceSystem::Crm]))
            .with_rule(FieldRule::aggregate("name", Reducer::Count));
        assert!(matches!(profile.validate(), Err(ConfigError::DuplicateField { .. })));
    }

    #[test]
    fn test_category_reading_later_field_rejected() {
        let profile = EntityProfile::new(EntityType::Investor)
            .with_category(
                "tier",
                CategoryTable::category("SMALL").bucket(Condition::gte("aum", 1.0e9), "LARGE"),
            )
            .with_rule(FieldRule::derived("tier", Derivation::Category { table: "tier".to_string() }))
            .with_rule(FieldRule::priority("aum", &[SourceSystem::Crm]));
        assert!(matches!(profile.validate(), Err(ConfigError::ForwardReference { .. })));
    }

    #[test]
    fn test_bad_pattern_and_required_field_rejected() {
        let mut profile = EntityProfile::new(EntityType::Counterparty)
            .with_rule(FieldRule::priority("name", &[SourceSystem::Accounting]));
        profile.canonical_id_pattern = "^(CPTY".to_string();
        assert!(matches!(profile.validate(), Err(ConfigError::InvalidPattern { .. })));

        let profile = EntityProfile::new(EntityType::Counterparty)
            .with_required(&["name", "rating"])
            .with_rule(FieldRule::priority("name", &[SourceSystem::Accounting]));
        assert!(matches!(profile.validate(), Err(ConfigError::UnknownField { .. })));
    }

    #[test]
    fn test_missing_entity_profile_rejected() {
        let mut registry = StrategyRegistry::with_defaults();
        registry.entities.remove(&EntityType::Counterparty);
        assert!(matches!(registry.validate(), Err(ConfigError::MissingProfile(_))));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let profile = EntityProfile::new(EntityType::Company)
            .with_rule(FieldRule::priority("revenue", &[SourceSystem::Crm]))
            .with_scorecard(
                "bad",
                Scorecard::new().component("size", -1.0, crate::rules::RuleTable::new(0.0)),
            );
        assert!(matches!(profile.validate(), Err(ConfigError::NegativeWeight { .. })));
    }

    #[test]
    fn test_source_rank() {
        let registry = StrategyRegistry::with_defaults();
        let profile = registry.association(AssociationType::CompanyIndustry).unwrap();
        assert_eq!(profile.source_rank(SourceSystem::Crm), 0);
        assert_eq!(profile.source_rank(SourceSystem::Accounting), profile.source_priority.len());
    }
}
