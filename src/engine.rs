// ⚙️ Consolidation Engine - one pure pass from input snapshot to output snapshot
//
//   cross-references → resolver → key index
//   source records   → partition by canonical id → resolve fields
//                    → quality checks → content hash
//   association rows → edges keyed by canonical ids
//
// No wall clock, no state carried between runs: the same snapshot and
// as-of date always give the same output.

use crate::consolidation::{resolve_fields, DerivationContext};
use crate::error::ConfigError;
use crate::fx::FxRateTable;
use crate::quality::{
    completeness_score, content_hash, flags_repr, normalize_flags, primary_flag, DataQualityFlag, QualityRating,
};
use crate::registry::{CompiledAssociationProfile, CompiledEntityProfile, CounterpartKind, StrategyRegistry};
use crate::relationships::{consolidate_associations, AssociationRecord};
use crate::source::{AssociationSourceRecord, AssociationType, EntityType, SourceRecord, SourceSystem};
use crate::value::FieldValue;
use crate::xref::{Confidence, CrossReferenceEntry, CrossReferenceResolver, KeyIndex, ResolvedReference, XrefResolution};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// Everything one run reads. Immutable for the duration of the run.
#[derive(Debug, Clone, Default)]
pub struct InputSnapshot {
    pub records: Vec<SourceRecord>,
    pub cross_references: Vec<CrossReferenceEntry>,
    pub associations: Vec<AssociationSourceRecord>,
}

/// Run parameters that must come from outside the engine
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    /// Snapshot date; ages and FX lookups are measured against it
    pub as_of: NaiveDate,
}

impl RunContext {
    pub fn new(as_of: NaiveDate) -> Self {
        RunContext { as_of }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceCoverage {
    MultiSource,
    SingleSource,
    /// No cross-reference at all: placeholder id
    SingleSourceOnly,
}

impl SourceCoverage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCoverage::MultiSource => "MULTI_SOURCE",
            SourceCoverage::SingleSource => "SINGLE_SOURCE",
            SourceCoverage::SingleSourceOnly => "SINGLE_SOURCE_ONLY",
        }
    }
}

/// One merged record per canonical id per entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub fields: BTreeMap<String, FieldValue>,

    // Diagnostics
    pub provenance: BTreeMap<String, String>,
    pub resolution_confidence: Confidence,
    pub source_coverage: SourceCoverage,
    pub source_systems: Vec<SourceSystem>,
    /// "CRM:C-1" style keys of every contributing row
    pub source_keys: Vec<String>,
    pub record_count: usize,

    // Quality
    pub completeness_score: f64,
    pub quality_rating: QualityRating,
    pub flags: Vec<DataQualityFlag>,
    pub data_quality_flag: Option<String>,
    pub content_hash: String,

    /// Earliest / latest last_modified of contributing rows
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalEntity {
    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(|v| v.as_str())
    }

    pub fn is_orphan(&self) -> bool {
        self.source_coverage == SourceCoverage::SingleSourceOnly
    }
}

/// Per-run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub entities_by_type: BTreeMap<EntityType, usize>,
    pub associations_by_type: BTreeMap<AssociationType, usize>,
    pub orphan_entities: usize,
    pub flagged_entities: usize,
    /// Rows with a blank source key (fatal category)
    pub dropped_records: usize,
    pub dropped_association_rows: usize,
    /// Association rows whose type has no registered profile
    pub unprofiled_association_rows: usize,
    pub unmapped_edges: usize,
    pub ambiguous_keys: usize,
    pub invalid_references: usize,
    /// References with zero source keys: reported, no entity produced
    pub excluded_references: usize,
}

impl RunSummary {
    pub fn entity_count(&self) -> usize {
        self.entities_by_type.values().sum()
    }

    pub fn association_count(&self) -> usize {
        self.associations_by_type.values().sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutput {
    /// Sorted by (entity type, id)
    pub entities: Vec<CanonicalEntity>,
    /// Sorted by (association type, entity id, counterpart)
    pub associations: Vec<AssociationRecord>,
    pub references: Vec<ResolvedReference>,
    pub summary: RunSummary,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ConsolidationEngine {
    registry: StrategyRegistry,
    entities: BTreeMap<EntityType, CompiledEntityProfile>,
    associations: BTreeMap<AssociationType, CompiledAssociationProfile>,
    fx: FxRateTable,
}

impl ConsolidationEngine {
    /// Validate the registry and compile every pattern up front
    pub fn new(registry: StrategyRegistry, fx: FxRateTable) -> Result<Self, ConfigError> {
        registry.validate()?;

        let entities = registry
            .entities
            .iter()
            .map(|(t, p)| p.compile().map(|c| (*t, c)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let associations = registry
            .associations
            .iter()
            .map(|(t, p)| p.compile().map(|c| (*t, c)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        info!(
            entity_profiles = entities.len(),
            association_profiles = associations.len(),
            fx_rates = fx.len(),
            "consolidation engine ready"
        );

        Ok(ConsolidationEngine {
            registry,
            entities,
            associations,
            fx,
        })
    }

    /// Engine with the built-in registry
    pub fn with_defaults(fx: FxRateTable) -> Result<Self, ConfigError> {
        Self::new(StrategyRegistry::with_defaults(), fx)
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn run(&self, input: &InputSnapshot, ctx: &RunContext) -> ConsolidationOutput {
        let mut output = ConsolidationOutput::default();
        let mut indexes: BTreeMap<EntityType, KeyIndex> = BTreeMap::new();

        for (entity_type, compiled) in &self.entities {
            let resolver = CrossReferenceResolver::new(&self.registry.confidence_synonyms, &compiled.id_pattern);
            let mut xref = resolver.resolve(*entity_type, &input.cross_references);
            xref.index.register_unmapped(self.key_references(*entity_type, input));

            let entities = self.consolidate_type(compiled, &xref, &input.records, ctx, &mut output.summary);

            output.summary.ambiguous_keys += xref.ambiguous_keys;
            output.summary.invalid_references += xref.references.iter().filter(|r| !r.flags.is_empty()).count();
            output.summary.excluded_references += xref.references.iter().filter(|r| !r.has_keys()).count();
            output.summary.entities_by_type.insert(*entity_type, entities.len());

            info!(
                entity_type = %entity_type,
                entities = entities.len(),
                references = xref.references.len(),
                ambiguous_keys = xref.ambiguous_keys,
                "entity type consolidated"
            );

            output.entities.extend(entities);
            output.references.extend(xref.references);
            indexes.insert(*entity_type, xref.index);
        }

        self.consolidate_relationships(input, ctx, &indexes, &mut output);

        output.summary.orphan_entities = output.entities.iter().filter(|e| e.is_orphan()).count();
        output.summary.flagged_entities = output.entities.iter().filter(|e| !e.flags.is_empty()).count();

        info!(
            entities = output.summary.entity_count(),
            associations = output.summary.association_count(),
            orphans = output.summary.orphan_entities,
            flagged = output.summary.flagged_entities,
            dropped = output.summary.dropped_records,
            "consolidation run complete"
        );
        output
    }

    /// Partition one entity type's rows by canonical id and build each entity
    fn consolidate_type(
        &self,
        compiled: &CompiledEntityProfile,
        xref: &XrefResolution,
        records: &[SourceRecord],
        ctx: &RunContext,
        summary: &mut RunSummary,
    ) -> Vec<CanonicalEntity> {
        let entity_type = compiled.profile.entity_type;
        let mut partitions: BTreeMap<String, Vec<&SourceRecord>> = BTreeMap::new();
        let mut orphans: BTreeSet<String> = BTreeSet::new();

        for record in records.iter().filter(|r| r.entity_type == entity_type) {
            if !record.has_key() {
                warn!(
                    entity_type = %entity_type,
                    system = %record.source_system,
                    "source record without a key, no canonical id derivable; dropped"
                );
                summary.dropped_records += 1;
                continue;
            }

            let (canonical_id, unmapped) = xref
                .index
                .canonical_or_placeholder(entity_type, record.source_system, &record.source_key);
            if unmapped {
                debug!(
                    system = %record.source_system,
                    key = %record.source_key,
                    placeholder = %canonical_id,
                    "no cross-reference, using placeholder id"
                );
                orphans.insert(canonical_id.clone());
            }
            partitions.entry(canonical_id).or_default().push(record);
        }

        let ctx = DerivationContext {
            categories: &compiled.profile.categories,
            scorecards: &compiled.profile.scorecards,
            fx: &self.fx,
            as_of: ctx.as_of,
        };

        partitions
            .into_iter()
            .map(|(id, rows)| {
                let reference = if orphans.contains(&id) {
                    None
                } else {
                    xref.reference(&id)
                };
                build_entity(compiled, id, reference, &rows, &ctx)
            })
            .collect()
    }

    /// Every (system, key) in the snapshot that names an entity of this type:
    /// its own rows plus both sides of the association rows
    fn key_references<'i>(
        &self,
        entity_type: EntityType,
        input: &'i InputSnapshot,
    ) -> Vec<(SourceSystem, &'i str)> {
        let mut refs: Vec<(SourceSystem, &'i str)> = input
            .records
            .iter()
            .filter(|r| r.entity_type == entity_type)
            .map(|r| (r.source_system, r.source_key.as_str()))
            .collect();

        for row in &input.associations {
            let Some(compiled) = self.associations.get(&row.association_type) else {
                continue;
            };
            if compiled.profile.entity_type == entity_type {
                refs.push((row.source_system, row.entity_key.as_str()));
            }
            if let CounterpartKind::Entity { entity_type: t } = &compiled.profile.counterpart {
                if *t == entity_type {
                    refs.push((row.source_system, row.counterpart.as_str()));
                }
            }
        }
        refs
    }

    fn consolidate_relationships(
        &self,
        input: &InputSnapshot,
        ctx: &RunContext,
        indexes: &BTreeMap<EntityType, KeyIndex>,
        output: &mut ConsolidationOutput,
    ) {
        let mut by_type: BTreeMap<AssociationType, Vec<&AssociationSourceRecord>> = BTreeMap::new();
        for row in &input.associations {
            by_type.entry(row.association_type).or_default().push(row);
        }

        let empty = KeyIndex::default();
        for (association_type, rows) in by_type {
            let compiled = match self.associations.get(&association_type) {
                Some(c) => c,
                None => {
                    warn!(
                        association_type = %association_type,
                        rows = rows.len(),
                        "no association profile registered, rows skipped"
                    );
                    output.summary.unprofiled_association_rows += rows.len();
                    continue;
                }
            };

            let entity_index = indexes.get(&compiled.profile.entity_type).unwrap_or(&empty);
            let counterpart_index = match &compiled.profile.counterpart {
                CounterpartKind::Entity { entity_type } => Some(indexes.get(entity_type).unwrap_or(&empty)),
                CounterpartKind::Category { .. } => None,
            };
            let derive_ctx = DerivationContext {
                categories: &compiled.profile.categories,
                scorecards: &compiled.profile.scorecards,
                fx: &self.fx,
                as_of: ctx.as_of,
            };

            let batch = consolidate_associations(compiled, &rows, entity_index, counterpart_index, &derive_ctx);
            output.summary.dropped_association_rows += batch.dropped_rows;
            output.summary.unmapped_edges += batch.unmapped_edges;
            output
                .summary
                .associations_by_type
                .insert(association_type, batch.records.len());
            output.associations.extend(batch.records);
        }
    }
}

/// Resolve, check and fingerprint one canonical entity
fn build_entity(
    compiled: &CompiledEntityProfile,
    id: String,
    reference: Option<&ResolvedReference>,
    rows: &[&SourceRecord],
    ctx: &DerivationContext,
) -> CanonicalEntity {
    let profile = &compiled.profile;
    let resolution = resolve_fields(&profile.rules, rows, ctx);
    let fields = resolution.fields;
    let mut flags = resolution.flags;

    let source_systems: BTreeSet<SourceSystem> = rows.iter().map(|r| r.source_system).collect();
    let mut source_keys: Vec<String> = rows
        .iter()
        .map(|r| format!("{}:{}", r.source_system.code(), r.source_key.trim()))
        .collect();
    source_keys.sort();
    source_keys.dedup();

    let (confidence, coverage) = match reference {
        Some(r) => {
            flags.extend(r.flags.iter().cloned());
            let coverage = if source_systems.len() >= 2 {
                SourceCoverage::MultiSource
            } else {
                SourceCoverage::SingleSource
            };
            (r.confidence, coverage)
        }
        None => {
            flags.push(DataQualityFlag::MissingCrossReference);
            (Confidence::Unknown, SourceCoverage::SingleSourceOnly)
        }
    };

    flags.extend(compiled.format_checks.iter().filter_map(|c| c.check(&fields)));
    flags.extend(profile.variance_checks.iter().filter_map(|c| c.check(&fields)));
    normalize_flags(&mut flags);

    let completeness = completeness_score(&fields, &profile.required_fields);
    let rating = profile.quality_grid.rate(confidence, completeness);
    let hash = content_hash(
        &id,
        profile.entity_type.as_str(),
        &fields,
        &[
            ("resolution_confidence", confidence.as_str().to_string()),
            ("source_coverage", coverage.as_str().to_string()),
            ("completeness_score", completeness.to_string()),
            ("quality_rating", rating.as_str().to_string()),
            ("flags", flags_repr(&flags)),
        ],
    );

    debug!(
        id = %id,
        rows = rows.len(),
        completeness = completeness,
        rating = rating.as_str(),
        "entity consolidated"
    );

    CanonicalEntity {
        data_quality_flag: primary_flag(&flags).map(|f| f.to_string()),
        created_at: rows.iter().filter_map(|r| r.last_modified).min(),
        updated_at: rows.iter().filter_map(|r| r.last_modified).max(),
        id,
        entity_type: profile.entity_type,
        fields,
        provenance: resolution.provenance,
        resolution_confidence: confidence,
        source_coverage: coverage,
        source_systems: source_systems.into_iter().collect(),
        source_keys,
        record_count: rows.len(),
        completeness_score: completeness,
        quality_rating: rating,
        flags,
        content_hash: hash,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn as_of() -> RunContext {
        RunContext::new(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap())
    }

    fn engine() -> ConsolidationEngine {
        ConsolidationEngine::with_defaults(FxRateTable::new()).unwrap()
    }

    #[test]
    fn test_blank_key_dropped_and_counted() {
        let input = InputSnapshot {
            records: vec![
                SourceRecord::new(EntityType::Company, SourceSystem::Crm, "  ").with("name", "Ghost"),
                SourceRecord::new(EntityType::Company, SourceSystem::Crm, "C-1").with("name", "Real"),
            ],
            ..Default::default()
        };
        let out = engine().run(&input, &as_of());
        assert_eq!(out.summary.dropped_records, 1);
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].id, "COMP-UNKNOWN-C-1");
    }

    #[test]
    fn test_same_unmapped_key_in_two_systems_stays_apart() {
        let input = InputSnapshot {
            records: vec![
                SourceRecord::new(EntityType::Company, SourceSystem::Crm, "1001").with("name", "Alpha Ltd"),
                SourceRecord::new(EntityType::Company, SourceSystem::PortfolioManagement, "1001")
                    .with("name", "Beta GmbH"),
            ],
            associations: vec![AssociationSourceRecord::new(
                AssociationType::CompanyIndustry,
                SourceSystem::PortfolioManagement,
                "r1",
                "1001",
                "LOGISTICS",
            )
            .allocation(100.0)],
            ..Default::default()
        };
        let out = engine().run(&input, &as_of());

        assert_eq!(out.entities.len(), 2);
        assert_eq!(out.summary.orphan_entities, 2);
        let alpha = out.entities.iter().find(|e| e.id == "COMP-UNKNOWN-CRM-1001").unwrap();
        let beta = out.entities.iter().find(|e| e.id == "COMP-UNKNOWN-PM-1001").unwrap();
        assert_eq!(alpha.name(), Some("Alpha Ltd"));
        assert_eq!(beta.name(), Some("Beta GmbH"));
        assert_eq!(alpha.record_count, 1);
        assert_eq!(beta.source_systems, vec![SourceSystem::PortfolioManagement]);

        // The edge lands on the entity of the system that reported it
        assert_eq!(out.associations.len(), 1);
        assert_eq!(out.associations[0].entity_id, "COMP-UNKNOWN-PM-1001");
    }

    #[test]
    fn test_hash_follows_reference_confidence() {
        let input = |label: &str| InputSnapshot {
            records: vec![SourceRecord::new(EntityType::Company, SourceSystem::Crm, "C-1").with("name", "Acme Inc")],
            cross_references: vec![CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0001", label)
                .key(SourceSystem::Crm, "C-1")],
            ..Default::default()
        };
        let high = engine().run(&input("HIGH"), &as_of());
        let weak = engine().run(&input("WEAK"), &as_of());

        assert_eq!(high.entities[0].fields, weak.entities[0].fields);
        assert_ne!(high.entities[0].quality_rating, weak.entities[0].quality_rating);
        assert_ne!(high.entities[0].content_hash, weak.entities[0].content_hash);
    }

    #[test]
    fn test_zero_key_reference_produces_no_entity() {
        let input = InputSnapshot {
            cross_references: vec![CrossReferenceEntry::new(EntityType::Fund, "FUND-CANON-0001", "HIGH")],
            ..Default::default()
        };
        let out = engine().run(&input, &as_of());
        assert!(out.entities.is_empty());
        assert_eq!(out.summary.excluded_references, 1);
        assert_eq!(out.references.len(), 1);
    }

    #[test]
    fn test_invalid_id_entity_flagged_low_quality() {
        let input = InputSnapshot {
            records: vec![SourceRecord::new(EntityType::Investor, SourceSystem::Crm, "I-1").with("name", "Pension Plan")],
            cross_references: vec![CrossReferenceEntry::new(EntityType::Investor, "INV-42", "HIGH")
                .key(SourceSystem::Crm, "I-1")],
            ..Default::default()
        };
        let out = engine().run(&input, &as_of());
        let entity = &out.entities[0];
        assert_eq!(entity.id, "INV-42");
        assert!(entity.flags.contains(&DataQualityFlag::LowQuality));
        assert_eq!(entity.data_quality_flag.as_deref(), Some("INVALID_FORMAT(canonical_id)"));
        assert_eq!(out.summary.invalid_references, 1);
    }

    #[test]
    fn test_unprofiled_association_rows_counted() {
        let mut registry = StrategyRegistry::with_defaults();
        registry.associations.remove(&AssociationType::FundInvestor);
        let engine = ConsolidationEngine::new(registry, FxRateTable::new()).unwrap();

        let input = InputSnapshot {
            associations: vec![AssociationSourceRecord::new(
                AssociationType::FundInvestor,
                SourceSystem::FundAdministration,
                "L-1",
                "F-1",
                "I-1",
            )],
            ..Default::default()
        };
        let out = engine.run(&input, &as_of());
        assert!(out.associations.is_empty());
        assert_eq!(out.summary.unprofiled_association_rows, 1);
    }

    #[test]
    fn test_engine_rejects_invalid_registry() {
        let mut registry = StrategyRegistry::with_defaults();
        if let Some(p) = registry.entities.get_mut(&EntityType::Company) {
            p.canonical_id_pattern = "[".to_string();
        }
        assert!(ConsolidationEngine::new(registry, FxRateTable::new()).is_err());
    }
}
