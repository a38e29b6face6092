// 🕸️ Relationship Consolidation
// Builds association edges (entity ↔ entity, entity ↔ category) with the same
// resolution primitives as entities: summed-and-capped allocation, one primary
// edge per (entity, association type), rule-table risk and significance.

use crate::consolidation::{resolve_fields, DerivationContext};
use crate::quality::{content_hash, flags_repr, normalize_flags, primary_flag, DataQualityFlag};
use crate::registry::{CompiledAssociationProfile, CounterpartKind, COUNTERPART_FIELD, IS_PRIMARY_FIELD};
use crate::source::{AssociationSourceRecord, AssociationType, Contribution, SourceSystem, ALLOCATION_FIELD};
use crate::value::{round2, FieldValue};
use crate::xref::KeyIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const RISK_FIELD: &str = "risk_category";
pub const SIGNIFICANCE_FIELD: &str = "significance_category";

/// One consolidated edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub association_type: AssociationType,

    /// Canonical id of side A
    pub entity_id: String,

    /// Canonical id of side B, or the normalized category value
    pub counterpart_id: String,

    /// Always within [0, 100]
    pub allocation_percentage: f64,
    pub is_primary: bool,
    pub risk_category: String,
    pub significance_category: String,

    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: BTreeMap<String, String>,
    pub source_systems: Vec<SourceSystem>,
    pub record_count: usize,
    pub flags: Vec<DataQualityFlag>,
    pub data_quality_flag: Option<String>,
    pub content_hash: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AssociationRecord {
    /// Identity string fed to the hasher and used as the storage key
    pub fn edge_key(&self) -> String {
        edge_key(&self.entity_id, &self.counterpart_id)
    }
}

fn edge_key(entity_id: &str, counterpart_id: &str) -> String {
    format!("{}|{}", entity_id, counterpart_id)
}

/// Output of one association type
#[derive(Debug, Clone, Default)]
pub struct AssociationBatch {
    pub records: Vec<AssociationRecord>,
    /// Rows with no entity key or no counterpart (fatal category)
    pub dropped_rows: usize,
    /// Edges whose side A or side B had no cross-reference
    pub unmapped_edges: usize,
}

#[derive(Default)]
struct EdgeGroup<'a> {
    rows: Vec<&'a AssociationSourceRecord>,
    missing_xref: bool,
}

/// Consolidate all rows of one association type
pub fn consolidate_associations(
    compiled: &CompiledAssociationProfile,
    rows: &[&AssociationSourceRecord],
    entity_index: &KeyIndex,
    counterpart_index: Option<&KeyIndex>,
    ctx: &DerivationContext,
) -> AssociationBatch {
    let profile = &compiled.profile;
    let mut batch = AssociationBatch::default();
    let mut groups: BTreeMap<(String, String), EdgeGroup> = BTreeMap::new();

    for row in rows.iter().copied().filter(|r| r.association_type == profile.association_type) {
        let entity_key = row.entity_key.trim();
        let counterpart_raw = row.counterpart.trim();
        if entity_key.is_empty() || counterpart_raw.is_empty() {
            warn!(
                association_type = %profile.association_type,
                system = %row.source_system,
                source_key = %row.source_key,
                "association row has no entity key or counterpart, dropped"
            );
            batch.dropped_rows += 1;
            continue;
        }

        let (entity_id, entity_unmapped) =
            entity_index.canonical_or_placeholder(profile.entity_type, row.source_system, entity_key);

        let (counterpart_id, counterpart_unmapped) = match &profile.counterpart {
            CounterpartKind::Category { .. } => (counterpart_raw.to_uppercase(), false),
            CounterpartKind::Entity { entity_type } => match counterpart_index {
                Some(idx) => idx.canonical_or_placeholder(*entity_type, row.source_system, counterpart_raw),
                None => (entity_type.placeholder_id(counterpart_raw), true),
            },
        };

        let group = groups.entry((entity_id, counterpart_id)).or_default();
        group.rows.push(row);
        group.missing_xref |= entity_unmapped || counterpart_unmapped;
    }

    let mut records: Vec<AssociationRecord> = Vec::with_capacity(groups.len());
    let mut ranks: Vec<usize> = Vec::with_capacity(groups.len());
    let mut hinted: Vec<bool> = Vec::with_capacity(groups.len());

    for ((entity_id, counterpart_id), group) in groups {
        if group.missing_xref {
            batch.unmapped_edges += 1;
        }
        ranks.push(
            group
                .rows
                .iter()
                .map(|r| profile.source_rank(r.source_system))
                .min()
                .unwrap_or(usize::MAX),
        );
        hinted.push(group.rows.iter().any(|r| r.is_primary == Some(true)));
        records.push(build_record(compiled, entity_id, counterpart_id, &group, ctx));
    }

    assign_primary(&mut records, &ranks, &hinted);

    for record in &mut records {
        finish_record(compiled, record);
    }

    debug!(
        association_type = %profile.association_type,
        records = records.len(),
        dropped = batch.dropped_rows,
        "associations consolidated"
    );
    batch.records = records;
    batch
}

/// Resolve attributes and allocation for one edge (primary flag comes later)
fn build_record(
    compiled: &CompiledAssociationProfile,
    entity_id: String,
    counterpart_id: String,
    group: &EdgeGroup,
    ctx: &DerivationContext,
) -> AssociationRecord {
    let profile = &compiled.profile;
    let resolution = resolve_fields(&profile.rules, &group.rows, ctx);
    let mut fields = resolution.fields;
    let mut provenance = resolution.provenance;
    let mut flags = resolution.flags;

    // Sum every reported allocation, then cap
    let mut ordered = group.rows.clone();
    ordered.sort_by(|a, b| {
        (a.source_system, &a.source_key).cmp(&(b.source_system, &b.source_key))
    });
    let reported: Vec<f64> = ordered
        .iter()
        .filter_map(|r| r.value(ALLOCATION_FIELD).and_then(|v| v.as_f64()))
        .collect();
    let allocation_percentage = if reported.is_empty() {
        flags.push(DataQualityFlag::MissingAllocation);
        0.0
    } else {
        provenance.insert(
            ALLOCATION_FIELD.to_string(),
            format!("AGGREGATE:SUM({})", reported.len()),
        );
        round2(reported.iter().sum::<f64>().clamp(0.0, 100.0))
    };

    if group.missing_xref {
        flags.push(DataQualityFlag::MissingCrossReference);
    }
    if let Some(pattern) = &compiled.counterpart_pattern {
        if !pattern.is_match(&counterpart_id) {
            flags.push(DataQualityFlag::InvalidFormat(COUNTERPART_FIELD.to_string()));
        }
    }

    fields.insert(ALLOCATION_FIELD.to_string(), FieldValue::Number(allocation_percentage));
    fields.insert(COUNTERPART_FIELD.to_string(), FieldValue::text(counterpart_id.clone()));

    let source_systems: BTreeSet<SourceSystem> = group.rows.iter().map(|r| r.source_system).collect();

    AssociationRecord {
        association_type: profile.association_type,
        entity_id,
        counterpart_id,
        allocation_percentage,
        is_primary: false,
        risk_category: String::new(),
        significance_category: String::new(),
        fields,
        provenance,
        source_systems: source_systems.into_iter().collect(),
        record_count: group.rows.len(),
        flags,
        data_quality_flag: None,
        content_hash: String::new(),
        created_at: group.rows.iter().filter_map(|r| r.last_modified).min(),
        updated_at: group.rows.iter().filter_map(|r| r.last_modified).max(),
    }
}

/// Exactly one primary per entity. Candidates are the hinted edges (all edges
/// when none is hinted), ordered by best source rank, then allocation
/// descending, then counterpart ascending.
fn assign_primary(records: &mut [AssociationRecord], ranks: &[usize], hinted: &[bool]) {
    let mut by_entity: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        by_entity.entry(record.entity_id.as_str()).or_default().push(i);
    }

    let mut winners = Vec::new();
    for indexes in by_entity.values() {
        let any_hinted = indexes.iter().any(|&i| hinted[i]);
        let winner = indexes
            .iter()
            .copied()
            .filter(|&i| !any_hinted || hinted[i])
            .min_by(|&a, &b| compare_candidates(&records[a], ranks[a], &records[b], ranks[b]));
        if let Some(i) = winner {
            winners.push(i);
        }
    }

    for i in winners {
        records[i].is_primary = true;
    }
}

fn compare_candidates(a: &AssociationRecord, rank_a: usize, b: &AssociationRecord, rank_b: usize) -> Ordering {
    rank_a
        .cmp(&rank_b)
        .then_with(|| b.allocation_percentage.total_cmp(&a.allocation_percentage))
        .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
}

/// Categories, flags and fingerprint once the primary flag is known
fn finish_record(compiled: &CompiledAssociationProfile, record: &mut AssociationRecord) {
    let profile = &compiled.profile;
    record
        .fields
        .insert(IS_PRIMARY_FIELD.to_string(), FieldValue::Bool(record.is_primary));

    record.risk_category = profile.risk_table.evaluate(&record.fields).clone();
    record.significance_category = profile.significance_table.evaluate(&record.fields).clone();
    record
        .fields
        .insert(RISK_FIELD.to_string(), FieldValue::text(record.risk_category.clone()));
    record.fields.insert(
        SIGNIFICANCE_FIELD.to_string(),
        FieldValue::text(record.significance_category.clone()),
    );

    normalize_flags(&mut record.flags);
    record.data_quality_flag = primary_flag(&record.flags).map(|f| f.to_string());
    record.content_hash = content_hash(
        &record.edge_key(),
        profile.association_type.as_str(),
        &record.fields,
        &[("flags", flags_repr(&record.flags))],
    );
}

/// Every (entity, type) group has at most one primary edge
pub fn primary_is_unique(records: &[AssociationRecord]) -> bool {
    let mut seen: BTreeSet<(AssociationType, &str)> = BTreeSet::new();
    records
        .iter()
        .filter(|r| r.is_primary)
        .all(|r| seen.insert((r.association_type, r.entity_id.as_str())))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::associations;
    use crate::fx::FxRateTable;
    use crate::source::EntityType;
    use crate::xref::{ConfidenceSynonyms, CrossReferenceEntry, CrossReferenceResolver};
    use chrono::NaiveDate;
    use regex::Regex;

    fn company_index() -> KeyIndex {
        let syn = ConfidenceSynonyms::default();
        let re = Regex::new(r"^COMP-CANON-[0-9]{4,}$").unwrap();
        let entries = vec![
            CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0001", "HIGH")
                .key(SourceSystem::Crm, "C-1")
                .key(SourceSystem::PortfolioManagement, "P-1"),
            CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0002", "HIGH")
                .key(SourceSystem::Crm, "C-2"),
        ];
        CrossReferenceResolver::new(&syn, &re)
            .resolve(EntityType::Company, &entries)
            .index
    }

    fn run(profile: crate::registry::AssociationProfile, rows: &[AssociationSourceRecord]) -> AssociationBatch {
        let compiled = profile.compile().unwrap();
        let fx = FxRateTable::new();
        let ctx = DerivationContext {
            categories: &compiled.profile.categories,
            scorecards: &compiled.profile.scorecards,
            fx: &fx,
            as_of: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        };
        let refs: Vec<&AssociationSourceRecord> = rows.iter().collect();
        consolidate_associations(&compiled, &refs, &company_index(), None, &ctx)
    }

    fn industry(system: SourceSystem, key: &str, entity: &str, value: &str) -> AssociationSourceRecord {
        AssociationSourceRecord::new(AssociationType::CompanyIndustry, system, key, entity, value)
    }

    #[test]
    fn test_allocation_summed_and_capped() {
        let rows = vec![
            industry(SourceSystem::Crm, "r1", "C-1", "software").allocation(70.0),
            industry(SourceSystem::PortfolioManagement, "r2", "P-1", "Software ").allocation(60.0),
        ];
        let batch = run(associations::company_industry(), &rows);
        assert_eq!(batch.records.len(), 1);
        let edge = &batch.records[0];
        assert_eq!(edge.entity_id, "COMP-CANON-0001");
        assert_eq!(edge.counterpart_id, "SOFTWARE");
        assert_eq!(edge.allocation_percentage, 100.0);
        assert_eq!(edge.record_count, 2);
        assert!(edge.is_primary);
    }

    #[test]
    fn test_missing_allocation_defaults_to_zero_and_flags() {
        let rows = vec![industry(SourceSystem::Crm, "r1", "C-2", "ENERGY")];
        let batch = run(associations::company_industry(), &rows);
        let edge = &batch.records[0];
        assert_eq!(edge.allocation_percentage, 0.0);
        assert!(edge.flags.contains(&DataQualityFlag::MissingAllocation));
        assert_eq!(edge.risk_category, "HIGH");
    }

    #[test]
    fn test_primary_prefers_source_rank_then_allocation() {
        let rows = vec![
            industry(SourceSystem::PortfolioManagement, "r1", "P-1", "HEALTHCARE").allocation(80.0),
            industry(SourceSystem::Crm, "r2", "C-1", "SOFTWARE").allocation(20.0),
            industry(SourceSystem::Crm, "r3", "C-1", "SERVICES").allocation(30.0),
        ];
        let batch = run(associations::company_industry(), &rows);
        let primary: Vec<&AssociationRecord> = batch.records.iter().filter(|r| r.is_primary).collect();
        assert_eq!(primary.len(), 1);
        // CRM outranks PM; SERVICES has the larger CRM allocation
        assert_eq!(primary[0].counterpart_id, "SERVICES");
        assert!(primary_is_unique(&batch.records));
    }

    #[test]
    fn test_primary_hint_restricts_candidates() {
        let rows = vec![
            industry(SourceSystem::Crm, "r1", "C-1", "SOFTWARE").allocation(90.0),
            industry(SourceSystem::PortfolioManagement, "r2", "P-1", "FINTECH")
                .allocation(10.0)
                .primary(true),
        ];
        let batch = run(associations::company_industry(), &rows);
        let primary = batch.records.iter().find(|r| r.is_primary).unwrap();
        assert_eq!(primary.counterpart_id, "FINTECH");
        assert_eq!(primary.significance_category, "PRIMARY");
    }

    #[test]
    fn test_unmapped_entity_gets_placeholder() {
        let rows = vec![industry(SourceSystem::Crm, "r1", "C-404", "SOFTWARE").allocation(100.0)];
        let batch = run(associations::company_industry(), &rows);
        let edge = &batch.records[0];
        assert_eq!(edge.entity_id, "COMP-UNKNOWN-C-404");
        assert!(edge.flags.contains(&DataQualityFlag::MissingCrossReference));
        assert_eq!(batch.unmapped_edges, 1);
    }

    #[test]
    fn test_blank_entity_key_dropped() {
        let rows = vec![industry(SourceSystem::Crm, "r1", " ", "SOFTWARE")];
        let batch = run(associations::company_industry(), &rows);
        assert!(batch.records.is_empty());
        assert_eq!(batch.dropped_rows, 1);
    }

    #[test]
    fn test_geography_pattern_flags_bad_codes() {
        let rows = vec![
            AssociationSourceRecord::new(AssociationType::CompanyGeography, SourceSystem::Crm, "g1", "C-1", "us")
                .allocation(60.0),
            AssociationSourceRecord::new(AssociationType::CompanyGeography, SourceSystem::Crm, "g2", "C-1", "USA")
                .allocation(40.0),
        ];
        let batch = run(associations::company_geography(), &rows);
        let us = batch.records.iter().find(|r| r.counterpart_id == "US").unwrap();
        let usa = batch.records.iter().find(|r| r.counterpart_id == "USA").unwrap();
        assert!(us.flags.is_empty());
        assert_eq!(
            usa.data_quality_flag.as_deref(),
            Some("INVALID_FORMAT(counterpart)")
        );
    }
}
