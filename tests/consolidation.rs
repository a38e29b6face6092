// End-to-end consolidation runs over small in-memory snapshots

use chrono::{NaiveDate, TimeZone, Utc};
use entity_consolidation::quality::QualityGrid;
use entity_consolidation::relationships::primary_is_unique;
use entity_consolidation::{
    AssociationSourceRecord, AssociationType, CanonicalEntity, Confidence, ConsolidationEngine,
    ConsolidationOutput, CrossReferenceEntry, DataQualityFlag, EntityType, FieldValue, FxRateTable,
    InputSnapshot, QualityRating, RunContext, SourceCoverage, SourceRecord, SourceSystem,
};

use SourceSystem::{Accounting as Acct, Crm, FundAdministration as Fa, PortfolioManagement as Pm};

fn ctx() -> RunContext {
    RunContext::new(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap())
}

fn run(input: &InputSnapshot) -> ConsolidationOutput {
    ConsolidationEngine::with_defaults(FxRateTable::new())
        .unwrap()
        .run(input, &ctx())
}

fn entity<'a>(out: &'a ConsolidationOutput, id: &str) -> &'a CanonicalEntity {
    out.entities
        .iter()
        .find(|e| e.id == id)
        .unwrap_or_else(|| panic!("no entity {}", id))
}

fn acme_input(revenue: f64) -> InputSnapshot {
    InputSnapshot {
        records: vec![
            SourceRecord::new(EntityType::Company, Crm, "C-1")
                .with("name", "Acme Inc")
                .with("country", "US")
                .modified_at(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap()),
            SourceRecord::new(EntityType::Company, Pm, "P-77")
                .with("name", "Acme Incorporated")
                .with("revenue", revenue),
        ],
        cross_references: vec![CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0001", "HIGH")
            .key(Crm, "C-1")
            .key(Pm, "P-77")],
        associations: vec![],
    }
}

#[test]
fn test_merge_scenario() {
    let out = run(&acme_input(5_000_000.0));
    let acme = entity(&out, "COMP-CANON-0001");

    assert_eq!(acme.name(), Some("Acme Inc"));
    assert_eq!(acme.fields.get("latest_revenue"), Some(&FieldValue::Number(5_000_000.0)));
    assert_eq!(acme.source_coverage, SourceCoverage::MultiSource);
    assert_eq!(acme.resolution_confidence, Confidence::High);
    assert_eq!(acme.provenance.get("name").map(String::as_str), Some("PRIORITY:CRM"));
    assert_eq!(acme.record_count, 2);
    assert_eq!(acme.source_keys, vec!["CRM:C-1".to_string(), "PM:P-77".to_string()]);
}

#[test]
fn test_orphan_scenario() {
    let mut input = acme_input(5_000_000.0);
    input
        .records
        .push(SourceRecord::new(EntityType::Company, Crm, "C-404").with("name", "Orphan Co"));

    let out = run(&input);
    let orphan = entity(&out, "COMP-UNKNOWN-C-404");

    assert_eq!(orphan.name(), Some("Orphan Co"));
    assert_eq!(orphan.source_coverage, SourceCoverage::SingleSourceOnly);
    assert!(orphan.flags.contains(&DataQualityFlag::MissingCrossReference));
    assert_eq!(out.summary.orphan_entities, 1);
    assert_eq!(out.entities.len(), 2);
}

#[test]
fn test_hash_sensitivity() {
    let base = run(&acme_input(5_000_000.0));
    let changed = run(&acme_input(5_100_000.0));
    assert_ne!(
        entity(&base, "COMP-CANON-0001").content_hash,
        entity(&changed, "COMP-CANON-0001").content_hash
    );

    // Timestamps alone do not move the fingerprint
    let mut retimed = acme_input(5_000_000.0);
    retimed.records[0].last_modified = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let retimed = run(&retimed);
    let a = entity(&base, "COMP-CANON-0001");
    let b = entity(&retimed, "COMP-CANON-0001");
    assert_eq!(a.content_hash, b.content_hash);
    assert_ne!(a.updated_at, b.updated_at);
}

#[test]
fn test_idempotence() {
    let input = full_input();
    let first = run(&input);
    let second = run(&input);

    assert_eq!(
        serde_json::to_string(&first.entities).unwrap(),
        serde_json::to_string(&second.entities).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.associations).unwrap(),
        serde_json::to_string(&second.associations).unwrap()
    );
    assert_eq!(first.summary, second.summary);
}

#[test]
fn test_input_order_does_not_matter() {
    let input = full_input();
    let mut reversed = input.clone();
    reversed.records.reverse();
    reversed.cross_references.reverse();
    reversed.associations.reverse();

    let a = run(&input);
    let b = run(&reversed);
    let hashes = |o: &ConsolidationOutput| -> Vec<String> {
        o.entities
            .iter()
            .map(|e| e.content_hash.clone())
            .chain(o.associations.iter().map(|r| r.content_hash.clone()))
            .collect()
    };
    assert_eq!(hashes(&a), hashes(&b));
}

#[test]
fn test_range_invariants() {
    let out = run(&full_input());
    assert!(!out.entities.is_empty());
    assert!(!out.associations.is_empty());

    for e in &out.entities {
        assert!((0.0..=100.0).contains(&e.completeness_score), "{}", e.id);
    }
    for a in &out.associations {
        assert!((0.0..=100.0).contains(&a.allocation_percentage), "{}", a.edge_key());
    }
}

#[test]
fn test_allocation_capped_at_hundred() {
    let out = run(&full_input());
    let software = out
        .associations
        .iter()
        .find(|a| a.association_type == AssociationType::CompanyIndustry && a.counterpart_id == "SOFTWARE")
        .unwrap();
    // 70 (CRM) + 60 (PM) summed, then capped
    assert_eq!(software.allocation_percentage, 100.0);
}

#[test]
fn test_primary_uniqueness() {
    let out = run(&full_input());
    assert!(primary_is_unique(&out.associations));

    let industry: Vec<_> = out
        .associations
        .iter()
        .filter(|a| a.association_type == AssociationType::CompanyIndustry && a.entity_id == "COMP-CANON-0001")
        .collect();
    assert_eq!(industry.len(), 2);
    assert_eq!(industry.iter().filter(|a| a.is_primary).count(), 1);
    // Only FINTECH carried a primary hint
    assert!(industry.iter().any(|a| a.is_primary && a.counterpart_id == "FINTECH"));
}

#[test]
fn test_priority_select_higher_source_wins() {
    let input = InputSnapshot {
        records: vec![
            SourceRecord::new(EntityType::Company, Pm, "P-1")
                .with("name", "Beta Holdings")
                .with("industry", "Logistics"),
            SourceRecord::new(EntityType::Company, Crm, "C-9")
                .with("name", "Beta Ltd")
                .with("industry", "Transport"),
        ],
        cross_references: vec![CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0002", "MEDIUM")
            .key(Crm, "C-9")
            .key(Pm, "P-1")],
        associations: vec![],
    };

    let out = run(&input);
    let beta = entity(&out, "COMP-CANON-0002");
    assert_eq!(beta.fields.get("name"), Some(&FieldValue::text("Beta Ltd")));
    assert_eq!(beta.fields.get("industry"), Some(&FieldValue::text("Transport")));
}

#[test]
fn test_aggregation_sum_and_count() {
    // Several ledger rows under one accounting key
    let input = InputSnapshot {
        records: vec![
            SourceRecord::new(EntityType::Counterparty, Acct, "L-1")
                .with("name", "First Bank")
                .with("exposure_amount", 1_000_000.0),
            SourceRecord::new(EntityType::Counterparty, Acct, "L-1").with("exposure_amount", 2_500_000.0),
            SourceRecord::new(EntityType::Counterparty, Acct, "L-1").with("name", "First Bank"),
            // Not an accounting source, so outside the aggregate
            SourceRecord::new(EntityType::Counterparty, Crm, "K-1").with("exposure_amount", 9_000_000_000.0),
            SourceRecord::new(EntityType::Counterparty, Acct, "L-3").with("name", "Quiet Broker"),
        ],
        cross_references: vec![
            CrossReferenceEntry::new(EntityType::Counterparty, "CPTY-CANON-0001", "HIGH")
                .key(Acct, "L-1")
                .key(Crm, "K-1"),
            CrossReferenceEntry::new(EntityType::Counterparty, "CPTY-CANON-0002", "HIGH").key(Acct, "L-3"),
        ],
        associations: vec![],
    };

    let out = run(&input);
    let bank = entity(&out, "CPTY-CANON-0001");
    assert_eq!(bank.fields.get("total_exposure"), Some(&FieldValue::Number(3_500_000.0)));
    assert_eq!(bank.fields.get("exposure_count"), Some(&FieldValue::Number(2.0)));
    assert_eq!(bank.provenance.get("total_exposure").map(String::as_str), Some("AGGREGATE:SUM(2)"));
    assert_eq!(bank.record_count, 4);

    let other = entity(&out, "CPTY-CANON-0002");
    assert_eq!(other.fields.get("total_exposure"), None);
    assert_eq!(other.fields.get("exposure_count"), Some(&FieldValue::Number(0.0)));
}

#[test]
fn test_quality_monotonicity() {
    let grid = QualityGrid::default();
    for confidence in Confidence::ALL {
        let mut previous = QualityRating::Poor;
        for step in 0..=100 {
            let rating = grid.rate(confidence, step as f64);
            // Ratings are ordered best → worst
            assert!(rating <= previous, "{:?} at {}", confidence, step);
            previous = rating;
        }
    }
}

#[test]
fn test_fund_investor_edges_resolve_both_sides() {
    let out = run(&full_input());
    let edge = out
        .associations
        .iter()
        .find(|a| a.association_type == AssociationType::FundInvestor)
        .unwrap();
    assert_eq!(edge.entity_id, "FUND-CANON-0001");
    assert_eq!(edge.counterpart_id, "INV-CANON-0001");
    assert_eq!(edge.fields.get("commitment_amount"), Some(&FieldValue::Number(50_000_000.0)));
    assert!(edge.is_primary);
    assert!(edge.flags.is_empty());
}

#[test]
fn test_unmapped_association_gets_placeholder() {
    let mut input = full_input();
    input.associations.push(
        AssociationSourceRecord::new(AssociationType::FundInvestor, Fa, "CMT-9", "F-1", "LP-UNKNOWN")
            .allocation(5.0),
    );
    let out = run(&input);
    let edge = out
        .associations
        .iter()
        .find(|a| a.counterpart_id == "INV-UNKNOWN-LP-UNKNOWN")
        .unwrap();
    assert!(edge.flags.contains(&DataQualityFlag::MissingCrossReference));
    assert_eq!(out.summary.unmapped_edges, 1);
}

/// A snapshot touching every entity type and two association types
fn full_input() -> InputSnapshot {
    let mut input = acme_input(5_000_000.0);

    input.records.extend([
        SourceRecord::new(EntityType::Fund, Fa, "F-1")
            .with("name", "Growth Fund I")
            .with("vintage_year", 2018.0)
            .with("fund_size", 250_000_000.0)
            .with("currency", "USD")
            .with("strategy", "Growth Equity"),
        SourceRecord::new(EntityType::Investor, Crm, "LP-1")
            .with("name", "State Pension Plan")
            .with("investor_type", "Pension")
            .with("country", "US")
            .with("aum", 40_000_000_000.0),
        SourceRecord::new(EntityType::Investor, Fa, "LP-1")
            .with("commitment_amount", 50_000_000.0)
            .with("commitment_date", NaiveDate::from_ymd_opt(2018, 3, 1).unwrap()),
    ]);

    input.cross_references.extend([
        CrossReferenceEntry::new(EntityType::Fund, "FUND-CANON-0001", "Strong").key(Fa, "F-1"),
        CrossReferenceEntry::new(EntityType::Investor, "INV-CANON-0001", "verified")
            .key(Crm, "LP-1")
            .key(Fa, "LP-1"),
    ]);

    input.associations.extend([
        AssociationSourceRecord::new(AssociationType::CompanyIndustry, Crm, "I-1", "C-1", "Software").allocation(70.0),
        AssociationSourceRecord::new(AssociationType::CompanyIndustry, Pm, "I-2", "P-77", "software").allocation(60.0),
        AssociationSourceRecord::new(AssociationType::CompanyIndustry, Pm, "I-3", "P-77", "Fintech")
            .allocation(30.0)
            .primary(true),
        AssociationSourceRecord::new(AssociationType::FundInvestor, Fa, "CMT-1", "F-1", "LP-1")
            .allocation(20.0)
            .with("commitment_amount", 50_000_000.0),
    ]);

    input
}
