// 🕸️ Association Profiles - built-in many-to-many relationship strategies
//
// Associations are stored as an edge list keyed by canonical ids; these
// profiles only say how each edge is resolved and categorized.

use crate::consolidation::{FieldRule, Reducer};
use crate::registry::{AssociationProfile, CounterpartKind, COUNTERPART_FIELD, IS_PRIMARY_FIELD};
use crate::rules::{CategoryTable, Condition};
use crate::source::{AssociationType, EntityType, SourceSystem, ALLOCATION_FIELD};
use crate::value::FieldKind;

use SourceSystem::{Crm, FundAdministration as Fa, PortfolioManagement as Pm};

const HIGH_RISK_INDUSTRIES: &[&str] = &["ENERGY", "MINING", "CRYPTO", "GAMBLING", "TOBACCO"];
const MEDIUM_RISK_INDUSTRIES: &[&str] = &["FINANCIALS", "REAL_ESTATE", "CONSUMER", "CONSTRUCTION"];
const HIGH_RISK_COUNTRIES: &[&str] = &["RU", "BY", "IR", "KP", "SY", "VE"];
const MEDIUM_RISK_COUNTRIES: &[&str] = &["CN", "BR", "IN", "TR", "MX", "ZA", "AR", "NG"];

pub fn profiles() -> Vec<AssociationProfile> {
    vec![
        company_industry(),
        company_geography(),
        fund_investor(),
        fund_investment(),
    ]
}

/// Shared significance buckets for category links
fn category_significance() -> CategoryTable {
    CategoryTable::category("MARGINAL")
        .bucket(Condition::is_true(IS_PRIMARY_FIELD), "PRIMARY")
        .bucket(Condition::gte(ALLOCATION_FIELD, 50.0), "MAJOR")
        .bucket(Condition::gte(ALLOCATION_FIELD, 10.0), "MINOR")
}

pub fn company_industry() -> AssociationProfile {
    AssociationProfile::new(
        AssociationType::CompanyIndustry,
        EntityType::Company,
        CounterpartKind::Category { pattern: None },
        &[Crm, Pm],
    )
    .with_rule(FieldRule::priority("classification_scheme", &[Crm, Pm]))
    .with_risk_table(
        CategoryTable::category("LOW")
            .bucket(Condition::one_of(COUNTERPART_FIELD, HIGH_RISK_INDUSTRIES), "HIGH")
            .bucket(Condition::one_of(COUNTERPART_FIELD, MEDIUM_RISK_INDUSTRIES), "MEDIUM"),
    )
    .with_significance_table(category_significance())
}

pub fn company_geography() -> AssociationProfile {
    AssociationProfile::new(
        AssociationType::CompanyGeography,
        EntityType::Company,
        CounterpartKind::Category {
            pattern: Some(r"^[A-Z]{2}$".to_string()),
        },
        &[Crm, Pm],
    )
    .with_rule(FieldRule::priority("presence_type", &[Crm, Pm]))
    .with_risk_table(
        CategoryTable::category("LOW")
            .bucket(Condition::one_of(COUNTERPART_FIELD, HIGH_RISK_COUNTRIES), "HIGH")
            .bucket(Condition::one_of(COUNTERPART_FIELD, MEDIUM_RISK_COUNTRIES), "MEDIUM"),
    )
    .with_significance_table(category_significance())
}

pub fn fund_investor() -> AssociationProfile {
    AssociationProfile::new(
        AssociationType::FundInvestor,
        EntityType::Fund,
        CounterpartKind::Entity {
            entity_type: EntityType::Investor,
        },
        &[Fa, Crm],
    )
    .with_types(FieldKind::Number, &["commitment_amount"])
    .with_types(FieldKind::Date, &["commitment_date"])
    .with_rule(FieldRule::aggregate("commitment_amount", Reducer::Sum))
    .with_rule(FieldRule::aggregate("commitment_date", Reducer::Min))
    .with_risk_table(
        CategoryTable::category("DIVERSIFIED")
            .bucket(Condition::gte(ALLOCATION_FIELD, 25.0), "HIGH_CONCENTRATION")
            .bucket(Condition::gte(ALLOCATION_FIELD, 10.0), "MODERATE_CONCENTRATION"),
    )
    .with_significance_table(
        CategoryTable::category("UNKNOWN")
            .bucket(Condition::is_true(IS_PRIMARY_FIELD), "ANCHOR")
            .bucket(Condition::gte("commitment_amount", 100_000_000.0), "ANCHOR")
            .bucket(Condition::gte("commitment_amount", 25_000_000.0), "MAJOR")
            .bucket(Condition::gte("commitment_amount", 0.0), "STANDARD"),
    )
}

pub fn fund_investment() -> AssociationProfile {
    AssociationProfile::new(
        AssociationType::FundInvestment,
        EntityType::Fund,
        CounterpartKind::Entity {
            entity_type: EntityType::Company,
        },
        &[Fa, Pm],
    )
    .with_types(FieldKind::Number, &["invested_amount", "ownership_percentage"])
    .with_types(FieldKind::Date, &["investment_date"])
    .with_rule(FieldRule::aggregate("invested_amount", Reducer::Sum))
    .with_rule(FieldRule::aggregate("first_investment_date", Reducer::Min).from_column("investment_date"))
    .with_rule(FieldRule::priority("ownership_percentage", &[Fa, Pm]))
    .with_risk_table(
        CategoryTable::category("DIVERSIFIED")
            .bucket(Condition::gte(ALLOCATION_FIELD, 20.0), "HIGH_CONCENTRATION")
            .bucket(Condition::gte(ALLOCATION_FIELD, 10.0), "MODERATE_CONCENTRATION"),
    )
    .with_significance_table(
        CategoryTable::category("NON_CORE")
            .bucket(Condition::is_true(IS_PRIMARY_FIELD), "CORE_HOLDING")
            .bucket(Condition::gte("ownership_percentage", 50.0), "CONTROLLING")
            .bucket(Condition::gte(ALLOCATION_FIELD, 10.0), "SIGNIFICANT"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_profiles_validate() {
        for profile in profiles() {
            profile.validate().unwrap();
        }
    }

    #[test]
    fn test_geography_compiles_country_pattern() {
        let compiled = company_geography().compile().unwrap();
        let re = compiled.counterpart_pattern.unwrap();
        assert!(re.is_match("US"));
        assert!(!re.is_match("USA"));
    }
}
