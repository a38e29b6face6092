// 🧾 Counterparty Profile - lenders, brokers and service providers seen in the ledger

use crate::consolidation::{Derivation, FieldRule, Reducer};
use crate::registry::EntityProfile;
use crate::rules::{CategoryTable, Condition};
use crate::source::{EntityType, SourceSystem};
use crate::value::FieldKind;

use SourceSystem::{Accounting as Acct, Crm};

const INVESTMENT_GRADE_HIGH: &[&str] = &["AAA", "AA+", "AA", "AA-"];
const INVESTMENT_GRADE: &[&str] = &["A+", "A", "A-", "BBB+", "BBB", "BBB-"];
const SPECULATIVE: &[&str] = &["BB+", "BB", "BB-", "B+", "B", "B-"];

pub fn profile() -> EntityProfile {
    EntityProfile::new(EntityType::Counterparty)
        .with_required(&["name", "counterparty_type", "country", "credit_rating"])
        .with_types(FieldKind::Number, &["exposure_amount"])
        .with_types(FieldKind::Date, &["exposure_date"])
        .with_rule(FieldRule::priority("name", &[Acct, Crm]))
        .with_rule(FieldRule::priority("counterparty_type", &[Acct, Crm]))
        .with_rule(FieldRule::priority("country", &[Acct, Crm]))
        .with_rule(FieldRule::priority("credit_rating", &[Crm, Acct]))
        .with_rule(FieldRule::priority("currency", &[Acct]))
        .with_rule(
            FieldRule::aggregate("total_exposure", Reducer::Sum)
                .from_column("exposure_amount")
                .only_sources(&[Acct]),
        )
        .with_rule(
            FieldRule::aggregate("exposure_count", Reducer::Count)
                .from_column("exposure_amount")
                .only_sources(&[Acct]),
        )
        .with_rule(FieldRule::aggregate("latest_exposure_date", Reducer::Max).from_column("exposure_date"))
        .with_category(
            "credit_risk_category",
            CategoryTable::category("HIGH")
                .bucket(Condition::is_null("credit_rating"), "UNKNOWN")
                .bucket(Condition::one_of("credit_rating", INVESTMENT_GRADE_HIGH), "LOW")
                .bucket(Condition::one_of("credit_rating", INVESTMENT_GRADE), "MODERATE")
                .bucket(Condition::one_of("credit_rating", SPECULATIVE), "ELEVATED"),
        )
        .with_category(
            "exposure_category",
            CategoryTable::category("UNKNOWN")
                .bucket(Condition::gte("total_exposure", 100_000_000.0), "MAJOR")
                .bucket(Condition::gte("total_exposure", 10_000_000.0), "SIGNIFICANT")
                .bucket(Condition::gte("total_exposure", 0.0), "MINOR"),
        )
        .with_rule(FieldRule::derived(
            "credit_risk_category",
            Derivation::Category {
                table: "credit_risk_category".to_string(),
            },
        ))
        .with_rule(FieldRule::derived(
            "exposure_category",
            Derivation::Category {
                table: "exposure_category".to_string(),
            },
        ))
        .with_format_check("country", r"^[A-Z]{2}$")
        .with_format_check("currency", r"^[A-Z]{3}$")
}
