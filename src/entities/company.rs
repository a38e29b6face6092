// 🏢 Company Profile - built-in strategy for portfolio companies
//
// Profile fields come from CRM first (relationship owners keep them tidy),
// financials from Fund Administration reporting packs.

use crate::consolidation::{Derivation, FieldRule, Reducer};
use crate::registry::EntityProfile;
use crate::rules::{CategoryTable, Condition, RuleTable, Scorecard};
use crate::source::{EntityType, SourceSystem};
use crate::value::FieldKind;

use SourceSystem::{Crm, FundAdministration as Fa, PortfolioManagement as Pm};

/// Reporting currency that every size bucket is measured in
pub const REPORTING_CURRENCY: &str = "USD";

pub fn profile() -> EntityProfile {
    EntityProfile::new(EntityType::Company)
        .with_required(&["name", "country", "industry", "currency", "latest_revenue", "founded_date"])
        .with_types(FieldKind::Date, &["founded_date", "reporting_date"])
        .with_types(
            FieldKind::Number,
            &[
                "revenue",
                "ebitda",
                "total_debt",
                "total_assets",
                "enterprise_value",
                "reported_ev_to_ebitda",
                "employee_count",
            ],
        )
        // Profile
        .with_rule(FieldRule::priority("name", &[Crm, Pm]))
        .with_rule(FieldRule::priority("country", &[Crm, Pm]))
        .with_rule(FieldRule::priority("industry", &[Crm, Pm]))
        .with_rule(FieldRule::priority("founded_date", &[Crm, Pm]))
        .with_rule(FieldRule::priority("website", &[Crm]))
        .with_rule(FieldRule::priority("employee_count", &[Pm, Crm]))
        .with_rule(FieldRule::priority("currency", &[Fa, Pm, Crm]))
        // Financials: latest reported figure wins
        .with_rule(latest("latest_revenue", "revenue"))
        .with_rule(latest("latest_ebitda", "ebitda"))
        .with_rule(latest("total_debt", "total_debt"))
        .with_rule(latest("total_assets", "total_assets"))
        .with_rule(latest("enterprise_value", "enterprise_value"))
        .with_rule(FieldRule::priority("reported_ev_to_ebitda", &[Fa]))
        .with_rule(FieldRule::aggregate("financial_report_count", Reducer::Count).from_column("reporting_date"))
        .with_rule(FieldRule::aggregate("last_reporting_date", Reducer::Max).from_column("reporting_date"))
        // Derived metrics
        .with_rule(FieldRule::derived(
            "company_age_years",
            Derivation::AgeInYears {
                from: "founded_date".to_string(),
            },
        ))
        .with_rule(ratio("debt_to_assets", "total_debt", "total_assets"))
        .with_rule(ratio("ev_to_ebitda", "enterprise_value", "latest_ebitda"))
        .with_rule(ratio("ebitda_margin", "latest_ebitda", "latest_revenue"))
        .with_rule(FieldRule::derived(
            "revenue_usd",
            Derivation::ConvertCurrency {
                amount: "latest_revenue".to_string(),
                currency: "currency".to_string(),
                target: REPORTING_CURRENCY.to_string(),
            },
        ))
        // Categories and scores
        .with_category("company_size", size_table())
        .with_category("lifecycle_stage", lifecycle_table())
        .with_category("leverage_category", leverage_table())
        .with_scorecard("attractiveness", attractiveness_scorecard())
        .with_category("attractiveness_tier", tier_table())
        .with_rule(category("company_size"))
        .with_rule(category("lifecycle_stage"))
        .with_rule(category("leverage_category"))
        .with_rule(FieldRule::derived(
            "attractiveness_score",
            Derivation::Score {
                scorecard: "attractiveness".to_string(),
            },
        ))
        .with_rule(category("attractiveness_tier"))
        .with_format_check("country", r"^[A-Z]{2}$")
        .with_format_check("currency", r"^[A-Z]{3}$")
        .with_variance_check("ev_to_ebitda", "reported_ev_to_ebitda", 0.05)
}

fn latest(field: &str, column: &str) -> FieldRule {
    FieldRule::aggregate(
        field,
        Reducer::LatestByDate {
            date_field: Some("reporting_date".to_string()),
        },
    )
    .from_column(column)
}

fn ratio(field: &str, numerator: &str, denominator: &str) -> FieldRule {
    FieldRule::derived(
        field,
        Derivation::Ratio {
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        },
    )
}

/// Category rule whose table shares the output field's name
fn category(field: &str) -> FieldRule {
    FieldRule::derived(
        field,
        Derivation::Category {
            table: field.to_string(),
        },
    )
}

fn size_table() -> CategoryTable {
    CategoryTable::category("UNKNOWN")
        .bucket(Condition::gte("revenue_usd", 1_000_000_000.0), "LARGE_CAP")
        .bucket(Condition::gte("revenue_usd", 100_000_000.0), "MID_MARKET")
        .bucket(Condition::gte("revenue_usd", 10_000_000.0), "LOWER_MID_MARKET")
        .bucket(Condition::gte("revenue_usd", 0.0), "SMALL")
}

fn lifecycle_table() -> CategoryTable {
    CategoryTable::category("UNKNOWN")
        .bucket(Condition::lt("company_age_years", 3.0), "STARTUP")
        .bucket(Condition::lt("company_age_years", 10.0), "GROWTH")
        .bucket(Condition::lt("company_age_years", 25.0), "MATURE")
        .bucket(Condition::gte("company_age_years", 25.0), "ESTABLISHED")
}

fn leverage_table() -> CategoryTable {
    CategoryTable::category("UNKNOWN")
        .bucket(Condition::lt("debt_to_assets", 0.3), "LOW")
        .bucket(Condition::lt("debt_to_assets", 0.6), "MODERATE")
        .bucket(Condition::gte("debt_to_assets", 0.6), "HIGH")
}

fn attractiveness_scorecard() -> Scorecard {
    Scorecard::new()
        .component(
            "scale",
            0.4,
            RuleTable::new(0.0)
                .when(Condition::gte("revenue_usd", 1_000_000_000.0), 100.0)
                .when(Condition::gte("revenue_usd", 100_000_000.0), 75.0)
                .when(Condition::gte("revenue_usd", 10_000_000.0), 50.0)
                .when(Condition::gte("revenue_usd", 0.0), 25.0),
        )
        .component(
            "profitability",
            0.35,
            RuleTable::new(0.0)
                .when(Condition::gte("ebitda_margin", 0.25), 100.0)
                .when(Condition::gte("ebitda_margin", 0.15), 75.0)
                .when(Condition::gte("ebitda_margin", 0.05), 50.0)
                .when(Condition::gte("ebitda_margin", 0.0), 25.0),
        )
        .component(
            "balance_sheet",
            0.25,
            RuleTable::new(50.0)
                .when(Condition::lt("debt_to_assets", 0.3), 100.0)
                .when(Condition::lt("debt_to_assets", 0.6), 60.0)
                .when(Condition::gte("debt_to_assets", 0.6), 20.0),
        )
}

fn tier_table() -> CategoryTable {
    CategoryTable::category("TIER_4")
        .bucket(Condition::gte("attractiveness_score", 75.0), "TIER_1")
        .bucket(Condition::gte("attractiveness_score", 50.0), "TIER_2")
        .bucket(Condition::gte("attractiveness_score", 25.0), "TIER_3")
}
