// 💼 Fund Profile
// Commitments and performance multiples; Fund Administration is the book of
// record for anything numeric.

use crate::consolidation::{Derivation, FieldRule, Reducer};
use crate::registry::EntityProfile;
use crate::rules::{CategoryTable, Condition, RuleTable, Scorecard};
use crate::source::{EntityType, SourceSystem};
use crate::value::FieldKind;

use SourceSystem::{Crm, FundAdministration as Fa};

pub fn profile() -> EntityProfile {
    EntityProfile::new(EntityType::Fund)
        .with_required(&["name", "vintage_year", "fund_size", "currency", "strategy"])
        .with_types(FieldKind::Date, &["report_date", "final_close_date"])
        .with_types(
            FieldKind::Number,
            &["vintage_year", "fund_size", "called_capital", "distributions", "nav"],
        )
        .with_rule(FieldRule::priority("name", &[Crm, Fa]))
        .with_rule(FieldRule::priority("strategy", &[Crm, Fa]))
        .with_rule(FieldRule::priority("vintage_year", &[Fa, Crm]))
        .with_rule(FieldRule::priority("final_close_date", &[Fa, Crm]))
        .with_rule(FieldRule::priority("currency", &[Fa, Crm]))
        .with_rule(FieldRule::priority("fund_size", &[Fa, Crm]))
        .with_rule(latest("total_called", "called_capital"))
        .with_rule(latest("total_distributed", "distributions"))
        .with_rule(latest("latest_nav", "nav"))
        .with_rule(
            FieldRule::aggregate("latest_report_date", Reducer::Max)
                .from_column("report_date")
                .only_sources(&[Fa]),
        )
        .with_rule(FieldRule::derived(
            "fund_age_years",
            Derivation::AgeInYears {
                from: "vintage_year".to_string(),
            },
        ))
        .with_rule(FieldRule::derived(
            "total_value",
            Derivation::Add {
                fields: vec!["total_distributed".to_string(), "latest_nav".to_string()],
            },
        ))
        .with_rule(ratio("dpi", "total_distributed", "total_called"))
        .with_rule(ratio("rvpi", "latest_nav", "total_called"))
        .with_rule(ratio("tvpi", "total_value", "total_called"))
        .with_rule(ratio("called_ratio", "total_called", "fund_size"))
        .with_rule(FieldRule::derived(
            "fund_size_usd",
            Derivation::ConvertCurrency {
                amount: "fund_size".to_string(),
                currency: "currency".to_string(),
                target: "USD".to_string(),
            },
        ))
        .with_category(
            "fund_size_category",
            CategoryTable::category("UNKNOWN")
                .bucket(Condition::gte("fund_size_usd", 5_000_000_000.0), "MEGA")
                .bucket(Condition::gte("fund_size_usd", 1_000_000_000.0), "LARGE")
                .bucket(Condition::gte("fund_size_usd", 250_000_000.0), "MID")
                .bucket(Condition::gte("fund_size_usd", 0.0), "SMALL"),
        )
        .with_category(
            "fund_lifecycle_stage",
            CategoryTable::category("UNKNOWN")
                .bucket(Condition::lt("fund_age_years", 4.0), "INVESTING")
                .bucket(Condition::lt("fund_age_years", 8.0), "VALUE_CREATION")
                .bucket(Condition::lt("fund_age_years", 12.0), "HARVESTING")
                .bucket(Condition::gte("fund_age_years", 12.0), "LIQUIDATING"),
        )
        .with_category(
            "performance_category",
            CategoryTable::category("UNKNOWN")
                .bucket(Condition::gte("tvpi", 2.0), "STRONG")
                .bucket(Condition::gte("tvpi", 1.5), "GOOD")
                .bucket(Condition::gte("tvpi", 1.0), "BREAKEVEN")
                .bucket(Condition::gte("tvpi", 0.0), "UNDERPERFORMING"),
        )
        .with_scorecard(
            "performance",
            Scorecard::new()
                .component(
                    "value_creation",
                    0.6,
                    RuleTable::new(0.0)
                        .when(Condition::gte("tvpi", 2.5), 100.0)
                        .when(Condition::gte("tvpi", 2.0), 80.0)
                        .when(Condition::gte("tvpi", 1.5), 60.0)
                        .when(Condition::gte("tvpi", 1.0), 30.0),
                )
                .component(
                    "realization",
                    0.4,
                    RuleTable::new(0.0)
                        .when(Condition::gte("dpi", 1.5), 100.0)
                        .when(Condition::gte("dpi", 1.0), 70.0)
                        .when(Condition::gte("dpi", 0.5), 40.0)
                        .when(Condition::gt("dpi", 0.0), 15.0),
                ),
        )
        .with_rule(category("fund_size_category"))
        .with_rule(category("fund_lifecycle_stage"))
        .with_rule(category("performance_category"))
        .with_rule(FieldRule::derived(
            "performance_score",
            Derivation::Score {
                scorecard: "performance".to_string(),
            },
        ))
        .with_format_check("currency", r"^[A-Z]{3}$")
}

fn latest(field: &str, column: &str) -> FieldRule {
    FieldRule::aggregate(
        field,
        Reducer::LatestByDate {
            date_field: Some("report_date".to_string()),
        },
    )
    .from_column(column)
    .only_sources(&[Fa])
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

fn category(field: &str) -> FieldRule {
    FieldRule::derived(
        field,
        Derivation::Category {
            table: field.to_string(),
        },
    )
}
