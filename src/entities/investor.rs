// 🤝 Investor Profile - limited partners and their commitment history

use crate::consolidation::{Derivation, FieldRule, Reducer};
use crate::registry::EntityProfile;
use crate::rules::{CategoryTable, Condition, RuleTable, Scorecard};
use crate::source::{EntityType, SourceSystem};
use crate::value::FieldKind;

use SourceSystem::{Crm, FundAdministration as Fa};

pub fn profile() -> EntityProfile {
    EntityProfile::new(EntityType::Investor)
        .with_required(&["name", "investor_type", "country", "aum"])
        .with_types(FieldKind::Date, &["commitment_date"])
        .with_types(FieldKind::Number, &["aum", "commitment_amount"])
        .with_rule(FieldRule::priority("name", &[Crm, Fa]))
        .with_rule(FieldRule::priority("investor_type", &[Crm]))
        .with_rule(FieldRule::priority("country", &[Crm, Fa]))
        .with_rule(FieldRule::priority("currency", &[Crm, Fa]))
        .with_rule(FieldRule::priority("aum", &[Crm]))
        .with_rule(FieldRule::aggregate("first_commitment_date", Reducer::Min).from_column("commitment_date"))
        .with_rule(FieldRule::aggregate("latest_commitment_date", Reducer::Max).from_column("commitment_date"))
        .with_rule(FieldRule::aggregate("commitment_count", Reducer::Count).from_column("commitment_amount"))
        .with_rule(FieldRule::aggregate("total_commitments", Reducer::Sum).from_column("commitment_amount"))
        .with_rule(FieldRule::derived(
            "relationship_years",
            Derivation::AgeInYears {
                from: "first_commitment_date".to_string(),
            },
        ))
        .with_rule(FieldRule::derived(
            "aum_usd",
            Derivation::ConvertCurrency {
                amount: "aum".to_string(),
                currency: "currency".to_string(),
                target: "USD".to_string(),
            },
        ))
        .with_category(
            "investor_tier",
            CategoryTable::category("UNKNOWN")
                .bucket(Condition::gte("aum_usd", 50_000_000_000.0), "TIER_1")
                .bucket(Condition::gte("aum_usd", 5_000_000_000.0), "TIER_2")
                .bucket(Condition::gte("aum_usd", 0.0), "TIER_3"),
        )
        .with_scorecard(
            "relationship_value",
            Scorecard::new()
                .component(
                    "commitments",
                    0.5,
                    RuleTable::new(0.0)
                        .when(Condition::gte("total_commitments", 250_000_000.0), 100.0)
                        .when(Condition::gte("total_commitments", 50_000_000.0), 70.0)
                        .when(Condition::gt("total_commitments", 0.0), 35.0),
                )
                .component(
                    "tenure",
                    0.3,
                    RuleTable::new(0.0)
                        .when(Condition::gte("relationship_years", 10.0), 100.0)
                        .when(Condition::gte("relationship_years", 5.0), 70.0)
                        .when(Condition::gte("relationship_years", 0.0), 30.0),
                )
                .component(
                    "repeat_business",
                    0.2,
                    RuleTable::new(0.0)
                        .when(Condition::gte("commitment_count", 5.0), 100.0)
                        .when(Condition::gte("commitment_count", 2.0), 60.0)
                        .when(Condition::gte("commitment_count", 1.0), 20.0),
                ),
        )
        .with_category(
            "relationship_value_tier",
            CategoryTable::category("EMERGING")
                .bucket(Condition::gte("relationship_value_score", 70.0), "STRATEGIC")
                .bucket(Condition::gte("relationship_value_score", 40.0), "CORE"),
        )
        .with_rule(FieldRule::derived(
            "investor_tier",
            Derivation::Category {
                table: "investor_tier".to_string(),
            },
        ))
        .with_rule(FieldRule::derived(
            "relationship_value_score",
            Derivation::Score {
                scorecard: "relationship_value".to_string(),
            },
        ))
        .with_rule(FieldRule::derived(
            "relationship_value_tier",
            Derivation::Category {
                table: "relationship_value_tier".to_string(),
            },
        ))
        .with_format_check("country", r"^[A-Z]{2}$")
        .with_format_check("currency", r"^[A-Z]{3}$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;
    use std::collections::BTreeMap;

    #[test]
    fn test_investor_profile_validates() {
        profile().validate().unwrap();
    }

    #[test]
    fn test_relationship_value_score() {
        let p = profile();
        let card = &p.scorecards["relationship_value"];
        let f: BTreeMap<String, FieldValue> = [
            ("total_commitments", 300_000_000.0),
            ("relationship_years", 6.0),
            ("commitment_count", 3.0),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::Number(*v)))
        .collect();
        // 0.5×100 + 0.3×70 + 0.2×60
        assert_eq!(card.score(&f), 83.0);
    }
}
