// 💱 FX Rates - read-only keyed lookup supplied by an external collaborator
// Missing rates never fail a run: the caller keeps the original currency.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of the external rate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxRate {
    pub from_currency: String,
    pub to_currency: String,
    pub rate: f64,
    pub as_of_date: NaiveDate,
}

/// Outcome of a conversion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    Converted(f64),
    /// No usable rate: value stays in its original currency
    MissingRate,
    /// Amount has no currency at all (distinct from any country code)
    MissingCurrency,
}

/// Rates keyed by (from, to), each with its dated history
#[derive(Debug, Clone, Default)]
pub struct FxRateTable {
    rates: BTreeMap<(String, String), BTreeMap<NaiveDate, f64>>,
}

impl FxRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rates(rates: impl IntoIterator<Item = FxRate>) -> Self {
        let mut table = Self::new();
        for rate in rates {
            table.insert(rate);
        }
        table
    }

    /// Later duplicates for the same (pair, date) replace earlier ones
    pub fn insert(&mut self, rate: FxRate) {
        if !(rate.rate.is_finite() && rate.rate > 0.0) {
            return;
        }
        self.rates
            .entry((normalize(&rate.from_currency), normalize(&rate.to_currency)))
            .or_default()
            .insert(rate.as_of_date, rate.rate);
    }

    pub fn len(&self) -> usize {
        self.rates.values().map(|h| h.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Most recent rate on or before `on`; inverse pair used when only the
    /// reverse direction is published
    pub fn rate(&self, from: &str, to: &str, on: NaiveDate) -> Option<f64> {
        let from = normalize(from);
        let to = normalize(to);
        if from == to {
            return Some(1.0);
        }

        let direct = self
            .rates
            .get(&(from.clone(), to.clone()))
            .and_then(|history| history.range(..=on).next_back().map(|(_, r)| *r));
        if direct.is_some() {
            return direct;
        }

        self.rates
            .get(&(to, from))
            .and_then(|history| history.range(..=on).next_back().map(|(_, r)| 1.0 / *r))
    }

    pub fn convert(&self, amount: f64, from: Option<&str>, to: &str, on: NaiveDate) -> Conversion {
        let from = match from.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => code,
            None => return Conversion::MissingCurrency,
        };

        match self.rate(from, to, on) {
            Some(rate) => Conversion::Converted(amount * rate),
            None => Conversion::MissingRate,
        }
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_uppercase()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn table() -> FxRateTable {
        FxRateTable::from_rates(vec![
            FxRate {
                from_currency: "EUR".to_string(),
                to_currency: "USD".to_string(),
                rate: 1.10,
                as_of_date: date(2024, 1, 1),
            },
            FxRate {
                from_currency: "EUR".to_string(),
                to_currency: "USD".to_string(),
                rate: 1.20,
                as_of_date: date(2024, 6, 1),
            },
            FxRate {
                from_currency: "USD".to_string(),
                to_currency: "GBP".to_string(),
                rate: 0.80,
                as_of_date: date(2024, 1, 1),
            },
        ])
    }

    #[test]
    fn test_latest_rate_on_or_before_date() {
        let fx = table();
        assert_eq!(fx.rate("EUR", "USD", date(2024, 3, 1)), Some(1.10));
        assert_eq!(fx.rate("EUR", "USD", date(2024, 7, 1)), Some(1.20));
        assert_eq!(fx.rate("EUR", "USD", date(2023, 12, 31)), None);
    }

    #[test]
    fn test_inverse_and_identity() {
        let fx = table();
        assert_eq!(fx.rate("GBP", "USD", date(2024, 2, 1)), Some(1.0 / 0.80));
        assert_eq!(fx.rate("usd", "USD", date(2000, 1, 1)), Some(1.0));
    }

    #[test]
    fn test_convert_outcomes() {
        let fx = table();
        assert_eq!(
            fx.convert(100.0, Some("EUR"), "USD", date(2024, 6, 2)),
            Conversion::Converted(120.0)
        );
        assert_eq!(fx.convert(100.0, Some("JPY"), "USD", date(2024, 6, 2)), Conversion::MissingRate);
        assert_eq!(fx.convert(100.0, None, "USD", date(2024, 6, 2)), Conversion::MissingCurrency);
        assert_eq!(fx.convert(100.0, Some(" "), "USD", date(2024, 6, 2)), Conversion::MissingCurrency);
    }

    #[test]
    fn test_rejects_non_positive_rates() {
        let mut fx = FxRateTable::new();
        fx.insert(FxRate {
            from_currency: "CAD".to_string(),
            to_currency: "USD".to_string(),
            rate: 0.0,
            as_of_date: date(2024, 1, 1),
        });
        assert!(fx.is_empty());
    }
}
