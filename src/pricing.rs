use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-call prices in currency units, converted to quota with `quota_per_unit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
    #[serde(default)]
    pub model_prices: BTreeMap<String, f64>,
    #[serde(default = "default_price")]
    pub default_price: f64,
    #[serde(default)]
    pub group_ratios: BTreeMap<String, f64>,
    /// Reject models with no configured or built-in price instead of charging `default_price`.
    #[serde(default)]
    pub strict: bool,
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

fn default_price() -> f64 {
    0.15
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: default_quota_per_unit(),
            model_prices: BTreeMap::new(),
            default_price: default_price(),
            group_ratios: BTreeMap::new(),
            strict: false,
        }
    }
}

fn builtin_model_price(model: &str) -> Option<f64> {
    match model {
        "suno_music" => Some(0.1),
        "suno_lyrics" => Some(0.01),
        _ => None,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("model price not configured: {model}")]
    UnknownModel { model: String },
    #[error("invalid price for model {model}: {price}")]
    InvalidPrice { model: String, price: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub model: String,
    pub model_price: f64,
    pub group_ratio: f64,
    /// Estimated cost of one call in quota units.
    pub quota: i64,
}

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    config: PricingConfig,
}

impl PricingTable {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.config.quota_per_unit
    }

    pub fn model_price(&self, model: &str) -> Result<f64, PricingError> {
        let price = match self
            .config
            .model_prices
            .get(model)
            .copied()
            .or_else(|| builtin_model_price(model))
        {
            Some(price) => price,
            None if self.config.strict => {
                return Err(PricingError::UnknownModel {
                    model: model.to_string(),
                });
            }
            None => self.config.default_price,
        };
        if !price.is_finite() || price < 0.0 {
            return Err(PricingError::InvalidPrice {
                model: model.to_string(),
                price,
            });
        }
        Ok(price)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        match self.config.group_ratios.get(group) {
            Some(ratio) if ratio.is_finite() && *ratio >= 0.0 => *ratio,
            Some(ratio) => {
                tracing::warn!(group, ratio, "ignoring invalid group ratio");
                1.0
            }
            None => 1.0,
        }
    }

    /// `unit price × group multiplier × quota per unit`, rounded to whole quota.
    pub fn quote(&self, model: &str, group: &str) -> Result<PriceQuote, PricingError> {
        let model_price = self.model_price(model)?;
        let group_ratio = self.group_ratio(group);
        let quota = to_quota(model_price * group_ratio * self.config.quota_per_unit);
        Ok(PriceQuote {
            model: model.to_string(),
            model_price,
            group_ratio,
            quota,
        })
    }

    /// Real cost for `billed_units` calls' worth of work under `quote`.
    pub fn actual_quota(&self, quote: &PriceQuote, billed_units: f64) -> i64 {
        if !billed_units.is_finite() || billed_units <= 0.0 {
            return 0;
        }
        to_quota(quote.model_price * quote.group_ratio * self.config.quota_per_unit * billed_units)
    }

    /// Quota credited for a top-up of `amount` currency units.
    pub fn quota_for_amount(&self, amount: i64) -> i64 {
        to_quota(amount as f64 * self.config.quota_per_unit)
    }
}

fn to_quota(value: f64) -> i64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    if value >= i64::MAX as f64 {
        return i64::MAX;
    }
    value.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        let mut config = PricingConfig {
            quota_per_unit: 1000.0,
            ..PricingConfig::default()
        };
        config.model_prices.insert("suno_music".to_string(), 0.15);
        config.group_ratios.insert("vip".to_string(), 0.5);
        PricingTable::new(config)
    }

    #[test]
    fn quote_multiplies_price_ratio_and_unit() {
        let quote = table().quote("suno_music", "default").expect("quote");
        assert_eq!(quote.quota, 150);
        assert_eq!(quote.group_ratio, 1.0);

        let quote = table().quote("suno_music", "vip").expect("quote");
        assert_eq!(quote.quota, 75);
    }

    #[test]
    fn unknown_models_fall_back_unless_strict() {
        let quote = table().quote("mystery", "default").expect("fallback");
        assert_eq!(quote.model_price, 0.15);

        let strict = PricingTable::new(PricingConfig {
            strict: true,
            ..PricingConfig::default()
        });
        assert_eq!(
            strict.quote("mystery", "default"),
            Err(PricingError::UnknownModel {
                model: "mystery".to_string()
            })
        );
        assert!(strict.quote("suno_lyrics", "default").is_ok());
    }

    #[test]
    fn actual_quota_scales_with_billed_units() {
        let table = table();
        let quote = table.quote("suno_music", "default").expect("quote");
        assert_eq!(table.actual_quota(&quote, 0.8), 120);
        assert_eq!(table.actual_quota(&quote, 0.0), 0);
        assert_eq!(table.quota_for_amount(10), 10_000);
    }
}
