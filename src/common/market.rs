//! Per-market trading rules (tick sizes, lot conversion)

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::StrategyError;

/// Trading rules for one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRules {
    /// Exchange market identifier
    pub market_id: u64,
    /// Smallest price increment
    pub price_tick: Decimal,
    /// Smallest tradable quantity increment
    pub quantity_tick: Decimal,
    /// Exchange book symbol (e.g. "BTCUSDC") when it differs from the pair
    #[serde(default)]
    pub symbol: Option<String>,
}

impl MarketRules {
    pub fn new(market_id: u64, price_tick: Decimal, quantity_tick: Decimal) -> Self {
        Self {
            market_id,
            price_tick,
            quantity_tick,
            symbol: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Symbol used for order book queries
    pub fn book_symbol(&self, pair: &str) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| pair.replace('-', "").to_ascii_uppercase())
    }

    /// Round a quantity down to a whole number of quantity ticks
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        floor_to_step(quantity, self.quantity_tick)
    }

    /// Round a price down to a whole number of price ticks
    pub fn round_price(&self, price: Decimal) -> Decimal {
        floor_to_step(price, self.price_tick)
    }

    /// Returns true when the quantity is below one tradable increment
    pub fn is_dust(&self, quantity: Decimal) -> bool {
        quantity < self.quantity_tick
    }

    /// Quantity expressed in whole exchange lots
    pub fn quantity_to_lots(&self, quantity: Decimal) -> u64 {
        to_steps(quantity, self.quantity_tick)
    }

    /// Price expressed in whole exchange ticks
    pub fn price_to_ticks(&self, price: Decimal) -> u64 {
        to_steps(price, self.price_tick)
    }

    pub fn lots_to_quantity(&self, lots: u64) -> Decimal {
        Decimal::from(lots) * self.quantity_tick
    }

    pub fn ticks_to_price(&self, ticks: u64) -> Decimal {
        Decimal::from(ticks) * self.price_tick
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.price_tick <= Decimal::ZERO {
            return Err("price_tick must be positive".to_string());
        }
        if self.quantity_tick <= Decimal::ZERO {
            return Err("quantity_tick must be positive".to_string());
        }
        Ok(())
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    (steps * step).normalize()
}

fn to_steps(value: Decimal, step: Decimal) -> u64 {
    if step <= Decimal::ZERO {
        return 0;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    steps.to_u64().unwrap_or_default()
}

/// Market rules keyed by pair symbol
///
/// Symbols are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct MarketCatalog {
    markets: HashMap<String, MarketRules>,
}

impl MarketCatalog {
    pub fn new(markets: HashMap<String, MarketRules>) -> Self {
        Self {
            markets: markets
                .into_iter()
                .map(|(pair, rules)| (pair.to_ascii_uppercase(), rules))
                .collect(),
        }
    }

    pub fn insert(&mut self, pair: impl Into<String>, rules: MarketRules) {
        self.markets.insert(pair.into().to_ascii_uppercase(), rules);
    }

    pub fn get(&self, pair: &str) -> Option<&MarketRules> {
        self.markets.get(&pair.to_ascii_uppercase())
    }

    /// Pair symbol of a market id, as configured
    pub fn pair_for(&self, market_id: u64) -> Option<&str> {
        self.markets
            .iter()
            .find(|(_, rules)| rules.market_id == market_id)
            .map(|(pair, _)| pair.as_str())
    }

    pub fn rules_for(&self, pair: &str) -> Result<&MarketRules, StrategyError> {
        self.get(pair)
            .ok_or_else(|| StrategyError::UnknownMarket(pair.to_string()))
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
