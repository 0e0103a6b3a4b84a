//! Liquidity maker strategy
//!
//! Keeps a quote on the trade's side of the book at `spread_bps` away from the
//! reference price, and once inventory has been acquired also quotes the
//! opposite side to earn the spread back. Quotes are replaced when the
//! reference moves more than `requote_threshold_bps` from the price they were
//! anchored to, or when any of them filled.
//!
//! Progress towards `total_quantity` is the net executed quantity on the
//! trade's side, so round trips do not count.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::common::errors::StrategyError;
use crate::common::market::MarketRules;
use crate::common::types::{OrderRecord, Side, Trade};
use crate::strategy::traits::Strategy;
use crate::strategy::types::{net_filled, Action, Correction, Decision, ExecutionState, OrderIntent};

const BPS: Decimal = dec!(10000);

fn default_spread_bps() -> Decimal {
    Decimal::from(10)
}

fn default_requote_threshold_bps() -> Decimal {
    Decimal::from(5)
}

fn default_refresh_secs() -> u64 {
    5
}

fn default_max_rejections() -> u32 {
    3
}

/// Longest accepted `refresh_secs`
pub const MAX_REFRESH_SECS: u64 = 24 * 3600;

/// Liquidity maker parameters as stored in `strategy_params`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityMakerParams {
    /// Size of each quote
    pub quote_quantity: Decimal,
    /// Distance of quotes from the reference price
    #[serde(default = "default_spread_bps")]
    pub spread_bps: Decimal,
    /// Reference move that triggers a requote
    #[serde(default = "default_requote_threshold_bps")]
    pub requote_threshold_bps: Decimal,
    /// How often the reference price is re-checked
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_max_rejections")]
    pub max_rejections: u32,
}

impl LiquidityMakerParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, StrategyError> {
        let params: Self = serde_json::from_value(value.clone())
            .map_err(|e| StrategyError::InvalidParams(format!("liquidity_maker: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), StrategyError> {
        if self.quote_quantity <= Decimal::ZERO {
            return Err(StrategyError::InvalidParams(
                "liquidity_maker: quote_quantity must be positive".into(),
            ));
        }
        if self.spread_bps < Decimal::ZERO || self.requote_threshold_bps < Decimal::ZERO {
            return Err(StrategyError::InvalidParams(
                "liquidity_maker: spread and threshold cannot be negative".into(),
            ));
        }
        if self.refresh_secs == 0 || self.refresh_secs > MAX_REFRESH_SECS {
            return Err(StrategyError::InvalidParams(format!(
                "liquidity_maker: refresh_secs must be between 1 and {}",
                MAX_REFRESH_SECS
            )));
        }
        Ok(())
    }
}

/// Liquidity maker instance for one trade
#[derive(Debug, Clone)]
pub struct LiquidityMaker {
    params: LiquidityMakerParams,
    rules: MarketRules,
    /// Reference price the live quotes were computed from
    anchor: Option<Decimal>,
    /// Gross filled quantity when the live quotes were placed
    seen_filled: Decimal,
}

impl LiquidityMaker {
    pub fn new(trade: &Trade, rules: MarketRules) -> Result<Self, StrategyError> {
        let params = LiquidityMakerParams::from_value(&trade.strategy_params)?;
        if rules.is_dust(rules.round_quantity(params.quote_quantity)) {
            return Err(StrategyError::Unsupported(format!(
                "quote_quantity {} is below the minimum increment {}",
                params.quote_quantity, rules.quantity_tick
            )));
        }

        Ok(Self {
            params,
            rules,
            anchor: None,
            seen_filled: Decimal::ZERO,
        })
    }

    pub fn params(&self) -> &LiquidityMakerParams {
        &self.params
    }

    fn refresh(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.params.refresh_secs.min(MAX_REFRESH_SECS) as i64)
    }

    /// Quote price for a side, never through the trade's limit
    fn quote_price(&self, trade: &Trade, side: Side, reference: Decimal) -> Decimal {
        let offset = reference * self.params.spread_bps / BPS;
        let price = match side {
            Side::Buy => reference - offset,
            Side::Sell => reference + offset,
        };
        let price = match (side == trade.side, trade.limit_price) {
            (true, Some(limit)) if side == Side::Buy => price.min(limit),
            (true, Some(limit)) => price.max(limit),
            _ => price,
        };
        self.rules.round_price(price)
    }

    fn moved_beyond_threshold(&self, reference: Decimal) -> bool {
        match self.anchor {
            Some(anchor) if !anchor.is_zero() => {
                ((reference - anchor).abs() / anchor) * BPS > self.params.requote_threshold_bps
            }
            _ => true,
        }
    }

    fn quotes(&self, trade: &Trade, state: &ExecutionState, reference: Decimal) -> Vec<OrderIntent> {
        let mut quotes = Vec::with_capacity(2);

        let entry = self
            .rules
            .round_quantity(self.params.quote_quantity.min(state.remaining_quantity));
        if !self.rules.is_dust(entry) {
            quotes.push(
                OrderIntent::new(trade.side, entry)
                    .with_price(Some(self.quote_price(trade, trade.side, reference))),
            );
        }

        let inventory = net_filled(trade.side, &state.orders);
        let exit = self
            .rules
            .round_quantity(self.params.quote_quantity.min(inventory));
        if inventory > Decimal::ZERO && !self.rules.is_dust(exit) {
            let side = trade.side.opposite();
            quotes.push(
                OrderIntent::new(side, exit).with_price(Some(self.quote_price(trade, side, reference))),
            );
        }

        quotes
    }
}

impl Strategy for LiquidityMaker {
    fn name(&self) -> &str {
        "liquidity_maker"
    }

    fn next_action(&mut self, trade: &Trade, state: &ExecutionState, now: DateTime<Utc>) -> Decision {
        let open: Vec<u64> = state.open_orders().map(|o| o.client_order_id).collect();

        if self.rules.is_dust(state.remaining_quantity) {
            if open.is_empty() {
                return Decision::Done;
            }
            return Decision::go_now(
                now,
                Action::Requote {
                    cancel: open,
                    place: Vec::new(),
                },
            );
        }

        let Some(reference) = state.reference_price else {
            return Decision::Idle {
                until: now + self.refresh(),
            };
        };

        let gross_filled: Decimal = state.orders.iter().map(|o| o.filled_quantity).sum();
        let filled_since_quote = gross_filled != self.seen_filled;
        let requote =
            open.is_empty() || filled_since_quote || self.moved_beyond_threshold(reference);

        if !requote {
            return Decision::Idle {
                until: now + self.refresh(),
            };
        }

        debug!(
            trade_id = %trade.id,
            reference = %reference,
            anchor = ?self.anchor,
            filled_since_quote,
            "Requoting"
        );
        self.anchor = Some(reference);
        self.seen_filled = gross_filled;

        Decision::go_now(
            now,
            Action::Requote {
                cancel: open,
                place: self.quotes(trade, state, reference),
            },
        )
    }

    fn on_rejected(&mut self, rejected: &OrderRecord, consecutive: u32) -> Correction {
        // Force fresh quotes on the next evaluation
        self.anchor = None;

        if consecutive > self.params.max_rejections {
            return Correction::GiveUp {
                reason: format!(
                    "{} consecutive rejected quotes, last: {}",
                    consecutive,
                    rejected.reason.as_deref().unwrap_or("unknown")
                ),
            };
        }
        Correction::Retry {
            after: Duration::from_secs(self.params.refresh_secs),
        }
    }

    fn needs_reference_price(&self) -> bool {
        true
    }
}
