//! Time-weighted average price strategy
//!
//! Splits `total_quantity` into N equal slices submitted one interval apart,
//! starting at the trade's `started_at`. Only one slice order is ever open.
//! Slice k is due at `started_at + k * interval`; the quantity submitted for
//! it is whatever brings the filled quantity up to the cumulative target of
//! slices `0..=k`, so unfilled remainders are carried forward and the sum of
//! all slices equals the trade's total exactly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::common::errors::StrategyError;
use crate::common::market::MarketRules;
use crate::common::types::{OrderRecord, Trade};
use crate::strategy::traits::Strategy;
use crate::strategy::types::{Action, Correction, Decision, ExecutionState, OrderIntent};

/// What to do when a slice falls due while the previous slice's order is
/// still working
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaggingSlicePolicy {
    /// Cancel the lagging order and fold its unfilled remainder into the due slice
    #[default]
    Fold,
    /// Leave the lagging order working and push the rest of the schedule back
    /// by whole intervals until it closes
    Extend,
}

fn default_max_rejections() -> u32 {
    3
}

/// Longest schedule accepted, in seconds (one leap year)
pub const MAX_SCHEDULE_SECS: u64 = 366 * 24 * 3600;

fn schedule_seconds(secs: u64, field: &str) -> Result<ChronoDuration, StrategyError> {
    if secs > MAX_SCHEDULE_SECS {
        return Err(StrategyError::InvalidParams(format!(
            "twap: {} exceeds {} seconds",
            field, MAX_SCHEDULE_SECS
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .ok_or_else(|| StrategyError::InvalidParams(format!("twap: {} out of range", field)))
}

/// TWAP parameters as stored in `strategy_params`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwapParams {
    /// Total schedule length in seconds
    #[serde(default, alias = "duration")]
    pub duration_secs: Option<u64>,
    /// Total schedule length in hours
    #[serde(default)]
    pub total_duration_hours: Option<Decimal>,
    /// Seconds between slices
    #[serde(default, alias = "interval", alias = "frequency")]
    pub interval_secs: Option<u64>,
    /// Number of slices; takes precedence over `interval_secs`
    #[serde(default)]
    pub slice_count: Option<u32>,
    #[serde(default)]
    pub lagging_slice: LaggingSlicePolicy,
    /// Consecutive rejected placements tolerated before the trade fails
    #[serde(default = "default_max_rejections")]
    pub max_rejections: u32,
}

impl TwapParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, StrategyError> {
        serde_json::from_value(value.clone())
            .map_err(|e| StrategyError::InvalidParams(format!("twap: {}", e)))
    }

    fn duration(&self) -> Result<ChronoDuration, StrategyError> {
        let secs = match (self.duration_secs, self.total_duration_hours) {
            (Some(secs), _) => secs,
            (None, Some(hours)) => hours
                .checked_mul(Decimal::from(3600))
                .and_then(|secs| secs.to_u64())
                .ok_or_else(|| StrategyError::InvalidParams("twap: duration out of range".into()))?,
            (None, None) => {
                return Err(StrategyError::InvalidParams(
                    "twap: duration_secs is required".into(),
                ))
            }
        };
        if secs == 0 {
            return Err(StrategyError::InvalidParams(
                "twap: duration must be positive".into(),
            ));
        }
        schedule_seconds(secs, "duration")
    }
}

/// Slice layout of a TWAP trade
#[derive(Debug, Clone, PartialEq)]
pub struct TwapSchedule {
    pub interval: ChronoDuration,
    pub slice_count: u32,
    /// Quantity of every slice but the last
    pub base_quantity: Decimal,
    /// Quantity of the last slice, carrying the rounding remainder
    pub final_quantity: Decimal,
}

impl TwapSchedule {
    pub fn build(
        total: Decimal,
        duration: ChronoDuration,
        interval: Option<ChronoDuration>,
        slice_count: Option<u32>,
        rules: &MarketRules,
    ) -> Result<Self, StrategyError> {
        if total <= Decimal::ZERO {
            return Err(StrategyError::Unsupported(
                "total quantity must be positive".into(),
            ));
        }

        let duration_ms = duration.num_milliseconds();
        let (interval, requested) = match (slice_count, interval) {
            (Some(0), _) => {
                return Err(StrategyError::InvalidParams(
                    "twap: slice_count must be at least 1".into(),
                ))
            }
            (Some(n), _) => (ChronoDuration::milliseconds(duration_ms / n as i64), n),
            (None, Some(interval)) => {
                if interval <= ChronoDuration::zero() {
                    return Err(StrategyError::InvalidParams(
                        "twap: interval must be positive".into(),
                    ));
                }
                let n = (duration_ms / interval.num_milliseconds()).max(1);
                (interval, u32::try_from(n).unwrap_or(u32::MAX))
            }
            (None, None) => {
                return Err(StrategyError::InvalidParams(
                    "twap: one of interval_secs or slice_count is required".into(),
                ))
            }
        };
        if interval <= ChronoDuration::zero() {
            return Err(StrategyError::InvalidParams(
                "twap: slices would be less than a millisecond apart".into(),
            ));
        }

        let max_slices = (total / rules.quantity_tick)
            .trunc()
            .to_u32()
            .unwrap_or(u32::MAX);
        if max_slices == 0 {
            return Err(StrategyError::Unsupported(format!(
                "total quantity {} is below the minimum increment {}",
                total, rules.quantity_tick
            )));
        }
        let slice_count = requested.min(max_slices);

        let base_quantity = rules.round_quantity(total / Decimal::from(slice_count));
        let final_quantity = total - base_quantity * Decimal::from(slice_count - 1);

        Ok(Self {
            interval,
            slice_count,
            base_quantity,
            final_quantity,
        })
    }

    pub fn slice_quantity(&self, k: u32) -> Decimal {
        if k + 1 < self.slice_count {
            self.base_quantity
        } else if k + 1 == self.slice_count {
            self.final_quantity
        } else {
            Decimal::ZERO
        }
    }

    pub fn slice_quantities(&self) -> Vec<Decimal> {
        (0..self.slice_count).map(|k| self.slice_quantity(k)).collect()
    }

    /// Sum of the quantities of slices `0..=k`; the total for catch-up slices
    pub fn cumulative_target(&self, k: u32) -> Decimal {
        if k + 1 >= self.slice_count {
            self.base_quantity * Decimal::from(self.slice_count - 1) + self.final_quantity
        } else {
            self.base_quantity * Decimal::from(k + 1)
        }
    }

    pub fn slice_time(&self, start: DateTime<Utc>, k: u32) -> DateTime<Utc> {
        self.interval
            .num_milliseconds()
            .checked_mul(i64::from(k))
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|offset| start.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// First schedule tick at or after `t`
    pub fn tick_at_or_after(&self, start: DateTime<Utc>, t: DateTime<Utc>) -> DateTime<Utc> {
        let elapsed = (t - start).num_milliseconds();
        if elapsed <= 0 {
            return start;
        }
        let step = self.interval.num_milliseconds();
        let ticks = (elapsed + step - 1) / step;
        start + ChronoDuration::milliseconds(ticks * step)
    }

    /// First schedule tick strictly after `t`
    pub fn tick_after(&self, start: DateTime<Utc>, t: DateTime<Utc>) -> DateTime<Utc> {
        let elapsed = (t - start).num_milliseconds().max(-1);
        let step = self.interval.num_milliseconds();
        let ticks = elapsed.div_euclid(step) + 1;
        start + ChronoDuration::milliseconds(ticks * step)
    }
}

/// TWAP strategy instance for one trade
#[derive(Debug, Clone)]
pub struct TwapStrategy {
    params: TwapParams,
    schedule: TwapSchedule,
    rules: MarketRules,
}

impl TwapStrategy {
    pub fn new(trade: &Trade, rules: MarketRules) -> Result<Self, StrategyError> {
        let params = TwapParams::from_value(&trade.strategy_params)?;
        let duration = params.duration()?;
        let interval = params
            .interval_secs
            .map(|secs| schedule_seconds(secs, "interval"))
            .transpose()?;
        let schedule = TwapSchedule::build(
            trade.total_quantity,
            duration,
            interval,
            params.slice_count,
            &rules,
        )?;

        Ok(Self {
            params,
            schedule,
            rules,
        })
    }

    pub fn schedule(&self) -> &TwapSchedule {
        &self.schedule
    }

    pub fn policy(&self) -> LaggingSlicePolicy {
        self.params.lagging_slice
    }

    /// When slice `k` may be submitted, given that slice `k - 1` is closed
    fn slice_due(&self, k: u32, state: &ExecutionState) -> DateTime<Utc> {
        let scheduled = self.schedule.slice_time(state.started_at, k);
        if self.params.lagging_slice == LaggingSlicePolicy::Fold || k == 0 {
            return scheduled;
        }
        match state.order_for_slice(k - 1).and_then(|o| o.closed_at()) {
            Some(closed_at) if closed_at > scheduled => {
                self.schedule.tick_at_or_after(state.started_at, closed_at)
            }
            _ => scheduled,
        }
    }

    fn quantity_for_slice(&self, k: u32, state: &ExecutionState) -> Decimal {
        let behind = self.schedule.cumulative_target(k) - state.filled_quantity;
        let quantity = self
            .rules
            .round_quantity(behind.min(state.remaining_quantity));
        if self.rules.is_dust(quantity) {
            self.rules.round_quantity(state.remaining_quantity)
        } else {
            quantity
        }
    }
}

impl Strategy for TwapStrategy {
    fn name(&self) -> &str {
        "twap"
    }

    fn next_action(&mut self, trade: &Trade, state: &ExecutionState, now: DateTime<Utc>) -> Decision {
        let open = state.open_orders().next();

        if open.is_none() && self.rules.is_dust(state.remaining_quantity) {
            return Decision::Done;
        }

        let k = state.slices_placed();
        let due = self.slice_due(k, state);

        if let Some(order) = open {
            if now < due {
                return Decision::Idle { until: due };
            }
            return match self.params.lagging_slice {
                LaggingSlicePolicy::Fold => {
                    debug!(
                        trade_id = %trade.id,
                        slice = k,
                        client_order_id = order.client_order_id,
                        "Slice due with previous order open, folding"
                    );
                    Decision::Go {
                        at: due,
                        action: Action::Cancel(order.client_order_id),
                    }
                }
                LaggingSlicePolicy::Extend => Decision::Idle {
                    until: self.schedule.tick_after(state.started_at, now),
                },
            };
        }

        let quantity = self.quantity_for_slice(k, state);
        if self.rules.is_dust(quantity) {
            return Decision::Done;
        }

        Decision::Go {
            at: due,
            action: Action::Place(
                OrderIntent::new(trade.side, quantity)
                    .with_price(trade.limit_price.map(|p| self.rules.round_price(p)))
                    .for_slice(k),
            ),
        }
    }

    fn on_rejected(&mut self, rejected: &OrderRecord, consecutive: u32) -> Correction {
        if consecutive > self.params.max_rejections {
            return Correction::GiveUp {
                reason: format!(
                    "{} consecutive rejections, last: {}",
                    consecutive,
                    rejected.reason.as_deref().unwrap_or("unknown")
                ),
            };
        }
        let backoff = Duration::from_secs(1u64 << consecutive.saturating_sub(1).min(16));
        let interval = self.schedule.interval.to_std().unwrap_or(backoff);
        Correction::Retry {
            after: backoff.min(interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{NewTrade, OrderPatch, OrderStatus, Side, StrategyKind};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn rules() -> MarketRules {
        MarketRules::new(1, dec!(0.01), dec!(0.00001))
    }

    fn whole_lots() -> MarketRules {
        MarketRules::new(1, dec!(0.01), dec!(1))
    }

    fn trade(total: Decimal, params: serde_json::Value) -> Trade {
        let now = Utc::now();
        let mut trade = Trade::new(
            NewTrade {
                pair: "BTC-USD".into(),
                side: Side::Buy,
                total_quantity: total,
                limit_price: None,
                strategy_kind: StrategyKind::Twap,
                strategy_params: params,
            },
            now,
        );
        trade.started_at = Some(now);
        trade
    }

    fn secs(s: i64) -> ChronoDuration {
        ChronoDuration::seconds(s)
    }

    fn placed(trade: &Trade, id: u64, slice: u32, qty: Decimal, at: DateTime<Utc>) -> OrderRecord {
        let mut order = OrderRecord::submitted(id, trade.id, trade.side, qty, None, Some(slice), at);
        order.apply(&OrderPatch::acknowledged(id + 1000, at));
        order
    }

    fn settle(order: &mut OrderRecord, status: OrderStatus, filled: Decimal, at: DateTime<Utc>) {
        let mut patch = OrderPatch::new(at);
        patch.status = Some(status);
        patch.filled_quantity = Some(filled);
        patch.exchange_updated_at = Some(at);
        order.apply(&patch);
    }

    #[test]
    fn test_slices_sum_exactly_with_remainder_on_final_slice() {
        let schedule =
            TwapSchedule::build(dec!(100), secs(30), None, Some(3), &whole_lots()).unwrap();
        assert_eq!(schedule.slice_quantities(), vec![dec!(33), dec!(33), dec!(34)]);
        assert_eq!(schedule.slice_quantities().iter().sum::<Decimal>(), dec!(100));

        let schedule =
            TwapSchedule::build(dec!(100), secs(40), None, Some(4), &whole_lots()).unwrap();
        assert_eq!(schedule.slice_quantities(), vec![dec!(25); 4]);
    }

    #[test]
    fn test_slice_count_derived_from_duration_and_interval() {
        let schedule =
            TwapSchedule::build(dec!(10), secs(40), Some(secs(10)), None, &rules()).unwrap();
        assert_eq!(schedule.slice_count, 4);
        assert_eq!(schedule.slice_quantities(), vec![dec!(2.5); 4]);

        let schedule =
            TwapSchedule::build(dec!(10), secs(5), Some(secs(10)), None, &rules()).unwrap();
        assert_eq!(schedule.slice_count, 1, "at least one slice");
    }

    #[test]
    fn test_slice_count_capped_by_minimum_increment() {
        let schedule =
            TwapSchedule::build(dec!(3), secs(100), Some(secs(10)), None, &whole_lots()).unwrap();
        assert_eq!(schedule.slice_count, 3);
        assert_eq!(schedule.slice_quantities(), vec![dec!(1); 3]);
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let err = TwapStrategy::new(&trade(dec!(10), json!({ "interval_secs": 10 })), rules());
        assert!(matches!(err, Err(StrategyError::InvalidParams(_))));

        let err = TwapStrategy::new(&trade(dec!(10), json!({ "duration_secs": 40 })), rules());
        assert!(matches!(err, Err(StrategyError::InvalidParams(_))));

        let err = TwapStrategy::new(
            &trade(dec!(10), json!({ "duration_secs": "soon", "interval_secs": 10 })),
            rules(),
        );
        assert!(matches!(err, Err(StrategyError::InvalidParams(_))));
    }

    #[test]
    fn test_out_of_range_durations_are_invalid_params() {
        let cases = [
            json!({ "duration_secs": 100_000_000_000_000_000u64, "interval_secs": 10 }),
            json!({ "duration_secs": 40, "interval_secs": 18_000_000_000_000_000_000u64 }),
            json!({ "total_duration_hours": "100000000000000000000", "interval_secs": 10 }),
            json!({ "total_duration_hours": -1, "interval_secs": 10 }),
            json!({ "duration_secs": MAX_SCHEDULE_SECS + 1, "interval_secs": 10 }),
        ];
        for params in cases {
            let err = TwapStrategy::new(&trade(dec!(10), params.clone()), rules());
            assert!(
                matches!(err, Err(StrategyError::InvalidParams(_))),
                "{} should be invalid",
                params
            );
        }

        let longest = json!({ "duration_secs": MAX_SCHEDULE_SECS, "interval_secs": MAX_SCHEDULE_SECS });
        assert!(TwapStrategy::new(&trade(dec!(10), longest), rules()).is_ok());
    }

    #[test]
    fn test_slice_time_for_large_index_moves_forward() {
        let schedule = TwapSchedule::build(
            dec!(10),
            secs(MAX_SCHEDULE_SECS as i64),
            None,
            Some(u32::MAX),
            &rules(),
        )
        .unwrap();
        let start = Utc::now();
        assert_eq!(schedule.slice_time(start, 0), start);
        assert!(schedule.slice_time(start, u32::MAX) > start);
    }

    #[test]
    fn test_legacy_parameter_names() {
        let strategy = TwapStrategy::new(
            &trade(dec!(1), json!({ "frequency": 60, "total_duration_hours": 1 })),
            rules(),
        )
        .unwrap();
        assert_eq!(strategy.schedule().slice_count, 60);
        assert_eq!(strategy.policy(), LaggingSlicePolicy::Fold);
    }

    #[test]
    fn test_first_slice_is_placed_at_start() {
        let trade = trade(dec!(10), json!({ "duration": 40, "interval": 10 }));
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();
        let state = ExecutionState::rebuild(&trade, vec![], start);

        let decision = strategy.next_action(&trade, &state, start);
        assert_eq!(
            decision,
            Decision::Go {
                at: start,
                action: Action::Place(OrderIntent::new(Side::Buy, dec!(2.5)).for_slice(0)),
            }
        );
    }

    #[test]
    fn test_waits_for_next_slice_while_order_works() {
        let trade = trade(dec!(10), json!({ "duration": 40, "interval": 10 }));
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();
        let orders = vec![placed(&trade, 1, 0, dec!(2.5), start)];
        let state = ExecutionState::rebuild(&trade, orders, start);

        let decision = strategy.next_action(&trade, &state, start + secs(3));
        assert_eq!(decision, Decision::Idle { until: start + secs(10) });
    }

    #[test]
    fn test_fold_cancels_lagging_slice_then_carries_remainder() {
        let trade = trade(dec!(10), json!({ "duration": 40, "interval": 10 }));
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();

        let mut first = placed(&trade, 1, 0, dec!(2.5), start);
        settle(&mut first, OrderStatus::Filled, dec!(2.5), start + secs(2));
        let lagging = placed(&trade, 2, 1, dec!(2.5), start + secs(10));
        let state = ExecutionState::rebuild(&trade, vec![first.clone(), lagging.clone()], start);

        let decision = strategy.next_action(&trade, &state, start + secs(20));
        assert_eq!(
            decision,
            Decision::Go {
                at: start + secs(20),
                action: Action::Cancel(2),
            }
        );

        let mut cancelled = lagging;
        settle(&mut cancelled, OrderStatus::Cancelled, dec!(0.5), start + secs(20));
        let state = ExecutionState::rebuild(&trade, vec![first, cancelled], start);
        let decision = strategy.next_action(&trade, &state, start + secs(20));
        assert_eq!(
            decision,
            Decision::Go {
                at: start + secs(20),
                action: Action::Place(OrderIntent::new(Side::Buy, dec!(4.5)).for_slice(2)),
            }
        );
    }

    #[test]
    fn test_extend_pushes_schedule_back_by_whole_intervals() {
        let trade = trade(
            dec!(10),
            json!({ "duration": 40, "interval": 10, "lagging_slice": "extend" }),
        );
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();

        let mut first = placed(&trade, 1, 0, dec!(2.5), start);
        settle(&mut first, OrderStatus::Filled, dec!(2.5), start + secs(2));
        let mut lagging = placed(&trade, 2, 1, dec!(2.5), start + secs(10));
        let state = ExecutionState::rebuild(&trade, vec![first.clone(), lagging.clone()], start);

        let decision = strategy.next_action(&trade, &state, start + secs(20));
        assert_eq!(decision, Decision::Idle { until: start + secs(30) });

        settle(&mut lagging, OrderStatus::Filled, dec!(2.5), start + secs(25));
        let state = ExecutionState::rebuild(&trade, vec![first, lagging], start);
        let decision = strategy.next_action(&trade, &state, start + secs(25));
        assert_eq!(
            decision,
            Decision::Go {
                at: start + secs(30),
                action: Action::Place(OrderIntent::new(Side::Buy, dec!(2.5)).for_slice(2)),
            }
        );
    }

    #[test]
    fn test_catch_up_after_schedule_end() {
        let trade = trade(dec!(10), json!({ "duration": 20, "interval": 10 }));
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();

        let mut a = placed(&trade, 1, 0, dec!(5), start);
        settle(&mut a, OrderStatus::Filled, dec!(5), start + secs(1));
        let mut b = placed(&trade, 2, 1, dec!(5), start + secs(10));
        settle(&mut b, OrderStatus::Cancelled, dec!(4), start + secs(19));
        let state = ExecutionState::rebuild(&trade, vec![a, b], start);

        let decision = strategy.next_action(&trade, &state, start + secs(20));
        assert_eq!(
            decision,
            Decision::Go {
                at: start + secs(20),
                action: Action::Place(OrderIntent::new(Side::Buy, dec!(1)).for_slice(2)),
            }
        );
    }

    #[test]
    fn test_done_once_filled() {
        let trade = trade(dec!(5), json!({ "duration": 10, "interval": 10 }));
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let start = trade.started_at.unwrap();
        let mut only = placed(&trade, 1, 0, dec!(5), start);
        settle(&mut only, OrderStatus::Filled, dec!(5), start + secs(1));
        let state = ExecutionState::rebuild(&trade, vec![only], start);

        assert!(strategy.next_action(&trade, &state, start + secs(2)).is_done());
    }

    #[test]
    fn test_rejections_retry_then_give_up() {
        let trade = trade(
            dec!(10),
            json!({ "duration": 40, "interval": 10, "max_rejections": 2 }),
        );
        let mut strategy = TwapStrategy::new(&trade, rules()).unwrap();
        let mut rejected = placed(&trade, 1, 0, dec!(2.5), Utc::now());
        rejected.apply(&OrderPatch::rejected("post only would cross", Utc::now()));

        assert_eq!(
            strategy.on_rejected(&rejected, 1),
            Correction::Retry { after: Duration::from_secs(1) }
        );
        assert_eq!(
            strategy.on_rejected(&rejected, 2),
            Correction::Retry { after: Duration::from_secs(2) }
        );
        assert!(matches!(
            strategy.on_rejected(&rejected, 3),
            Correction::GiveUp { .. }
        ));
    }
}
