//! Management API request and response bodies

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::types::{OrderRecord, OrderStatus, Side, StrategyKind, Trade, TradeStatus};
use crate::engine::WorkerState;
use crate::strategy::net_filled;

const PERCENT_DP: u32 = 4;

fn percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    (part / whole * Decimal::ONE_HUNDRED).round_dp(PERCENT_DP)
}

/// Volume-weighted average fill price over the trade-side orders
fn vwap(side: Side, orders: &[OrderRecord]) -> Option<Decimal> {
    let (quantity, notional) = orders
        .iter()
        .filter(|o| o.side == side)
        .filter_map(|o| o.average_fill_price.map(|p| (o.filled_quantity, p)))
        .fold((Decimal::ZERO, Decimal::ZERO), |(q, n), (filled, price)| {
            (q + filled, n + filled * price)
        });
    if quantity.is_zero() {
        None
    } else {
        Some(notional / quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTradeResponse {
    pub id: Uuid,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTradeResponse {
    pub id: Uuid,
    pub status: TradeStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_trades: usize,
    pub timestamp: DateTime<Utc>,
}

/// One row of GET /trades
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSummary {
    pub id: Uuid,
    pub pair: String,
    pub side: Side,
    pub strategy_kind: StrategyKind,
    pub status: TradeStatus,
    pub total_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub progress_percent: Decimal,
    pub average_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl TradeSummary {
    pub fn new(trade: &Trade, orders: &[OrderRecord]) -> Self {
        let executed = net_filled(trade.side, orders);
        Self {
            id: trade.id,
            pair: trade.pair.clone(),
            side: trade.side,
            strategy_kind: trade.strategy_kind,
            status: trade.status,
            total_quantity: trade.total_quantity,
            executed_quantity: executed,
            progress_percent: percent(executed, trade.total_quantity),
            average_price: vwap(trade.side, orders),
            created_at: trade.created_at,
        }
    }
}

/// GET /trades/{id}
#[derive(Debug, Clone, Serialize)]
pub struct TradeView {
    pub id: Uuid,
    pub pair: String,
    pub side: Side,
    pub total_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub strategy_kind: StrategyKind,
    pub strategy_params: serde_json::Value,
    pub status: TradeStatus,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub executed_quantity: Decimal,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub orders: Vec<OrderRecord>,
    /// Present while a worker owns the trade
    pub worker: Option<WorkerState>,
}

impl TradeView {
    pub fn new(trade: Trade, orders: Vec<OrderRecord>, worker: Option<WorkerState>) -> Self {
        Self {
            executed_quantity: net_filled(trade.side, &orders),
            id: trade.id,
            pair: trade.pair,
            side: trade.side,
            total_quantity: trade.total_quantity,
            limit_price: trade.limit_price,
            strategy_kind: trade.strategy_kind,
            strategy_params: trade.strategy_params,
            status: trade.status,
            cancel_requested: trade.cancel_requested,
            last_error: trade.last_error,
            started_at: trade.started_at,
            created_at: trade.created_at,
            updated_at: trade.updated_at,
            orders,
            worker,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderCounts {
    pub total: usize,
    pub open: usize,
    pub filled: usize,
    pub cancelled: usize,
    pub rejected: usize,
    /// Filled orders as a percentage of all orders
    pub fill_rate_percent: Decimal,
}

/// GET /trades/{id}/stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub trade_id: Uuid,
    pub pair: String,
    pub side: Side,
    pub strategy_kind: StrategyKind,
    pub status: TradeStatus,
    pub total_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub progress_percent: Decimal,
    pub average_price: Option<Decimal>,
    pub executed_value: Decimal,
    pub limit_price: Option<Decimal>,
    /// Positive when the average price beat the limit
    pub price_improvement_percent: Option<Decimal>,
    /// From the first order to the last order that closed
    pub execution_seconds: Option<i64>,
    pub orders: OrderCounts,
}

impl ExecutionStats {
    pub fn compute(trade: &Trade, orders: &[OrderRecord]) -> Self {
        let executed = net_filled(trade.side, orders);
        let average_price = vwap(trade.side, orders);
        let executed_value = orders
            .iter()
            .filter(|o| o.side == trade.side)
            .filter_map(|o| o.average_fill_price.map(|p| p * o.filled_quantity))
            .sum();

        let price_improvement_percent = match (trade.limit_price, average_price) {
            (Some(limit), Some(avg)) if !limit.is_zero() => {
                let edge = match trade.side {
                    Side::Buy => limit - avg,
                    Side::Sell => avg - limit,
                };
                Some(percent(edge, limit))
            }
            _ => None,
        };

        let first = orders.iter().map(|o| o.created_at).min();
        let last = orders.iter().filter_map(|o| o.closed_at()).max();
        let execution_seconds = match (first, last) {
            (Some(first), Some(last)) if last >= first => Some((last - first).num_seconds()),
            _ => None,
        };

        let count = |status: OrderStatus| orders.iter().filter(|o| o.local_status == status).count();
        let filled = count(OrderStatus::Filled);
        let counts = OrderCounts {
            total: orders.len(),
            open: orders.iter().filter(|o| o.is_open()).count(),
            filled,
            cancelled: count(OrderStatus::Cancelled),
            rejected: count(OrderStatus::Rejected),
            fill_rate_percent: percent(Decimal::from(filled), Decimal::from(orders.len())),
        };

        Self {
            trade_id: trade.id,
            pair: trade.pair.clone(),
            side: trade.side,
            strategy_kind: trade.strategy_kind,
            status: trade.status,
            total_quantity: trade.total_quantity,
            executed_quantity: executed,
            remaining_quantity: (trade.total_quantity - executed).max(Decimal::ZERO),
            progress_percent: percent(executed, trade.total_quantity),
            average_price,
            executed_value,
            limit_price: trade.limit_price,
            price_improvement_percent,
            execution_seconds,
            orders: counts,
        }
    }
}
