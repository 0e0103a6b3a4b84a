//! Persisted data model shared by the engine, the stores and the API

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::errors::{EngineError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Strategy used to execute a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Twap,
    LiquidityMaker,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Twap => "twap",
            StrategyKind::LiquidityMaker => "liquidity_maker",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "twap" => Ok(StrategyKind::Twap),
            "liquidity_maker" => Ok(StrategyKind::LiquidityMaker),
            other => Err(format!("unknown strategy kind '{}'", other)),
        }
    }
}

/// Lifecycle status of a trade
///
/// Statuses only move forward: Pending, then Active, then one of the terminal
/// statuses. Skipping Active is allowed (a trade can fail or be cancelled
/// before any worker claims it), going back never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TradeStatus {
    fn rank(self) -> u8 {
        match self {
            TradeStatus::Pending => 0,
            TradeStatus::Active => 1,
            TradeStatus::Completed | TradeStatus::Failed | TradeStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Active => "active",
            TradeStatus::Completed => "completed",
            TradeStatus::Failed => "failed",
            TradeStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "active" => Ok(TradeStatus::Active),
            "completed" => Ok(TradeStatus::Completed),
            "failed" => Ok(TradeStatus::Failed),
            "cancelled" => Ok(TradeStatus::Cancelled),
            other => Err(format!("unknown trade status '{}'", other)),
        }
    }
}

/// Request to create a trade (what the management API accepts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrade {
    pub pair: String,
    pub side: Side,
    pub total_quantity: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub strategy_kind: StrategyKind,
    #[serde(default)]
    pub strategy_params: serde_json::Value,
}

/// A persisted intent to execute a strategy over a token pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    /// Market symbol, e.g. "BTC-USD"
    pub pair: String,
    pub side: Side,
    pub total_quantity: Decimal,
    /// Worst acceptable price; None submits market orders
    pub limit_price: Option<Decimal>,
    pub strategy_kind: StrategyKind,
    /// Opaque parameters interpreted only by the matching strategy
    pub strategy_params: serde_json::Value,
    pub status: TradeStatus,
    /// Set once when a worker claims the trade; anchors time-based schedules
    pub started_at: Option<DateTime<Utc>>,
    /// Durable cancellation flag, observed by the owning worker
    pub cancel_requested: bool,
    /// Reason of the last failure or rejection
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Compare-and-set token, bumped by the store on every save
    pub version: u64,
}

impl Trade {
    pub fn new(request: NewTrade, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pair: request.pair,
            side: request.side,
            total_quantity: request.total_quantity,
            limit_price: request.limit_price,
            strategy_kind: request.strategy_kind,
            strategy_params: request.strategy_params,
            status: TradeStatus::Pending,
            started_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Move the trade to `next`, refusing backward or terminal-to-terminal moves
    pub fn transition(&mut self, next: TradeStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == TradeStatus::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Local status of an order believed to exist on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Persisted locally, placement sent but not acknowledged
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    fn rank(self) -> u8 {
        match self {
            OrderStatus::Submitted => 0,
            OrderStatus::Acknowledged => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 3,
        }
    }

    /// Submitted, Acknowledged or PartiallyFilled
    pub fn is_open(self) -> bool {
        self.rank() < 3
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    pub fn can_advance_to(self, next: OrderStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Acknowledged => "acknowledged",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(OrderStatus::Submitted),
            "acknowledged" | "open" => Ok(OrderStatus::Acknowledged),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(format!("unknown order status '{}'", other)),
        }
    }
}

/// Local record of one order, owned by exactly one trade
///
/// Records are created right before placement and are only ever patched
/// afterwards; they are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Locally generated, globally unique; the reconciliation key
    pub client_order_id: u64,
    /// Assigned by the exchange on acknowledgement
    pub exchange_order_id: Option<u64>,
    pub trade_id: Uuid,
    pub side: Side,
    pub requested_quantity: Decimal,
    /// None for market orders
    pub requested_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub local_status: OrderStatus,
    /// TWAP slice index this order was placed for
    pub slice: Option<u32>,
    /// Reject or cancel reason
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    /// Exchange transact time of the last applied exchange state
    pub exchange_updated_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// Build a fresh record in `Submitted` state
    pub fn submitted(
        client_order_id: u64,
        trade_id: Uuid,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        slice: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            trade_id,
            side,
            requested_quantity: quantity,
            requested_price: price,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            local_status: OrderStatus::Submitted,
            slice,
            reason: None,
            created_at: now,
            last_synced_at: now,
            exchange_updated_at: None,
        }
    }

    pub fn key(&self) -> OrderKey {
        OrderKey {
            client_order_id: self.client_order_id,
            exchange_order_id: self.exchange_order_id,
        }
    }

    pub fn is_open(&self) -> bool {
        self.local_status.is_open()
    }

    /// Quantity still working on the book
    pub fn open_quantity(&self) -> Decimal {
        if self.is_open() {
            (self.requested_quantity - self.filled_quantity).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    /// Time the order stopped working, if it has
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        if self.is_open() {
            None
        } else {
            Some(self.exchange_updated_at.unwrap_or(self.last_synced_at))
        }
    }

    /// Apply a patch, returning whether anything changed
    ///
    /// Exchange-derived fields (status, fills, price) are only taken from a
    /// patch whose exchange timestamp is strictly newer than the one already
    /// applied. Status only moves forward and the filled quantity never
    /// decreases, so replaying an old or identical patch is a no-op.
    pub fn apply(&mut self, patch: &OrderPatch) -> bool {
        let mut changed = false;

        if self.exchange_order_id.is_none() {
            if let Some(id) = patch.exchange_order_id {
                self.exchange_order_id = Some(id);
                changed = true;
            }
        }

        let stale = match (patch.exchange_updated_at, self.exchange_updated_at) {
            (Some(incoming), Some(applied)) => incoming <= applied,
            _ => false,
        };

        if !stale {
            if let Some(filled) = patch.filled_quantity {
                if filled > self.filled_quantity {
                    self.filled_quantity = filled;
                    changed = true;
                }
            }
            if let Some(price) = patch.average_fill_price {
                if self.average_fill_price != Some(price) {
                    self.average_fill_price = Some(price);
                    changed = true;
                }
            }
            if let Some(status) = patch.status {
                if self.local_status.can_advance_to(status) {
                    self.local_status = status;
                    changed = true;
                }
            }
            if let Some(reason) = &patch.reason {
                if self.reason.as_ref() != Some(reason) {
                    self.reason = Some(reason.clone());
                    changed = true;
                }
            }
            if let Some(at) = patch.exchange_updated_at {
                if changed && self.exchange_updated_at.map_or(true, |prev| at > prev) {
                    self.exchange_updated_at = Some(at);
                }
            }
        }

        if changed && patch.synced_at > self.last_synced_at {
            self.last_synced_at = patch.synced_at;
        }
        changed
    }
}

/// Partial update of an order record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPatch {
    pub exchange_order_id: Option<u64>,
    pub status: Option<OrderStatus>,
    pub filled_quantity: Option<Decimal>,
    pub average_fill_price: Option<Decimal>,
    pub reason: Option<String>,
    pub exchange_updated_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl OrderPatch {
    pub fn new(synced_at: DateTime<Utc>) -> Self {
        Self {
            synced_at,
            ..Default::default()
        }
    }

    pub fn acknowledged(exchange_order_id: u64, synced_at: DateTime<Utc>) -> Self {
        Self {
            exchange_order_id: Some(exchange_order_id),
            status: Some(OrderStatus::Acknowledged),
            synced_at,
            ..Default::default()
        }
    }

    pub fn rejected(reason: impl Into<String>, synced_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(OrderStatus::Rejected),
            reason: Some(reason.into()),
            synced_at,
            ..Default::default()
        }
    }
}

/// Identifies an order on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub client_order_id: u64,
    /// Unknown until the placement is acknowledged
    pub exchange_order_id: Option<u64>,
}

/// Order placement request sent to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: Side,
    pub quantity: Decimal,
    /// None places a market order
    pub price: Option<Decimal>,
    pub client_order_id: u64,
}

/// Exchange acknowledgement of a placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: u64,
}

/// Exchange-reported state of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub exchange_order_id: Option<u64>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub reason: Option<String>,
    /// Exchange transact time of this state
    pub updated_at: DateTime<Utc>,
}

/// A single execution against one of our orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub exchange_order_id: u64,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Volume-weighted average price of a set of fills
pub fn average_price(fills: &[Fill]) -> Option<Decimal> {
    let quantity: Decimal = fills.iter().map(|f| f.quantity).sum();
    if quantity.is_zero() {
        return None;
    }
    let notional: Decimal = fills.iter().map(|f| f.quantity * f.price).sum();
    Some(notional / quantity)
}

/// Generates strictly increasing client order ids
///
/// Seeded from wall-clock nanoseconds so ids stay unique across restarts.
#[derive(Debug, Default)]
pub struct ClientOrderIdGenerator {
    last: AtomicU64,
}

impl ClientOrderIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n as u64)
            .unwrap_or_default();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(previous + 1)
    }
}
