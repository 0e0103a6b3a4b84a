//! Cube REST message types
//!
//! Prices and quantities on the wire are integers: prices in price ticks and
//! quantities in base lots of the market. Conversion to decimals happens in
//! the client, with the market's [`MarketRules`](crate::common::market::MarketRules).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::types::Side;

/// Numeric side codes
pub mod side {
    pub const BID: u8 = 0;
    pub const ASK: u8 = 1;
}

/// Numeric time-in-force codes
pub mod time_in_force {
    pub const IMMEDIATE_OR_CANCEL: u8 = 0;
    pub const GOOD_FOR_SESSION: u8 = 1;
}

/// Numeric order type codes
pub mod order_type {
    pub const LIMIT: u8 = 0;
    pub const MARKET_WITH_PROTECTION: u8 = 2;
}

pub fn side_code(side: Side) -> u8 {
    match side {
        Side::Buy => side::BID,
        Side::Sell => side::ASK,
    }
}

/// Every REST response wraps its payload in `result`
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub result: T,
}

/// POST /order body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub client_order_id: u64,
    pub request_id: u64,
    pub market_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<u64>,
    pub quantity: u64,
    pub side: u8,
    pub time_in_force: u8,
    pub order_type: u8,
    pub subaccount_id: u64,
    pub post_only: bool,
    pub cancel_on_disconnect: bool,
}

/// DELETE /order body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub client_order_id: u64,
    pub request_id: u64,
    pub market_id: u64,
    pub subaccount_id: u64,
}

/// Outcome of a placement or cancel request
#[derive(Debug, Clone, Deserialize)]
pub enum OrderResponse {
    Ack(OrderAckMessage),
    Rej(OrderRejectMessage),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAckMessage {
    pub client_order_id: u64,
    #[serde(default)]
    pub exchange_order_id: Option<u64>,
    #[serde(default)]
    pub transact_time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRejectMessage {
    pub client_order_id: u64,
    /// Code or text, depending on the rejection
    #[serde(default)]
    pub reason: serde_json::Value,
}

impl OrderRejectMessage {
    pub fn reason_text(&self) -> String {
        match &self.reason {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => "rejected by exchange".to_string(),
            other => other.to_string(),
        }
    }
}

/// GET /users/subaccount/{id}/orders payload
#[derive(Debug, Clone, Deserialize)]
pub struct SubaccountOrders {
    #[serde(default)]
    pub orders: Vec<CubeOrder>,
}

/// One order as listed for a subaccount
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeOrder {
    pub client_order_id: u64,
    #[serde(default)]
    pub exchange_order_id: Option<u64>,
    pub market_id: u64,
    /// "open", "partially_filled", "filled", "canceled" or "rejected"
    pub status: String,
    #[serde(alias = "quantity")]
    pub qty: u64,
    /// Executed base lots
    #[serde(default, alias = "filledQuantity")]
    pub filled_qty: u64,
    #[serde(default)]
    pub price: Option<u64>,
    #[serde(default)]
    pub reason: Option<serde_json::Value>,
    #[serde(default)]
    pub fills: Vec<CubeFill>,
    /// Nanoseconds since the epoch
    #[serde(default)]
    pub updated_at: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeFill {
    pub trade_id: u64,
    #[serde(default)]
    pub exchange_order_id: Option<u64>,
    /// Price ticks
    pub fill_price: u64,
    /// Base lots
    pub fill_quantity: u64,
    #[serde(default)]
    pub fee_ratio: Option<Decimal>,
    /// Nanoseconds since the epoch
    pub transact_time: u64,
}

/// GET /parsed/book/{symbol}/snapshot payload
#[derive(Debug, Clone, Deserialize)]
pub struct BookSnapshot {
    #[serde(default)]
    pub ticker: Option<String>,
    /// (price, quantity), best first
    #[serde(default)]
    pub bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    pub asks: Vec<(Decimal, Decimal)>,
}

impl BookSnapshot {
    /// Mid of the best bid and ask, or the one side present
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.bids.first().map(|(price, _)| *price);
        let ask = self.asks.first().map(|(price, _)| *price);
        match (bid, ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            (Some(price), None) | (None, Some(price)) => Some(price),
            (None, None) => None,
        }
    }
}

/// Exchange nanosecond timestamp to UTC
pub fn from_nanos(nanos: u64) -> Option<DateTime<Utc>> {
    let secs = (nanos / 1_000_000_000) as i64;
    let subsec = (nanos % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
}
