use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

use crate::common::types::{OrderRecord, OrderStatus, Side, Trade};

/// One order a strategy wants on the book
///
/// The worker turns an intent into an [`OrderRecord`] (with a fresh client
/// order id) and a gateway placement.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub side: Side,
    pub quantity: Decimal,
    /// None places a market order
    pub price: Option<Decimal>,
    /// TWAP slice index, if any
    pub slice: Option<u32>,
}

impl OrderIntent {
    pub fn new(side: Side, quantity: Decimal) -> Self {
        Self {
            side,
            quantity,
            price: None,
            slice: None,
        }
    }

    pub fn with_price(mut self, price: Option<Decimal>) -> Self {
        self.price = price;
        self
    }

    pub fn for_slice(mut self, slice: u32) -> Self {
        self.slice = Some(slice);
        self
    }
}

/// A mutation of the trade's orders on the exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Place one order
    Place(OrderIntent),
    /// Cancel one working order, by client order id
    Cancel(u64),
    /// Cancel the listed orders, then place the new ones
    Requote {
        cancel: Vec<u64>,
        place: Vec<OrderIntent>,
    },
}

/// Strategy output for one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing to do before `until`
    Idle { until: DateTime<Utc> },
    /// Execute `action` once `at` is reached
    Go { at: DateTime<Utc>, action: Action },
    /// The trade's objective is met
    Done,
}

impl Decision {
    pub fn go_now(now: DateTime<Utc>, action: Action) -> Self {
        Self::Go { at: now, action }
    }

    /// Returns true if this is a Done decision
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Strategy answer to a rejected placement
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Re-evaluate after the delay; the rejected intent will be proposed again
    Retry { after: Duration },
    /// Stop and fail the trade
    GiveUp { reason: String },
}

/// Worker's working snapshot of a trade's execution
///
/// Rebuilt from the trade and its order records whenever the worker starts
/// and after every reconciliation; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    /// Schedule anchor
    pub started_at: DateTime<Utc>,
    /// Net quantity executed on the trade's side
    pub filled_quantity: Decimal,
    /// total_quantity - filled_quantity, never negative
    pub remaining_quantity: Decimal,
    /// All order records of the trade in creation order
    pub orders: Vec<OrderRecord>,
    /// Latest reference price, for quoting strategies
    pub reference_price: Option<Decimal>,
    /// When the worker next plans to act
    pub next_action_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn rebuild(trade: &Trade, mut orders: Vec<OrderRecord>, now: DateTime<Utc>) -> Self {
        orders.sort_by_key(|o| (o.created_at, o.client_order_id));

        let filled_quantity = net_filled(trade.side, &orders);
        let remaining_quantity = (trade.total_quantity - filled_quantity).max(Decimal::ZERO);

        Self {
            started_at: trade.started_at.unwrap_or(now),
            filled_quantity,
            remaining_quantity,
            orders,
            reference_price: None,
            next_action_at: None,
        }
    }

    /// Orders still working (Submitted, Acknowledged or PartiallyFilled)
    pub fn open_orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.iter().filter(|o| o.is_open())
    }

    pub fn has_open_orders(&self) -> bool {
        self.open_orders().next().is_some()
    }

    /// Quantity working on the book on the given side
    pub fn open_quantity(&self, side: Side) -> Decimal {
        self.open_orders()
            .filter(|o| o.side == side)
            .map(|o| o.open_quantity())
            .sum()
    }

    /// Number of trailing records that ended Rejected
    pub fn consecutive_rejections(&self) -> u32 {
        self.orders
            .iter()
            .rev()
            .take_while(|o| o.local_status == OrderStatus::Rejected)
            .count() as u32
    }

    /// One past the highest slice index with a non-rejected order
    pub fn slices_placed(&self) -> u32 {
        self.orders
            .iter()
            .filter(|o| o.local_status != OrderStatus::Rejected)
            .filter_map(|o| o.slice)
            .max()
            .map(|s| s + 1)
            .unwrap_or(0)
    }

    /// Latest non-rejected order placed for a slice
    pub fn order_for_slice(&self, slice: u32) -> Option<&OrderRecord> {
        self.orders
            .iter()
            .rev()
            .filter(|o| o.local_status != OrderStatus::Rejected)
            .find(|o| o.slice == Some(slice))
    }

    pub fn find_order(&self, client_order_id: u64) -> Option<&OrderRecord> {
        self.orders
            .iter()
            .find(|o| o.client_order_id == client_order_id)
    }
}

/// Trade-side fills minus opposite-side fills
pub fn net_filled(side: Side, orders: &[OrderRecord]) -> Decimal {
    orders.iter().fold(Decimal::ZERO, |acc, o| {
        if o.side == side {
            acc + o.filled_quantity
        } else {
            acc - o.filled_quantity
        }
    })
}
