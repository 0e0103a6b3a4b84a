//! Paper exchange
//!
//! An in-memory [`ExchangeGateway`] that matches orders against a settable
//! reference price. Used by `--paper` mode and throughout the test suites,
//! where its fault injection stands in for a misbehaving exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::clock::{Clock, SystemClock};
use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::traits::ExchangeGateway;
use crate::common::types::{
    average_price, Fill, OrderAck, OrderKey, OrderRequest, OrderStatus, OrderStatusReport, Side,
};

/// How resting orders get executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Orders fill in full as soon as they cross the reference price;
    /// market orders fill immediately
    #[default]
    Cross,
    /// Crossing orders fill this fraction of their remaining quantity per
    /// matching event, then keep resting
    Partial(Decimal),
    /// Nothing fills unless [`PaperExchange::fill_order`] is called
    Manual,
}

/// Scripted outcome for an upcoming placement
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementFault {
    /// Refuse the order
    Reject(String),
    /// Return a timeout without accepting the order
    Drop,
    /// Accept the order but return a timeout, losing the acknowledgement
    LoseAck,
    /// Report the venue as unreachable
    Unavailable,
}

/// One order as the paper exchange sees it
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub exchange_order_id: u64,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub fills: Vec<Fill>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PaperOrder {
    fn remaining(&self) -> Decimal {
        self.request.quantity - self.filled_quantity
    }

    fn is_open(&self) -> bool {
        self.status.is_open()
    }

    fn crosses(&self, reference: Decimal) -> bool {
        match (self.request.side, self.request.price) {
            (_, None) => true,
            (Side::Buy, Some(limit)) => limit >= reference,
            (Side::Sell, Some(limit)) => limit <= reference,
        }
    }

    fn report(&self) -> OrderStatusReport {
        OrderStatusReport {
            exchange_order_id: Some(self.exchange_order_id),
            status: self.status,
            filled_quantity: self.filled_quantity,
            average_price: average_price(&self.fills),
            reason: self.reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    orders: HashMap<u64, PaperOrder>,
    by_exchange_id: HashMap<u64, u64>,
    reference_prices: HashMap<String, Decimal>,
    faults: VecDeque<PlacementFault>,
    cancel_faults: VecDeque<GatewayError>,
    unavailable: bool,
    next_exchange_id: u64,
    next_fill_id: u64,
    last_event_at: Option<DateTime<Utc>>,
    placements: usize,
}

impl Book {
    /// Event timestamp that is strictly later than every previous one
    fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last_event_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_event_at = Some(at);
        at
    }

    fn lookup(&self, key: &OrderKey) -> Option<u64> {
        if self.orders.contains_key(&key.client_order_id) {
            return Some(key.client_order_id);
        }
        key.exchange_order_id
            .and_then(|id| self.by_exchange_id.get(&id).copied())
    }

    fn execute(&mut self, client_order_id: u64, quantity: Decimal, price: Decimal, now: DateTime<Utc>) {
        let at = self.stamp(now);
        self.next_fill_id += 1;
        let fill_id = self.next_fill_id;
        let Some(order) = self.orders.get_mut(&client_order_id) else {
            return;
        };
        let quantity = quantity.min(order.remaining());
        if quantity <= Decimal::ZERO || !order.is_open() {
            return;
        }
        order.fills.push(Fill {
            fill_id,
            exchange_order_id: order.exchange_order_id,
            quantity,
            price,
            fee: Decimal::ZERO,
            timestamp: at,
        });
        order.filled_quantity += quantity;
        order.status = if order.remaining() <= Decimal::ZERO {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = at;
    }

    fn match_order(&mut self, client_order_id: u64, mode: FillMode, now: DateTime<Utc>) {
        let Some(order) = self.orders.get(&client_order_id) else {
            return;
        };
        let Some(reference) = self.reference_prices.get(&order.request.pair).copied() else {
            return;
        };
        if !order.is_open() || !order.crosses(reference) {
            return;
        }
        let price = order.request.price.unwrap_or(reference);
        let quantity = match mode {
            FillMode::Cross => order.remaining(),
            FillMode::Partial(ratio) => (order.remaining() * ratio).max(Decimal::ZERO),
            FillMode::Manual => return,
        };
        self.execute(client_order_id, quantity, price, now);
    }
}

/// In-memory exchange
pub struct PaperExchange {
    book: Mutex<Book>,
    mode: FillMode,
    clock: Arc<dyn Clock>,
}

impl PaperExchange {
    pub fn new(mode: FillMode) -> Self {
        Self::with_clock(mode, Arc::new(SystemClock))
    }

    pub fn with_clock(mode: FillMode, clock: Arc<dyn Clock>) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            mode,
            clock,
        }
    }

    /// Move the reference price of a pair, matching resting orders that now cross
    pub async fn set_reference_price(&self, pair: &str, price: Decimal) {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        book.reference_prices.insert(pair.to_string(), price);
        let resting: Vec<u64> = book
            .orders
            .values()
            .filter(|o| o.is_open() && o.request.pair == pair)
            .map(|o| o.request.client_order_id)
            .collect();
        for id in resting {
            book.match_order(id, self.mode, now);
        }
    }

    /// Queue a scripted outcome for the next placement
    pub async fn push_fault(&self, fault: PlacementFault) {
        self.book.lock().await.faults.push_back(fault);
    }

    /// Queue an error for the next cancel request
    pub async fn push_cancel_fault(&self, error: GatewayError) {
        self.book.lock().await.cancel_faults.push_back(error);
    }

    /// Make every call fail with `GatewayError::Unavailable`
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.book.lock().await.unavailable = unavailable;
    }

    /// Execute part of a resting order at the given price
    pub async fn fill_order(&self, client_order_id: u64, quantity: Decimal, price: Decimal) {
        let now = self.clock.now();
        self.book
            .lock()
            .await
            .execute(client_order_id, quantity, price, now);
    }

    /// Cancel an order from the exchange side
    pub async fn expire_order(&self, client_order_id: u64, reason: &str) {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        let at = book.stamp(now);
        if let Some(order) = book.orders.get_mut(&client_order_id) {
            if order.is_open() {
                order.status = OrderStatus::Cancelled;
                order.reason = Some(reason.to_string());
                order.updated_at = at;
            }
        }
    }

    /// Every order ever accepted, oldest first
    pub async fn orders(&self) -> Vec<PaperOrder> {
        let book = self.book.lock().await;
        let mut orders: Vec<PaperOrder> = book.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.exchange_order_id);
        orders
    }

    pub async fn open_orders(&self) -> Vec<PaperOrder> {
        self.orders()
            .await
            .into_iter()
            .filter(|o| o.is_open())
            .collect()
    }

    pub async fn order(&self, client_order_id: u64) -> Option<PaperOrder> {
        self.book.lock().await.orders.get(&client_order_id).cloned()
    }

    /// Number of placement requests received, including refused ones
    pub async fn placement_count(&self) -> usize {
        self.book.lock().await.placements
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        book.placements += 1;
        if book.unavailable {
            return Err(GatewayError::Unavailable("paper exchange offline".into()));
        }

        let fault = book.faults.pop_front();
        match &fault {
            Some(PlacementFault::Reject(reason)) => return Err(GatewayError::rejected(reason.clone())),
            Some(PlacementFault::Drop) => return Err(GatewayError::Timeout),
            Some(PlacementFault::Unavailable) => {
                return Err(GatewayError::Unavailable("connection reset".into()))
            }
            Some(PlacementFault::LoseAck) | None => {}
        }

        if book.orders.contains_key(&request.client_order_id) {
            return Err(GatewayError::rejected("duplicate client order id"));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(GatewayError::rejected("quantity must be positive"));
        }
        if request.price.is_none() && !book.reference_prices.contains_key(&request.pair) {
            return Err(GatewayError::rejected(format!(
                "no liquidity for market order on {}",
                request.pair
            )));
        }

        book.next_exchange_id += 1;
        let exchange_order_id = book.next_exchange_id;
        let at = book.stamp(now);
        book.orders.insert(
            request.client_order_id,
            PaperOrder {
                exchange_order_id,
                request: request.clone(),
                status: OrderStatus::Acknowledged,
                filled_quantity: Decimal::ZERO,
                fills: Vec::new(),
                reason: None,
                updated_at: at,
            },
        );
        book.by_exchange_id
            .insert(exchange_order_id, request.client_order_id);
        book.match_order(request.client_order_id, self.mode, now);

        debug!(
            client_order_id = request.client_order_id,
            exchange_order_id,
            side = %request.side,
            quantity = %request.quantity,
            "Paper order accepted"
        );

        if fault == Some(PlacementFault::LoseAck) {
            return Err(GatewayError::Timeout);
        }
        Ok(OrderAck { exchange_order_id })
    }

    async fn cancel_order(&self, key: &OrderKey) -> GatewayResult<()> {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        if book.unavailable {
            return Err(GatewayError::Unavailable("paper exchange offline".into()));
        }
        if let Some(err) = book.cancel_faults.pop_front() {
            return Err(err);
        }
        let id = book
            .lookup(key)
            .ok_or_else(|| GatewayError::rejected("unknown order"))?;
        let at = book.stamp(now);
        if let Some(order) = book.orders.get_mut(&id) {
            if order.is_open() {
                order.status = OrderStatus::Cancelled;
                order.reason = Some("cancelled by user".into());
                order.updated_at = at;
            }
        }
        Ok(())
    }

    async fn get_order_status(&self, key: &OrderKey) -> GatewayResult<Option<OrderStatusReport>> {
        let book = self.book.lock().await;
        if book.unavailable {
            return Err(GatewayError::Unavailable("paper exchange offline".into()));
        }
        Ok(book
            .lookup(key)
            .and_then(|id| book.orders.get(&id))
            .map(PaperOrder::report))
    }

    async fn get_fills(&self, key: &OrderKey) -> GatewayResult<Vec<Fill>> {
        let book = self.book.lock().await;
        if book.unavailable {
            return Err(GatewayError::Unavailable("paper exchange offline".into()));
        }
        Ok(book
            .lookup(key)
            .and_then(|id| book.orders.get(&id))
            .map(|o| o.fills.clone())
            .unwrap_or_default())
    }

    async fn reference_price(&self, pair: &str) -> GatewayResult<Decimal> {
        let book = self.book.lock().await;
        if book.unavailable {
            return Err(GatewayError::Unavailable("paper exchange offline".into()));
        }
        book.reference_prices
            .get(pair)
            .copied()
            .ok_or_else(|| GatewayError::Unavailable(format!("no reference price for {}", pair)))
    }

    fn exchange_name(&self) -> &'static str {
        "paper"
    }
}
