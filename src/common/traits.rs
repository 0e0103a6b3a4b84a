//! Trait definitions for the engine's collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::errors::{GatewayError, GatewayResult, StoreResult};
use super::types::{Fill, OrderAck, OrderKey, OrderPatch, OrderRecord, OrderRequest, OrderStatusReport, Trade};

/// Trait for exchange access on one account
///
/// The engine depends on the exchange only through this interface. Every call
/// fails with a [`GatewayError`]; callers wrap calls in their own deadline and
/// treat expiry as [`GatewayError::Timeout`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit a new order
    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck>;

    /// Cancel a working order
    async fn cancel_order(&self, order: &OrderKey) -> GatewayResult<()>;

    /// Query the exchange's view of an order
    ///
    /// Returns `Ok(None)` when the exchange has no order with this key, which
    /// after a timed-out placement means the order never landed.
    async fn get_order_status(&self, order: &OrderKey) -> GatewayResult<Option<OrderStatusReport>>;

    /// Executions against an order, oldest first
    async fn get_fills(&self, order: &OrderKey) -> GatewayResult<Vec<Fill>>;

    /// Reference (mid) price for a pair
    ///
    /// Only needed by quoting strategies. Default implementation reports the
    /// feed as unavailable.
    async fn reference_price(&self, pair: &str) -> GatewayResult<Decimal> {
        Err(GatewayError::Unavailable(format!(
            "no reference price source for {}",
            pair
        )))
    }

    /// Get the name of the exchange
    fn exchange_name(&self) -> &'static str;
}

/// Trait for the durable store of trade intent and order state
///
/// Implementations guarantee per-record atomicity: [`TradeStore::save_trade`]
/// is a compare-and-set on [`Trade::version`] and
/// [`TradeStore::update_order_record`] applies a patch with
/// [`OrderRecord::apply`] semantics in one step.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Persist a new trade
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<Trade>;

    /// Trades with status Pending or Active
    async fn list_active_trades(&self) -> StoreResult<Vec<Trade>>;

    /// Every trade, newest first
    async fn list_trades(&self) -> StoreResult<Vec<Trade>>;

    async fn load_trade(&self, id: Uuid) -> StoreResult<Trade>;

    /// Save a trade if nobody else saved it since `trade.version` was read
    ///
    /// Returns the stored trade with its new version, or
    /// `StoreError::Conflict` when the version no longer matches.
    async fn save_trade(&self, trade: &Trade) -> StoreResult<Trade>;

    async fn append_order_record(&self, record: &OrderRecord) -> StoreResult<()>;

    /// Apply a patch to the record with this client order id
    ///
    /// Returns the record as stored after the patch.
    async fn update_order_record(
        &self,
        client_order_id: u64,
        patch: &OrderPatch,
    ) -> StoreResult<OrderRecord>;

    /// All records of a trade in creation order
    async fn list_order_records(&self, trade_id: Uuid) -> StoreResult<Vec<OrderRecord>>;
}
