//! In-memory trade store for paper mode and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::common::errors::{StoreError, StoreResult};
use crate::common::traits::TradeStore;
use crate::common::types::{OrderPatch, OrderRecord, Trade};

#[derive(Debug, Default)]
struct Tables {
    trades: HashMap<Uuid, Trade>,
    orders: HashMap<u64, OrderRecord>,
    /// Client order ids per trade in append order
    orders_by_trade: HashMap<Uuid, Vec<u64>>,
}

/// Trade store backed by process memory
///
/// Each operation takes the table lock once, which gives the same per-record
/// atomicity as the SQL store. [`InMemoryTradeStore::set_unavailable`] makes
/// every call fail with `StoreError::Unavailable`.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage of the backing store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<Trade> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if tables.trades.contains_key(&trade.id) {
            return Err(StoreError::Conflict(format!("trade {} already exists", trade.id)));
        }
        let mut stored = trade.clone();
        stored.version = 1;
        tables.trades.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_active_trades(&self) -> StoreResult<Vec<Trade>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut trades: Vec<Trade> = tables
            .trades
            .values()
            .filter(|t| t.is_live())
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.created_at);
        Ok(trades)
    }

    async fn list_trades(&self) -> StoreResult<Vec<Trade>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut trades: Vec<Trade> = tables.trades.values().cloned().collect();
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    async fn load_trade(&self, id: Uuid) -> StoreResult<Trade> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .trades
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::trade_not_found(id))
    }

    async fn save_trade(&self, trade: &Trade) -> StoreResult<Trade> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let current = tables
            .trades
            .get_mut(&trade.id)
            .ok_or_else(|| StoreError::trade_not_found(trade.id))?;
        if current.version != trade.version {
            debug!(
                trade_id = %trade.id,
                expected = trade.version,
                actual = current.version,
                "Trade version conflict"
            );
            return Err(StoreError::Conflict(format!("trade {}", trade.id)));
        }
        let mut stored = trade.clone();
        stored.version += 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn append_order_record(&self, record: &OrderRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if !tables.trades.contains_key(&record.trade_id) {
            return Err(StoreError::trade_not_found(record.trade_id));
        }
        if tables.orders.contains_key(&record.client_order_id) {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                record.client_order_id
            )));
        }
        tables
            .orders
            .insert(record.client_order_id, record.clone());
        tables
            .orders_by_trade
            .entry(record.trade_id)
            .or_default()
            .push(record.client_order_id);
        Ok(())
    }

    async fn update_order_record(
        &self,
        client_order_id: u64,
        patch: &OrderPatch,
    ) -> StoreResult<OrderRecord> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let record = tables
            .orders
            .get_mut(&client_order_id)
            .ok_or_else(|| StoreError::order_not_found(client_order_id))?;
        record.apply(patch);
        Ok(record.clone())
    }

    async fn list_order_records(&self, trade_id: Uuid) -> StoreResult<Vec<OrderRecord>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .orders_by_trade
            .get(&trade_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.orders.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
