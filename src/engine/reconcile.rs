//! Order reconciliation against the exchange
//!
//! Shared by the trade worker (local-first sync of its own open orders) and
//! the reconciliation sweep. All writes go through
//! [`TradeStore::update_order_record`], whose patch semantics make replaying
//! an identical exchange state a no-op.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::clock::Clock;
use crate::common::errors::{EngineError, GatewayError, GatewayResult, Result};
use crate::common::traits::{ExchangeGateway, TradeStore};
use crate::common::types::{average_price, OrderPatch, OrderRecord, OrderStatusReport};

/// Reason recorded when the exchange never saw an order
pub const NOT_RECEIVED: &str = "not received by exchange";

/// Run a gateway call under a deadline, mapping expiry to `GatewayError::Timeout`
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

/// Patch that brings `record` in line with an exchange report
///
/// Returns `None` when applying it would change nothing.
pub fn diff(
    record: &OrderRecord,
    report: &OrderStatusReport,
    now: DateTime<Utc>,
) -> Option<OrderPatch> {
    let patch = OrderPatch {
        exchange_order_id: report.exchange_order_id,
        status: Some(report.status),
        filled_quantity: Some(report.filled_quantity),
        average_fill_price: report.average_price,
        reason: report.reason.clone(),
        exchange_updated_at: Some(report.updated_at),
        synced_at: now,
    };
    let mut candidate = record.clone();
    if candidate.apply(&patch) {
        Some(patch)
    } else {
        None
    }
}

/// Outcome of syncing a batch of orders
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Records after the sync, in creation order
    pub records: Vec<OrderRecord>,
    /// Number of open records queried on the exchange
    pub checked: usize,
    /// Number of records that were patched
    pub patched: usize,
    /// Last gateway failure, if any order could not be checked
    pub gateway_error: Option<GatewayError>,
}

/// Syncs local order records with the exchange's view
#[derive(Clone)]
pub struct Reconciler {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn TradeStore>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
    unknown_grace: Duration,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn TradeStore>,
        clock: Arc<dyn Clock>,
        deadline: Duration,
        unknown_grace: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            deadline,
            unknown_grace,
        }
    }

    /// Bring one record up to date
    ///
    /// Returns the stored record when it was patched, `None` when it already
    /// matched the exchange. Gateway failures are returned as errors and leave
    /// the record untouched.
    pub async fn sync_order(&self, record: &OrderRecord) -> Result<Option<OrderRecord>> {
        let key = record.key();
        let report = with_deadline(self.deadline, self.gateway.get_order_status(&key)).await?;
        let now = self.clock.now();

        let Some(mut report) = report else {
            return self.resolve_unknown(record, now).await;
        };

        // Fills are only fetched when the executed quantity moved
        if report.filled_quantity > record.filled_quantity {
            match with_deadline(self.deadline, self.gateway.get_fills(&key)).await {
                Ok(fills) => {
                    if let Some(avg) = average_price(&fills) {
                        report.average_price = Some(avg);
                    }
                }
                Err(err) => debug!(
                    client_order_id = record.client_order_id,
                    error = %err,
                    "Fill query failed, using reported average"
                ),
            }
        }

        let Some(patch) = diff(record, &report, now) else {
            return Ok(None);
        };

        debug!(
            trade_id = %record.trade_id,
            client_order_id = record.client_order_id,
            from = %record.local_status,
            to = %report.status,
            filled = %report.filled_quantity,
            "Order diverged from exchange"
        );
        let updated = self
            .store
            .update_order_record(record.client_order_id, &patch)
            .await?;
        Ok(Some(updated))
    }

    /// The exchange does not report the order
    ///
    /// An order it never acknowledged is rejected once the grace period has
    /// passed. An acknowledged order is still live somewhere, so a missing
    /// report is treated like a failed query and retried on the next sync.
    async fn resolve_unknown(
        &self,
        record: &OrderRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderRecord>> {
        if let Some(exchange_order_id) = record.exchange_order_id {
            return Err(GatewayError::Unavailable(format!(
                "acknowledged order {} ({}) missing from exchange report",
                record.client_order_id, exchange_order_id
            ))
            .into());
        }
        let age = (now - record.created_at).to_std().unwrap_or(Duration::ZERO);
        if !record.is_open() || age < self.unknown_grace {
            return Ok(None);
        }
        warn!(
            trade_id = %record.trade_id,
            client_order_id = record.client_order_id,
            age_secs = age.as_secs(),
            "Order unknown to exchange, marking rejected"
        );
        let updated = self
            .store
            .update_order_record(record.client_order_id, &OrderPatch::rejected(NOT_RECEIVED, now))
            .await?;
        Ok(Some(updated))
    }

    /// Sync every open record of a trade
    ///
    /// Store failures abort the sync; gateway failures are logged, counted in
    /// the summary and leave the affected record as it was.
    pub async fn sync_open_orders(&self, trade_id: Uuid) -> Result<SyncSummary> {
        let mut records = self.store.list_order_records(trade_id).await?;
        let mut summary = SyncSummary::default();

        for record in records.iter_mut().filter(|r| r.is_open()) {
            summary.checked += 1;
            match self.sync_order(record).await {
                Ok(Some(updated)) => {
                    *record = updated;
                    summary.patched += 1;
                }
                Ok(None) => {}
                Err(EngineError::Gateway(err)) => {
                    debug!(
                        trade_id = %trade_id,
                        client_order_id = record.client_order_id,
                        error = %err,
                        "Order status query failed"
                    );
                    summary.gateway_error = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        summary.records = records;
        Ok(summary)
    }
}
