//! Periodic reconciliation sweep
//!
//! Runs on its own interval, independent of the workers. For every Active
//! trade it brings the open order records in line with the exchange, and it
//! completes trades that are fully filled but have no live worker to notice.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::reconcile::Reconciler;
use super::EngineContext;
use crate::common::errors::{Result, StoreError};
use crate::common::types::{Trade, TradeStatus};
use crate::strategy::net_filled;

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Active trades visited
    pub trades: usize,
    /// Open orders queried on the exchange
    pub orders_checked: usize,
    /// Order records corrected
    pub patched: usize,
    /// Orphaned trades moved to Completed
    pub completed: usize,
    /// Trades that could not be fully reconciled
    pub errors: usize,
}

pub struct ReconciliationSweep {
    ctx: Arc<EngineContext>,
    reconciler: Reconciler,
    liveness: watch::Receiver<HashSet<Uuid>>,
}

impl ReconciliationSweep {
    pub fn new(ctx: Arc<EngineContext>, liveness: watch::Receiver<HashSet<Uuid>>) -> Self {
        let reconciler = ctx.reconciler();
        Self {
            ctx,
            reconciler,
            liveness,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(report) if report.patched > 0 || report.completed > 0 => {
                        info!(
                            trades = report.trades,
                            patched = report.patched,
                            completed = report.completed,
                            errors = report.errors,
                            "Reconciliation sweep corrected state"
                        );
                    }
                    Ok(report) => debug!(trades = report.trades, checked = report.orders_checked, "Sweep clean"),
                    Err(err) => warn!(error = %err, "Reconciliation sweep failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Reconciliation sweep stopped");
    }

    /// One pass over every Active trade
    ///
    /// Failures on one trade are counted and never stop the pass or change
    /// the trade's status.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let trades = self.ctx.store.list_active_trades().await?;
        let live = self.liveness.borrow().clone();
        let mut report = SweepReport::default();

        for trade in trades.iter().filter(|t| t.status == TradeStatus::Active) {
            report.trades += 1;
            let summary = match self.reconciler.sync_open_orders(trade.id).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(trade_id = %trade.id, error = %err, "Trade reconciliation failed");
                    report.errors += 1;
                    continue;
                }
            };
            report.orders_checked += summary.checked;
            report.patched += summary.patched;
            if summary.gateway_error.is_some() {
                report.errors += 1;
                continue;
            }

            if live.contains(&trade.id) || summary.records.iter().any(|o| o.is_open()) {
                continue;
            }
            let Some(rules) = self.ctx.catalog.get(&trade.pair) else {
                continue;
            };
            let remaining = trade.total_quantity - net_filled(trade.side, &summary.records);
            if rules.is_dust(remaining) {
                match self.complete(trade).await {
                    Ok(true) => report.completed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(trade_id = %trade.id, error = %err, "Could not complete trade");
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Move a filled, unowned trade to Completed; a concurrent write wins
    async fn complete(&self, trade: &Trade) -> Result<bool> {
        let mut updated = trade.clone();
        updated.transition(TradeStatus::Completed, self.ctx.clock.now())?;
        match self.ctx.store.save_trade(&updated).await {
            Ok(_) => {
                info!(trade_id = %trade.id, "Completed filled trade without a worker");
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::{Clock, MonotonicClock};
    use crate::common::market::{MarketCatalog, MarketRules};
    use crate::common::traits::{ExchangeGateway, TradeStore};
    use crate::common::types::{NewTrade, OrderRecord, OrderRequest, Side, StrategyKind};
    use crate::config::types::EngineConfig;
    use crate::paper::{FillMode, PaperExchange};
    use crate::store::InMemoryTradeStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        ctx: Arc<EngineContext>,
        paper: Arc<PaperExchange>,
        store: Arc<InMemoryTradeStore>,
        liveness: watch::Sender<HashSet<Uuid>>,
        sweep: ReconciliationSweep,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let paper = Arc::new(PaperExchange::with_clock(FillMode::Manual, clock.clone()));
        let store = Arc::new(InMemoryTradeStore::new());
        let mut catalog = MarketCatalog::default();
        catalog.insert("BTC-USD", MarketRules::new(100004, dec!(0.1), dec!(0.00001)));
        let ctx = Arc::new(EngineContext::with_clock(
            paper.clone(),
            store.clone(),
            catalog,
            EngineConfig::default(),
            clock,
        ));
        let (liveness, liveness_rx) = watch::channel(HashSet::new());
        let sweep = ReconciliationSweep::new(ctx.clone(), liveness_rx);
        Fixture {
            ctx,
            paper,
            store,
            liveness,
            sweep,
        }
    }

    async fn active_trade(f: &Fixture, total: Decimal) -> Trade {
        let now = f.ctx.clock.now();
        let mut trade = f
            .store
            .insert_trade(&Trade::new(
                NewTrade {
                    pair: "BTC-USD".into(),
                    side: Side::Buy,
                    total_quantity: total,
                    limit_price: Some(dec!(100)),
                    strategy_kind: StrategyKind::Twap,
                    strategy_params: serde_json::json!({ "duration_secs": 60, "slice_count": 1 }),
                },
                now,
            ))
            .await
            .unwrap();
        trade.transition(TradeStatus::Active, now).unwrap();
        f.store.save_trade(&trade).await.unwrap()
    }

    async fn resting_order(f: &Fixture, trade: &Trade, id: u64, quantity: Decimal) {
        let record = OrderRecord::submitted(
            id,
            trade.id,
            Side::Buy,
            quantity,
            Some(dec!(100)),
            Some(0),
            f.ctx.clock.now(),
        );
        f.store.append_order_record(&record).await.unwrap();
        f.paper
            .place_order(&OrderRequest {
                pair: "BTC-USD".into(),
                side: Side::Buy,
                quantity,
                price: Some(dec!(100)),
                client_order_id: id,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_sweep_writes_nothing() {
        let f = fixture();
        let trade = active_trade(&f, dec!(10)).await;
        resting_order(&f, &trade, 1, dec!(5)).await;
        f.paper.fill_order(1, dec!(2), dec!(100)).await;

        let first = f.sweep.sweep_once().await.unwrap();
        assert_eq!(first.trades, 1);
        assert_eq!(first.orders_checked, 1);
        assert_eq!(first.patched, 1);

        let second = f.sweep.sweep_once().await.unwrap();
        assert_eq!(second.patched, 0);
        assert_eq!(second.completed, 0);
    }

    #[tokio::test]
    async fn test_filled_trade_without_worker_is_completed() {
        let f = fixture();
        let trade = active_trade(&f, dec!(2)).await;
        resting_order(&f, &trade, 1, dec!(2)).await;
        f.paper.fill_order(1, dec!(2), dec!(99.5)).await;

        let report = f.sweep.sweep_once().await.unwrap();
        assert_eq!(report.completed, 1);
        let stored = f.store.load_trade(trade.id).await.unwrap();
        assert_eq!(stored.status, TradeStatus::Completed);
    }

    #[tokio::test]
    async fn test_live_trade_is_left_to_its_worker() {
        let f = fixture();
        let trade = active_trade(&f, dec!(2)).await;
        resting_order(&f, &trade, 1, dec!(2)).await;
        f.paper.fill_order(1, dec!(2), dec!(100)).await;
        f.liveness.send_replace(HashSet::from([trade.id]));

        let report = f.sweep.sweep_once().await.unwrap();
        assert_eq!(report.patched, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(
            f.store.load_trade(trade.id).await.unwrap().status,
            TradeStatus::Active
        );
    }

    #[tokio::test]
    async fn test_exchange_outage_is_counted_not_fatal() {
        let f = fixture();
        let trade = active_trade(&f, dec!(2)).await;
        resting_order(&f, &trade, 1, dec!(2)).await;
        f.paper.set_unavailable(true).await;

        let report = f.sweep.sweep_once().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.patched, 0);
        assert_eq!(
            f.store.load_trade(trade.id).await.unwrap().status,
            TradeStatus::Active
        );
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_sweep() {
        let f = fixture();
        active_trade(&f, dec!(2)).await;
        f.store.set_unavailable(true);
        assert!(f.sweep.sweep_once().await.is_err());
    }
}
