//! Trade worker
//!
//! One worker task drives one trade through
//! `Initializing → Running → Draining → Terminal`. Every iteration is
//! local-first: open orders are reconciled with the exchange, the execution
//! state is rebuilt from the stored records, and only then is the strategy
//! asked for its next decision. A worker holds no state that cannot be rebuilt
//! from the store, so a replacement worker picks up exactly where a crashed
//! one stopped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::reconcile::{with_deadline, Reconciler};
use super::EngineContext;
use crate::common::clock::span;
use crate::common::errors::{EngineError, GatewayError, Result, StoreError};
use crate::common::types::{OrderKey, OrderPatch, OrderRecord, OrderRequest, OrderStatus, Trade, TradeStatus};
use crate::strategy::{
    build_strategy, net_filled, Action, Correction, Decision, ExecutionState, OrderIntent, Strategy,
};

const MAX_SAVE_ATTEMPTS: usize = 5;

/// Lifecycle phase of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Initializing,
    Running,
    Draining,
    Terminal,
}

/// What a worker publishes about itself
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerState {
    pub phase: WorkerPhase,
    /// Last time the worker loop made progress
    pub heartbeat_at: DateTime<Utc>,
    /// When the worker next plans to act
    pub next_action_at: Option<DateTime<Utc>>,
    pub open_orders: usize,
}

impl WorkerState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: WorkerPhase::Initializing,
            heartbeat_at: now,
            next_action_at: None,
            open_orders: 0,
        }
    }
}

/// Signal from the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Run,
    /// Cancel the trade: drain open orders and finish as Cancelled
    Cancel,
    /// Stop without touching the trade; a later worker resumes it
    Shutdown,
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The trade reached a terminal status
    Finished(TradeStatus),
    /// Stopped on shutdown with the trade still live
    Stopped,
    /// Gave up on an unexpected error; the trade is still live
    Aborted(String),
}

/// Exit notice sent to the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    pub trade_id: Uuid,
    pub generation: u64,
    pub outcome: WorkerOutcome,
}

enum Flow {
    Finished(TradeStatus),
    Stopped,
}

enum Step {
    Continue,
    Drain(TradeStatus, Option<String>),
    Finished(TradeStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Accepted,
    Rejected,
    Unknown,
    Skipped,
}

/// Drives a single trade
pub struct TradeWorker {
    trade_id: Uuid,
    generation: u64,
    ctx: Arc<EngineContext>,
    reconciler: Reconciler,
    signal: watch::Receiver<WorkerSignal>,
    state: watch::Sender<WorkerState>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    /// Rejected records the strategy has already been told about
    seen_rejections: HashSet<u64>,
}

impl TradeWorker {
    pub fn new(
        trade_id: Uuid,
        generation: u64,
        ctx: Arc<EngineContext>,
        signal: watch::Receiver<WorkerSignal>,
        state: watch::Sender<WorkerState>,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Self {
        let reconciler = ctx.reconciler();
        Self {
            trade_id,
            generation,
            ctx,
            reconciler,
            signal,
            state,
            exits,
            seen_rejections: HashSet::new(),
        }
    }

    #[instrument(name = "worker", skip(self), fields(trade_id = %self.trade_id, generation = self.generation))]
    pub async fn run(mut self) {
        let outcome = match self.execute().await {
            Ok(Flow::Finished(status)) => WorkerOutcome::Finished(status),
            Ok(Flow::Stopped) => {
                info!("Worker stopped, trade left live");
                WorkerOutcome::Stopped
            }
            Err(err) => {
                error!(error = %err, "Worker aborted");
                WorkerOutcome::Aborted(err.to_string())
            }
        };

        self.beat(WorkerPhase::Terminal);
        let exit = WorkerExit {
            trade_id: self.trade_id,
            generation: self.generation,
            outcome,
        };
        if self.exits.send(exit).is_err() {
            debug!("Supervisor gone, exit notice dropped");
        }
    }

    async fn execute(&mut self) -> Result<Flow> {
        self.beat(WorkerPhase::Initializing);
        let trade = self.ctx.store.load_trade(self.trade_id).await?;
        if trade.status.is_terminal() {
            return Ok(Flow::Finished(trade.status));
        }

        match self.signal_now() {
            WorkerSignal::Shutdown => return Ok(Flow::Stopped),
            WorkerSignal::Cancel => return self.cancel_early(&trade).await,
            WorkerSignal::Run if trade.cancel_requested => return self.cancel_early(&trade).await,
            WorkerSignal::Run => {}
        }

        let mut strategy = match build_strategy(&trade, &self.ctx.catalog) {
            Ok(strategy) => strategy,
            Err(err) => {
                warn!(error = %err, "Strategy cannot run, failing trade");
                let status = self.finish(TradeStatus::Failed, Some(err.to_string())).await?;
                return Ok(Flow::Finished(status));
            }
        };

        if trade.status == TradeStatus::Pending {
            let now = self.ctx.clock.now();
            self.modify_trade(|t| {
                if t.status != TradeStatus::Pending {
                    return Ok(false);
                }
                t.transition(TradeStatus::Active, now)?;
                Ok(true)
            })
            .await?;
            info!(strategy = strategy.name(), "Trade activated");
        }

        let records = self.ctx.store.list_order_records(self.trade_id).await?;
        self.seen_rejections = records
            .iter()
            .filter(|o| o.local_status == OrderStatus::Rejected)
            .map(|o| o.client_order_id)
            .collect();

        self.run_loop(strategy.as_mut()).await
    }

    async fn cancel_early(&mut self, trade: &Trade) -> Result<Flow> {
        if trade.status == TradeStatus::Pending {
            let status = self.finish(TradeStatus::Cancelled, None).await?;
            return Ok(Flow::Finished(status));
        }
        self.drain(TradeStatus::Cancelled, None).await
    }

    async fn run_loop(&mut self, strategy: &mut dyn Strategy) -> Result<Flow> {
        loop {
            self.beat(WorkerPhase::Running);
            match self.signal_now() {
                WorkerSignal::Shutdown => return Ok(Flow::Stopped),
                WorkerSignal::Cancel => return self.drain(TradeStatus::Cancelled, None).await,
                WorkerSignal::Run => {}
            }

            match self.step(strategy).await {
                Ok(Step::Continue) => {}
                Ok(Step::Drain(status, reason)) => return self.drain(status, reason).await,
                Ok(Step::Finished(status)) => return Ok(Flow::Finished(status)),
                Err(EngineError::Store(StoreError::Unavailable(msg))) => {
                    warn!(error = %msg, "Store unavailable, retrying next cycle");
                    let until = self.ctx.clock.now() + span(self.ctx.config.order_poll_interval());
                    self.suspend_until(until).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn step(&mut self, strategy: &mut dyn Strategy) -> Result<Step> {
        let trade = self.ctx.store.load_trade(self.trade_id).await?;
        if trade.status.is_terminal() {
            info!(status = %trade.status, "Trade finished elsewhere");
            return Ok(Step::Finished(trade.status));
        }
        if trade.cancel_requested {
            return Ok(Step::Drain(TradeStatus::Cancelled, None));
        }

        let summary = self.reconciler.sync_open_orders(trade.id).await?;
        let now = self.ctx.clock.now();
        let mut state = ExecutionState::rebuild(&trade, summary.records, now);

        match self.check_rejections(&state, strategy).await? {
            Some(Correction::Retry { after }) => {
                debug!(after_ms = after.as_millis() as u64, "Retrying after rejection");
                self.suspend_until(now + span(after)).await;
                return Ok(Step::Continue);
            }
            Some(Correction::GiveUp { reason }) => {
                warn!(reason = %reason, "Strategy gave up");
                return Ok(Step::Drain(TradeStatus::Failed, Some(reason)));
            }
            None => {}
        }

        if strategy.needs_reference_price() {
            let quote = self.ctx.gateway.reference_price(&trade.pair);
            match with_deadline(self.ctx.config.gateway_timeout(), quote).await {
                Ok(price) => state.reference_price = Some(price),
                Err(err) => debug!(error = %err, "Reference price unavailable"),
            }
        }

        let open = state.open_orders().count();
        match strategy.next_action(&trade, &state, now) {
            Decision::Done => {
                let status = self.finish(TradeStatus::Completed, None).await?;
                info!(filled = %state.filled_quantity, status = %status, "Trade objective met");
                Ok(Step::Finished(status))
            }
            Decision::Idle { until } => {
                self.wait(until, open).await;
                Ok(Step::Continue)
            }
            Decision::Go { at, .. } if at > now => {
                self.wait(at, open).await;
                Ok(Step::Continue)
            }
            Decision::Go { action, .. } => {
                self.publish_plan(None, open);
                self.apply(&trade, &state, action).await?;
                Ok(Step::Continue)
            }
        }
    }

    /// Tell the strategy about rejections it has not seen yet
    async fn check_rejections(
        &mut self,
        state: &ExecutionState,
        strategy: &mut dyn Strategy,
    ) -> Result<Option<Correction>> {
        let mut latest = None;
        for order in state
            .orders
            .iter()
            .filter(|o| o.local_status == OrderStatus::Rejected)
        {
            if self.seen_rejections.insert(order.client_order_id) {
                latest = Some(order);
            }
        }
        let Some(rejected) = latest else {
            return Ok(None);
        };

        let reason = rejected
            .reason
            .clone()
            .unwrap_or_else(|| "order rejected".to_string());
        let now = self.ctx.clock.now();
        self.modify_trade(|t| {
            t.last_error = Some(reason.clone());
            t.updated_at = now;
            Ok(true)
        })
        .await?;

        let consecutive = state.consecutive_rejections();
        if consecutive == 0 {
            return Ok(None);
        }
        Ok(Some(strategy.on_rejected(rejected, consecutive)))
    }

    async fn apply(&mut self, trade: &Trade, state: &ExecutionState, action: Action) -> Result<()> {
        match action {
            Action::Place(intent) => {
                self.place(trade, intent).await?;
            }
            Action::Cancel(client_order_id) => {
                let closed = match state.find_order(client_order_id) {
                    Some(order) => self.cancel(order).await?,
                    None => true,
                };
                if !closed {
                    self.pause().await;
                }
            }
            Action::Requote { cancel, place } => {
                let mut closed = true;
                for id in cancel {
                    if let Some(order) = state.find_order(id) {
                        closed &= self.cancel(order).await?;
                    }
                }
                if !closed {
                    self.pause().await;
                    return Ok(());
                }
                for intent in place {
                    if self.place(trade, intent).await? != Placement::Accepted {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist a record, then submit it
    ///
    /// The record exists before the exchange can see the order, so a crash at
    /// any point leaves something to reconcile against.
    async fn place(&mut self, trade: &Trade, intent: OrderIntent) -> Result<Placement> {
        let rules = self.ctx.catalog.rules_for(&trade.pair)?;
        let quantity = rules.round_quantity(intent.quantity);
        if rules.is_dust(quantity) {
            debug!(quantity = %intent.quantity, "Skipping order below minimum increment");
            return Ok(Placement::Skipped);
        }
        let price = intent.price.map(|p| rules.round_price(p));

        let client_order_id = self.ctx.ids.next_id();
        let now = self.ctx.clock.now();
        let record = OrderRecord::submitted(
            client_order_id,
            trade.id,
            intent.side,
            quantity,
            price,
            intent.slice,
            now,
        );
        self.ctx.store.append_order_record(&record).await?;

        let request = OrderRequest {
            pair: trade.pair.clone(),
            side: intent.side,
            quantity,
            price,
            client_order_id,
        };
        let result = with_deadline(
            self.ctx.config.gateway_timeout(),
            self.ctx.gateway.place_order(&request),
        )
        .await;

        match result {
            Ok(ack) => {
                let patch = OrderPatch::acknowledged(ack.exchange_order_id, self.ctx.clock.now());
                self.ctx
                    .store
                    .update_order_record(client_order_id, &patch)
                    .await?;
                info!(
                    client_order_id,
                    exchange_order_id = ack.exchange_order_id,
                    side = %intent.side,
                    quantity = %quantity,
                    price = ?price,
                    slice = ?intent.slice,
                    "Order placed"
                );
                Ok(Placement::Accepted)
            }
            Err(GatewayError::Rejected { reason }) => {
                warn!(client_order_id, reason = %reason, "Order rejected");
                let patch = OrderPatch::rejected(reason, self.ctx.clock.now());
                self.ctx
                    .store
                    .update_order_record(client_order_id, &patch)
                    .await?;
                Ok(Placement::Rejected)
            }
            Err(err) => {
                warn!(
                    client_order_id,
                    error = %err,
                    "Placement outcome unknown, confirming by status query"
                );
                Ok(Placement::Unknown)
            }
        }
    }

    /// Request a cancel and report whether the order is now closed
    async fn cancel(&mut self, order: &OrderRecord) -> Result<bool> {
        match self.request_cancel(&order.key()).await {
            Ok(()) => {}
            Err(GatewayError::Rejected { reason }) => {
                debug!(client_order_id = order.client_order_id, reason = %reason, "Cancel refused")
            }
            Err(err) => {
                warn!(client_order_id = order.client_order_id, error = %err, "Cancel failed");
                return Ok(false);
            }
        }

        let refreshed = match self.reconciler.sync_order(order).await {
            Ok(Some(updated)) => updated,
            Ok(None) => order.clone(),
            Err(EngineError::Gateway(err)) => {
                debug!(client_order_id = order.client_order_id, error = %err, "Status after cancel unknown");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        Ok(!refreshed.is_open())
    }

    async fn request_cancel(&self, key: &OrderKey) -> std::result::Result<(), GatewayError> {
        with_deadline(
            self.ctx.config.gateway_timeout(),
            self.ctx.gateway.cancel_order(key),
        )
        .await
    }

    /// Cancel everything open, wait for it to close, then finish the trade
    async fn drain(&mut self, target: TradeStatus, reason: Option<String>) -> Result<Flow> {
        self.beat(WorkerPhase::Draining);
        info!(target = %target, "Draining open orders");

        let poll = self.ctx.config.order_poll_interval();
        let deadline = self.ctx.clock.now() + span(self.ctx.config.drain_timeout());
        let mut cancel_sent = HashSet::new();

        let records = loop {
            let summary = match self.reconciler.sync_open_orders(self.trade_id).await {
                Ok(summary) => summary,
                Err(EngineError::Store(StoreError::Unavailable(msg)))
                    if self.ctx.clock.now() < deadline =>
                {
                    warn!(error = %msg, "Store unavailable while draining");
                    tokio::time::sleep(poll).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let open: Vec<OrderKey> = summary
                .records
                .iter()
                .filter(|o| o.is_open())
                .map(|o| o.key())
                .collect();
            if open.is_empty() {
                break summary.records;
            }

            for key in &open {
                if cancel_sent.contains(&key.client_order_id) {
                    continue;
                }
                match self.request_cancel(key).await {
                    Ok(()) | Err(GatewayError::Rejected { .. }) => {
                        cancel_sent.insert(key.client_order_id);
                    }
                    Err(err) => {
                        warn!(client_order_id = key.client_order_id, error = %err, "Cancel failed")
                    }
                }
            }

            if self.ctx.clock.now() >= deadline {
                warn!(open = open.len(), "Drain timed out with orders still open");
                break summary.records;
            }
            if self.signal_now() == WorkerSignal::Shutdown {
                return Ok(Flow::Stopped);
            }
            self.beat(WorkerPhase::Draining);
            tokio::time::sleep(poll).await;
        };

        let trade = self.ctx.store.load_trade(self.trade_id).await?;
        let filled = net_filled(trade.side, &records);
        let remaining = trade.total_quantity - filled;
        let fully_filled = match self.ctx.catalog.get(&trade.pair) {
            Some(rules) => rules.is_dust(remaining),
            None => remaining <= rust_decimal::Decimal::ZERO,
        };
        let still_open = records.iter().filter(|o| o.is_open()).count();

        let (status, reason) = if target == TradeStatus::Cancelled && fully_filled {
            (TradeStatus::Completed, None)
        } else if still_open > 0 {
            let note = format!("{} order(s) still open after drain timeout", still_open);
            (target, Some(reason.map_or(note.clone(), |r| format!("{}; {}", r, note))))
        } else {
            (target, reason)
        };

        let status = self.finish(status, reason).await?;
        info!(status = %status, filled = %filled, "Trade finished");
        Ok(Flow::Finished(status))
    }

    /// Move the trade to a terminal status unless it already is terminal
    async fn finish(&self, status: TradeStatus, reason: Option<String>) -> Result<TradeStatus> {
        let now = self.ctx.clock.now();
        let trade = self
            .modify_trade(|t| {
                if t.status.is_terminal() {
                    return Ok(false);
                }
                t.transition(status, now)?;
                if let Some(reason) = &reason {
                    t.last_error = Some(reason.clone());
                }
                Ok(true)
            })
            .await?;
        Ok(trade.status)
    }

    /// Read-modify-write of the trade under compare-and-set
    ///
    /// `change` returns false when there is nothing to write.
    async fn modify_trade<F>(&self, mut change: F) -> Result<Trade>
    where
        F: FnMut(&mut Trade) -> Result<bool>,
    {
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let mut trade = self.ctx.store.load_trade(self.trade_id).await?;
            if !change(&mut trade)? {
                return Ok(trade);
            }
            match self.ctx.store.save_trade(&trade).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::Conflict(_)) => {
                    debug!(attempt, "Trade changed concurrently, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(format!("trade {}", self.trade_id)).into())
    }

    fn signal_now(&self) -> WorkerSignal {
        if self.signal.has_changed().is_err() {
            return WorkerSignal::Shutdown;
        }
        *self.signal.borrow()
    }

    fn beat(&self, phase: WorkerPhase) {
        let now = self.ctx.clock.now();
        self.state.send_modify(|state| {
            state.phase = phase;
            state.heartbeat_at = now;
        });
    }

    fn publish_plan(&self, next_action_at: Option<DateTime<Utc>>, open_orders: usize) {
        self.state.send_modify(|state| {
            state.next_action_at = next_action_at;
            state.open_orders = open_orders;
        });
    }

    /// Wait for `until`, waking early to re-check open orders
    async fn wait(&mut self, until: DateTime<Utc>, open_orders: usize) {
        self.publish_plan(Some(until), open_orders);
        let wake = if open_orders > 0 {
            until.min(self.ctx.clock.now() + span(self.ctx.config.order_poll_interval()))
        } else {
            until
        };
        self.suspend_until(wake).await;
    }

    async fn pause(&mut self) {
        let until = self.ctx.clock.now() + span(self.ctx.config.order_poll_interval());
        self.suspend_until(until).await;
    }

    /// Sleep until `until` or the next heartbeat, whichever is first; a
    /// supervisor signal ends the sleep early
    async fn suspend_until(&mut self, until: DateTime<Utc>) {
        let now = self.ctx.clock.now();
        let wake = until.min(now + span(self.ctx.config.heartbeat_interval()));
        let nap = crate::common::clock::duration_until(now, wake);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = self.signal.changed() => {}
        }
    }
}
