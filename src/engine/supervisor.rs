//! Trade supervisor
//!
//! Owns the registry of running workers. On every discovery cycle it reaps
//! finished and stale workers, spawns a worker for every live trade that has
//! none, forwards durable cancel requests and publishes the liveness set.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::worker::{TradeWorker, WorkerExit, WorkerOutcome, WorkerSignal, WorkerState};
use super::EngineContext;
use crate::common::errors::{EngineError, Result};

/// Requests accepted by the supervisor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Run a discovery cycle now instead of waiting for the next tick
    Discover,
    /// Tell the trade's worker to cancel; the durable flag must already be set
    Cancel(Uuid),
    /// Snapshot of a trade's worker, if one is running
    WorkerStatus {
        trade_id: Uuid,
        reply: oneshot::Sender<Option<WorkerState>>,
    },
}

/// Cloneable handle for sending commands to the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    commands: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorClient {
    pub fn new(commands: mpsc::Sender<SupervisorCommand>) -> Self {
        Self { commands }
    }

    pub async fn discover(&self) -> Result<()> {
        self.send(SupervisorCommand::Discover).await
    }

    pub async fn cancel(&self, trade_id: Uuid) -> Result<()> {
        self.send(SupervisorCommand::Cancel(trade_id)).await
    }

    pub async fn worker_state(&self, trade_id: Uuid) -> Result<Option<WorkerState>> {
        let (reply, response) = oneshot::channel();
        self.send(SupervisorCommand::WorkerStatus { trade_id, reply })
            .await?;
        response
            .await
            .map_err(|e| EngineError::ChannelSend(e.to_string()))
    }

    async fn send(&self, command: SupervisorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|e| EngineError::ChannelSend(e.to_string()))
    }
}

struct WorkerHandle {
    signal: watch::Sender<WorkerSignal>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
    generation: u64,
    spawned_at: DateTime<Utc>,
}

impl WorkerHandle {
    fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        let heartbeat = self.state.borrow().heartbeat_at.max(self.spawned_at);
        now - heartbeat > stale_after
    }
}

/// Spawns and tracks one worker per live trade
pub struct Supervisor {
    ctx: Arc<EngineContext>,
    commands: mpsc::Receiver<SupervisorCommand>,
    liveness: watch::Sender<HashSet<Uuid>>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    workers: HashMap<Uuid, WorkerHandle>,
    next_generation: u64,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<EngineContext>,
        commands: mpsc::Receiver<SupervisorCommand>,
        liveness: watch::Sender<HashSet<Uuid>>,
    ) -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        Self {
            ctx,
            commands,
            liveness,
            exits_tx,
            exits,
            workers: HashMap::new(),
            next_generation: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.discovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.ctx.config.discovery_interval_seconds,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.discover().await,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(exit) = self.exits.recv() => self.on_exit(exit),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown_workers().await;
        info!("Supervisor stopped");
    }

    async fn discover(&mut self) {
        if let Err(err) = self.discovery_cycle().await {
            warn!(error = %err, "Discovery cycle failed");
        }
    }

    #[instrument(skip(self), fields(workers = self.workers.len()))]
    async fn discovery_cycle(&mut self) -> Result<()> {
        while let Ok(exit) = self.exits.try_recv() {
            self.on_exit(exit);
        }
        self.reap();

        let trades = match self.ctx.store.list_active_trades().await {
            Ok(trades) => trades,
            Err(err) => {
                self.publish_liveness();
                return Err(err.into());
            }
        };

        for trade in &trades {
            match self.workers.get(&trade.id) {
                Some(handle) => {
                    if trade.cancel_requested {
                        handle.signal.send_if_modified(|signal| {
                            if *signal == WorkerSignal::Run {
                                *signal = WorkerSignal::Cancel;
                                true
                            } else {
                                false
                            }
                        });
                    }
                }
                None => self.spawn_worker(trade.id, trade.cancel_requested),
            }
        }

        self.publish_liveness();
        debug!(trades = trades.len(), workers = self.workers.len(), "Discovery cycle done");
        Ok(())
    }

    /// Drop finished workers and abort workers whose heartbeat stopped
    fn reap(&mut self) {
        let now = self.ctx.clock.now();
        let stale_after = crate::common::clock::span(self.ctx.config.stale_after());

        self.workers.retain(|trade_id, handle| {
            if handle.task.is_finished() {
                debug!(trade_id = %trade_id, generation = handle.generation, "Reaped finished worker");
                return false;
            }
            if handle.is_stale(now, stale_after) {
                error!(
                    trade_id = %trade_id,
                    generation = handle.generation,
                    last_heartbeat = %handle.state.borrow().heartbeat_at,
                    "Worker heartbeat stale, aborting"
                );
                handle.task.abort();
                return false;
            }
            true
        });
    }

    fn spawn_worker(&mut self, trade_id: Uuid, cancel_requested: bool) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let now = self.ctx.clock.now();

        let initial = if cancel_requested {
            WorkerSignal::Cancel
        } else {
            WorkerSignal::Run
        };
        let (signal_tx, signal_rx) = watch::channel(initial);
        let (state_tx, state_rx) = watch::channel(WorkerState::new(now));
        let worker = TradeWorker::new(
            trade_id,
            generation,
            self.ctx.clone(),
            signal_rx,
            state_tx,
            self.exits_tx.clone(),
        );
        let task = tokio::spawn(worker.run());

        info!(trade_id = %trade_id, generation, "Worker spawned");
        self.workers.insert(
            trade_id,
            WorkerHandle {
                signal: signal_tx,
                state: state_rx,
                task,
                generation,
                spawned_at: now,
            },
        );
    }

    fn on_exit(&mut self, exit: WorkerExit) {
        match &exit.outcome {
            WorkerOutcome::Finished(status) => {
                info!(trade_id = %exit.trade_id, status = %status, "Worker finished")
            }
            WorkerOutcome::Stopped => debug!(trade_id = %exit.trade_id, "Worker stopped"),
            WorkerOutcome::Aborted(reason) => {
                warn!(trade_id = %exit.trade_id, reason = %reason, "Worker aborted, will respawn")
            }
        }

        // A replacement may already be registered under a newer generation
        let current = self
            .workers
            .get(&exit.trade_id)
            .is_some_and(|h| h.generation == exit.generation);
        if current {
            self.workers.remove(&exit.trade_id);
            self.publish_liveness();
        }
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Discover => self.discover().await,
            SupervisorCommand::Cancel(trade_id) => match self.workers.get(&trade_id) {
                Some(handle) => {
                    info!(trade_id = %trade_id, "Forwarding cancel to worker");
                    handle.signal.send_replace(WorkerSignal::Cancel);
                }
                // The next worker reads the durable flag
                None => self.discover().await,
            },
            SupervisorCommand::WorkerStatus { trade_id, reply } => {
                let state = self
                    .workers
                    .get(&trade_id)
                    .map(|h| h.state.borrow().clone());
                let _ = reply.send(state);
            }
        }
    }

    fn publish_liveness(&self) {
        let live: HashSet<Uuid> = self.workers.keys().copied().collect();
        self.liveness.send_replace(live);
    }

    /// Stop every worker, leaving its trade live for the next start
    async fn shutdown_workers(&mut self) {
        info!(workers = self.workers.len(), "Stopping workers");
        for handle in self.workers.values() {
            handle.signal.send_replace(WorkerSignal::Shutdown);
        }

        let grace = self.ctx.config.drain_timeout();
        for (trade_id, mut handle) in self.workers.drain() {
            if tokio::time::timeout(grace, &mut handle.task).await.is_err() {
                warn!(trade_id = %trade_id, "Worker did not stop in time, aborting");
                handle.task.abort();
            }
        }
        self.liveness.send_replace(HashSet::new());
    }
}
