//! Execution engine
//!
//! ```text
//!            ┌──────────────┐   SupervisorCommand    ┌──────────────┐
//!  API ─────►│ Supervisor   │◄───────────────────────│ SupervisorClient
//!            │  registry    │                        └──────────────┘
//!            └──┬────────┬──┘
//!   spawn/signal│        │ liveness (watch)
//!               ▼        ▼
//!        ┌────────────┐ ┌─────────────────────┐
//!        │ TradeWorker│ │ ReconciliationSweep │
//!        │ (per trade)│ │ (own interval)      │
//!        └─────┬──────┘ └─────────┬───────────┘
//!              │  ExchangeGateway │ TradeStore
//!              ▼                  ▼
//! ```
//!
//! The supervisor is the only owner of the worker registry. Workers report
//! liveness through a heartbeat `watch` channel and deregister through an exit
//! notice; the sweep learns which trades have a live worker from a liveness
//! set the supervisor publishes after every discovery cycle.

pub mod reconcile;
pub mod supervisor;
pub mod sweep;
pub mod worker;

pub use reconcile::{Reconciler, SyncSummary};
pub use supervisor::{Supervisor, SupervisorClient, SupervisorCommand};
pub use sweep::{ReconciliationSweep, SweepReport};
pub use worker::{TradeWorker, WorkerExit, WorkerOutcome, WorkerPhase, WorkerSignal, WorkerState};

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::clock::{Clock, SystemClock};
use crate::common::market::MarketCatalog;
use crate::common::traits::{ExchangeGateway, TradeStore};
use crate::common::types::ClientOrderIdGenerator;
use crate::config::types::EngineConfig;

const COMMAND_BUFFER: usize = 64;

/// Everything the supervisor, its workers and the sweep share
pub struct EngineContext {
    pub gateway: Arc<dyn ExchangeGateway>,
    pub store: Arc<dyn TradeStore>,
    pub catalog: MarketCatalog,
    pub clock: Arc<dyn Clock>,
    pub ids: ClientOrderIdGenerator,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn TradeStore>,
        catalog: MarketCatalog,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(gateway, store, catalog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn TradeStore>,
        catalog: MarketCatalog,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            store,
            catalog,
            clock,
            ids: ClientOrderIdGenerator::new(),
            config,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.gateway.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.gateway_timeout(),
            self.config.unknown_order_grace(),
        )
    }
}

/// Starts the supervisor and sweep tasks
pub struct Engine;

impl Engine {
    pub fn start(ctx: Arc<EngineContext>) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (liveness_tx, liveness_rx) = watch::channel(HashSet::new());

        let exchange = ctx.gateway.exchange_name();
        let supervisor = Supervisor::new(ctx.clone(), commands_rx, liveness_tx);
        let sweep = ReconciliationSweep::new(ctx, liveness_rx.clone());

        let tasks = vec![
            tokio::spawn(supervisor.run(shutdown_rx.clone())),
            tokio::spawn(sweep.run(shutdown_rx)),
        ];
        info!(exchange, "Engine started");

        EngineHandle {
            client: SupervisorClient::new(commands_tx),
            shutdown: shutdown_tx,
            liveness: liveness_rx,
            tasks,
        }
    }
}

/// Running engine
pub struct EngineHandle {
    client: SupervisorClient,
    shutdown: watch::Sender<bool>,
    liveness: watch::Receiver<HashSet<Uuid>>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Cloneable command channel to the supervisor
    pub fn client(&self) -> SupervisorClient {
        self.client.clone()
    }

    /// Trades that had a live worker at the last discovery cycle
    pub fn live_trades(&self) -> HashSet<Uuid> {
        self.liveness.borrow().clone()
    }

    /// Stop workers (leaving their trades Active for the next start) and wait
    /// for the engine tasks to finish
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            warn!("Engine tasks already gone");
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Engine task ended abnormally");
            }
        }
        info!("Engine stopped");
    }
}
