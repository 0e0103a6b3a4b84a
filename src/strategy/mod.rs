//! Strategy module for execution decision making
//!
//! Strategies are pure decision functions over a trade's execution state. The
//! worker owns all I/O.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TRADE WORKER (async)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  reconcile open orders ──► ExecutionState::rebuild()        │
//! │       │                                                     │
//! │       ▼                                                     │
//! │  Strategy.next_action() → Idle / Go / Done                  │
//! │       │                                                     │
//! │       ▼ (Go)                                                │
//! │  suspend until `at` (cancellable), then place / cancel      │
//! │       │                                                     │
//! │       ▼ (rejected)                                          │
//! │  Strategy.on_rejected() → Retry / GiveUp                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`Strategy`]: Trait every execution strategy implements
//! - [`Decision`]: Idle/Go/Done returned by strategies
//! - [`TwapStrategy`]: Equal slices over a fixed schedule
//! - [`LiquidityMaker`]: Passive quoting around a reference price
//! - [`build_strategy`]: Instantiates the strategy a trade asks for

mod liquidity_maker;
mod traits;
mod twap;
mod types;

pub use liquidity_maker::{LiquidityMaker, LiquidityMakerParams};
pub use traits::{BoxedStrategy, Strategy};
pub use twap::{LaggingSlicePolicy, TwapParams, TwapSchedule, TwapStrategy};
pub use types::{net_filled, Action, Correction, Decision, ExecutionState, OrderIntent};

use crate::common::errors::StrategyError;
use crate::common::market::MarketCatalog;
use crate::common::types::{StrategyKind, Trade};

/// Build the strategy named by `trade.strategy_kind`
///
/// Fails when the pair has no market rules or the parameters do not describe
/// a runnable strategy. The API uses this to validate new trades before they
/// are stored.
pub fn build_strategy(trade: &Trade, catalog: &MarketCatalog) -> Result<BoxedStrategy, StrategyError> {
    let rules = catalog.rules_for(&trade.pair)?.clone();
    match trade.strategy_kind {
        StrategyKind::Twap => Ok(Box::new(TwapStrategy::new(trade, rules)?)),
        StrategyKind::LiquidityMaker => Ok(Box::new(LiquidityMaker::new(trade, rules)?)),
    }
}
