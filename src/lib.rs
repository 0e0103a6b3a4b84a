//! cube_dca
//!
//! Automated order splitting for the Cube exchange: a large order is executed
//! as a series of smaller ones (TWAP slices or passive liquidity-making quotes)
//! by a supervised per-trade worker, with durable state in a trade store and a
//! background sweep that reconciles local records against the exchange.

pub mod api;
pub mod common;
pub mod config;
pub mod cube;
pub mod engine;
pub mod paper;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use common::clock::{Clock, MonotonicClock, SystemClock};
pub use common::errors::{EngineError, GatewayError, Result, StoreError, StrategyError};
pub use common::market::{MarketCatalog, MarketRules};
pub use common::traits::{ExchangeGateway, TradeStore};
pub use common::types::{
    NewTrade, OrderRecord, OrderStatus, Side, StrategyKind, Trade, TradeStatus,
};
pub use config::types::AppConfig;
pub use cube::CubeRestClient;
pub use engine::{Engine, EngineContext, EngineHandle, SupervisorClient};
pub use paper::{FillMode, PaperExchange};
pub use store::{InMemoryTradeStore, PgTradeStore};

// Strategy types
pub use strategy::{build_strategy, BoxedStrategy, Decision, LiquidityMaker, Strategy, TwapStrategy};
