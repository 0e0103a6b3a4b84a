//! Common test utilities and fixtures
#![allow(dead_code)]

use cube_dca::common::clock::{Clock, MonotonicClock};
use cube_dca::common::market::{MarketCatalog, MarketRules};
use cube_dca::common::traits::TradeStore;
use cube_dca::common::types::{NewTrade, Side, StrategyKind, Trade, TradeStatus};
use cube_dca::config::EngineConfig;
use cube_dca::engine::EngineContext;
use cube_dca::paper::{FillMode, PaperExchange};
use cube_dca::store::InMemoryTradeStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const BTC_USD: &str = "BTC-USD";
pub const ETH_USD: &str = "ETH-USD";

/// Market rules matching Cube's BTCUSDC and ETHUSDC books
pub fn sample_catalog() -> MarketCatalog {
    let mut catalog = MarketCatalog::default();
    catalog.insert(
        BTC_USD,
        MarketRules::new(100004, dec!(0.1), dec!(0.00001)).with_symbol("BTCUSDC"),
    );
    catalog.insert(
        ETH_USD,
        MarketRules::new(100005, dec!(0.01), dec!(0.0001)).with_symbol("ETHUSDC"),
    );
    catalog
}

/// Short intervals so paused-time tests stay readable
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        discovery_interval_seconds: 1,
        sweep_interval_seconds: 5,
        heartbeat_interval_seconds: 5,
        stale_after_seconds: 60,
        gateway_timeout_seconds: 2,
        drain_timeout_seconds: 5,
        order_poll_interval_seconds: 1,
        unknown_order_grace_seconds: 3,
    }
}

/// Paper exchange, memory store and engine context on a clock that follows
/// tokio's (possibly paused) time
pub struct TestBed {
    pub ctx: Arc<EngineContext>,
    pub paper: Arc<PaperExchange>,
    pub store: Arc<InMemoryTradeStore>,
    pub clock: Arc<dyn Clock>,
}

impl TestBed {
    pub async fn new(mode: FillMode) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let paper = Arc::new(PaperExchange::with_clock(mode, clock.clone()));
        paper.set_reference_price(BTC_USD, dec!(50000)).await;
        paper.set_reference_price(ETH_USD, dec!(3000)).await;
        let store = Arc::new(InMemoryTradeStore::new());
        let ctx = Arc::new(EngineContext::with_clock(
            paper.clone(),
            store.clone(),
            sample_catalog(),
            fast_engine_config(),
            clock.clone(),
        ));
        Self {
            ctx,
            paper,
            store,
            clock,
        }
    }

    /// Store a trade directly, bypassing the API
    pub async fn insert(&self, request: NewTrade) -> Trade {
        let trade = Trade::new(request, self.clock.now());
        self.store.insert_trade(&trade).await.unwrap()
    }

    pub async fn status(&self, trade_id: Uuid) -> TradeStatus {
        self.store.load_trade(trade_id).await.unwrap().status
    }

    /// Fill the single working paper order in full; returns its quantity
    pub async fn fill_open_order(&self, price: Decimal) -> Decimal {
        let open = self.paper.open_orders().await;
        assert_eq!(open.len(), 1, "expected exactly one working order");
        let order = &open[0];
        self.paper
            .fill_order(order.request.client_order_id, order.request.quantity, price)
            .await;
        order.request.quantity
    }

    /// Flag a trade for cancellation the way the API does
    pub async fn request_cancel(&self, trade_id: Uuid) {
        let mut trade = self.store.load_trade(trade_id).await.unwrap();
        trade.cancel_requested = true;
        self.store.save_trade(&trade).await.unwrap();
    }
}

/// BTC-USD buy of 10 over 40 seconds in 10 second slices
pub fn twap_buy(limit_price: Option<Decimal>) -> NewTrade {
    twap_request(BTC_USD, Side::Buy, dec!(10), limit_price, json!({
        "duration_secs": 40,
        "interval_secs": 10
    }))
}

pub fn twap_request(
    pair: &str,
    side: Side,
    total_quantity: Decimal,
    limit_price: Option<Decimal>,
    params: serde_json::Value,
) -> NewTrade {
    NewTrade {
        pair: pair.to_string(),
        side,
        total_quantity,
        limit_price,
        strategy_kind: StrategyKind::Twap,
        strategy_params: params,
    }
}

pub fn liquidity_maker_buy(total_quantity: Decimal, quote_quantity: Decimal) -> NewTrade {
    NewTrade {
        pair: BTC_USD.to_string(),
        side: Side::Buy,
        total_quantity,
        limit_price: None,
        strategy_kind: StrategyKind::LiquidityMaker,
        strategy_params: json!({
            "quote_quantity": quote_quantity,
            "spread_bps": 10,
            "requote_threshold_bps": 20,
            "refresh_secs": 2
        }),
    }
}

/// Advance paused time
pub async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

/// Sample Cube REST payloads
pub mod cube_responses {
    pub const ORDER_ACK: &str = r#"{
        "result": {
            "Ack": {
                "msgSeqNum": 7,
                "clientOrderId": 1700000000000000001,
                "requestId": 1,
                "exchangeOrderId": 884422,
                "marketId": 100004,
                "price": 490000,
                "quantity": 250000,
                "side": 0,
                "timeInForce": 1,
                "orderType": 0,
                "transactTime": 1700000000000000000,
                "subaccountId": 1
            }
        }
    }"#;

    pub const ORDER_REJECT: &str = r#"{
        "result": {
            "Rej": {
                "msgSeqNum": 8,
                "clientOrderId": 1700000000000000001,
                "requestId": 1,
                "transactTime": 1700000000000000000,
                "subaccountId": 1,
                "reason": "INSUFFICIENT_FUNDS",
                "marketId": 100004,
                "price": 490000,
                "quantity": 250000,
                "side": 0,
                "timeInForce": 1,
                "orderType": 0
            }
        }
    }"#;

    pub const BOOK_SNAPSHOT: &str = r#"{
        "result": {
            "ticker": "BTCUSDC",
            "bids": [["49990.0", "0.5"]],
            "asks": [["50010.0", "0.7"]]
        }
    }"#;
}
