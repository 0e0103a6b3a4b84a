//! End-to-end execution tests
//!
//! The full engine (supervisor, workers, reconciliation sweep) runs against
//! the paper exchange and the in-memory store on paused tokio time, so a
//! 40 second schedule takes no wall-clock time at all.

mod common;

use common::{advance, liquidity_maker_buy, twap_buy, twap_request, TestBed, BTC_USD, ETH_USD};
use cube_dca::common::traits::TradeStore;
use cube_dca::common::types::{OrderStatus, Side, TradeStatus};
use cube_dca::engine::Engine;
use cube_dca::paper::{FillMode, PlacementFault};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

// ============================================================================
// TWAP
// ============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_twap_splits_into_equal_slices_on_schedule() {
    let bed = TestBed::new(FillMode::Cross).await;
    let trade = bed.insert(twap_buy(None)).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(45).await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Completed);

    let stored = bed.store.load_trade(trade.id).await.unwrap();
    let start = stored.started_at.unwrap();
    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    let offsets: Vec<i64> = orders
        .iter()
        .map(|o| (o.created_at - start).num_seconds())
        .collect();
    assert_eq!(offsets, vec![0, 10, 20, 30]);
    assert!(orders.iter().all(|o| o.requested_quantity == dec!(2.5)));
    assert!(orders.iter().all(|o| o.local_status == OrderStatus::Filled));
    assert_eq!(
        orders.iter().map(|o| o.filled_quantity).sum::<Decimal>(),
        dec!(10)
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_uneven_total_puts_remainder_on_final_slice() {
    let bed = TestBed::new(FillMode::Cross).await;
    let trade = bed
        .insert(twap_request(
            ETH_USD,
            Side::Sell,
            dec!(1),
            None,
            json!({ "duration_secs": 30, "interval_secs": 10 }),
        ))
        .await;
    let engine = Engine::start(bed.ctx.clone());

    advance(35).await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Completed);

    let quantities: Vec<Decimal> = bed
        .store
        .list_order_records(trade.id)
        .await
        .unwrap()
        .iter()
        .map(|o| o.requested_quantity)
        .collect();
    assert_eq!(quantities, vec![dec!(0.3333), dec!(0.3333), dec!(0.3334)]);
    assert_eq!(quantities.iter().sum::<Decimal>(), dec!(1));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fold_cancels_lagging_slice_and_carries_it_forward() {
    let bed = TestBed::new(FillMode::Manual).await;
    let trade = bed.insert(twap_buy(Some(dec!(49000)))).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(5).await;
    let first = bed.paper.open_orders().await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].request.quantity, dec!(2.5));
    assert_eq!(first[0].request.price, Some(dec!(49000)));

    advance(8).await;
    let open = bed.paper.open_orders().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].request.quantity, dec!(5));

    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].local_status, OrderStatus::Cancelled);
    assert_eq!(orders[1].slice, Some(1));

    // Catch-up slice, then the two remaining slices on schedule
    assert_eq!(bed.fill_open_order(dec!(49000)).await, dec!(5));
    advance(8).await;
    assert_eq!(bed.fill_open_order(dec!(49000)).await, dec!(2.5));
    advance(10).await;
    assert_eq!(bed.fill_open_order(dec!(49000)).await, dec!(2.5));
    advance(5).await;

    assert_eq!(bed.status(trade.id).await, TradeStatus::Completed);
    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    let quantities: Vec<Decimal> = orders.iter().map(|o| o.requested_quantity).collect();
    assert_eq!(quantities, vec![dec!(2.5), dec!(5), dec!(2.5), dec!(2.5)]);
    assert_eq!(
        orders.iter().map(|o| o.filled_quantity).sum::<Decimal>(),
        dec!(10)
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_extend_waits_for_lagging_slice() {
    let bed = TestBed::new(FillMode::Manual).await;
    let trade = bed
        .insert(twap_request(
            BTC_USD,
            Side::Buy,
            dec!(10),
            Some(dec!(49000)),
            json!({ "duration_secs": 40, "interval_secs": 10, "lagging_slice": "extend" }),
        ))
        .await;
    let engine = Engine::start(bed.ctx.clone());

    advance(14).await;
    let open = bed.paper.open_orders().await;
    assert_eq!(open.len(), 1, "lagging slice keeps working");
    assert_eq!(bed.paper.placement_count().await, 1);

    let client_order_id = open[0].request.client_order_id;
    bed.paper
        .fill_order(client_order_id, dec!(2.5), dec!(49000))
        .await;

    advance(3).await;
    assert_eq!(bed.paper.placement_count().await, 1, "next slice waits for the next tick");

    advance(5).await;
    assert_eq!(bed.paper.placement_count().await, 2);
    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    assert_eq!(orders[0].local_status, OrderStatus::Filled);
    assert_eq!(orders[1].requested_quantity, dec!(2.5));

    // Every slice closes after the next one was scheduled, so each placement
    // moves to the following tick
    bed.fill_open_order(dec!(49000)).await;
    advance(9).await;
    bed.fill_open_order(dec!(49000)).await;
    advance(10).await;
    bed.fill_open_order(dec!(49000)).await;
    advance(5).await;

    assert_eq!(bed.status(trade.id).await, TradeStatus::Completed);
    let stored = bed.store.load_trade(trade.id).await.unwrap();
    let start = stored.started_at.unwrap();
    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    let offsets: Vec<i64> = orders
        .iter()
        .map(|o| (o.created_at - start).num_seconds())
        .collect();
    assert_eq!(offsets, vec![0, 20, 30, 40]);
    assert!(orders.iter().all(|o| o.local_status == OrderStatus::Filled));
    assert_eq!(
        orders.iter().map(|o| o.filled_quantity).sum::<Decimal>(),
        dec!(10)
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_open_order_per_twap_trade() {
    let bed = TestBed::new(FillMode::Partial(dec!(0.5))).await;
    let trade = bed.insert(twap_buy(Some(dec!(50000)))).await;
    let engine = Engine::start(bed.ctx.clone());

    for _ in 0..50 {
        advance(1).await;
        let open = bed
            .store
            .list_order_records(trade.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.is_open())
            .count();
        assert!(open <= 1, "{} open orders", open);
    }

    let filled: Decimal = bed
        .store
        .list_order_records(trade.id)
        .await
        .unwrap()
        .iter()
        .map(|o| o.filled_quantity)
        .sum();
    assert!(filled <= dec!(10), "overfilled: {}", filled);

    engine.shutdown().await;
}

// ============================================================================
// Cancellation and failure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_request_drains_and_terminates() {
    let bed = TestBed::new(FillMode::Manual).await;
    let trade = bed.insert(twap_buy(Some(dec!(49000)))).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(3).await;
    assert_eq!(bed.paper.open_orders().await.len(), 1);

    bed.request_cancel(trade.id).await;
    engine.client().cancel(trade.id).await.unwrap();

    advance(5).await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Cancelled);
    assert!(bed.paper.open_orders().await.is_empty());
    assert!(!engine.live_trades().contains(&trade.id));

    advance(30).await;
    assert_eq!(bed.paper.placement_count().await, 1, "no orders after cancel");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_flag_is_honoured_without_a_nudge() {
    let bed = TestBed::new(FillMode::Manual).await;
    let trade = bed.insert(twap_buy(Some(dec!(49000)))).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(3).await;
    bed.request_cancel(trade.id).await;

    advance(5).await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Cancelled);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistent_rejections_fail_trade() {
    let bed = TestBed::new(FillMode::Cross).await;
    for _ in 0..4 {
        bed.paper
            .push_fault(PlacementFault::Reject("INSUFFICIENT_FUNDS".into()))
            .await;
    }
    let trade = bed
        .insert(twap_request(
            BTC_USD,
            Side::Buy,
            dec!(10),
            None,
            json!({ "duration_secs": 40, "interval_secs": 10, "max_rejections": 2 }),
        ))
        .await;
    let engine = Engine::start(bed.ctx.clone());

    advance(30).await;
    let stored = bed.store.load_trade(trade.id).await.unwrap();
    assert_eq!(stored.status, TradeStatus::Failed);
    assert!(stored
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("INSUFFICIENT_FUNDS")));

    engine.shutdown().await;
}

// ============================================================================
// Restart and concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_trade_without_duplicate_slices() {
    let bed = TestBed::new(FillMode::Cross).await;
    let trade = bed.insert(twap_buy(None)).await;

    let engine = Engine::start(bed.ctx.clone());
    advance(15).await;
    engine.shutdown().await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Active);
    assert_eq!(bed.paper.placement_count().await, 2);

    let engine = Engine::start(bed.ctx.clone());
    advance(40).await;
    assert_eq!(bed.status(trade.id).await, TradeStatus::Completed);

    let orders = bed.store.list_order_records(trade.id).await.unwrap();
    let slices: Vec<Option<u32>> = orders.iter().map(|o| o.slice).collect();
    assert_eq!(slices, vec![Some(0), Some(1), Some(2), Some(3)]);
    assert_eq!(bed.paper.placement_count().await, 4);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_trades_execute_independently() {
    let bed = TestBed::new(FillMode::Cross).await;
    let btc = bed.insert(twap_buy(None)).await;
    let eth = bed
        .insert(twap_request(
            ETH_USD,
            Side::Sell,
            dec!(4),
            None,
            json!({ "duration_secs": 20, "interval_secs": 10 }),
        ))
        .await;
    let broken = bed
        .insert(twap_request(
            ETH_USD,
            Side::Buy,
            dec!(1),
            None,
            json!({ "interval_secs": 10 }),
        ))
        .await;
    let engine = Engine::start(bed.ctx.clone());

    advance(3).await;
    assert_eq!(bed.status(broken.id).await, TradeStatus::Failed);
    assert_eq!(engine.live_trades().len(), 2);

    advance(25).await;
    assert_eq!(bed.status(eth.id).await, TradeStatus::Completed);
    assert_eq!(bed.status(btc.id).await, TradeStatus::Active);

    advance(20).await;
    assert_eq!(bed.status(btc.id).await, TradeStatus::Completed);
    assert!(engine.live_trades().is_empty());

    engine.shutdown().await;
}

// ============================================================================
// Liquidity maker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_liquidity_maker_quotes_both_sides_after_fill() {
    let bed = TestBed::new(FillMode::Manual).await;
    let trade = bed.insert(liquidity_maker_buy(dec!(3), dec!(1))).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(3).await;
    let quotes = bed.paper.open_orders().await;
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].request.side, Side::Buy);
    assert_eq!(quotes[0].request.quantity, dec!(1));
    assert_eq!(quotes[0].request.price, Some(dec!(49950)));

    bed.paper
        .fill_order(quotes[0].request.client_order_id, dec!(1), dec!(49950))
        .await;
    advance(5).await;

    let mut quotes = bed.paper.open_orders().await;
    quotes.sort_by_key(|o| o.request.side == Side::Sell);
    assert_eq!(quotes.len(), 2);
    assert_eq!(quotes[0].request.side, Side::Buy);
    assert_eq!(quotes[0].request.price, Some(dec!(49950)));
    assert_eq!(quotes[1].request.side, Side::Sell);
    assert_eq!(quotes[1].request.price, Some(dec!(50050)));
    assert_eq!(bed.status(trade.id).await, TradeStatus::Active);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_liquidity_maker_requotes_when_reference_moves() {
    let bed = TestBed::new(FillMode::Manual).await;
    bed.insert(liquidity_maker_buy(dec!(3), dec!(1))).await;
    let engine = Engine::start(bed.ctx.clone());

    advance(3).await;
    let before = bed.paper.open_orders().await;
    assert_eq!(before.len(), 1);

    // 50 bps, beyond the 20 bps threshold
    bed.paper.set_reference_price(BTC_USD, dec!(50250)).await;
    advance(5).await;

    let after = bed.paper.open_orders().await;
    assert_eq!(after.len(), 1);
    assert_ne!(
        after[0].request.client_order_id,
        before[0].request.client_order_id
    );
    assert_eq!(after[0].request.price, Some(dec!(50199.7)));

    engine.shutdown().await;
}
