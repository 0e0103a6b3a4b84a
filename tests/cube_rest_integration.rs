//! Integration tests for the Cube REST gateway
//!
//! Every test runs against a local wiremock server that plays the Cube API,
//! so nothing here needs network access or real credentials.

mod common;

use common::cube_responses::{BOOK_SNAPSHOT, ORDER_ACK, ORDER_REJECT};
use common::{sample_catalog, BTC_USD};
use cube_dca::common::errors::GatewayError;
use cube_dca::common::traits::ExchangeGateway;
use cube_dca::common::types::{OrderKey, OrderRequest, OrderStatus, Side};
use cube_dca::config::CubeConfig;
use cube_dca::cube::CubeRestClient;
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_ORDER_ID: u64 = 1700000000000000001;
const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn config(server: &MockServer) -> CubeConfig {
    CubeConfig {
        api_key: Some("test-key".into()),
        api_secret: Some(SECRET.into()),
        subaccount_id: 1,
        rest_url: server.uri(),
        ..CubeConfig::default()
    }
}

fn create_test_client(server: &MockServer) -> CubeRestClient {
    CubeRestClient::new(&config(server), sample_catalog()).expect("Failed to create REST client")
}

fn limit_buy() -> OrderRequest {
    OrderRequest {
        pair: BTC_USD.into(),
        side: Side::Buy,
        quantity: dec!(2.5),
        price: Some(dec!(49000)),
        client_order_id: CLIENT_ORDER_ID,
    }
}

fn key(client_order_id: u64, exchange_order_id: Option<u64>) -> OrderKey {
    OrderKey {
        client_order_id,
        exchange_order_id,
    }
}

fn json_body(raw: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(raw.as_bytes().to_vec(), "application/json")
}

async fn last_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap_or_default();
    let last = requests.last().expect("no request recorded");
    serde_json::from_slice(&last.body).expect("request body is not JSON")
}

fn orders_listing(orders: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "result": { "orders": orders } }))
}

async fn mount_orders(server: &MockServer, orders: Value) {
    Mock::given(method("GET"))
        .and(path("/users/subaccount/1/orders"))
        .and(query_param("limit", "500"))
        .respond_with(orders_listing(orders))
        .mount(server)
        .await;
}

// ============================================================================
// Placement
// ============================================================================

#[tokio::test]
async fn test_place_limit_order_is_signed_and_acknowledged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .and(header("x-api-key", "test-key"))
        .and(header_exists("x-api-signature"))
        .and(header_exists("x-api-timestamp"))
        .respond_with(json_body(ORDER_ACK))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let ack = client.place_order(&limit_buy()).await.unwrap();
    assert_eq!(ack.exchange_order_id, 884422);

    let body = last_body(&server).await;
    assert_eq!(body["clientOrderId"], json!(CLIENT_ORDER_ID));
    assert_eq!(body["marketId"], json!(100004));
    assert_eq!(body["price"], json!(490000));
    assert_eq!(body["quantity"], json!(250000));
    assert_eq!(body["side"], json!(0));
    assert_eq!(body["timeInForce"], json!(1));
    assert_eq!(body["orderType"], json!(0));
    assert_eq!(body["subaccountId"], json!(1));
}

#[tokio::test]
async fn test_place_market_order_uses_protection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .respond_with(json_body(ORDER_ACK))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let request = OrderRequest {
        side: Side::Sell,
        price: None,
        ..limit_buy()
    };
    client.place_order(&request).await.unwrap();

    let body = last_body(&server).await;
    assert!(body.get("price").is_none());
    assert_eq!(body["side"], json!(1));
    assert_eq!(body["timeInForce"], json!(0));
    assert_eq!(body["orderType"], json!(2));
}

#[tokio::test]
async fn test_place_rejection_carries_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .respond_with(json_body(ORDER_REJECT))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    match client.place_order(&limit_buy()).await {
        Err(GatewayError::Rejected { reason }) => assert_eq!(reason, "INSUFFICIENT_FUNDS"),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let result = client.place_order(&limit_buy()).await;
    assert!(
        matches!(result, Err(GatewayError::Unavailable(_))),
        "unexpected result {:?}",
        result
    );
}

#[tokio::test]
async fn test_client_error_is_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad market"))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    assert!(matches!(
        client.place_order(&limit_buy()).await,
        Err(GatewayError::Rejected { .. })
    ));
}

#[tokio::test]
async fn test_place_without_credentials_never_reaches_exchange() {
    let server = MockServer::start().await;
    let config = CubeConfig {
        api_key: None,
        api_secret: None,
        ..config(&server)
    };
    let client = CubeRestClient::new(&config, sample_catalog()).unwrap();

    assert!(matches!(
        client.place_order(&limit_buy()).await,
        Err(GatewayError::Rejected { .. })
    ));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_place_unknown_pair_is_rejected() {
    let server = MockServer::start().await;
    let client = create_test_client(&server);
    let request = OrderRequest {
        pair: "DOGE-USD".into(),
        ..limit_buy()
    };
    assert!(matches!(
        client.place_order(&request).await,
        Err(GatewayError::Rejected { .. })
    ));
}

// ============================================================================
// Order status and fills
// ============================================================================

fn partially_filled_order() -> Value {
    json!([
        {
            "clientOrderId": 42,
            "exchangeOrderId": 7,
            "marketId": 100005,
            "status": "open",
            "qty": 10000,
            "filledQty": 0
        },
        {
            "clientOrderId": CLIENT_ORDER_ID,
            "exchangeOrderId": 884422,
            "marketId": 100004,
            "status": "partially_filled",
            "qty": 250000,
            "filledQty": 100000,
            "price": 490000,
            "fills": [
                {
                    "tradeId": 1,
                    "fillPrice": 490000,
                    "fillQuantity": 50000,
                    "feeRatio": "0.0004",
                    "transactTime": 1700000001000000000u64
                },
                {
                    "tradeId": 2,
                    "fillPrice": 480000,
                    "fillQuantity": 50000,
                    "transactTime": 1700000002000000000u64
                }
            ],
            "updatedAt": 1700000002000000000u64
        }
    ])
}

#[tokio::test]
async fn test_order_status_maps_listing() {
    let server = MockServer::start().await;
    mount_orders(&server, partially_filled_order()).await;

    let client = create_test_client(&server);
    let report = client
        .get_order_status(&key(CLIENT_ORDER_ID, None))
        .await
        .unwrap()
        .expect("order should be listed");

    assert_eq!(report.status, OrderStatus::PartiallyFilled);
    assert_eq!(report.exchange_order_id, Some(884422));
    assert_eq!(report.filled_quantity, dec!(1));
    assert_eq!(report.average_price, Some(dec!(48500)));
    assert_eq!(report.updated_at.timestamp(), 1700000002);
}

#[tokio::test]
async fn test_order_status_unknown_order() {
    let server = MockServer::start().await;
    mount_orders(&server, json!([])).await;

    let client = create_test_client(&server);
    let report = client
        .get_order_status(&key(CLIENT_ORDER_ID, None))
        .await
        .unwrap();
    assert!(report.is_none());
}

#[tokio::test]
async fn test_fills_are_converted_from_ticks_and_lots() {
    let server = MockServer::start().await;
    mount_orders(&server, partially_filled_order()).await;

    let client = create_test_client(&server);
    let fills = client
        .get_fills(&key(CLIENT_ORDER_ID, Some(884422)))
        .await
        .unwrap();

    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].quantity, dec!(0.5));
    assert_eq!(fills[0].price, dec!(49000));
    assert_eq!(fills[0].fee, dec!(9.8));
    assert_eq!(fills[0].exchange_order_id, 884422);
    assert_eq!(fills[1].price, dec!(48000));
    assert_eq!(fills[1].fee, dec!(0));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_after_place_uses_known_market() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/order"))
        .respond_with(json_body(ORDER_ACK))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/order"))
        .respond_with(json_body(ORDER_ACK))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    client.place_order(&limit_buy()).await.unwrap();
    client
        .cancel_order(&key(CLIENT_ORDER_ID, Some(884422)))
        .await
        .unwrap();

    let body = last_body(&server).await;
    assert_eq!(body["clientOrderId"], json!(CLIENT_ORDER_ID));
    assert_eq!(body["marketId"], json!(100004));
}

#[tokio::test]
async fn test_cancel_looks_up_market_after_restart() {
    let server = MockServer::start().await;
    mount_orders(&server, partially_filled_order()).await;
    Mock::given(method("DELETE"))
        .and(path("/order"))
        .respond_with(json_body(ORDER_ACK))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    client
        .cancel_order(&key(CLIENT_ORDER_ID, None))
        .await
        .unwrap();
    assert_eq!(last_body(&server).await["marketId"], json!(100004));
}

#[tokio::test]
async fn test_cancel_unknown_order_is_rejected() {
    let server = MockServer::start().await;
    mount_orders(&server, json!([])).await;

    let client = create_test_client(&server);
    assert!(matches!(
        client.cancel_order(&key(99, None)).await,
        Err(GatewayError::Rejected { .. })
    ));
}

// ============================================================================
// Reference price
// ============================================================================

#[tokio::test]
async fn test_reference_price_is_book_mid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/parsed/book/BTCUSDC/snapshot"))
        .and(query_param("depth", "1"))
        .respond_with(json_body(BOOK_SNAPSHOT))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    assert_eq!(client.reference_price(BTC_USD).await.unwrap(), dec!(50000));
}

#[tokio::test]
async fn test_reference_price_empty_book_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/parsed/book/BTCUSDC/snapshot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "ticker": "BTCUSDC", "bids": [], "asks": [] }
        })))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    assert!(matches!(
        client.reference_price(BTC_USD).await,
        Err(GatewayError::Unavailable(_))
    ));
}
