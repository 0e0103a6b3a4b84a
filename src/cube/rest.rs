//! REST client for the Cube exchange

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::auth::generate_auth_headers;
use super::messages::*;
use crate::common::errors::{EngineError, GatewayError, GatewayResult, Result};
use crate::common::market::{MarketCatalog, MarketRules};
use crate::common::traits::ExchangeGateway;
use crate::common::types::{
    average_price, Fill, OrderAck, OrderKey, OrderRequest, OrderStatus, OrderStatusReport,
};
use crate::config::types::{ApiCredentials, CubeConfig};

/// Orders listed per status query
const ORDER_PAGE_LIMIT: u32 = 500;

/// Cube REST gateway
#[derive(Debug)]
pub struct CubeRestClient {
    client: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    subaccount_id: u64,
    catalog: MarketCatalog,
    request_ids: AtomicU64,
    /// Market of every order placed by this process, for cancels
    order_markets: RwLock<HashMap<u64, u64>>,
}

impl CubeRestClient {
    pub fn new(config: &CubeConfig, catalog: MarketCatalog) -> Result<Self> {
        let base = url::Url::parse(&config.rest_url).map_err(|e| {
            EngineError::Configuration(format!("Invalid Cube REST URL {}: {}", config.rest_url, e))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(EngineError::Configuration(format!(
                "Cube REST URL must be http(s): {}",
                config.rest_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            credentials: config.credentials(),
            subaccount_id: config.subaccount_id,
            catalog,
            request_ids: AtomicU64::new(1),
            order_markets: RwLock::new(HashMap::new()),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn rules_for_market(&self, market_id: u64) -> GatewayResult<&MarketRules> {
        self.catalog
            .pair_for(market_id)
            .and_then(|pair| self.catalog.get(pair))
            .ok_or_else(|| GatewayError::Unavailable(format!("no rules for market {}", market_id)))
    }

    /// Sign (when credentials are set), send and decode one request
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> GatewayResult<T> {
        let request = match &self.credentials {
            Some(credentials) => generate_auth_headers(credentials)
                .map_err(|e| GatewayError::rejected(e.to_string()))?
                .apply_to_request(request),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("Invalid response: {}", e)))
    }

    /// Look an order up in the subaccount's order list
    async fn find_order(&self, client_order_id: u64) -> GatewayResult<Option<CubeOrder>> {
        let url = format!(
            "{}/users/subaccount/{}/orders",
            self.base_url, self.subaccount_id
        );
        let request = self
            .client
            .get(&url)
            .query(&[("limit", ORDER_PAGE_LIMIT)]);
        let listing: Envelope<SubaccountOrders> = self.send(request).await?;

        let order = listing
            .result
            .orders
            .into_iter()
            .find(|o| o.client_order_id == client_order_id);
        if let Some(order) = &order {
            self.order_markets
                .write()
                .await
                .insert(client_order_id, order.market_id);
        }
        Ok(order)
    }

    fn convert_fills(&self, order: &CubeOrder) -> GatewayResult<Vec<Fill>> {
        let rules = self.rules_for_market(order.market_id)?;
        order
            .fills
            .iter()
            .map(|fill| {
                let quantity = rules.lots_to_quantity(fill.fill_quantity);
                let price = rules.ticks_to_price(fill.fill_price);
                Ok(Fill {
                    fill_id: fill.trade_id,
                    exchange_order_id: fill
                        .exchange_order_id
                        .or(order.exchange_order_id)
                        .unwrap_or_default(),
                    quantity,
                    price,
                    fee: fill.fee_ratio.unwrap_or(Decimal::ZERO) * quantity * price,
                    timestamp: from_nanos(fill.transact_time).ok_or_else(|| {
                        GatewayError::Unavailable(format!("Invalid fill time {}", fill.transact_time))
                    })?,
                })
            })
            .collect()
    }

    fn convert_order(&self, order: &CubeOrder) -> GatewayResult<OrderStatusReport> {
        let rules = self.rules_for_market(order.market_id)?;
        let status: OrderStatus = order
            .status
            .parse()
            .map_err(GatewayError::Unavailable)?;
        let fills = self.convert_fills(order)?;
        let updated_at = order
            .updated_at
            .and_then(from_nanos)
            .or_else(|| fills.iter().map(|f| f.timestamp).max())
            .unwrap_or_else(chrono::Utc::now);

        Ok(OrderStatusReport {
            exchange_order_id: order.exchange_order_id,
            status,
            filled_quantity: rules.lots_to_quantity(order.filled_qty),
            average_price: average_price(&fills),
            reason: order.reason.as_ref().map(|r| match r {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            }),
            updated_at,
        })
    }
}

/// Map an HTTP error status to the gateway error taxonomy
///
/// Rate limiting and server errors are transient; any other client error is
/// an explicit refusal.
fn classify_status(status: StatusCode, body: String) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        GatewayError::Unavailable(format!("Server returned status {}: {}", status, body))
    } else {
        GatewayError::rejected(format!("Server returned status {}: {}", status, body))
    }
}

#[async_trait]
impl ExchangeGateway for CubeRestClient {
    #[instrument(skip(self), fields(client_order_id = request.client_order_id))]
    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        if self.credentials.is_none() {
            return Err(GatewayError::rejected("no API credentials configured"));
        }
        let rules = self
            .catalog
            .get(&request.pair)
            .ok_or_else(|| GatewayError::rejected(format!("unknown market {}", request.pair)))?;

        let (price, time_in_force, order_type) = match request.price {
            Some(price) => (
                Some(rules.price_to_ticks(price)),
                time_in_force::GOOD_FOR_SESSION,
                order_type::LIMIT,
            ),
            None => (
                None,
                time_in_force::IMMEDIATE_OR_CANCEL,
                order_type::MARKET_WITH_PROTECTION,
            ),
        };
        let body = NewOrderRequest {
            client_order_id: request.client_order_id,
            request_id: self.next_request_id(),
            market_id: rules.market_id,
            price,
            quantity: rules.quantity_to_lots(request.quantity),
            side: side_code(request.side),
            time_in_force,
            order_type,
            subaccount_id: self.subaccount_id,
            post_only: false,
            cancel_on_disconnect: false,
        };
        if body.quantity == 0 {
            return Err(GatewayError::rejected("quantity below one lot"));
        }

        self.order_markets
            .write()
            .await
            .insert(request.client_order_id, rules.market_id);

        let url = format!("{}/order", self.base_url);
        debug!(market_id = body.market_id, lots = body.quantity, "Placing order");
        let response: Envelope<OrderResponse> = self.send(self.client.post(&url).json(&body)).await?;

        match response.result {
            OrderResponse::Ack(ack) => match ack.exchange_order_id {
                Some(exchange_order_id) => Ok(OrderAck { exchange_order_id }),
                None => {
                    warn!("Placement acknowledged without exchange order id");
                    Err(GatewayError::Timeout)
                }
            },
            OrderResponse::Rej(rej) => Err(GatewayError::rejected(rej.reason_text())),
        }
    }

    #[instrument(skip(self), fields(client_order_id = key.client_order_id))]
    async fn cancel_order(&self, key: &OrderKey) -> GatewayResult<()> {
        let known = self
            .order_markets
            .read()
            .await
            .get(&key.client_order_id)
            .copied();
        let market_id = match known {
            Some(market_id) => market_id,
            None => match self.find_order(key.client_order_id).await? {
                Some(order) => order.market_id,
                None => return Err(GatewayError::rejected("unknown order")),
            },
        };

        let body = CancelOrderRequest {
            client_order_id: key.client_order_id,
            request_id: self.next_request_id(),
            market_id,
            subaccount_id: self.subaccount_id,
        };
        let url = format!("{}/order", self.base_url);
        let response: Envelope<OrderResponse> =
            self.send(self.client.delete(&url).json(&body)).await?;

        match response.result {
            OrderResponse::Ack(_) => Ok(()),
            OrderResponse::Rej(rej) => Err(GatewayError::rejected(rej.reason_text())),
        }
    }

    #[instrument(skip(self), fields(client_order_id = key.client_order_id))]
    async fn get_order_status(&self, key: &OrderKey) -> GatewayResult<Option<OrderStatusReport>> {
        match self.find_order(key.client_order_id).await? {
            Some(order) => self.convert_order(&order).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(client_order_id = key.client_order_id))]
    async fn get_fills(&self, key: &OrderKey) -> GatewayResult<Vec<Fill>> {
        match self.find_order(key.client_order_id).await? {
            Some(order) => self.convert_fills(&order),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self))]
    async fn reference_price(&self, pair: &str) -> GatewayResult<Decimal> {
        let rules = self
            .catalog
            .get(pair)
            .ok_or_else(|| GatewayError::Unavailable(format!("unknown market {}", pair)))?;
        let url = format!(
            "{}/parsed/book/{}/snapshot",
            self.base_url,
            rules.book_symbol(pair)
        );
        let snapshot: Envelope<BookSnapshot> =
            self.send(self.client.get(&url).query(&[("depth", 1)])).await?;
        snapshot
            .result
            .mid_price()
            .ok_or_else(|| GatewayError::Unavailable(format!("empty book for {}", pair)))
    }

    fn exchange_name(&self) -> &'static str {
        "cube"
    }
}
