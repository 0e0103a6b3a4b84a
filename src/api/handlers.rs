use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::types::*;
use super::AppState;
use crate::common::errors::StoreError;
use crate::common::types::{NewTrade, Trade};
use crate::strategy::build_strategy;

const MAX_CANCEL_ATTEMPTS: usize = 5;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, active_trades) = match state.store.list_active_trades().await {
        Ok(trades) => (StatusCode::OK, "ok", trades.len()),
        Err(err) => {
            warn!(error = %err, "Health check could not reach the store");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", 0)
        }
    };
    let body = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_trades,
        timestamp: state.clock.now(),
    };
    (code, Json(body))
}

/// POST /trades
#[instrument(skip_all, fields(pair = %request.pair, strategy = %request.strategy_kind))]
pub async fn create_trade(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewTrade>,
) -> Result<(StatusCode, Json<CreateTradeResponse>), ApiError> {
    if request.total_quantity <= Decimal::ZERO {
        return Err(ApiError::bad_request("total_quantity must be positive"));
    }
    if request.limit_price.is_some_and(|p| p <= Decimal::ZERO) {
        return Err(ApiError::bad_request("limit_price must be positive"));
    }

    let trade = Trade::new(request, state.clock.now());
    build_strategy(&trade, &state.catalog).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let stored = state.store.insert_trade(&trade).await?;
    info!(trade_id = %stored.id, "Trade created");

    if let Err(err) = state.supervisor.discover().await {
        warn!(error = %err, "Supervisor not reachable, trade waits for next discovery");
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateTradeResponse {
            id: stored.id,
            status: stored.status,
        }),
    ))
}

/// GET /trades
pub async fn list_trades(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TradeSummary>>, ApiError> {
    let trades = state.store.list_trades().await?;
    let mut summaries = Vec::with_capacity(trades.len());
    for trade in &trades {
        let orders = state.store.list_order_records(trade.id).await?;
        summaries.push(TradeSummary::new(trade, &orders));
    }
    Ok(Json(summaries))
}

/// GET /trades/{id}
pub async fn get_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TradeView>, ApiError> {
    let trade = state.store.load_trade(id).await?;
    let orders = state.store.list_order_records(id).await?;
    let worker = if trade.is_live() {
        state.supervisor.worker_state(id).await.ok().flatten()
    } else {
        None
    };
    Ok(Json(TradeView::new(trade, orders, worker)))
}

/// GET /trades/{id}/stats
pub async fn trade_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionStats>, ApiError> {
    let trade = state.store.load_trade(id).await?;
    let orders = state.store.list_order_records(id).await?;
    Ok(Json(ExecutionStats::compute(&trade, &orders)))
}

/// POST /trades/{id}/cancel
///
/// Sets the durable cancel flag and nudges the supervisor; the owning worker
/// drains the trade's orders and finishes it.
#[instrument(skip_all, fields(trade_id = %id))]
pub async fn cancel_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelTradeResponse>), ApiError> {
    let mut attempt = 0;
    let trade = loop {
        attempt += 1;
        let mut trade = state.store.load_trade(id).await?;
        if trade.status.is_terminal() {
            return Err(ApiError::conflict(format!(
                "trade {} is already {}",
                id, trade.status
            )));
        }
        if trade.cancel_requested {
            break trade;
        }
        trade.cancel_requested = true;
        trade.updated_at = state.clock.now();
        match state.store.save_trade(&trade).await {
            Ok(saved) => break saved,
            Err(StoreError::Conflict(_)) if attempt < MAX_CANCEL_ATTEMPTS => continue,
            Err(err) => return Err(err.into()),
        }
    };
    info!(trade_id = %id, "Cancel requested");

    if let Err(err) = state.supervisor.cancel(id).await {
        warn!(error = %err, "Supervisor not reachable, cancel picked up on next discovery");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelTradeResponse {
            id,
            status: trade.status,
            cancel_requested: true,
        }),
    ))
}
