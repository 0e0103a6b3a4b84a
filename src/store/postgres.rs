//! PostgreSQL trade store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::common::errors::{StoreError, StoreResult};
use crate::common::traits::TradeStore;
use crate::common::types::{OrderPatch, OrderRecord, Trade};
use crate::config::types::DatabaseConfig;

const TRADE_COLUMNS: &str = "id, pair, side, total_quantity, limit_price, strategy_kind, \
     strategy_params, status, started_at, cancel_requested, last_error, created_at, updated_at, version";

const ORDER_COLUMNS: &str = "client_order_id, exchange_order_id, trade_id, side, requested_quantity, \
     requested_price, filled_quantity, average_fill_price, local_status, slice, reason, created_at, \
     last_synced_at, exchange_updated_at";

/// Trade store on a Postgres connection pool
#[derive(Clone)]
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    /// Connect and make sure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("Connected to trade database");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id UUID PRIMARY KEY,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                total_quantity NUMERIC NOT NULL,
                limit_price NUMERIC,
                strategy_kind TEXT NOT NULL,
                strategy_params JSONB NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ,
                cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS order_records (
                seq BIGSERIAL,
                client_order_id BIGINT PRIMARY KEY,
                exchange_order_id BIGINT,
                trade_id UUID NOT NULL REFERENCES trades(id),
                side TEXT NOT NULL,
                requested_quantity NUMERIC NOT NULL,
                requested_price NUMERIC,
                filled_quantity NUMERIC NOT NULL,
                average_fill_price NUMERIC,
                local_status TEXT NOT NULL,
                slice INTEGER,
                reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                last_synced_at TIMESTAMPTZ NOT NULL,
                exchange_updated_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS order_records_trade_idx ON order_records (trade_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn trade_exists(&self, id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM trades WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    #[instrument(skip(self, trade), fields(trade_id = %trade.id))]
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<Trade> {
        let mut stored = trade.clone();
        stored.version = 1;
        sqlx::query(&format!(
            "INSERT INTO trades ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            TRADE_COLUMNS
        ))
        .bind(stored.id)
        .bind(&stored.pair)
        .bind(stored.side.as_str())
        .bind(stored.total_quantity)
        .bind(stored.limit_price)
        .bind(stored.strategy_kind.as_str())
        .bind(Json(&stored.strategy_params))
        .bind(stored.status.as_str())
        .bind(stored.started_at)
        .bind(stored.cancel_requested)
        .bind(&stored.last_error)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(stored.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn list_active_trades(&self) -> StoreResult<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {} FROM trades WHERE status IN ('pending', 'active') ORDER BY created_at ASC",
            TRADE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    async fn list_trades(&self) -> StoreResult<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {} FROM trades ORDER BY created_at DESC",
            TRADE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    async fn load_trade(&self, id: Uuid) -> StoreResult<Trade> {
        sqlx::query_as::<_, Trade>(&format!("SELECT {} FROM trades WHERE id = $1", TRADE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::trade_not_found(id))
    }

    #[instrument(skip(self, trade), fields(trade_id = %trade.id, version = trade.version))]
    async fn save_trade(&self, trade: &Trade) -> StoreResult<Trade> {
        let next_version = trade.version + 1;
        let result = sqlx::query(
            "UPDATE trades SET status = $3, started_at = $4, cancel_requested = $5, last_error = $6, \
             updated_at = $7, version = $8 WHERE id = $1 AND version = $2",
        )
        .bind(trade.id)
        .bind(trade.version as i64)
        .bind(trade.status.as_str())
        .bind(trade.started_at)
        .bind(trade.cancel_requested)
        .bind(&trade.last_error)
        .bind(trade.updated_at)
        .bind(next_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return if self.trade_exists(trade.id).await? {
                debug!("Trade version conflict");
                Err(StoreError::Conflict(format!("trade {}", trade.id)))
            } else {
                Err(StoreError::trade_not_found(trade.id))
            };
        }

        let mut stored = trade.clone();
        stored.version = next_version;
        Ok(stored)
    }

    #[instrument(skip(self, record), fields(trade_id = %record.trade_id, client_order_id = record.client_order_id))]
    async fn append_order_record(&self, record: &OrderRecord) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO order_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            ORDER_COLUMNS
        ))
        .bind(record.client_order_id as i64)
        .bind(record.exchange_order_id.map(|id| id as i64))
        .bind(record.trade_id)
        .bind(record.side.as_str())
        .bind(record.requested_quantity)
        .bind(record.requested_price)
        .bind(record.filled_quantity)
        .bind(record.average_fill_price)
        .bind(record.local_status.as_str())
        .bind(record.slice.map(|s| s as i32))
        .bind(&record.reason)
        .bind(record.created_at)
        .bind(record.last_synced_at)
        .bind(record.exchange_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                "order {} already exists",
                record.client_order_id
            )),
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::trade_not_found(record.trade_id)
            }
            other => other.into(),
        })?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update_order_record(
        &self,
        client_order_id: u64,
        patch: &OrderPatch,
    ) -> StoreResult<OrderRecord> {
        let mut tx = self.pool.begin().await?;

        let mut record = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM order_records WHERE client_order_id = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(client_order_id as i64)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::order_not_found(client_order_id))?;

        if record.apply(patch) {
            sqlx::query(
                "UPDATE order_records SET exchange_order_id = $2, filled_quantity = $3, \
                 average_fill_price = $4, local_status = $5, reason = $6, last_synced_at = $7, \
                 exchange_updated_at = $8 WHERE client_order_id = $1",
            )
            .bind(client_order_id as i64)
            .bind(record.exchange_order_id.map(|id| id as i64))
            .bind(record.filled_quantity)
            .bind(record.average_fill_price)
            .bind(record.local_status.as_str())
            .bind(&record.reason)
            .bind(record.last_synced_at)
            .bind(record.exchange_updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn list_order_records(&self, trade_id: Uuid) -> StoreResult<Vec<OrderRecord>> {
        let records = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM order_records WHERE trade_id = $1 ORDER BY seq ASC",
            ORDER_COLUMNS
        ))
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.into(),
        source: e.into(),
    })
}

impl FromRow<'_, PgRow> for Trade {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let strategy_params: Json<serde_json::Value> = row.try_get("strategy_params")?;
        let version: i64 = row.try_get("version")?;
        Ok(Trade {
            id: row.try_get("id")?,
            pair: row.try_get("pair")?,
            side: parse_column(row, "side")?,
            total_quantity: row.try_get("total_quantity")?,
            limit_price: row.try_get("limit_price")?,
            strategy_kind: parse_column(row, "strategy_kind")?,
            strategy_params: strategy_params.0,
            status: parse_column(row, "status")?,
            started_at: row.try_get("started_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: version as u64,
        })
    }
}

impl FromRow<'_, PgRow> for OrderRecord {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let client_order_id: i64 = row.try_get("client_order_id")?;
        let exchange_order_id: Option<i64> = row.try_get("exchange_order_id")?;
        let slice: Option<i32> = row.try_get("slice")?;
        let requested_price: Option<Decimal> = row.try_get("requested_price")?;
        let exchange_updated_at: Option<DateTime<Utc>> = row.try_get("exchange_updated_at")?;
        Ok(OrderRecord {
            client_order_id: client_order_id as u64,
            exchange_order_id: exchange_order_id.map(|id| id as u64),
            trade_id: row.try_get("trade_id")?,
            side: parse_column(row, "side")?,
            requested_quantity: row.try_get("requested_quantity")?,
            requested_price,
            filled_quantity: row.try_get("filled_quantity")?,
            average_fill_price: row.try_get("average_fill_price")?,
            local_status: parse_column(row, "local_status")?,
            slice: slice.map(|s| s as u32),
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            last_synced_at: row.try_get("last_synced_at")?,
            exchange_updated_at,
        })
    }
}
