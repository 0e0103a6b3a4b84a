//! Configuration types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::common::errors::{EngineError, Result};
use crate::common::market::{MarketCatalog, MarketRules};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cube exchange access
    #[serde(default)]
    pub cube: CubeConfig,
    /// Database configuration (optional; in-memory store when absent)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Management API settings
    #[serde(default)]
    pub api: ApiConfig,
    /// Supervisor, worker and sweep timing
    #[serde(default)]
    pub engine: EngineConfig,
    /// Trading rules keyed by pair symbol
    #[serde(default)]
    pub markets: HashMap<String, MarketRules>,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Simulated exchange used with `--paper`
    #[serde(default)]
    pub paper: PaperConfig,
}

impl AppConfig {
    pub fn market_catalog(&self) -> MarketCatalog {
        MarketCatalog::new(self.markets.clone())
    }

    pub fn validate(&self) -> Result<()> {
        for (pair, rules) in &self.markets {
            rules
                .validate()
                .map_err(|e| EngineError::Configuration(format!("market {}: {}", pair, e)))?;
        }
        self.engine.validate()
    }
}

/// Cube exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeConfig {
    /// API key for authenticated requests
    #[serde(default)]
    pub api_key: Option<String>,
    /// Hex-encoded API secret for signing requests
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Subaccount orders are placed on
    #[serde(default = "default_subaccount_id")]
    pub subaccount_id: u64,
    /// Base URL for the REST API
    #[serde(default = "default_cube_rest_url")]
    pub rest_url: String,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for CubeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            subaccount_id: default_subaccount_id(),
            rest_url: default_cube_rest_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl CubeConfig {
    /// Key and secret, if both are configured
    pub fn credentials(&self) -> Option<ApiCredentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(ApiCredentials::new(key.clone(), secret.clone())),
            _ => None,
        }
    }
}

fn default_subaccount_id() -> u64 {
    1
}

fn default_cube_rest_url() -> String {
    "https://api.cube.exchange/os/v0".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

/// Database configuration for the trade store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    30
}

/// Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Engine timing, all in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Supervisor discovery cycle period
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_seconds: u64,
    /// Reconciliation sweep period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Worker heartbeat period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// A worker whose last heartbeat is older than this is considered dead
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
    /// Deadline applied to every gateway call
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_seconds: u64,
    /// How long a draining worker waits for its orders to close
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// How often a worker re-checks its open orders
    #[serde(default = "default_order_poll_interval")]
    pub order_poll_interval_seconds: u64,
    /// How long an order may stay unknown to the exchange before it is
    /// considered never received
    #[serde(default = "default_unknown_order_grace")]
    pub unknown_order_grace_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_interval_seconds: default_discovery_interval(),
            sweep_interval_seconds: default_sweep_interval(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stale_after_seconds: default_stale_after(),
            gateway_timeout_seconds: default_gateway_timeout(),
            drain_timeout_seconds: default_drain_timeout(),
            order_poll_interval_seconds: default_order_poll_interval(),
            unknown_order_grace_seconds: default_unknown_order_grace(),
        }
    }
}

impl EngineConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_secs(self.order_poll_interval_seconds)
    }

    pub fn unknown_order_grace(&self) -> Duration {
        Duration::from_secs(self.unknown_order_grace_seconds)
    }

    fn validate(&self) -> Result<()> {
        let periods = [
            ("discovery_interval_seconds", self.discovery_interval_seconds),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("gateway_timeout_seconds", self.gateway_timeout_seconds),
            ("order_poll_interval_seconds", self.order_poll_interval_seconds),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            return Err(EngineError::Configuration(format!(
                "engine.{} must be positive",
                name
            )));
        }
        if self.stale_after_seconds <= self.heartbeat_interval_seconds {
            return Err(EngineError::Configuration(
                "engine.stale_after_seconds must exceed heartbeat_interval_seconds".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_stale_after() -> u64 {
    60
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_order_poll_interval() -> u64 {
    2
}

fn default_unknown_order_grace() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Paper trading settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting reference price per pair; market orders fill at it
    #[serde(default)]
    pub reference_prices: HashMap<String, Decimal>,
}

/// API credentials for authenticated requests
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    /// Hex-encoded secret
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }
}
