//! Error types for the application

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using our EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type for exchange gateway calls
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Result type for trade store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of an exchange gateway call
///
/// Every gateway operation fails with exactly one of these. `Timeout` means the
/// outcome is unknown and must be resolved with a status query before any
/// further mutation of the same order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The call did not complete within its deadline
    #[error("Gateway call timed out")]
    Timeout,

    /// The exchange explicitly refused the request
    #[error("Gateway rejected request: {reason}")]
    Rejected { reason: String },

    /// The exchange could not be reached or is not serving requests
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}

/// Failures of a trade store call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer updated the record since it was read
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// No record with the given key
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The backing store could not serve the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn trade_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("trade {}", id))
    }

    pub fn order_not_found(client_order_id: u64) -> Self {
        Self::NotFound(format!("order {}", client_order_id))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Strategy construction and evaluation errors
///
/// These are never retried: a trade whose strategy cannot be built is failed
/// with the error as its recorded reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// strategy_params could not be interpreted
    #[error("Invalid strategy parameters: {0}")]
    InvalidParams(String),

    /// No market rules are configured for the pair
    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    /// The strategy cannot run with the trade as given
    #[error("Unsupported trade: {0}")]
    Unsupported(String),
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Exchange gateway errors
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Trade store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Strategy errors
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Illegal trade status change
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_in_message() {
        let err = GatewayError::rejected("post only");
        assert_eq!(err.to_string(), "Gateway rejected request: post only");
    }

    #[test]
    fn test_engine_error_wraps_store_error() {
        let err: EngineError = StoreError::Conflict("trade".into()).into();
        assert_eq!(err.to_string(), "Write conflict on trade");
    }
}
