//! Authentication utilities for the Cube REST API

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::common::errors::{EngineError, Result};
use crate::config::types::ApiCredentials;

type HmacSha256 = Hmac<Sha256>;

/// Fixed prefix of every signed payload
const SIGNING_PREFIX: &[u8] = b"cube.xyz";

/// Sign a request timestamp
///
/// # Arguments
/// * `secret` - API secret key (hex encoded)
/// * `timestamp` - Unix timestamp in seconds
///
/// The payload is `"cube.xyz"` followed by the timestamp as 8 little-endian
/// bytes; the HMAC-SHA256 digest is returned base64 encoded.
pub fn sign_request(secret: &str, timestamp: u64) -> Result<String> {
    let secret_bytes = hex::decode(secret)
        .map_err(|e| EngineError::Configuration(format!("Failed to decode API secret: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(&secret_bytes)
        .map_err(|e| EngineError::Configuration(format!("Failed to create HMAC: {}", e)))?;
    mac.update(SIGNING_PREFIX);
    mac.update(&timestamp.to_le_bytes());

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Generate authentication headers for the current second
pub fn generate_auth_headers(credentials: &ApiCredentials) -> Result<AuthHeaders> {
    let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
    let signature = sign_request(&credentials.api_secret, timestamp)?;

    Ok(AuthHeaders {
        api_key: credentials.api_key.clone(),
        signature,
        timestamp,
    })
}

/// Authentication headers for API requests
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: u64,
}

impl AuthHeaders {
    /// Add authentication headers to a reqwest RequestBuilder
    pub fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", &self.api_key)
            .header("x-api-signature", &self.signature)
            .header("x-api-timestamp", self.timestamp.to_string())
    }
}
