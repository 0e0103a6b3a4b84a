//! Configuration loader

use config::{Config, Environment, File};
use std::path::Path;

use super::types::AppConfig;
use crate::common::errors::{EngineError, Result};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. `CUBE_API_KEY`, `CUBE_API_SECRET`, `CUBE_SUBACCOUNT_ID`, `DATABASE_URL`
/// 2. Environment variables prefixed with `APP__` (e.g. `APP__ENGINE__SWEEP_INTERVAL_SECONDS`)
/// 3. Configuration file (TOML format)
/// 4. Default values
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    // Pick up a .env file if present
    dotenvy::dotenv().ok();

    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder = builder
        .set_override_option("cube.api_key", std::env::var("CUBE_API_KEY").ok())
        .and_then(|b| b.set_override_option("cube.api_secret", std::env::var("CUBE_API_SECRET").ok()))
        .and_then(|b| {
            b.set_override_option(
                "cube.subaccount_id",
                std::env::var("CUBE_SUBACCOUNT_ID").ok(),
            )
        })
        .and_then(|b| b.set_override_option("database.url", std::env::var("DATABASE_URL").ok()))
        .map_err(|e| EngineError::Configuration(e.to_string()))?;

    let config: AppConfig = builder
        .build()
        .map_err(|e| EngineError::Configuration(e.to_string()))?
        .try_deserialize()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("cube_dca_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[api]
bind = "0.0.0.0:9000"

[engine]
sweep_interval_seconds = 7

[markets.BTC-USD]
market_id = 100004
price_tick = "0.1"
quantity_tick = "0.00001"
"#
        )
        .unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.api.bind, "0.0.0.0:9000");
        assert_eq!(config.engine.sweep_interval_seconds, 7);
        assert_eq!(config.engine.discovery_interval_seconds, 5);
        let btc = config.market_catalog().rules_for("BTC-USD").cloned().unwrap();
        assert_eq!(btc.market_id, 100004);
        assert_eq!(btc.quantity_tick, dec!(0.00001));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/cube_dca.toml")).unwrap();
        assert_eq!(config.engine.gateway_timeout_seconds, 10);
    }
}
