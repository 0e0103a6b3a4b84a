//! Application configuration: types and the layered loader

pub mod loader;
pub mod types;

pub use loader::load_config;
pub use types::{
    ApiConfig, ApiCredentials, AppConfig, CubeConfig, DatabaseConfig, EngineConfig, LogConfig,
    PaperConfig,
};
