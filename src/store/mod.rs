//! Trade store implementations
//!
//! - [`InMemoryTradeStore`]: process memory, for paper trading and tests
//! - [`PgTradeStore`]: PostgreSQL through sqlx

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTradeStore;
pub use postgres::PgTradeStore;
