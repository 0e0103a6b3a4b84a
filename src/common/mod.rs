//! Common types, traits and utilities shared across the crate

pub mod clock;
pub mod errors;
pub mod market;
pub mod traits;
pub mod types;
