//! Cube exchange gateway
//!
//! Signed REST access to the Cube spot exchange: order placement and
//! cancellation, order status and fills by client order id, and the order
//! book mid used as a reference price.

pub mod auth;
pub mod messages;
pub mod rest;

pub use rest::CubeRestClient;
