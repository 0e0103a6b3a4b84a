use chrono::{DateTime, Utc};

use crate::common::types::{OrderRecord, Trade};
use crate::strategy::types::{Correction, Decision, ExecutionState};

/// Core strategy trait
///
/// A strategy decides, for one trade, what the next order action is and when
/// it should happen. It never talks to the exchange or the store itself: the
/// worker executes the returned [`Decision`], persists the outcome and asks
/// again with a refreshed [`ExecutionState`].
///
/// # Implementation Notes
///
/// - `next_action` must be deterministic in `(trade, state, now)` for
///   schedule-driven strategies so a re-spawned worker makes the same choices
/// - `next_action` should be fast - no blocking I/O
/// - Returning `Decision::Go` with `at` in the future makes the worker
///   suspend until then (cancellably) and re-evaluate
pub trait Strategy: Send + Sync {
    /// Unique identifier for this strategy
    fn name(&self) -> &str;

    /// Decide the next action and its earliest time
    fn next_action(&mut self, trade: &Trade, state: &ExecutionState, now: DateTime<Utc>) -> Decision;

    /// Called after a placement was rejected by the exchange
    ///
    /// `consecutive` counts trailing rejections including this one.
    fn on_rejected(&mut self, rejected: &OrderRecord, consecutive: u32) -> Correction;

    /// Whether the worker should fetch a reference price before each evaluation
    ///
    /// Default implementation returns false.
    fn needs_reference_price(&self) -> bool {
        false
    }
}

/// Boxed strategy for dynamic dispatch
pub type BoxedStrategy = Box<dyn Strategy>;
