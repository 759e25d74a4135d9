//! Ordering and resilience primitives for the bridge.
//!
//! Three small building blocks, all callback-driven so they compose with
//! both binding variants:
//!
//! - [`OperationQueue`]: per-session FIFO admitting one in-flight operation,
//!   gated by correlation id, with an optional stall watchdog
//! - [`execute_with_retry`]: exponential-backoff retry around a
//!   completion-callback operation
//! - [`PrimaryContext`]: the host's main-loop dispatcher; background
//!   completions are posted here before user callbacks run
//!
//! # Architecture
//!
//! ```text
//! caller → OperationQueue::submit → action → binding (background)
//!                                              ↓
//!              PrimaryContext::post ← completion callback
//!                     ↓
//!              user callback → OperationQueue::advance → next action
//! ```

pub mod primary;
pub mod queue;
pub mod retry;

pub use primary::{PrimaryContext, PrimaryLoop};
pub use queue::{Action, CorrelationId, OperationQueue, QueueError};
pub use retry::{execute_with_retry, run_with_retry};
