//! On-actor deferred and delayed execution.
//!
//! # Components
//!
//! - [`TaskQueue`] - Per-actor min-heap of scheduled tasks ordered by
//!   `(deadline, insertion sequence)` with stable FIFO tie-breaking
//! - [`ScheduledEntry`] - One queued task with its cancellation token

mod queue;

pub use queue::{ScheduledEntry, TaskQueue};
