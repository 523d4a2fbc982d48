//! Run state store.
//!
//! Queryable record of every run's status, progress and timing, with
//! change notification and priority-aware retention.

#![warn(missing_docs)]

pub mod manager;
pub mod retention;

pub use manager::{StateManager, StateStats};
pub use retention::RetentionPolicy;
