//! Core error type.

/// Errors raised by the data model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// The plan is malformed
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}
