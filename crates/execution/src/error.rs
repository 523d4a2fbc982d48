//! Error types for the execution layer.

use groupflow_core::{CoreError, RunId};
use std::time::Duration;

/// Errors reported by a [`Backend`](crate::Backend).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The request could not be sent or completed
    #[error("Request to {endpoint} failed: {message}")]
    Request {
        /// Endpoint path
        endpoint: String,
        /// Transport error
        message: String,
    },

    /// The backend answered with a non-success status
    #[error("Backend returned status {status} for {endpoint}: {body}")]
    Status {
        /// Endpoint path
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response body did not have the expected shape
    #[error("Invalid response from {endpoint}: {message}")]
    Decode {
        /// Endpoint path
        endpoint: String,
        /// Decode error
        message: String,
    },
}

/// Errors reported by a [`GraphHost`](crate::GraphHost).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    /// Converting the live graph to a prompt failed
    #[error("Graph conversion failed: {0}")]
    Conversion(String),
}

/// Why a single group did not finish.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GroupError {
    /// The run was cancelled by an interrupt
    #[error("Execution cancelled")]
    Cancelled,

    /// The backend reported that the running job was aborted
    #[error("Execution interrupted by backend: {reason}")]
    RemoteInterrupted {
        /// Reason reported by the backend
        reason: String,
    },

    /// The queue did not drain in time
    #[error("Queue did not drain within {}s", .waited.as_secs())]
    Timeout {
        /// How long the engine waited
        waited: Duration,
    },

    /// The graph host failed
    #[error(transparent)]
    Host(#[from] HostError),

    /// None of the group's output nodes made it into the prompt
    #[error("Prompt snapshot contains none of the group's output nodes")]
    EmptyJob,

    /// Submitting the job failed
    #[error("Submit failed: {0}")]
    Submit(BackendError),

    /// The cleanup request failed
    #[error("Cleanup failed: {0}")]
    Cleanup(BackendError),
}

impl GroupError {
    /// Whether this error ends the run as cancelled instead of failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::RemoteInterrupted { .. })
    }
}

/// Why a run request was not admitted. Not a failure: nothing ran.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    /// A run with this id is already executing
    #[error("Run {0} is already executing")]
    Duplicate(RunId),

    /// The request does not come from this engine's session
    #[error("Run request from foreign origin {origin} (session {session})")]
    ForeignOrigin {
        /// Origin claimed by the request
        origin: String,
        /// This engine's session
        session: String,
    },

    /// Another run holds the execution lock
    #[error("Execution in progress{}", holder_suffix(.holder))]
    Busy {
        /// Current lock holder
        holder: Option<RunId>,
    },

    /// The plan failed validation
    #[error(transparent)]
    InvalidPlan(#[from] CoreError),
}

fn holder_suffix(holder: &Option<RunId>) -> String {
    holder
        .as_ref()
        .map(|h| format!(" (run {})", h))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        assert!(GroupError::Cancelled.is_cancellation());
        assert!(GroupError::RemoteInterrupted { reason: "x".into() }.is_cancellation());
        assert!(!GroupError::Timeout { waited: Duration::from_secs(1) }.is_cancellation());
        assert!(!GroupError::EmptyJob.is_cancellation());
    }

    #[test]
    fn test_busy_message_names_holder() {
        let err = AdmissionError::Busy { holder: Some(RunId::from("r9")) };
        assert_eq!(err.to_string(), "Execution in progress (run r9)");
        assert_eq!(AdmissionError::Busy { holder: None }.to_string(), "Execution in progress");
    }
}
