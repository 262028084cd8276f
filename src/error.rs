//! Error taxonomy for the manager-facing surface.
//!
//! The runner never crashes on a single bad call (it converts the
//! failure into an error Response) and the manager never crashes on a
//! single bad frame. What reaches a caller is therefore one of the small
//! set of shapes below; only unrecoverable transport failures end a
//! session, and those surface as [`BridgeError::ChildExited`].

use thiserror::Error;

use crate::wire::WireError;

/// Failures surfaced by a manager session.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The runner could not be brought to the Ready state: the child
    /// exited before both streams connected, a connect wait timed out,
    /// or endpoint creation failed.
    #[error("failed to start runner process: {reason}")]
    Startup {
        reason: String,
        exit_code: Option<i32>,
    },

    /// The runner answered with an error Response. Carries the message
    /// text produced on the runner side (`Method <name> not found`, or
    /// the root-cause message of the failed method body).
    #[error("{message}")]
    Call { message: String },

    /// The child terminated while the call was pending, or had already
    /// terminated when the call was issued.
    #[error("Process exited unexpectedly")]
    ChildExited,

    /// The session was shut down gracefully; no further calls are
    /// possible on it.
    #[error("session stopped")]
    Stopped,

    /// A frame could not be encoded or the transport failed mid-write.
    #[error("transport error: {0}")]
    Wire(#[from] WireError),
}

impl BridgeError {
    pub(crate) fn startup(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        BridgeError::Startup {
            reason: reason.into(),
            exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_exit_message_names_the_unexpected_exit() {
        let err = BridgeError::ChildExited;
        assert!(err.to_string().contains("Process exited unexpectedly"));
    }

    #[test]
    fn call_errors_surface_the_runner_message() {
        let err = BridgeError::Call {
            message: "Method frob not found".to_string(),
        };
        assert_eq!(err.to_string(), "Method frob not found");
    }
}
