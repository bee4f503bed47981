use std::time::Duration;

use crate::task::TaskState;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by simswitch APIs.
///
/// This error model is designed to be:
/// - **Classifiable** (callers can branch on variants),
/// - **Diagnosable** (includes context like slot, port and subscription id),
/// - **Storable** (a task keeps its last terminal error for later inspection,
///   so every variant is `Clone`).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Input validation failure (e.g. a slot id that does not name a
    /// removable slot, or a command missing a required field).
    #[error("invalid input: {context}")]
    InvalidInput { context: String },

    /// The hardware cannot perform the requested operation (e.g. the modem
    /// has fewer slots than requested, or a mode change needs a reboot).
    #[error("unsupported on this hardware: {context}")]
    Unsupported { context: String },

    /// The completion deadline elapsed without a matching hardware event.
    #[error("timeout for {operation}: {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The wait ended because the event channel was torn down underneath
    /// the waiting worker.
    #[error("interrupted while waiting for {operation}")]
    Interrupted { operation: &'static str },

    /// A task lifecycle method was called in a state that does not allow it
    /// (e.g. `reset()` while the task is still running).
    #[error("task {tag} cannot {action} while {state:?}")]
    InvalidState {
        tag: &'static str,
        action: &'static str,
        state: TaskState,
    },

    /// The slot service reported a failure for a query or a raw primitive.
    #[error("slot service error: {context}")]
    Service { context: String },

    /// The hardware completed a profile switch with a failure result.
    #[error("profile switch rejected for subscription {subscription_id} on port {port_index}")]
    SwitchRejected {
        subscription_id: i32,
        port_index: u32,
    },

    /// A delegated stage of a task chain reported a terminal error.
    #[error("{stage} stage failed: {source}")]
    ChainFailed {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn invalid_input(context: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::Unsupported {
            context: context.into(),
        }
    }

    /// Wrap a failure raised by a [`SlotInfoService`](crate::SlotInfoService)
    /// implementation. Public so service implementors can produce it.
    pub fn service(context: impl Into<String>) -> Self {
        Self::Service {
            context: context.into(),
        }
    }

    pub(crate) fn chained(stage: &'static str, source: Error) -> Self {
        Self::ChainFailed {
            stage,
            source: Box::new(source),
        }
    }
}
