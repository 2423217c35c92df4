//! Error types shared by operators and the helpers to produce them.
use thiserror::Error;

use crate::channels::PortError;
use crate::shared::SharedError;

/// Boxed user error, as returned by operator and function code
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a failed or cancelled operator run.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Execution was cancelled, the operator unwound without finishing its work
    #[error("Operator was cancelled")]
    Cancelled,
    /// A port operation failed
    #[error(transparent)]
    Port(PortError),
    /// A shared container operation failed
    #[error(transparent)]
    Shared(SharedError),
    /// The operator was handed a different kind of input or output than it expects
    #[error("Port kind mismatch: {0}")]
    PortMismatch(String),
    /// User code failed
    #[error("Operator failed: {0}")]
    Failed(#[source] BoxedError),
}

impl OperatorError {
    /// Wrap an arbitrary error as an operator failure
    pub fn failed(err: impl Into<BoxedError>) -> Self {
        Self::Failed(err.into())
    }

    /// Create an operator failure from a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into().into())
    }

    /// True if this error stands for cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<PortError> for OperatorError {
    fn from(value: PortError) -> Self {
        match value {
            PortError::Cancelled => Self::Cancelled,
            other => Self::Port(other),
        }
    }
}

impl From<SharedError> for OperatorError {
    fn from(value: SharedError) -> Self {
        match value {
            SharedError::Cancelled => Self::Cancelled,
            other => Self::Shared(other),
        }
    }
}

/// Turn any result into an operator result, treating the error as a failure of user code.
pub trait OrFailed<T>: Sized + sealed::Sealed {
    /// Map the error into [OperatorError::Failed]
    fn or_failed(self) -> Result<T, OperatorError>;
}

impl<T, E> OrFailed<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn or_failed(self) -> Result<T, OperatorError> {
        self.map_err(OperatorError::failed)
    }
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}
