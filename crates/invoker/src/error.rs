//! Invoker errors.

use exert_core::ContextFault;
use thiserror::Error;

/// Errors raised while defining or evaluating invokers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokerError {
    /// No invoker with this name
    #[error("unknown invoker '{0}'")]
    Unknown(String),

    /// An invoker with this name already exists
    #[error("invoker '{0}' is already defined")]
    Duplicate(String),

    /// Evaluation reached an invoker that is already being evaluated
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// A scope parameter could not be read
    #[error(transparent)]
    Context(#[from] ContextFault),

    /// The computation itself failed
    #[error("invoker '{name}' failed: {message}")]
    Evaluation {
        /// Invoker name
        name: String,
        /// Failure description
        message: String,
    },
}
