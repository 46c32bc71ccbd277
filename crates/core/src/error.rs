//! Fault kinds raised while assembling and dispatching exertions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::ExecState;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, ExertError>;

/// A missing or mistyped value in a Context.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ContextFault {
    /// No entry is declared at the path
    #[error("no entry at path '{0}'")]
    MissingPath(String),

    /// The entry exists but holds no value yet
    #[error("path '{0}' is unbound")]
    Unbound(String),

    /// The value cannot be read as the requested type
    #[error("path '{path}' is not a {expected}")]
    Mistyped {
        /// Offending path
        path: String,
        /// Requested type
        expected: String,
    },
}

/// Coarse classification of a fault, carried in exception traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Context read/write problem
    Context,
    /// Unresolvable or inconsistent signature
    Signature,
    /// Remote invocation threw or timed out
    Endpoint,
    /// Mutual-exclusion lock unavailable
    Lock,
    /// Queue transaction or lease failure
    Queue,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultKind::Context => "context",
            FaultKind::Signature => "signature",
            FaultKind::Endpoint => "endpoint",
            FaultKind::Lock => "lock",
            FaultKind::Queue => "queue",
        };
        f.write_str(s)
    }
}

/// Errors raised by dispatching an exertion.
///
/// These never escape `exert`: the dispatcher records them in the exertion's
/// control context and turns them into a FAILED or ERROR status.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExertError {
    /// Context fault
    #[error("context fault: {0}")]
    Context(#[from] ContextFault),

    /// Signature fault
    #[error("signature fault: {0}")]
    Signature(String),

    /// Endpoint fault
    #[error("endpoint fault: {message}")]
    Endpoint {
        /// Description from the endpoint or transport
        message: String,
        /// Whether the endpoint reported an expected, business-level failure
        business: bool,
    },

    /// Lock fault
    #[error("lock fault: {0}")]
    Lock(String),

    /// Queue fault
    #[error("queue fault: {0}")]
    Queue(String),
}

impl ExertError {
    /// Endpoint failure reported by the operation itself.
    pub fn business(message: impl Into<String>) -> Self {
        Self::Endpoint {
            message: message.into(),
            business: true,
        }
    }

    /// Endpoint failure caused by the system (unreachable, timed out, crashed).
    pub fn system(message: impl Into<String>) -> Self {
        Self::Endpoint {
            message: message.into(),
            business: false,
        }
    }

    /// Classify the fault.
    pub fn kind(&self) -> FaultKind {
        match self {
            ExertError::Context(_) => FaultKind::Context,
            ExertError::Signature(_) => FaultKind::Signature,
            ExertError::Endpoint { .. } => FaultKind::Endpoint,
            ExertError::Lock(_) => FaultKind::Lock,
            ExertError::Queue(_) => FaultKind::Queue,
        }
    }

    /// Whether the fault is an expected, recoverable business failure.
    ///
    /// Context faults count as business failures: the operation was reached
    /// but its inputs were unusable.
    pub fn is_business(&self) -> bool {
        match self {
            ExertError::Context(_) => true,
            ExertError::Endpoint { business, .. } => *business,
            _ => false,
        }
    }

    /// Terminal state an exertion takes when this fault is recorded.
    pub fn failure_state(&self) -> ExecState {
        if self.is_business() {
            ExecState::Failed
        } else {
            ExecState::Error
        }
    }
}
