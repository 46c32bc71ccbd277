//! Operation abstraction.

use async_trait::async_trait;
use exert_core::{Context, ContextFault, ExertError};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// An input could not be read
    #[error(transparent)]
    Context(#[from] ContextFault),

    /// Expected failure, e.g. a validation error
    #[error("{0}")]
    Business(String),

    /// Unexpected failure
    #[error("{0}")]
    System(String),
}

impl OperationError {
    /// Business failure.
    pub fn business(message: impl Into<String>) -> Self {
        Self::Business(message.into())
    }

    /// System failure.
    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }
}

impl From<OperationError> for ExertError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Context(fault) => ExertError::Context(fault),
            OperationError::Business(msg) => ExertError::business(msg),
            OperationError::System(msg) => ExertError::system(msg),
        }
    }
}

/// An operation a provider exposes under a selector.
///
/// The operation reads its inputs from the Task's context and returns the
/// value the provider stores at the signature's return path.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run against a context.
    async fn invoke(&self, ctx: &Context) -> Result<Value, OperationError>;
}

/// Adapter turning a synchronous closure into an [`Operation`].
pub struct FnOperation<F>(F);

impl<F> FnOperation<F>
where
    F: Fn(&Context) -> Result<Value, OperationError> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Operation for FnOperation<F>
where
    F: Fn(&Context) -> Result<Value, OperationError> + Send + Sync,
{
    async fn invoke(&self, ctx: &Context) -> Result<Value, OperationError> {
        (self.0)(ctx)
    }
}
