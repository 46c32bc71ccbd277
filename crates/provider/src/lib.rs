//! Service Providers
//!
//! Operations bound to selectors, and the providers that run a Task's
//! signatures against them.

#![warn(missing_docs)]

pub mod operation;
pub mod provider;
pub mod arithmetic;

pub use operation::{FnOperation, Operation, OperationError};
pub use provider::{Provider, ServiceProvider};
pub use arithmetic::{arithmetic_provider, Arithmetic, ARITHMETIC_ROLE};
