//! Invoker Model
//!
//! Lazily evaluated, cached computations over a scope context, linked into
//! a dependency graph that invalidates on change.

#![warn(missing_docs)]

pub mod error;
pub mod model;

pub use error::InvokerError;
pub use model::{Args, InvokerId, Model};
