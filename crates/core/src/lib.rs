//! Exert core data model.
//!
//! This crate defines the exertion tree dispatched by the engine: data
//! contexts with pipes, signatures, Tasks and Jobs, and the control context
//! carrying strategy, status, and fault history.

#![warn(missing_docs)]

// Core identities
mod id;
mod error;

// Data and control
mod context;
mod control;

// Exertions
mod signature;
mod exertion;

// Re-exports
pub use id::*;
pub use error::{ContextFault, ExertError, FaultKind, Result};

pub use context::{Context, ContextData, Direction, Entry, PipeSpec, DEFAULT_RESULT_PATH};
pub use control::{
    Access, ControlContext, ExecState, FailurePolicy, Flow, Strategy, ThrowableTrace,
};

pub use signature::{Phase, Resolution, Signature, DIRECT_BROKER_ROLE, QUEUE_BROKER_ROLE};
pub use exertion::{Exertion, Job, Task};

/// Timestamp type used across the engine.
pub type Time = chrono::DateTime<chrono::Utc>;
