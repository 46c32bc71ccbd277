//! Shared Work Queue
//!
//! A transactional, template-matching space of work envelopes, and the
//! worker pool that takes envelopes from it and answers them, plus the
//! lock service that keeps exclusive providers to one exertion at a time.

#![warn(missing_docs)]

pub mod envelope;
pub mod lock;
pub mod space;
pub mod taker;

pub use envelope::{Envelope, EnvelopeState, Template};
pub use lock::{hold_while, InProcessLockService, LockService};
pub use space::{InMemorySpace, Space, SpaceError};
pub use taker::{SpaceTaker, TakerHandle, TakerStats, WorkerConfig};
