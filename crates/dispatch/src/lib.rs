//! Exertion Dispatch
//!
//! Resolves signatures to endpoints or to the shared space, runs Jobs under
//! their SEQ/PAR strategy, and wires in-process federations for local use.

#![warn(missing_docs)]

pub mod config;
pub mod locator;
pub mod transport;
pub mod dispatcher;
mod flow;
pub mod jobber;
pub mod federation;

pub use config::{ConfigError, DispatcherConfig, EngineConfig};
pub use locator::{Endpoint, InMemoryLocator, ServiceLocator};
pub use transport::{LocalTransport, Transport};
pub use exert_space::{InProcessLockService, LockService};
pub use dispatcher::Dispatcher;
pub use jobber::Jobber;
pub use federation::LocalFederation;
