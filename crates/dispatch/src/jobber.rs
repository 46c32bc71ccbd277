//! Job brokers.

use async_trait::async_trait;
use exert_core::{Access, Exertion, DIRECT_BROKER_ROLE, QUEUE_BROKER_ROLE};
use exert_provider::Provider;
use tracing::info;

use crate::dispatcher::Dispatcher;

/// Provider that coordinates the Jobs it receives with its own dispatcher.
///
/// A direct broker serves the `Jobber` role and keeps each Job's access.
/// A queue broker serves the `Spacer` role and runs Jobs as PULL, so their
/// Task children go to the space.
pub struct Jobber {
    name: String,
    role: &'static str,
    access: Access,
    dispatcher: Dispatcher,
}

impl Jobber {
    /// Direct broker.
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            name: name.into(),
            role: DIRECT_BROKER_ROLE,
            access: Access::Push,
            dispatcher,
        }
    }

    /// Queue broker.
    pub fn spacer(name: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            name: name.into(),
            role: QUEUE_BROKER_ROLE,
            access: Access::Pull,
            dispatcher,
        }
    }
}

#[async_trait]
impl Provider for Jobber {
    fn name(&self) -> &str {
        &self.name
    }

    fn roles(&self) -> Vec<String> {
        vec![self.role.to_string()]
    }

    async fn service(&self, exertion: Exertion) -> Exertion {
        match exertion {
            Exertion::Job(mut job) => {
                info!("{} coordinating {}", self.name, job.name);
                if self.access == Access::Pull {
                    let strategy = job.control.strategy().with_access(Access::Pull);
                    job.control.set_strategy(strategy);
                }
                job.control.append_trace(format!("{}:coordinate", self.name));
                Exertion::Job(self.dispatcher.coordinate(job).await)
            }
            task => self.dispatcher.dispatch(task).await,
        }
    }
}
