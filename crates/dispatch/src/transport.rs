//! Transport to endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use exert_core::{ExertError, Exertion};
use exert_provider::Provider;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::locator::Endpoint;

/// Carries an exertion to an endpoint and its answer back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke the endpoint. An `Err` means the exertion never got an answer.
    async fn invoke(&self, endpoint: &Endpoint, exertion: Exertion) -> Result<Exertion, ExertError>;
}

/// Routes by endpoint address to in-process providers.
///
/// Requests and answers are copied through JSON so neither side shares
/// context storage with the other.
#[derive(Default)]
pub struct LocalTransport {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a provider at an address.
    pub fn register(&self, address: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.write().insert(address.into(), provider);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn invoke(&self, endpoint: &Endpoint, exertion: Exertion) -> Result<Exertion, ExertError> {
        let provider = self
            .providers
            .read()
            .get(&endpoint.address)
            .cloned()
            .ok_or_else(|| ExertError::system(format!("nothing listening at {}", endpoint.address)))?;

        let request = exertion.detached()?;
        debug!("Sending {} to {}", request.name(), endpoint.address);

        let answer = tokio::spawn(async move { provider.service(request).await })
            .await
            .map_err(|e| {
                error!("Endpoint {} crashed: {}", endpoint.name, e);
                ExertError::system(format!("endpoint {} crashed", endpoint.name))
            })?;
        answer.detached()
    }
}
