//! Service lookup.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A reachable provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Provider name, also the lock key for exclusive endpoints
    pub name: String,

    /// Roles served
    pub roles: Vec<String>,

    /// Processes one exertion at a time
    pub exclusive: bool,

    /// Transport address
    pub address: String,
}

impl Endpoint {
    /// Create an endpoint with no roles.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            exclusive: false,
            address: address.into(),
        }
    }

    /// Add a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Mark as exclusive.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Whether the endpoint serves a role.
    pub fn serves(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Finds endpoints by role and optional provider name.
#[async_trait]
pub trait ServiceLocator: Send + Sync {
    /// Look up one endpoint serving `role`, named `name` if given.
    async fn lookup(&self, role: &str, name: Option<&str>) -> Option<Endpoint>;
}

/// In-process registry. Several matches are handed out round-robin.
#[derive(Default)]
pub struct InMemoryLocator {
    endpoints: RwLock<Vec<Endpoint>>,
    cursor: AtomicUsize,
}

impl InMemoryLocator {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint, replacing one with the same name.
    pub fn register(&self, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.write();
        endpoints.retain(|e| e.name != endpoint.name);
        debug!("Registered endpoint {} for {:?}", endpoint.name, endpoint.roles);
        endpoints.push(endpoint);
    }

    /// Remove an endpoint by name.
    pub fn unregister(&self, name: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| e.name != name);
        endpoints.len() != before
    }

    /// Registered endpoints.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }
}

#[async_trait]
impl ServiceLocator for InMemoryLocator {
    async fn lookup(&self, role: &str, name: Option<&str>) -> Option<Endpoint> {
        let endpoints = self.endpoints.read();
        let matches: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|e| e.serves(role) && name.map_or(true, |n| e.name == n))
            .collect();
        if matches.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % matches.len();
        Some(matches[i].clone())
    }
}
