//! Signature - descriptor of a logical remote operation.

use serde::{Deserialize, Serialize};

/// Role served by direct (PUSH) job brokers.
pub const DIRECT_BROKER_ROLE: &str = "Jobber";

/// Role served by queue (PULL) job brokers.
pub const QUEUE_BROKER_ROLE: &str = "Spacer";

/// Execution phase of a signature within a multi-signature Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Runs before the service signature
    Pre,
    /// The service signature; its result is the Task's result
    #[default]
    Srv,
    /// Runs after the service signature
    Post,
}

/// How an endpoint is looked up for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    /// Single lookup by exact provider name
    Directed,
    /// Any matching provider, polled with retry and backoff
    #[default]
    Discovered,
}

/// Names an operation: which role, which selector, optionally which provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Interface / role name
    pub role: String,

    /// Operation (method) name
    pub selector: String,

    /// Specific provider, if any
    #[serde(default)]
    pub provider_name: Option<String>,

    /// Phase within the Task
    #[serde(default)]
    pub phase: Phase,

    /// Lookup mode
    #[serde(default)]
    pub resolution: Resolution,

    /// Where this signature's result is stored
    #[serde(default)]
    pub return_path: Option<String>,
}

impl Signature {
    /// Create a discovered SRV signature.
    pub fn new(role: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            selector: selector.into(),
            provider_name: None,
            phase: Phase::Srv,
            resolution: Resolution::Discovered,
            return_path: None,
        }
    }

    /// Signature of a direct job broker.
    pub fn jobber() -> Self {
        Self::new(DIRECT_BROKER_ROLE, "exert")
    }

    /// Signature of a queue job broker.
    pub fn spacer() -> Self {
        Self::new(QUEUE_BROKER_ROLE, "exert")
    }

    /// Target a provider by exact name.
    pub fn with_provider(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self.resolution = Resolution::Directed;
        self
    }

    /// Prefer a named provider but fall back to discovery.
    pub fn prefer_provider(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self.resolution = Resolution::Discovered;
        self
    }

    /// Set the phase.
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Make this a PRE signature.
    pub fn pre(self) -> Self {
        self.with_phase(Phase::Pre)
    }

    /// Make this a POST signature.
    pub fn post(self) -> Self {
        self.with_phase(Phase::Post)
    }

    /// Set the return path.
    pub fn with_return_path(mut self, path: impl Into<String>) -> Self {
        self.return_path = Some(path.into());
        self
    }

    /// Whether the role is one of the job broker roles.
    pub fn is_broker(&self) -> bool {
        self.role == DIRECT_BROKER_ROLE || self.role == QUEUE_BROKER_ROLE
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.role, self.selector)?;
        if let Some(name) = &self.provider_name {
            write!(f, "@{}", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_builder() {
        let sig = Signature::new("Adder", "add").with_provider("adder-1");
        assert_eq!(sig.phase, Phase::Srv);
        assert_eq!(sig.resolution, Resolution::Directed);
        assert_eq!(sig.to_string(), "Adder#add@adder-1");
        assert!(!sig.is_broker());
        assert!(Signature::spacer().is_broker());
    }

    #[test]
    fn test_phase_order() {
        let mut phases = vec![Phase::Post, Phase::Srv, Phase::Pre];
        phases.sort();
        assert_eq!(phases, vec![Phase::Pre, Phase::Srv, Phase::Post]);
    }
}
