//! Envelopes and the templates that match them.

use exert_core::{
    EnvelopeId, ExecState, ExertError, Exertion, Time, QUEUE_BROKER_ROLE,
};
use serde::{Deserialize, Serialize};

/// Lifecycle of an envelope in the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EnvelopeState {
    /// Waiting for a worker
    #[default]
    Initial,
    /// Claimed under a transaction
    Taken,
    /// Answered, exertion done
    Done,
    /// Answered, business failure
    Failed,
    /// Answered, system failure
    Error,
}

impl EnvelopeState {
    /// Whether this is an answer rather than pending work.
    pub fn is_result(self) -> bool {
        matches!(self, EnvelopeState::Done | EnvelopeState::Failed | EnvelopeState::Error)
    }
}

impl From<ExecState> for EnvelopeState {
    fn from(state: ExecState) -> Self {
        match state {
            ExecState::Failed => EnvelopeState::Failed,
            ExecState::Error => EnvelopeState::Error,
            // a worker only answers once it is finished with the exertion
            _ => EnvelopeState::Done,
        }
    }
}

/// Queue-resident wrapper of one exertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, kept by the answer
    pub id: EnvelopeId,

    /// Role a worker must serve to take this envelope
    pub role: String,

    /// Required provider, `None` for any
    pub provider_name: Option<String>,

    /// Current state
    pub state: EnvelopeState,

    /// The work
    pub exertion: Exertion,

    /// How many times the envelope has been taken
    pub attempts: u32,

    /// When the envelope was written
    pub written_at: Time,
}

impl Envelope {
    /// Wrap an exertion for a role.
    pub fn new(role: impl Into<String>, provider_name: Option<String>, exertion: Exertion) -> Self {
        Self {
            id: EnvelopeId::new(),
            role: role.into(),
            provider_name,
            state: EnvelopeState::Initial,
            exertion,
            attempts: 0,
            written_at: chrono::Utc::now(),
        }
    }

    /// Wrap an exertion, addressing it by its own signature.
    ///
    /// Tasks go to their SRV role. Jobs go to their broker role, or to the
    /// queue broker when they have none.
    pub fn for_exertion(exertion: Exertion) -> Result<Self, ExertError> {
        let (role, name) = match &exertion {
            Exertion::Task(task) => {
                let sig = task.process_signature().ok_or_else(|| {
                    ExertError::Signature(format!("task '{}' has no SRV signature", task.name))
                })?;
                (sig.role.clone(), sig.provider_name.clone())
            }
            Exertion::Job(job) => match &job.signature {
                Some(sig) => (sig.role.clone(), sig.provider_name.clone()),
                None => (QUEUE_BROKER_ROLE.to_string(), None),
            },
        };
        Ok(Self::new(role, name, exertion))
    }

    /// Turn a taken envelope into its answer.
    pub fn into_result(mut self, exertion: Exertion) -> Self {
        self.state = exertion.status().into();
        self.exertion = exertion;
        self.written_at = chrono::Utc::now();
        self
    }
}

/// Pattern over envelopes. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    /// Role to match
    pub role: Option<String>,

    /// Provider name. Matches when either side leaves it open
    pub provider_name: Option<String>,

    /// Exact envelope
    pub id: Option<EnvelopeId>,

    /// Acceptable states, empty for any
    pub states: Vec<EnvelopeState>,
}

impl Template {
    /// Pending work for a role, for any provider.
    pub fn for_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            states: vec![EnvelopeState::Initial],
            ..Default::default()
        }
    }

    /// Pending work a named worker may take for a role.
    pub fn for_worker(role: impl Into<String>, provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: Some(provider_name.into()),
            ..Self::for_role(role)
        }
    }

    /// A request still waiting for a worker.
    pub fn request_of(id: EnvelopeId) -> Self {
        Self {
            id: Some(id),
            states: vec![EnvelopeState::Initial],
            ..Default::default()
        }
    }

    /// The answer to an envelope.
    pub fn result_of(id: EnvelopeId) -> Self {
        Self {
            id: Some(id),
            states: vec![EnvelopeState::Done, EnvelopeState::Failed, EnvelopeState::Error],
            ..Default::default()
        }
    }

    /// Whether the envelope matches.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(role) = &self.role {
            if role != &envelope.role {
                return false;
            }
        }
        if let (Some(wanted), Some(required)) = (&self.provider_name, &envelope.provider_name) {
            if wanted != required {
                return false;
            }
        }
        if let Some(id) = self.id {
            if id != envelope.id {
                return false;
            }
        }
        self.states.is_empty() || self.states.contains(&envelope.state)
    }
}
