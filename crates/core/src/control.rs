//! Control context: execution policy, status, and fault log of an exertion.

use serde::{Deserialize, Serialize};

use crate::error::{ExertError, FaultKind};
use crate::id::EnvelopeId;
use crate::Time;

/// How an exertion reaches its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Access {
    /// Invoke a specific or any matching endpoint synchronously
    #[default]
    Push,
    /// Publish to the shared queue for any capable worker
    Pull,
}

/// How the direct children of a Job are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Flow {
    /// In list order, each waiting on the previous
    #[default]
    Seq,
    /// Concurrently
    Par,
}

/// What a SEQ Job does after a child fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Record the failure and run the remaining children
    #[default]
    Continue,
    /// Leave the remaining children unexecuted
    Abort,
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecState {
    /// Not yet dispatched
    #[default]
    Initial,
    /// Dispatched, result pending
    Running,
    /// Completed successfully
    Done,
    /// Business failure
    Failed,
    /// System failure
    Error,
}

impl ExecState {
    /// Whether the state is DONE, FAILED or ERROR.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecState::Done | ExecState::Failed | ExecState::Error)
    }

    /// Whether the state is FAILED or ERROR.
    pub fn is_failure(self) -> bool {
        matches!(self, ExecState::Failed | ExecState::Error)
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecState::Initial => "INITIAL",
            ExecState::Running => "RUNNING",
            ExecState::Done => "DONE",
            ExecState::Failed => "FAILED",
            ExecState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Execution policy of one exertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    /// PUSH or PULL
    #[serde(default)]
    pub access: Access,

    /// SEQ or PAR (Jobs only)
    #[serde(default)]
    pub flow: Flow,

    /// Reaction to child failure (SEQ Jobs only)
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Block until a queued exertion returns
    #[serde(default = "default_wait_for_result")]
    pub wait_for_result: bool,

    /// Upper bound on the queued-result wait, overriding the dispatcher default
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

fn default_wait_for_result() -> bool {
    true
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            access: Access::Push,
            flow: Flow::Seq,
            failure_policy: FailurePolicy::Continue,
            wait_for_result: true,
            wait_timeout_ms: None,
        }
    }
}

impl Strategy {
    /// Create a strategy with the given access and flow.
    pub fn new(access: Access, flow: Flow) -> Self {
        Self {
            access,
            flow,
            ..Default::default()
        }
    }

    /// Set access.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Set flow.
    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flow = flow;
        self
    }

    /// Set failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Submit to the queue without waiting for the result.
    pub fn no_wait(mut self) -> Self {
        self.wait_for_result = false;
        self
    }

    /// Set the queued-result wait timeout.
    pub fn with_wait_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.wait_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// One recorded fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrowableTrace {
    /// What went wrong
    pub message: String,

    /// Underlying cause, if known
    pub cause: Option<String>,

    /// Fault classification
    pub kind: FaultKind,

    /// When it was recorded
    pub at: Time,
}

/// Per-exertion policy, status, and append-only fault and execution logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlContext {
    strategy: Strategy,
    status: ExecState,
    exceptions: Vec<ThrowableTrace>,
    trace: Vec<String>,
    pending_envelope: Option<EnvelopeId>,
}

impl ControlContext {
    /// Create a control context with the given strategy.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Current strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Replace the strategy.
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Current status.
    pub fn status(&self) -> ExecState {
        self.status
    }

    /// Set the status.
    pub fn set_status(&mut self, status: ExecState) {
        self.status = status;
    }

    /// Record a fault and move to its failure state.
    pub fn fail(&mut self, err: &ExertError) {
        self.record(err, None);
        self.status = err.failure_state();
    }

    /// Record a fault without touching the status.
    pub fn record(&mut self, err: &ExertError, cause: Option<String>) {
        self.exceptions.push(ThrowableTrace {
            message: err.to_string(),
            cause,
            kind: err.kind(),
            at: chrono::Utc::now(),
        });
    }

    /// Append already-recorded faults, e.g. those returned by an endpoint.
    pub fn extend_exceptions(&mut self, exceptions: impl IntoIterator<Item = ThrowableTrace>) {
        self.exceptions.extend(exceptions);
    }

    /// Recorded faults, oldest first.
    pub fn exceptions(&self) -> &[ThrowableTrace] {
        &self.exceptions
    }

    /// Append an execution note.
    pub fn append_trace(&mut self, note: impl Into<String>) {
        self.trace.push(note.into());
    }

    /// Append several execution notes.
    pub fn extend_trace(&mut self, notes: impl IntoIterator<Item = String>) {
        self.trace.extend(notes);
    }

    /// Execution notes, oldest first.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Envelope of a queued exertion whose result was not awaited.
    pub fn pending_envelope(&self) -> Option<EnvelopeId> {
        self.pending_envelope
    }

    /// Set or clear the pending envelope.
    pub fn set_pending_envelope(&mut self, id: Option<EnvelopeId>) {
        self.pending_envelope = id;
    }
}
