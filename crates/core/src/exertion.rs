//! Exertion model - Tasks, Jobs, and the tree they form.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, Direction, DEFAULT_RESULT_PATH};
use crate::control::{Access, ControlContext, ExecState, Flow, Strategy};
use crate::error::ExertError;
use crate::id::{ContextId, ExertionId};
use crate::signature::{Phase, Signature};

/// Leaf exertion: one service signature bound to one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: ExertionId,

    /// Task name, unique among its siblings
    pub name: String,

    signatures: Vec<Signature>,

    /// Data context
    pub context: Context,

    /// Policy, status, and fault log
    pub control: ControlContext,
}

impl Task {
    /// Create a task around a service signature.
    pub fn new(name: impl Into<String>, signature: Signature, context: Context) -> Self {
        Self {
            id: ExertionId::new(),
            name: name.into(),
            signatures: vec![signature.with_phase(Phase::Srv)],
            context,
            control: ControlContext::default(),
        }
    }

    /// Add a PRE or POST signature. A SRV signature replaces the current one.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        if signature.phase == Phase::Srv {
            self.signatures.retain(|s| s.phase != Phase::Srv);
        }
        self.signatures.push(signature);
        self
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.control.set_strategy(strategy);
        self
    }

    /// Set access, keeping the rest of the strategy.
    pub fn with_access(mut self, access: Access) -> Self {
        let strategy = self.control.strategy().with_access(access);
        self.control.set_strategy(strategy);
        self
    }

    /// The SRV signature.
    pub fn process_signature(&self) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.phase == Phase::Srv)
    }

    /// The SRV signature, mutably.
    pub fn process_signature_mut(&mut self) -> Option<&mut Signature> {
        self.signatures.iter_mut().find(|s| s.phase == Phase::Srv)
    }

    /// Signatures in execution order: PRE, SRV, POST, stable within a phase.
    pub fn signatures(&self) -> Vec<&Signature> {
        let mut ordered: Vec<&Signature> = self.signatures.iter().collect();
        ordered.sort_by_key(|s| s.phase);
        ordered
    }

    /// Where the SRV result will be stored.
    pub fn result_path(&self) -> String {
        self.process_signature()
            .and_then(|s| s.return_path.clone())
            .or_else(|| self.context.return_path())
            .or_else(|| self.context.first_unbound_output())
            .unwrap_or_else(|| DEFAULT_RESULT_PATH.to_string())
    }

    /// Store the SRV result and pin the context's return path to it.
    pub fn set_result(&self, value: Value) -> String {
        let path = self.result_path();
        let direction = match self.context.direction(&path) {
            Some(Direction::InOut) => Direction::InOut,
            _ => Direction::Out,
        };
        self.context.put(&path, value, direction);
        if self.context.return_path().is_none() {
            self.context.set_return_path(&path);
        }
        path
    }

    /// The canonical result, once produced.
    pub fn return_value(&self) -> Option<Value> {
        let path = self
            .process_signature()
            .and_then(|s| s.return_path.clone())
            .or_else(|| self.context.return_path())
            .unwrap_or_else(|| DEFAULT_RESULT_PATH.to_string());
        self.context.try_get(&path)
    }
}

/// Composite exertion: ordered children plus a control strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: ExertionId,

    /// Job name
    pub name: String,

    /// Broker signature, when the job should be handed to a remote broker
    #[serde(default)]
    pub signature: Option<Signature>,

    /// Children in execution order
    pub exertions: Vec<Exertion>,

    /// Policy, status, and fault log
    pub control: ControlContext,

    #[serde(default)]
    master: Option<usize>,
}

impl Job {
    /// Create an empty job with the default strategy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ExertionId::new(),
            name: name.into(),
            signature: None,
            exertions: Vec::new(),
            control: ControlContext::default(),
            master: None,
        }
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.control.set_strategy(strategy);
        self
    }

    /// Set flow, keeping the rest of the strategy.
    pub fn with_flow(mut self, flow: Flow) -> Self {
        let strategy = self.control.strategy().with_flow(flow);
        self.control.set_strategy(strategy);
        self
    }

    /// Set access, keeping the rest of the strategy.
    pub fn with_access(mut self, access: Access) -> Self {
        let strategy = self.control.strategy().with_access(access);
        self.control.set_strategy(strategy);
        self
    }

    /// Set the broker signature.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Append a child.
    pub fn add(mut self, exertion: impl Into<Exertion>) -> Self {
        self.push(exertion);
        self
    }

    /// Append a child in place.
    pub fn push(&mut self, exertion: impl Into<Exertion>) {
        self.exertions.push(exertion.into());
    }

    /// Designate the master child by index.
    pub fn with_master(mut self, index: usize) -> Self {
        self.master = Some(index);
        self
    }

    /// Index of the master child: the designated one, else the last.
    pub fn master_index(&self) -> Option<usize> {
        match self.master {
            Some(i) if i < self.exertions.len() => Some(i),
            _ => self.exertions.len().checked_sub(1),
        }
    }

    /// The master child, whose context seeds notifications.
    pub fn master(&self) -> Option<&Exertion> {
        self.master_index().map(|i| &self.exertions[i])
    }

    /// The master child, mutably.
    pub fn master_mut(&mut self) -> Option<&mut Exertion> {
        self.master_index().map(move |i| &mut self.exertions[i])
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<&Exertion> {
        self.exertions.iter().find(|e| e.name() == name)
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.exertions.len()
    }

    /// Whether the job has no children.
    pub fn is_empty(&self) -> bool {
        self.exertions.is_empty()
    }

    /// Union of the children's contexts, keyed `<child name>/<path>`.
    ///
    /// Built fresh on every call; writes to it do not reach the children.
    pub fn job_context(&self) -> Context {
        let ctx = Context::new(format!("{}-context", self.name));
        self.collect_into(&ctx, "");
        ctx
    }

    fn collect_into(&self, target: &Context, prefix: &str) {
        for child in &self.exertions {
            let child_prefix = format!("{}{}/", prefix, child.name());
            match child {
                Exertion::Task(task) => {
                    for (path, entry) in task.context.entries() {
                        let key = format!("{}{}", child_prefix, path);
                        match entry.value {
                            Some(v) => target.put(&key, v, entry.direction),
                            None => target.declare(&key, entry.direction),
                        }
                    }
                }
                Exertion::Job(job) => job.collect_into(target, &child_prefix),
            }
        }
    }
}

/// A unit of work: a Task or a Job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Exertion {
    /// Leaf
    Task(Task),
    /// Composite
    Job(Job),
}

impl Exertion {
    /// Unique identifier.
    pub fn id(&self) -> ExertionId {
        match self {
            Exertion::Task(t) => t.id,
            Exertion::Job(j) => j.id,
        }
    }

    /// Name.
    pub fn name(&self) -> &str {
        match self {
            Exertion::Task(t) => &t.name,
            Exertion::Job(j) => &j.name,
        }
    }

    /// Control context.
    pub fn control(&self) -> &ControlContext {
        match self {
            Exertion::Task(t) => &t.control,
            Exertion::Job(j) => &j.control,
        }
    }

    /// Control context, mutably.
    pub fn control_mut(&mut self) -> &mut ControlContext {
        match self {
            Exertion::Task(t) => &mut t.control,
            Exertion::Job(j) => &mut j.control,
        }
    }

    /// Current status.
    pub fn status(&self) -> ExecState {
        self.control().status()
    }

    /// Whether this is a Job.
    pub fn is_job(&self) -> bool {
        matches!(self, Exertion::Job(_))
    }

    /// Borrow as a Task.
    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Exertion::Task(t) => Some(t),
            Exertion::Job(_) => None,
        }
    }

    /// Borrow as a Job.
    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Exertion::Job(j) => Some(j),
            Exertion::Task(_) => None,
        }
    }

    /// Data context of a Task, or the job context of a Job.
    pub fn data_context(&self) -> Context {
        match self {
            Exertion::Task(t) => t.context.clone(),
            Exertion::Job(j) => j.job_context(),
        }
    }

    /// Find an exertion anywhere in the tree by name.
    pub fn find(&self, name: &str) -> Option<&Exertion> {
        if self.name() == name {
            return Some(self);
        }
        match self {
            Exertion::Task(_) => None,
            Exertion::Job(j) => j.exertions.iter().find_map(|e| e.find(name)),
        }
    }

    /// Every Task context in the tree, depth first.
    pub fn contexts(&self) -> Vec<Context> {
        let mut out = Vec::new();
        self.visit_tasks(&mut |t| out.push(t.context.clone()));
        out
    }

    fn visit_tasks(&self, f: &mut dyn FnMut(&Task)) {
        match self {
            Exertion::Task(t) => f(t),
            Exertion::Job(j) => j.exertions.iter().for_each(|e| e.visit_tasks(f)),
        }
    }

    fn visit_tasks_mut(&mut self, f: &mut dyn FnMut(&mut Task)) {
        match self {
            Exertion::Task(t) => f(t),
            Exertion::Job(j) => j.exertions.iter_mut().for_each(|e| e.visit_tasks_mut(f)),
        }
    }

    /// Restore shared contexts and pipe targets after deserialization.
    ///
    /// Tasks whose contexts carry the same id are made to share one handle,
    /// and pipe specs are re-attached to the contexts they name.
    pub fn relink(&mut self) {
        let mut registry: HashMap<ContextId, Context> = HashMap::new();
        self.visit_tasks_mut(&mut |task| {
            let id = task.context.id();
            match registry.get(&id) {
                Some(shared) => task.context = shared.clone(),
                None => {
                    registry.insert(id, task.context.clone());
                }
            }
        });
        for ctx in registry.values() {
            ctx.relink(&registry);
        }
    }
}

impl Exertion {
    /// Deep copy sharing no context storage with `self`, as if shipped
    /// over a wire. Pipes to contexts outside the tree stay detached.
    pub fn detached(&self) -> Result<Exertion, ExertError> {
        let wire = serde_json::to_value(self)
            .map_err(|e| ExertError::system(format!("encode {}: {}", self.name(), e)))?;
        let mut copy: Exertion = serde_json::from_value(wire)
            .map_err(|e| ExertError::system(format!("decode {}: {}", self.name(), e)))?;
        copy.relink();
        Ok(copy)
    }
}

impl From<Task> for Exertion {
    fn from(task: Task) -> Self {
        Exertion::Task(task)
    }
}

impl From<Job> for Exertion {
    fn from(job: Job) -> Self {
        Exertion::Job(job)
    }
}
