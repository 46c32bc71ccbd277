//! Providers - endpoints that service exertions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use exert_core::{ExecState, ExertError, Exertion, Phase, Signature, Task};
use serde_json::Value;
use tracing::{debug, warn};

use crate::operation::{FnOperation, Operation, OperationError};

/// An endpoint that services exertions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used for directed lookup and locking.
    fn name(&self) -> &str;

    /// Roles (interfaces) this provider serves.
    fn roles(&self) -> Vec<String>;

    /// Whether the provider must process one exertion at a time.
    fn is_exclusive(&self) -> bool {
        false
    }

    /// Execute an exertion and return it populated with results and faults.
    async fn service(&self, exertion: Exertion) -> Exertion;
}

/// Provider that maps selectors to operations and runs a Task's
/// signatures PRE, SRV, POST.
pub struct ServiceProvider {
    name: String,
    roles: Vec<String>,
    operations: HashMap<String, Arc<dyn Operation>>,
    exclusive: bool,
}

impl ServiceProvider {
    /// Create a provider with no roles and no operations.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            operations: HashMap::new(),
            exclusive: false,
        }
    }

    /// Serve a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Bind an operation to a selector.
    pub fn with_operation(mut self, selector: impl Into<String>, op: impl Operation + 'static) -> Self {
        self.operations.insert(selector.into(), Arc::new(op));
        self
    }

    /// Bind a synchronous closure to a selector.
    pub fn with_fn<F>(self, selector: impl Into<String>, f: F) -> Self
    where
        F: Fn(&exert_core::Context) -> Result<Value, OperationError> + Send + Sync + 'static,
    {
        self.with_operation(selector, FnOperation::new(f))
    }

    /// Require mutual exclusion when dispatching to this provider.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Selectors this provider can run.
    pub fn selectors(&self) -> Vec<String> {
        let mut selectors: Vec<String> = self.operations.keys().cloned().collect();
        selectors.sort();
        selectors
    }

    async fn run_signature(&self, task: &Task, sig: &Signature) -> Result<(), ExertError> {
        if !self.roles.iter().any(|r| r == &sig.role) {
            return Err(ExertError::Signature(format!(
                "provider '{}' does not serve role '{}'",
                self.name, sig.role
            )));
        }

        let op = self.operations.get(&sig.selector).ok_or_else(|| {
            ExertError::Signature(format!(
                "provider '{}' has no operation '{}'",
                self.name, sig.selector
            ))
        })?;

        let value = op.invoke(&task.context).await?;
        match sig.phase {
            Phase::Srv => {
                let path = task.set_result(value);
                debug!("{} stored {} result at '{}'", self.name, sig, path);
            }
            Phase::Pre | Phase::Post => {
                if let Some(path) = &sig.return_path {
                    task.context.put_value(path, value);
                }
            }
        }
        Ok(())
    }

    async fn service_task(&self, mut task: Task) -> Task {
        task.control.set_status(ExecState::Running);

        let signatures: Vec<Signature> = task.signatures().into_iter().cloned().collect();
        for sig in &signatures {
            if let Err(err) = self.run_signature(&task, sig).await {
                warn!("{} failed {}: {}", self.name, sig, err);
                task.control.fail(&err);
                task.control.append_trace(format!("{}:{} failed", self.name, sig.selector));
                return task;
            }
            task.control.append_trace(format!("{}:{}", self.name, sig.selector));
        }

        task.control.set_status(ExecState::Done);
        task
    }
}

#[async_trait]
impl Provider for ServiceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn roles(&self) -> Vec<String> {
        self.roles.clone()
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    async fn service(&self, exertion: Exertion) -> Exertion {
        match exertion {
            Exertion::Task(task) => Exertion::Task(self.service_task(task).await),
            Exertion::Job(mut job) => {
                let err = ExertError::Signature(format!(
                    "provider '{}' cannot coordinate job '{}'",
                    self.name, job.name
                ));
                job.control.fail(&err);
                Exertion::Job(job)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exert_core::{Context, Job};
    use serde_json::json;

    fn echo_provider() -> ServiceProvider {
        ServiceProvider::new("echo-1")
            .with_role("Echo")
            .with_fn("echo", |ctx| ctx.get("in").map_err(OperationError::from))
            .with_fn("stamp", |_ctx| Ok(json!("stamped")))
            .with_fn("reject", |_ctx| Err(OperationError::business("rejected")))
            .with_fn("crash", |_ctx| Err(OperationError::system("boom")))
    }

    fn task(selector: &str) -> Task {
        Task::new(
            "t",
            Signature::new("Echo", selector),
            Context::new("c").with_in("in", "hello").with_out("out"),
        )
    }

    async fn run(task: Task) -> Task {
        match echo_provider().service(task.into()).await {
            Exertion::Task(t) => t,
            Exertion::Job(_) => panic!("expected a task"),
        }
    }

    #[tokio::test]
    async fn test_srv_result_goes_to_first_unbound_output() {
        let done = run(task("echo")).await;
        assert_eq!(done.control.status(), ExecState::Done);
        assert_eq!(done.context.get("out").unwrap(), json!("hello"));
        assert_eq!(done.return_value(), Some(json!("hello")));
        assert_eq!(done.control.trace(), ["echo-1:echo"]);
    }

    #[tokio::test]
    async fn test_pre_and_post_run_around_srv() {
        let t = task("echo")
            .with_signature(Signature::new("Echo", "stamp").post().with_return_path("audit/post"))
            .with_signature(Signature::new("Echo", "stamp").pre().with_return_path("audit/pre"));
        let done = run(t).await;

        assert_eq!(done.control.trace(), ["echo-1:stamp", "echo-1:echo", "echo-1:stamp"]);
        assert_eq!(done.context.get("audit/pre").unwrap(), json!("stamped"));
        assert_eq!(done.context.get("audit/post").unwrap(), json!("stamped"));
        assert_eq!(done.return_value(), Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_business_and_system_failures() {
        let failed = run(task("reject")).await;
        assert_eq!(failed.control.status(), ExecState::Failed);
        assert_eq!(failed.control.exceptions().len(), 1);

        let errored = run(task("crash")).await;
        assert_eq!(errored.control.status(), ExecState::Error);
    }

    #[tokio::test]
    async fn test_failed_pre_stops_srv() {
        let t = task("echo").with_signature(Signature::new("Echo", "reject").pre());
        let done = run(t).await;
        assert_eq!(done.control.status(), ExecState::Failed);
        assert!(done.context.try_get("out").is_none());
    }

    #[tokio::test]
    async fn test_unknown_role_or_selector_is_signature_fault() {
        let t = Task::new("t", Signature::new("Other", "echo"), Context::new("c"));
        let done = run(t).await;
        assert_eq!(done.control.status(), ExecState::Error);
        assert_eq!(done.control.exceptions()[0].kind, exert_core::FaultKind::Signature);

        let done = run(task("missing")).await;
        assert_eq!(done.control.status(), ExecState::Error);
    }

    #[tokio::test]
    async fn test_job_is_rejected() {
        let job = Job::new("j").add(task("echo"));
        let out = echo_provider().service(job.into()).await;
        assert_eq!(out.status(), ExecState::Error);
    }
}
