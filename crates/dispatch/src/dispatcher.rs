//! Dispatcher - resolves exertions to endpoints or the space and merges
//! the answers back.

use std::sync::Arc;
use std::time::Duration;

use exert_core::{
    Access, ControlContext, EnvelopeId, ExecState, ExertError, Exertion, Job, Resolution,
    Signature, Task, DIRECT_BROKER_ROLE, QUEUE_BROKER_ROLE,
};
use exert_space::{hold_while, Envelope, InProcessLockService, LockService, Space, Template};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::locator::{Endpoint, ServiceLocator};
use crate::transport::Transport;

/// Walks exertion trees, choosing per node between direct invocation and
/// the shared space.
///
/// Cheap to clone; clones share the locator, transport, space, lock
/// service and invocation pool.
#[derive(Clone)]
pub struct Dispatcher {
    locator: Arc<dyn ServiceLocator>,
    transport: Arc<dyn Transport>,
    space: Arc<dyn Space>,
    locks: Arc<dyn LockService>,
    pool: Arc<Semaphore>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    /// Create a dispatcher with an in-process lock service.
    pub fn new(
        locator: Arc<dyn ServiceLocator>,
        transport: Arc<dyn Transport>,
        space: Arc<dyn Space>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            locator,
            transport,
            space,
            locks: Arc::new(InProcessLockService::new()),
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            config: Arc::new(config),
        }
    }

    /// Use another lock service.
    pub fn with_lock_service(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Execute an exertion and return it with results and faults filled in.
    ///
    /// Never fails: every fault is recorded in the exertion's control
    /// context and reflected in its status.
    pub async fn exert(&self, exertion: impl Into<Exertion>) -> Exertion {
        self.exert_with(exertion, &[]).await
    }

    /// Like [`Dispatcher::exert`], writing `overrides` into the tree first.
    ///
    /// On a Job, `"<child>/<path>"` goes to that direct child and any other
    /// path goes to the master child.
    pub async fn exert_with(&self, exertion: impl Into<Exertion>, overrides: &[(&str, Value)]) -> Exertion {
        let mut exertion = exertion.into();
        for (path, value) in overrides {
            apply_override(&mut exertion, path, value.clone());
        }
        info!("Exerting {}", exertion.name());
        let done = self.dispatch(exertion).await;
        info!("{} finished {}", done.name(), done.status());
        done
    }

    /// Dispatch one node.
    pub fn dispatch(&self, exertion: Exertion) -> BoxFuture<'static, Exertion> {
        let this = self.clone();
        async move {
            match exertion {
                Exertion::Task(task) => this.exert_task(task).await,
                Exertion::Job(job) => this.exert_job(job).await,
            }
        }
        .boxed()
    }

    /// Fetch answers for every node submitted without waiting.
    pub fn collect(&self, exertion: Exertion, timeout: Duration) -> BoxFuture<'static, Exertion> {
        let this = self.clone();
        async move {
            if let Some(id) = exertion.control().pending_envelope() {
                return this.await_answer(exertion, id, timeout).await;
            }
            match exertion {
                Exertion::Job(mut job) => {
                    let children = std::mem::take(&mut job.exertions);
                    for child in children {
                        let was_pending = child.status() == ExecState::Running;
                        let child = this.collect(child, timeout).await;
                        if was_pending {
                            crate::flow::after_child(&mut job.control, &child);
                        }
                        job.exertions.push(child);
                    }
                    if job.control.status() == ExecState::Running {
                        let status = crate::flow::aggregate(&job, false);
                        job.control.set_status(status);
                    }
                    Exertion::Job(job)
                }
                task => task,
            }
        }
        .boxed()
    }

    async fn exert_task(&self, mut task: Task) -> Exertion {
        let sig = match task.process_signature() {
            Some(sig) => sig.clone(),
            None => {
                let err = ExertError::Signature(format!("task '{}' has no SRV signature", task.name));
                task.control.fail(&err);
                return Exertion::Task(task);
            }
        };

        if task.control.strategy().access == Access::Push {
            if let Some(endpoint) = self.resolve(&sig).await {
                return self.invoke(Exertion::Task(task), endpoint).await;
            }
            info!("No endpoint for {}, writing {} to the space", sig, task.name);
        }
        self.submit(Exertion::Task(task)).await
    }

    async fn exert_job(&self, mut job: Job) -> Exertion {
        if job.signature.is_none() && job.exertions.len() == 1 {
            return self.flatten(job).await;
        }

        let strategy = job.control.strategy();
        if let Some(sig) = job.signature.as_mut() {
            if let Some(note) = normalize_broker(sig, strategy.access) {
                info!("{}: {}", job.name, note);
                job.control.append_trace(note);
            }
        }

        let sig = match &job.signature {
            Some(sig) => sig.clone(),
            None => return Exertion::Job(self.coordinate(job).await),
        };

        if strategy.access == Access::Push {
            if let Some(endpoint) = self.resolve(&sig).await {
                return self.invoke(Exertion::Job(job), endpoint).await;
            }
            info!("No broker for {}, writing {} to the space", sig, job.name);
        }
        self.submit(Exertion::Job(job)).await
    }

    /// Dispatch the only child in place of its wrapper.
    async fn flatten(&self, mut job: Job) -> Exertion {
        let mut child = job.exertions.remove(0);
        debug!("Flattening {} into {}", job.name, child.name());
        if job.control.strategy().access == Access::Pull {
            crate::flow::force_pull(&mut child);
        }

        let done = self.dispatch(child).await;
        if done.status() == ExecState::Done {
            crate::flow::propagate(&done);
        }
        job.control.set_status(done.status());
        job.control
            .extend_exceptions(done.control().exceptions().iter().cloned());
        job.control.append_trace(format!("flattened:{}", done.name()));
        job.exertions.push(done);
        Exertion::Job(job)
    }

    /// Find an endpoint for a signature.
    ///
    /// Directed signatures get a single lookup. Discovered ones are retried
    /// with doubling backoff, trying the preferred provider before any.
    pub async fn resolve(&self, sig: &Signature) -> Option<Endpoint> {
        let name = sig.provider_name.as_deref();
        if sig.resolution == Resolution::Directed {
            return self.locator.lookup(&sig.role, name).await;
        }

        let attempts = self.config.discovery_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.discovery_backoff(attempt)).await;
            }
            if name.is_some() {
                if let Some(endpoint) = self.locator.lookup(&sig.role, name).await {
                    return Some(endpoint);
                }
            }
            if let Some(endpoint) = self.locator.lookup(&sig.role, None).await {
                return Some(endpoint);
            }
            debug!("Discovery of {} missed (attempt {}/{})", sig, attempt + 1, attempts);
        }
        None
    }

    async fn invoke(&self, mut exertion: Exertion, endpoint: Endpoint) -> Exertion {
        // leaf invocations are bounded, brokered jobs are not
        let _permit = match &exertion {
            Exertion::Task(_) => match self.pool.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    exertion
                        .control_mut()
                        .fail(&ExertError::system("dispatcher pool closed"));
                    return exertion;
                }
            },
            Exertion::Job(_) => None,
        };

        let holder = exertion.id().to_string();
        if endpoint.exclusive {
            if let Err(err) = self.lock(&endpoint.name, &holder).await {
                warn!("{}: {}", exertion.name(), err);
                exertion.control_mut().fail(&err);
                return exertion;
            }
        }

        exertion
            .control_mut()
            .append_trace(format!("push:{}", endpoint.name));
        debug!("Invoking {} on {}", exertion.name(), endpoint.name);

        // the call owns the lock: a timed-out call keeps the endpoint
        // locked until it actually returns
        let call = {
            let transport = self.transport.clone();
            let locks = self.locks.clone();
            let lease = self.config.lock_lease();
            let endpoint = endpoint.clone();
            let request = exertion.clone();
            tokio::spawn(async move {
                let invoke = transport.invoke(&endpoint, request);
                if endpoint.exclusive {
                    hold_while(locks.as_ref(), &endpoint.name, &holder, lease, invoke).await
                } else {
                    invoke.await
                }
            })
        };
        let outcome = tokio::time::timeout(self.config.invoke_timeout(), call).await;

        match outcome {
            Ok(Ok(Ok(answer))) => absorb(&mut exertion, &answer),
            Ok(Ok(Err(err))) => {
                warn!("{} on {}: {}", exertion.name(), endpoint.name, err);
                exertion.control_mut().fail(&err);
            }
            Ok(Err(e)) => {
                let err = ExertError::system(format!("call to {} aborted: {}", endpoint.name, e));
                warn!("{}: {}", exertion.name(), err);
                exertion.control_mut().fail(&err);
            }
            Err(_) => {
                let err = ExertError::system(format!(
                    "{} timed out after {}ms",
                    endpoint.name, self.config.invoke_timeout_ms
                ));
                warn!("{}: {}", exertion.name(), err);
                exertion.control_mut().fail(&err);
            }
        }
        exertion
    }

    async fn lock(&self, key: &str, holder: &str) -> Result<(), ExertError> {
        let deadline = tokio::time::Instant::now() + self.config.lock_wait();
        loop {
            if self.locks.acquire(key, holder, self.config.lock_lease()).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExertError::Lock(format!(
                    "no lock on {} within {}ms",
                    key, self.config.lock_wait_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn submit(&self, mut exertion: Exertion) -> Exertion {
        let mut envelope = match exertion.detached().and_then(Envelope::for_exertion) {
            Ok(envelope) => envelope,
            Err(err) => {
                exertion.control_mut().fail(&err);
                return exertion;
            }
        };
        let id = envelope.id;
        let note = format!("queued:{}", id);
        envelope.exertion.control_mut().append_trace(note.clone());
        exertion.control_mut().append_trace(note);
        let role = envelope.role.clone();

        if let Err(err) = self.space.write(envelope, None).await {
            exertion.control_mut().fail(&err.into());
            return exertion;
        }
        info!("{} written to the space as {} for {}", exertion.name(), id, role);

        let strategy = exertion.control().strategy();
        if !strategy.wait_for_result {
            exertion.control_mut().set_pending_envelope(Some(id));
            exertion.control_mut().set_status(ExecState::Running);
            return exertion;
        }

        let timeout = strategy
            .wait_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.queue_wait_timeout());
        self.await_answer(exertion, id, timeout).await
    }

    async fn await_answer(&self, mut exertion: Exertion, id: EnvelopeId, timeout: Duration) -> Exertion {
        match self.space.take(&[Template::result_of(id)], None, timeout).await {
            Ok(Some(answer)) => {
                debug!("Answer for {} is {:?}", id, answer.state);
                absorb(&mut exertion, &answer.exertion);
                exertion.control_mut().set_pending_envelope(None);
            }
            Ok(None) => {
                let err = ExertError::Queue(format!(
                    "no answer for {} within {}ms",
                    id,
                    timeout.as_millis()
                ));
                warn!("{}: {}", exertion.name(), err);
                self.withdraw(id).await;
                exertion.control_mut().fail(&err);
                exertion.control_mut().set_pending_envelope(None);
            }
            Err(err) => exertion.control_mut().fail(&err.into()),
        }
        exertion
    }

    /// Take back a request nobody waits for. One already claimed by a
    /// worker is answered anyway and left to the space's retention.
    async fn withdraw(&self, id: EnvelopeId) {
        match self
            .space
            .take(&[Template::request_of(id)], None, Duration::ZERO)
            .await
        {
            Ok(Some(_)) => info!("Withdrew unanswered request {}", id),
            Ok(None) => debug!("Request {} already claimed, not withdrawn", id),
            Err(err) => warn!("Withdrawing {}: {}", id, err),
        }
    }
}

/// Point a broker signature at the broker matching the access mode.
fn normalize_broker(sig: &mut Signature, access: Access) -> Option<String> {
    if !sig.is_broker() {
        return None;
    }
    let role = match access {
        Access::Pull => QUEUE_BROKER_ROLE,
        Access::Push => DIRECT_BROKER_ROLE,
    };
    if sig.role == role {
        return None;
    }
    let note = format!("{} access, broker role {} -> {}", access_name(access), sig.role, role);
    sig.role = role.to_string();
    Some(note)
}

fn access_name(access: Access) -> &'static str {
    match access {
        Access::Push => "PUSH",
        Access::Pull => "PULL",
    }
}

fn apply_override(exertion: &mut Exertion, path: &str, value: Value) {
    match exertion {
        Exertion::Task(task) => task.context.put_value(path, value),
        Exertion::Job(job) => {
            let trimmed = path.trim_start_matches('/');
            if let Some((head, rest)) = trimmed.split_once('/') {
                if let Some(child) = job.exertions.iter_mut().find(|e| e.name() == head) {
                    apply_override(child, rest, value);
                    return;
                }
            }
            match job.master_mut() {
                Some(master) => apply_override(master, trimmed, value),
                None => debug!("Override {} dropped, job {} is empty", path, job.name),
            }
        }
    }
}

/// Take an endpoint's answer into the local tree.
///
/// Local context handles are kept, so sharing and pipes survive; only
/// produced values, status, and the new log entries come back.
fn absorb(local: &mut Exertion, answer: &Exertion) {
    match (local, answer) {
        (Exertion::Task(l), Exertion::Task(r)) => {
            l.context.merge_outputs(&r.context.snapshot());
            merge_control(&mut l.control, &r.control);
        }
        (Exertion::Job(l), Exertion::Job(r)) => {
            for (lc, rc) in l.exertions.iter_mut().zip(&r.exertions) {
                absorb(lc, rc);
            }
            merge_control(&mut l.control, &r.control);
            crate::flow::replay_pipes(&l.exertions);
        }
        (l, r) => {
            let err = ExertError::system(format!(
                "answer for {} does not match the request shape ({})",
                l.name(),
                r.name()
            ));
            l.control_mut().fail(&err);
        }
    }
}

fn merge_control(local: &mut ControlContext, remote: &ControlContext) {
    let known = local.exceptions().len();
    local.extend_exceptions(remote.exceptions().iter().skip(known).cloned());
    let known = local.trace().len();
    local.extend_trace(remote.trace().iter().skip(known).cloned());
    local.set_status(remote.status());
    local.set_pending_envelope(remote.pending_envelope());
}

#[cfg(test)]
mod tests {
    use super::*;
    use exert_core::{Context, Strategy};
    use serde_json::json;

    #[test]
    fn test_normalize_broker_roles() {
        let mut sig = Signature::jobber();
        let note = normalize_broker(&mut sig, Access::Pull).unwrap();
        assert_eq!(sig.role, QUEUE_BROKER_ROLE);
        assert!(note.contains("PULL"));

        assert!(normalize_broker(&mut sig, Access::Pull).is_none());
        normalize_broker(&mut sig, Access::Push);
        assert_eq!(sig.role, DIRECT_BROKER_ROLE);

        let mut other = Signature::new("Adder", "add");
        assert!(normalize_broker(&mut other, Access::Pull).is_none());
    }

    #[test]
    fn test_overrides_route_to_child_or_master() {
        let t = |name: &str| Task::new(name, Signature::new("R", "s"), Context::new(name));
        let mut job: Exertion = Job::new("j").add(t("a")).add(t("b")).into();

        apply_override(&mut job, "a/x", json!(1));
        apply_override(&mut job, "y", json!(2));
        apply_override(&mut job, "zzz/q", json!(3));

        let j = job.as_job().unwrap();
        let a = j.child("a").unwrap().as_task().unwrap();
        let b = j.child("b").unwrap().as_task().unwrap();
        assert_eq!(a.context.get("x").unwrap(), json!(1));
        assert_eq!(b.context.get("y").unwrap(), json!(2));
        assert_eq!(b.context.get("zzz/q").unwrap(), json!(3));
    }

    #[test]
    fn test_absorb_keeps_local_handles_and_appends_logs() {
        let ctx = Context::new("c").with_in("a", 1).with_out("sum");
        let mut local: Exertion =
            Task::new("t", Signature::new("R", "s"), ctx.clone())
                .with_strategy(Strategy::default())
                .into();
        local.control_mut().append_trace("push:p");

        let mut answer = local.detached().unwrap();
        if let Exertion::Task(t) = &mut answer {
            t.context.put_value("sum", 5);
            t.context.put_value("a", 99);
            t.control.append_trace("p:s");
            t.control.set_status(ExecState::Done);
        }

        absorb(&mut local, &answer);
        assert_eq!(ctx.get("sum").unwrap(), json!(5));
        assert_eq!(ctx.get("a").unwrap(), json!(1));
        assert_eq!(local.control().trace(), ["push:p", "p:s"]);
        assert_eq!(local.status(), ExecState::Done);
    }
}
