//! Worker pool taking envelopes from a space.
//!
//! One poller claims envelopes under leased transactions; each claim runs
//! on its own task and holds one of `workers` permits until it commits or
//! aborts. When every permit is in use the poller simply stops polling.
//!
//! Exclusive providers get a single permit, and every claim also holds the
//! provider's lock in the shared [`LockService`], so queued work never
//! overlaps direct invocations of the same provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exert_core::{ExertError, Exertion, TxnId};
use exert_provider::Provider;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{Envelope, Template};
use crate::lock::{hold_while, InProcessLockService, LockService};
use crate::space::Space;

/// Pause before polling again when an exclusive provider's lock is busy.
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent executions
    pub workers: usize,

    /// Transaction lease per claim
    pub lease_ms: u64,

    /// How long one poll waits for a matching envelope
    pub poll_timeout_ms: u64,

    /// Takes after which an envelope is answered with ERROR
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            lease_ms: 60_000,
            poll_timeout_ms: 500,
            max_attempts: 3,
        }
    }
}

impl WorkerConfig {
    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the lease.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = lease.as_millis() as u64;
        self
    }

    /// Set the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Counters kept by a running pool.
#[derive(Debug, Default)]
pub struct TakerStats {
    taken: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    empty_polls: AtomicU64,
}

impl TakerStats {
    /// Envelopes claimed.
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    /// Envelopes answered and committed.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Claims aborted, returning the envelope to the space.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Polls that found nothing.
    pub fn empty_polls(&self) -> u64 {
        self.empty_polls.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Worker pool serving one provider from one space.
pub struct SpaceTaker {
    space: Arc<dyn Space>,
    provider: Arc<dyn Provider>,
    templates: Vec<Template>,
    config: WorkerConfig,
    locks: Arc<dyn LockService>,
}

impl SpaceTaker {
    /// Create a pool taking work for each of the provider's roles.
    pub fn new(space: Arc<dyn Space>, provider: Arc<dyn Provider>, config: WorkerConfig) -> Self {
        let templates = provider
            .roles()
            .into_iter()
            .map(|role| Template::for_worker(role, provider.name()))
            .collect();
        Self {
            space,
            provider,
            templates,
            config,
            locks: Arc::new(InProcessLockService::new()),
        }
    }

    /// Share a lock service with other users of the provider.
    pub fn with_lock_service(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    /// Replace the templates.
    pub fn with_templates(mut self, templates: Vec<Template>) -> Self {
        self.templates = templates;
        self
    }

    /// Start polling.
    pub fn spawn(self) -> TakerHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::new(TakerStats::default());
        let join = tokio::spawn(self.run(cancel.clone(), stats.clone()));
        TakerHandle { cancel, join, stats }
    }

    async fn run(self, cancel: CancellationToken, stats: Arc<TakerStats>) {
        let exclusive = self.provider.is_exclusive();
        let workers = if exclusive { 1 } else { self.config.workers.max(1) };
        let permits = Arc::new(Semaphore::new(workers));
        info!(
            "SpaceTaker for {} started ({} workers, roles {:?})",
            self.provider.name(),
            workers,
            self.provider.roles()
        );

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let txn = self.space.begin(self.config.lease()).await;
            let holder = txn.to_string();
            if exclusive
                && !self
                    .locks
                    .acquire(self.provider.name(), &holder, self.config.lease())
                    .await
            {
                self.release(txn).await;
                debug!("{} busy elsewhere, polling later", self.provider.name());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(LOCK_RETRY) => continue,
                }
            }

            let taken = tokio::select! {
                _ = cancel.cancelled() => {
                    self.unlock(exclusive, &holder).await;
                    self.release(txn).await;
                    break;
                }
                taken = self.space.take(&self.templates, Some(txn), self.config.poll_timeout()) => taken,
            };

            match taken {
                Ok(Some(envelope)) => {
                    TakerStats::bump(&stats.taken);
                    let claim = Claim {
                        space: self.space.clone(),
                        provider: self.provider.clone(),
                        stats: stats.clone(),
                        txn,
                        max_attempts: self.config.max_attempts,
                        lock: exclusive.then(|| ClaimLock {
                            locks: self.locks.clone(),
                            key: self.provider.name().to_string(),
                            holder,
                            lease: self.config.lease(),
                        }),
                        _permit: permit,
                    };
                    tokio::spawn(claim.execute(envelope));
                }
                Ok(None) => {
                    TakerStats::bump(&stats.empty_polls);
                    self.unlock(exclusive, &holder).await;
                    self.release(txn).await;
                }
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    self.unlock(exclusive, &holder).await;
                    self.release(txn).await;
                }
            }
        }

        // let in-flight claims finish
        let _ = permits.acquire_many(workers as u32).await;
        info!("SpaceTaker for {} stopped", self.provider.name());
    }

    async fn unlock(&self, exclusive: bool, holder: &str) {
        if exclusive {
            self.locks.release(self.provider.name(), holder).await;
        }
    }

    async fn release(&self, txn: TxnId) {
        if let Err(e) = self.space.abort(txn).await {
            debug!("Releasing empty poll {}: {}", txn, e);
        }
    }
}

/// One claimed envelope and the resources held for it.
struct Claim {
    space: Arc<dyn Space>,
    provider: Arc<dyn Provider>,
    stats: Arc<TakerStats>,
    txn: TxnId,
    max_attempts: u32,
    lock: Option<ClaimLock>,
    _permit: OwnedSemaphorePermit,
}

/// Provider lock taken by the poller on behalf of an exclusive claim.
struct ClaimLock {
    locks: Arc<dyn LockService>,
    key: String,
    holder: String,
    lease: Duration,
}

impl Claim {
    async fn execute(self, envelope: Envelope) {
        match &self.lock {
            Some(lock) => {
                let work = self.answer(envelope);
                hold_while(lock.locks.as_ref(), &lock.key, &lock.holder, lock.lease, work).await
            }
            None => self.answer(envelope).await,
        }
    }

    async fn answer(&self, envelope: Envelope) {
        let id = envelope.id;
        let result = if envelope.attempts > self.max_attempts {
            warn!("Envelope {} exhausted {} attempts", id, self.max_attempts);
            let mut exertion = envelope.exertion.clone();
            exertion.control_mut().fail(&ExertError::Queue(format!(
                "retries exhausted after {} attempts",
                self.max_attempts
            )));
            exertion
        } else {
            let provider = self.provider.clone();
            let exertion = envelope.exertion.clone();
            // isolate provider panics so the claim can be aborted
            match tokio::spawn(async move { provider.service(exertion).await }).await {
                Ok(mut exertion) => {
                    exertion
                        .control_mut()
                        .append_trace(format!("space:{}", id));
                    exertion
                }
                Err(e) => {
                    error!("Provider {} crashed on {}: {}", self.provider.name(), id, e);
                    self.abort().await;
                    return;
                }
            }
        };

        let answer = envelope.into_result(result);
        debug!("Answering {} with {:?}", id, answer.state);
        if let Err(e) = self.space.write(answer, Some(self.txn)).await {
            warn!("Answer to {} not written: {}", id, e);
            self.abort().await;
            return;
        }
        match self.space.commit(self.txn).await {
            Ok(()) => TakerStats::bump(&self.stats.completed),
            Err(e) => {
                warn!("Commit of {} failed: {}", id, e);
                TakerStats::bump(&self.stats.aborted);
            }
        }
    }

    async fn abort(&self) {
        TakerStats::bump(&self.stats.aborted);
        if let Err(e) = self.space.abort(self.txn).await {
            warn!("Abort of {} failed: {}", self.txn, e);
        }
    }
}

/// Handle to a running pool.
pub struct TakerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<TakerStats>,
}

impl TakerHandle {
    /// Pool counters.
    pub fn stats(&self) -> &TakerStats {
        &self.stats
    }

    /// Stop polling and wait for in-flight claims.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!("SpaceTaker task failed: {}", e);
        }
    }

    /// Stop polling without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeState;
    use crate::space::InMemorySpace;
    use async_trait::async_trait;
    use exert_core::{Context, ExecState, FaultKind, Signature, Task};
    use exert_provider::arithmetic_provider;
    use serde_json::json;

    fn fast() -> WorkerConfig {
        WorkerConfig::default().with_poll_timeout(Duration::from_millis(20))
    }

    fn add_task(name: &str, a: i64, b: i64) -> Task {
        Task::new(
            name,
            Signature::new("Arithmetic", "add"),
            Context::new(name).with_in("a", a).with_in("b", b).with_out("sum"),
        )
    }

    async fn answer_of(space: &InMemorySpace, id: exert_core::EnvelopeId) -> Envelope {
        space
            .take(&[Template::result_of(id)], None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_worker_answers_envelope() {
        let space = Arc::new(InMemorySpace::new());
        let handle = SpaceTaker::new(space.clone(), Arc::new(arithmetic_provider("arith")), fast()).spawn();

        let env = Envelope::for_exertion(add_task("t", 2, 3).into()).unwrap();
        let id = env.id;
        space.write(env, None).await.unwrap();

        let answer = answer_of(&space, id).await;
        assert_eq!(answer.state, EnvelopeState::Done);
        let task = answer.exertion.as_task().unwrap();
        assert_eq!(task.context.get("sum").unwrap(), json!(5));
        assert!(task.control.trace().iter().any(|t| t.starts_with("space:")));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_each_envelope_answered_once() {
        let space = Arc::new(InMemorySpace::new());
        let provider: Arc<dyn Provider> = Arc::new(arithmetic_provider("arith"));
        let handles: Vec<TakerHandle> = (0..3)
            .map(|_| SpaceTaker::new(space.clone(), provider.clone(), fast().with_workers(2)).spawn())
            .collect();

        let mut ids = Vec::new();
        for i in 0..5 {
            let env = Envelope::for_exertion(add_task(&format!("t{}", i), i, 1).into()).unwrap();
            ids.push(env.id);
            space.write(env, None).await.unwrap();
        }
        for id in &ids {
            answer_of(&space, *id).await;
        }
        // answers are visible at commit, counters move just after
        tokio::time::sleep(Duration::from_millis(50)).await;

        let completed: u64 = handles.iter().map(|h| h.stats().completed()).sum();
        assert_eq!(completed, 5);
        assert_eq!(space.count(&Template::default()).await, 0);
        for h in handles {
            h.shutdown().await;
        }
    }

    struct Crashing;

    #[async_trait]
    impl Provider for Crashing {
        fn name(&self) -> &str {
            "crashing"
        }

        fn roles(&self) -> Vec<String> {
            vec!["Arithmetic".into()]
        }

        async fn service(&self, _exertion: Exertion) -> Exertion {
            panic!("worker crashed");
        }
    }

    #[tokio::test]
    async fn test_crashing_worker_exhausts_retries() {
        let space = Arc::new(InMemorySpace::new());
        let handle = SpaceTaker::new(space.clone(), Arc::new(Crashing), fast().with_max_attempts(2)).spawn();

        let env = Envelope::for_exertion(add_task("t", 1, 1).into()).unwrap();
        let id = env.id;
        space.write(env, None).await.unwrap();

        let answer = answer_of(&space, id).await;
        assert_eq!(answer.state, EnvelopeState::Error);
        assert_eq!(answer.attempts, 3);
        assert_eq!(answer.exertion.status(), ExecState::Error);
        assert_eq!(answer.exertion.control().exceptions()[0].kind, FaultKind::Queue);
        assert_eq!(handle.stats().aborted(), 2);

        handle.shutdown().await;
    }

    /// Counts overlapping services.
    struct Device {
        active: AtomicU64,
        peak: AtomicU64,
    }

    #[async_trait]
    impl Provider for Device {
        fn name(&self) -> &str {
            "device"
        }

        fn roles(&self) -> Vec<String> {
            vec!["Device".into()]
        }

        fn is_exclusive(&self) -> bool {
            true
        }

        async fn service(&self, mut exertion: Exertion) -> Exertion {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            exertion.control_mut().set_status(ExecState::Done);
            exertion
        }
    }

    fn device_envelope(name: &str) -> Envelope {
        let task = Task::new(name, Signature::new("Device", "use"), Context::new(name));
        Envelope::for_exertion(task.into()).unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_provider_serves_one_at_a_time() {
        let space = Arc::new(InMemorySpace::new());
        let device = Arc::new(Device {
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        });
        let locks: Arc<dyn LockService> = Arc::new(InProcessLockService::new());
        let handles: Vec<TakerHandle> = (0..2)
            .map(|_| {
                SpaceTaker::new(space.clone(), device.clone(), fast().with_workers(4))
                    .with_lock_service(locks.clone())
                    .spawn()
            })
            .collect();

        let mut ids = Vec::new();
        for i in 0..4 {
            let env = device_envelope(&format!("u{}", i));
            ids.push(env.id);
            space.write(env, None).await.unwrap();
        }
        for id in &ids {
            assert_eq!(answer_of(&space, *id).await.state, EnvelopeState::Done);
        }

        assert_eq!(device.peak.load(Ordering::SeqCst), 1);
        for h in handles {
            h.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_exclusive_provider_waits_for_outside_holder() {
        let space = Arc::new(InMemorySpace::new());
        let locks: Arc<dyn LockService> = Arc::new(InProcessLockService::new());
        assert!(locks.acquire("device", "direct-call", Duration::from_secs(60)).await);

        let device = Arc::new(Device {
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        });
        let handle = SpaceTaker::new(space.clone(), device, fast())
            .with_lock_service(locks.clone())
            .spawn();

        space.write(device_envelope("u"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.stats().taken(), 0);
        assert_eq!(space.count(&Template::for_role("Device")).await, 1);

        assert!(locks.release("device", "direct-call").await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.stats().completed(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_pool_counts_empty_polls() {
        let space = Arc::new(InMemorySpace::new());
        let handle = SpaceTaker::new(space, Arc::new(arithmetic_provider("arith")), fast()).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.stats().empty_polls() > 0);
        assert_eq!(handle.stats().taken(), 0);
        handle.shutdown().await;
    }
}
