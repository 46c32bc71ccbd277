//! In-process federation: locator, transport, space, and worker pools
//! wired to one dispatcher.

use std::sync::Arc;

use exert_provider::Provider;
use exert_space::{InMemorySpace, InProcessLockService, LockService, SpaceTaker, TakerHandle};
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::jobber::Jobber;
use crate::locator::{Endpoint, InMemoryLocator};
use crate::transport::LocalTransport;

/// Providers reachable directly, through the space, or both, from a
/// single dispatcher.
///
/// The dispatcher and every worker pool share one lock service, so an
/// exclusive provider runs one exertion at a time whichever way it is
/// reached.
pub struct LocalFederation {
    config: EngineConfig,
    locator: Arc<InMemoryLocator>,
    transport: Arc<LocalTransport>,
    space: Arc<InMemorySpace>,
    locks: Arc<dyn LockService>,
    dispatcher: Dispatcher,
    takers: Vec<TakerHandle>,
}

impl LocalFederation {
    /// Create an empty federation.
    pub fn new(config: EngineConfig) -> Self {
        let locator = Arc::new(InMemoryLocator::new());
        let transport = Arc::new(LocalTransport::new());
        let space = Arc::new(InMemorySpace::new());
        let locks: Arc<dyn LockService> = Arc::new(InProcessLockService::new());
        let dispatcher = Dispatcher::new(
            locator.clone(),
            transport.clone(),
            space.clone(),
            config.dispatcher.clone(),
        )
        .with_lock_service(locks.clone());
        Self {
            config,
            locator,
            transport,
            space,
            locks,
            dispatcher,
            takers: Vec::new(),
        }
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The shared space.
    pub fn space(&self) -> Arc<InMemorySpace> {
        self.space.clone()
    }

    /// The locator.
    pub fn locator(&self) -> &InMemoryLocator {
        &self.locator
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make a provider reachable by direct invocation.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Endpoint {
        let name = provider.name().to_string();
        let address = format!("local://{}", name);
        let mut endpoint = Endpoint::new(name, address.clone());
        endpoint.roles = provider.roles();
        endpoint.exclusive = provider.is_exclusive();

        self.transport.register(address, provider);
        self.locator.register(endpoint.clone());
        endpoint
    }

    /// Start a worker pool taking the provider's work from the space.
    pub fn serve(&mut self, provider: Arc<dyn Provider>) {
        info!("Serving {} from the space", provider.name());
        let taker = SpaceTaker::new(self.space.clone(), provider, self.config.worker.clone())
            .with_lock_service(self.locks.clone());
        self.takers.push(taker.spawn());
    }

    /// Register and serve.
    pub fn deploy(&mut self, provider: Arc<dyn Provider>) -> Endpoint {
        self.serve(provider.clone());
        self.register(provider)
    }

    /// Deploy a direct and a queue job broker backed by this dispatcher.
    pub fn with_brokers(mut self) -> Self {
        let dispatcher = self.dispatcher.clone();
        self.deploy(Arc::new(Jobber::new("jobber", dispatcher.clone())));
        self.deploy(Arc::new(Jobber::spacer("spacer", dispatcher)));
        self
    }

    /// Stop every worker pool.
    pub async fn shutdown(self) {
        for taker in self.takers {
            taker.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use exert_core::{
        Access, Context, ExecState, Exertion, FailurePolicy, FaultKind, Flow, Job, Signature,
        Strategy, Task,
    };
    use exert_provider::{
        arithmetic_provider, Operation, OperationError, ServiceProvider, ARITHMETIC_ROLE,
    };
    use exert_space::{Space, Template, WorkerConfig};
    use serde_json::{json, Value};

    use crate::config::DispatcherConfig;

    fn config() -> EngineConfig {
        EngineConfig {
            dispatcher: DispatcherConfig::default()
                .with_discovery(1, Duration::from_millis(1))
                .with_queue_wait_timeout(Duration::from_secs(5)),
            worker: WorkerConfig::default().with_poll_timeout(Duration::from_millis(20)),
        }
    }

    fn arithmetic_job() -> (Job, Context, Context) {
        let c1 = Context::new("c1")
            .with_in("operand/1", 20)
            .with_in("operand/2", 80)
            .with_out("result");
        let c2 = Context::new("c2")
            .with_in("operand/1", 10)
            .with_unbound_in("operand/2")
            .with_out("result");
        c1.connect("result", "operand/2", &c2);

        let t1 = Task::new("t1", Signature::new(ARITHMETIC_ROLE, "add"), c1.clone());
        let t3 = Task::new("t3", Signature::new(ARITHMETIC_ROLE, "multiply"), c2.clone());
        (Job::new("arithmetic").add(t1).add(t3), c1, c2)
    }

    fn assert_arithmetic(done: &Exertion, c1: &Context, c2: &Context) {
        assert_eq!(done.status(), ExecState::Done, "{:?}", done.control().exceptions());
        assert_eq!(c1.get("result").unwrap(), json!(100));
        assert_eq!(c2.get("operand/1").unwrap(), json!(10));
        assert_eq!(c2.get("operand/2").unwrap(), json!(100));
        assert_eq!(c2.get("result").unwrap(), json!(1000));
    }

    #[tokio::test]
    async fn test_arithmetic_push_seq() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed.dispatcher().exert(job).await;
        assert_arithmetic(&done, &c1, &c2);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_arithmetic_pull_seq() {
        let mut fed = LocalFederation::new(config());
        fed.serve(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed.dispatcher().exert(job.with_access(Access::Pull)).await;
        assert_arithmetic(&done, &c1, &c2);

        let t1 = done.find("t1").unwrap();
        assert!(t1.control().trace().iter().any(|t| t.starts_with("queued:")));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_without_endpoint_falls_back_to_space() {
        let mut fed = LocalFederation::new(config());
        fed.serve(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed.dispatcher().exert(job).await;
        assert_arithmetic(&done, &c1, &c2);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_arithmetic_via_direct_broker() {
        let fed = LocalFederation::new(config()).with_brokers();
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed
            .dispatcher()
            .exert(job.with_signature(Signature::jobber()))
            .await;
        assert_arithmetic(&done, &c1, &c2);
        let trace = done.control().trace();
        assert!(trace.iter().any(|t| t == "push:jobber"));
        assert!(trace.iter().any(|t| t == "jobber:coordinate"));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_pull_job_with_jobber_role_goes_to_spacer() {
        let mut fed = LocalFederation::new(config()).with_brokers();
        fed.serve(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let job = job
            .with_signature(Signature::jobber())
            .with_access(Access::Pull);
        let done = fed.dispatcher().exert(job).await;

        assert_arithmetic(&done, &c1, &c2);
        let trace = done.control().trace();
        assert!(trace.iter().any(|t| t.contains("Jobber -> Spacer")));
        assert!(trace.iter().any(|t| t == "spacer:coordinate"));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_job_with_spacer_role_goes_to_jobber() {
        let fed = LocalFederation::new(config()).with_brokers();
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed
            .dispatcher()
            .exert(job.with_signature(Signature::spacer()))
            .await;

        assert_arithmetic(&done, &c1, &c2);
        let trace = done.control().trace();
        assert!(trace.iter().any(|t| t.contains("Spacer -> Jobber")));
        assert!(trace.iter().any(|t| t == "jobber:coordinate"));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_overrides_reach_child_and_master() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed
            .dispatcher()
            .exert_with(job, &[("t1/operand/1", json!(0)), ("operand/1", json!(2))])
            .await;

        assert_eq!(done.status(), ExecState::Done);
        assert_eq!(c1.get("result").unwrap(), json!(80));
        assert_eq!(c2.get("result").unwrap(), json!(160));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_child_job_is_flattened() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let ctx = Context::new("c").with_in("a", 2).with_in("b", 3).with_out("sum");
        let job = Job::new("wrapper").add(Task::new("add", Signature::new(ARITHMETIC_ROLE, "add"), ctx.clone()));
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Done);
        assert_eq!(ctx.get("sum").unwrap(), json!(5));
        assert!(done.control().trace().iter().any(|t| t == "flattened:add"));
        fed.shutdown().await;
    }

    /// Records its start order and sleeps, slower for earlier children.
    struct Recorder {
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Operation for Recorder {
        async fn invoke(&self, ctx: &Context) -> Result<Value, OperationError> {
            let order = self.counter.fetch_add(1, Ordering::SeqCst);
            let delay: u64 = ctx.get_as("delay_ms")?;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!(order))
        }
    }

    fn recorder_provider(counter: Arc<AtomicUsize>) -> ServiceProvider {
        ServiceProvider::new("recorder")
            .with_role("Recorder")
            .with_operation("record", Recorder { counter })
    }

    fn recording_job(flow: Flow) -> (Job, Vec<Context>) {
        let mut job = Job::new("recorded").with_flow(flow);
        let mut contexts = Vec::new();
        for (i, delay) in [60u64, 30, 0].iter().enumerate() {
            let ctx = Context::new(format!("c{}", i))
                .with_in("delay_ms", *delay)
                .with_out("order");
            contexts.push(ctx.clone());
            job.push(Task::new(format!("r{}", i), Signature::new("Recorder", "record"), ctx));
        }
        (job, contexts)
    }

    #[tokio::test]
    async fn test_seq_starts_in_list_order() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(recorder_provider(Arc::new(AtomicUsize::new(0)))));

        let (job, contexts) = recording_job(Flow::Seq);
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Done);
        for (i, ctx) in contexts.iter().enumerate() {
            assert_eq!(ctx.get("order").unwrap(), json!(i));
        }
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_par_children_are_independent() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let mut job = Job::new("par").with_flow(Flow::Par);
        let mut contexts = Vec::new();
        for i in 0..4 {
            let ctx = Context::new(format!("c{}", i))
                .with_in("a", i)
                .with_in("b", 10)
                .with_out("sum");
            contexts.push(ctx.clone());
            job.push(Task::new(format!("t{}", i), Signature::new(ARITHMETIC_ROLE, "add"), ctx));
        }

        let done = fed.dispatcher().exert(job).await;
        assert_eq!(done.status(), ExecState::Done);
        for (i, ctx) in contexts.iter().enumerate() {
            assert_eq!(ctx.get("sum").unwrap(), json!(i + 10));
        }
        fed.shutdown().await;
    }

    fn failing_job(policy: FailurePolicy) -> (Job, Context) {
        let last = Context::new("last").with_in("a", 1).with_in("b", 1).with_out("sum");
        let job = Job::new("failing")
            .with_strategy(Strategy::default().with_failure_policy(policy))
            .add(Task::new(
                "div",
                Signature::new(ARITHMETIC_ROLE, "divide"),
                Context::new("div").with_in("a", 1).with_in("b", 0),
            ))
            .add(Task::new("add", Signature::new(ARITHMETIC_ROLE, "add"), last.clone()));
        (job, last)
    }

    #[tokio::test]
    async fn test_seq_continues_after_failure_by_default() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, last) = failing_job(FailurePolicy::Continue);
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Failed);
        assert_eq!(done.control().exceptions().len(), 1);
        assert_eq!(last.get("sum").unwrap(), json!(2));
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_seq_abort_leaves_rest_initial() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, last) = failing_job(FailurePolicy::Abort);
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Failed);
        assert_eq!(done.find("add").unwrap().status(), ExecState::Initial);
        assert!(last.try_get("sum").is_none());
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_directed_signature_to_missing_provider_times_out() {
        let fed = LocalFederation::new(EngineConfig {
            dispatcher: config()
                .dispatcher
                .with_queue_wait_timeout(Duration::from_millis(50)),
            ..config()
        });
        fed.register(Arc::new(arithmetic_provider("arith")));

        let ctx = Context::new("c").with_in("a", 1).with_in("b", 2);
        let task = Task::new(
            "t",
            Signature::new(ARITHMETIC_ROLE, "add").with_provider("elsewhere"),
            ctx,
        );
        let done = fed.dispatcher().exert(task).await;

        assert_eq!(done.status(), ExecState::Error);
        assert_eq!(done.control().exceptions()[0].kind, FaultKind::Queue);
        assert_eq!(fed.space().count(&Template::default()).await, 0);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_wait_then_collect() {
        let mut fed = LocalFederation::new(config());
        fed.serve(Arc::new(arithmetic_provider("arith")));

        let ctx = Context::new("c").with_in("a", 4).with_in("b", 5).with_out("sum");
        let task = Task::new("t", Signature::new(ARITHMETIC_ROLE, "add"), ctx.clone())
            .with_strategy(Strategy::new(Access::Pull, Flow::Seq).no_wait());

        let pending = fed.dispatcher().exert(task).await;
        assert_eq!(pending.status(), ExecState::Running);
        assert!(pending.control().pending_envelope().is_some());

        let done = fed.dispatcher().collect(pending, Duration::from_secs(5)).await;
        assert_eq!(done.status(), ExecState::Done);
        assert!(done.control().pending_envelope().is_none());
        assert_eq!(ctx.get("sum").unwrap(), json!(9));
        fed.shutdown().await;
    }

    /// Tracks how many invocations overlap.
    struct Overlap {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Overlap {
        fn new(peak: Arc<AtomicUsize>, delay: Duration) -> Self {
            Self {
                active: Arc::new(AtomicUsize::new(0)),
                peak,
                delay,
            }
        }
    }

    #[async_trait]
    impl Operation for Overlap {
        async fn invoke(&self, _ctx: &Context) -> Result<Value, OperationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(now))
        }
    }

    fn device(peak: Arc<AtomicUsize>, delay: Duration) -> Arc<ServiceProvider> {
        Arc::new(
            ServiceProvider::new("device")
                .with_role("Device")
                .with_operation("use", Overlap::new(peak, delay))
                .exclusive(),
        )
    }

    fn device_job(flow: Flow, uses: usize) -> Job {
        let mut job = Job::new("contention").with_flow(flow);
        for i in 0..uses {
            job.push(Task::new(
                format!("u{}", i),
                Signature::new("Device", "use"),
                Context::new(format!("c{}", i)),
            ));
        }
        job
    }

    fn exclusive_setup(lock_wait: Duration) -> (LocalFederation, Arc<AtomicUsize>, Job) {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut cfg = config();
        cfg.dispatcher = cfg.dispatcher.with_lock_wait(lock_wait);
        let fed = LocalFederation::new(cfg);
        fed.register(device(peak.clone(), Duration::from_millis(40)));
        (fed, peak, device_job(Flow::Par, 3))
    }

    #[tokio::test]
    async fn test_par_children_overlap() {
        let peak = Arc::new(AtomicUsize::new(0));
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(ServiceProvider::new("shared").with_role("Device").with_operation(
            "use",
            Overlap::new(peak.clone(), Duration::from_millis(40)),
        )));

        let done = fed.dispatcher().exert(device_job(Flow::Par, 3)).await;

        assert_eq!(done.status(), ExecState::Done);
        assert!(peak.load(Ordering::SeqCst) > 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_exclusive_endpoint_serializes_invocations() {
        let (fed, peak, job) = exclusive_setup(Duration::from_secs(5));
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Done);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_exclusive_endpoint_lock_timeout_is_error() {
        let (fed, _peak, job) = exclusive_setup(Duration::from_millis(5));
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Error);
        let job = done.as_job().unwrap();
        let locked_out = job
            .exertions
            .iter()
            .filter(|e| {
                e.control()
                    .exceptions()
                    .iter()
                    .any(|x| x.kind == FaultKind::Lock)
            })
            .count();
        assert!(locked_out >= 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_call_keeps_exclusive_endpoint_locked() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut cfg = config();
        cfg.dispatcher = cfg
            .dispatcher
            .with_lock_wait(Duration::from_secs(5))
            .with_invoke_timeout(Duration::from_millis(20));
        let fed = LocalFederation::new(cfg);
        fed.register(device(peak.clone(), Duration::from_millis(150)));

        let done = fed.dispatcher().exert(device_job(Flow::Seq, 3)).await;

        assert_eq!(done.status(), ExecState::Error);
        for child in &done.as_job().unwrap().exertions {
            assert_eq!(child.status(), ExecState::Error);
            assert_eq!(child.control().exceptions()[0].kind, FaultKind::Endpoint);
        }
        // let the last abandoned call finish
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_exclusive_provider_behind_queue_workers() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut cfg = config();
        cfg.worker = cfg.worker.with_workers(4);
        let mut fed = LocalFederation::new(cfg);
        fed.deploy(device(peak.clone(), Duration::from_millis(30)));

        let job = device_job(Flow::Par, 3).with_access(Access::Pull);
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Done, "{:?}", done.control().exceptions());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_exclusive_provider_reached_both_ways() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut cfg = config();
        cfg.worker = cfg.worker.with_workers(4);
        let mut fed = LocalFederation::new(cfg);
        fed.deploy(device(peak.clone(), Duration::from_millis(30)));

        let mut job = Job::new("mixed").with_flow(Flow::Par);
        for i in 0..4 {
            let mut task = Task::new(
                format!("u{}", i),
                Signature::new("Device", "use"),
                Context::new(format!("c{}", i)),
            );
            if i % 2 == 0 {
                task = task.with_strategy(Strategy::new(Access::Pull, Flow::Seq));
            }
            job.push(task);
        }
        let done = fed.dispatcher().exert(job).await;

        assert_eq!(done.status(), ExecState::Done, "{:?}", done.control().exceptions());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_par_pipes_fire_after_join() {
        let fed = LocalFederation::new(config());
        fed.register(Arc::new(arithmetic_provider("arith")));

        let (job, c1, c2) = arithmetic_job();
        let done = fed.dispatcher().exert(job.with_flow(Flow::Par)).await;

        assert_eq!(done.status(), ExecState::Failed);
        assert_eq!(done.find("t1").unwrap().status(), ExecState::Done);
        let t3 = done.find("t3").unwrap();
        assert_eq!(t3.status(), ExecState::Failed);
        assert_eq!(t3.control().exceptions()[0].kind, FaultKind::Context);

        assert_eq!(c1.get("result").unwrap(), json!(100));
        assert_eq!(c2.get("operand/2").unwrap(), json!(100));
        assert!(c2.try_get("result").is_none());
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let mut cfg = config();
        cfg.dispatcher = cfg.dispatcher.with_invoke_timeout(Duration::from_millis(10));
        let fed = LocalFederation::new(cfg);
        fed.register(Arc::new(recorder_provider(Arc::new(AtomicUsize::new(0)))));

        let ctx = Context::new("c").with_in("delay_ms", 500);
        let task = Task::new("slow", Signature::new("Recorder", "record"), ctx);
        let done = fed.dispatcher().exert(task).await;

        assert_eq!(done.status(), ExecState::Error);
        assert_eq!(done.control().exceptions()[0].kind, FaultKind::Endpoint);
        fed.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovery_retries_until_provider_appears() {
        let mut cfg = config();
        cfg.dispatcher = cfg.dispatcher.with_discovery(6, Duration::from_millis(10));
        let fed = Arc::new(LocalFederation::new(cfg));

        let late = {
            let fed = fed.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fed.register(Arc::new(arithmetic_provider("late")));
            })
        };

        let endpoint = fed
            .dispatcher()
            .resolve(&Signature::new(ARITHMETIC_ROLE, "add"))
            .await;
        late.await.unwrap();
        assert_eq!(endpoint.unwrap().name, "late");
    }
}
