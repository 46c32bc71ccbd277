//! Job control flow: SEQ and PAR coordination of direct children.

use exert_core::{
    Access, ControlContext, ExecState, ExertError, Exertion, FailurePolicy, Flow, Job,
};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

impl Dispatcher {
    /// Run a Job's direct children here under the Job's strategy.
    ///
    /// PULL jobs send their Task children to the space. The Job's status
    /// is aggregated from its children.
    pub async fn coordinate(&self, mut job: Job) -> Job {
        let strategy = job.control.strategy();
        job.control.set_status(ExecState::Running);
        if strategy.access == Access::Pull {
            job.exertions.iter_mut().for_each(force_pull);
        }

        info!(
            "Coordinating {} ({:?}, {} children)",
            job.name,
            strategy.flow,
            job.exertions.len()
        );
        let aborted = match strategy.flow {
            Flow::Seq => self.run_seq(&mut job, strategy.failure_policy).await,
            Flow::Par => {
                self.run_par(&mut job).await;
                false
            }
        };

        let status = aggregate(&job, aborted);
        job.control.set_status(status);
        job
    }

    async fn run_seq(&self, job: &mut Job, policy: FailurePolicy) -> bool {
        let mut aborted = false;
        let children = std::mem::take(&mut job.exertions);
        for child in children {
            if aborted {
                job.exertions.push(child);
                continue;
            }

            debug!("{}: starting {}", job.name, child.name());
            let done = self.dispatch(child).await;
            after_child(&mut job.control, &done);

            if done.status().is_failure() && policy == FailurePolicy::Abort {
                warn!("{}: {} {}, skipping the rest", job.name, done.name(), done.status());
                aborted = true;
            }
            job.exertions.push(done);
        }
        aborted
    }

    async fn run_par(&self, job: &mut Job) {
        let children = std::mem::take(&mut job.exertions);
        let running: Vec<_> = children
            .into_iter()
            .map(|child| {
                let fallback = child.clone();
                (fallback, tokio::spawn(self.dispatch(child)))
            })
            .collect();

        for (mut fallback, handle) in running {
            let done = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    let err = ExertError::system(format!("{} aborted: {}", fallback.name(), e));
                    fallback.control_mut().fail(&err);
                    fallback
                }
            };
            job.exertions.push(done);
        }

        // pipes between siblings move only once everyone has joined
        for child in &job.exertions {
            after_child(&mut job.control, child);
        }
    }
}

/// Send a Task to the space regardless of its own access.
pub(crate) fn force_pull(child: &mut Exertion) {
    if let Exertion::Task(task) = child {
        let strategy = task.control.strategy().with_access(Access::Pull);
        task.control.set_strategy(strategy);
    }
}

/// Fire a finished Task's pipes. Jobs fire their own while coordinating.
pub(crate) fn propagate(child: &Exertion) {
    if let Exertion::Task(task) = child {
        let moved = task.context.propagate_pipes();
        if moved > 0 {
            debug!("{}: {} value(s) piped", task.name, moved);
        }
    }
}

/// Fire the pipes of every finished Task in a tree, in order. Used for
/// trees that were coordinated on the far side of a transport.
pub(crate) fn replay_pipes(children: &[Exertion]) {
    for child in children {
        match child {
            Exertion::Task(_) if child.status() == ExecState::Done => propagate(child),
            Exertion::Job(job) => replay_pipes(&job.exertions),
            Exertion::Task(_) => {}
        }
    }
}

/// Record a finished child in its parent's log and fire its pipes.
pub(crate) fn after_child(control: &mut ControlContext, child: &Exertion) {
    control.append_trace(format!("{}:{}", child.name(), child.status()));
    match child.status() {
        ExecState::Done => propagate(child),
        ExecState::Failed | ExecState::Error => {
            control.extend_exceptions(child.control().exceptions().iter().cloned())
        }
        _ => {}
    }
}

/// Job status from its children's.
pub(crate) fn aggregate(job: &Job, aborted: bool) -> ExecState {
    let states: Vec<ExecState> = job.exertions.iter().map(|e| e.status()).collect();
    if states.contains(&ExecState::Error) {
        ExecState::Error
    } else if aborted || states.contains(&ExecState::Failed) {
        ExecState::Failed
    } else if states.iter().all(|s| *s == ExecState::Done) {
        ExecState::Done
    } else {
        ExecState::Running
    }
}
