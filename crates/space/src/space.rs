//! Space abstraction and the in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use exert_core::{ExertError, TxnId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::envelope::{Envelope, EnvelopeState, Template};

/// Space errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpaceError {
    /// No such transaction
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),

    /// The transaction's lease ran out; its takes were returned
    #[error("transaction {0} expired")]
    Expired(TxnId),
}

impl From<SpaceError> for ExertError {
    fn from(err: SpaceError) -> Self {
        ExertError::Queue(err.to_string())
    }
}

/// A shared, transactional queue of envelopes.
#[async_trait]
pub trait Space: Send + Sync {
    /// Open a transaction that expires after `lease`.
    async fn begin(&self, lease: Duration) -> TxnId;

    /// Write an envelope. Under a transaction it becomes visible on commit.
    async fn write(&self, envelope: Envelope, txn: Option<TxnId>) -> Result<(), SpaceError>;

    /// Take the first envelope matching any template, waiting up to
    /// `timeout`. Under a transaction the take is undone by abort or expiry.
    async fn take(
        &self,
        templates: &[Template],
        txn: Option<TxnId>,
        timeout: Duration,
    ) -> Result<Option<Envelope>, SpaceError>;

    /// Make a transaction's takes permanent and its writes visible.
    async fn commit(&self, txn: TxnId) -> Result<(), SpaceError>;

    /// Return a transaction's takes and discard its writes.
    async fn abort(&self, txn: TxnId) -> Result<(), SpaceError>;

    /// Number of visible envelopes matching a template.
    async fn count(&self, template: &Template) -> usize;
}

struct Transaction {
    deadline: Instant,
    taken: Vec<Envelope>,
    written: Vec<Envelope>,
}

/// How long expired transaction ids and unclaimed answers are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

struct SpaceState {
    visible: VecDeque<Envelope>,
    txns: HashMap<TxnId, Transaction>,
    /// expired transaction -> when it expired
    expired: HashMap<TxnId, Instant>,
    retention: Duration,
}

impl Default for SpaceState {
    fn default() -> Self {
        Self {
            visible: VecDeque::new(),
            txns: HashMap::new(),
            expired: HashMap::new(),
            retention: DEFAULT_RETENTION,
        }
    }
}

impl SpaceState {
    fn check(&self, txn: TxnId) -> Result<(), SpaceError> {
        if self.txns.contains_key(&txn) {
            Ok(())
        } else if self.expired.contains_key(&txn) {
            Err(SpaceError::Expired(txn))
        } else {
            Err(SpaceError::UnknownTransaction(txn))
        }
    }

    /// Put taken envelopes back at the front, in their original order.
    fn restore(&mut self, taken: Vec<Envelope>) {
        for mut env in taken.into_iter().rev() {
            env.state = EnvelopeState::Initial;
            self.visible.push_front(env);
        }
    }

    fn reap(&mut self, now: Instant) -> bool {
        let expired: Vec<TxnId> = self
            .txns
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(txn) = self.txns.remove(id) {
                warn!("Transaction {} expired, returning {} envelope(s)", id, txn.taken.len());
                self.restore(txn.taken);
                self.expired.insert(*id, now);
            }
        }

        let retention = self.retention;
        self.expired
            .retain(|_, at| now.saturating_duration_since(*at) < retention);

        let wall = chrono::Utc::now();
        let before = self.visible.len();
        self.visible.retain(|env| {
            !env.state.is_result()
                || (wall - env.written_at)
                    .to_std()
                    .map(|age| age < retention)
                    .unwrap_or(true)
        });
        if self.visible.len() < before {
            debug!("Dropped {} unclaimed answer(s)", before - self.visible.len());
        }

        !expired.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.txns.values().map(|t| t.deadline).min()
    }
}

/// In-process [`Space`].
///
/// Expired transactions are reaped lazily by every operation, and waiting
/// takers wake at the next lease deadline to do so. Answers nobody took
/// and the ids of expired transactions are dropped after the retention
/// period.
#[derive(Default)]
pub struct InMemorySpace {
    state: Mutex<SpaceState>,
    changed: Notify,
}

impl InMemorySpace {
    /// Create an empty space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retention period.
    pub fn with_retention(self, retention: Duration) -> Self {
        self.state.lock().retention = retention;
        self
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, SpaceState> {
        let mut state = self.state.lock();
        if state.reap(Instant::now()) {
            self.changed.notify_waiters();
        }
        state
    }
}

#[async_trait]
impl Space for InMemorySpace {
    async fn begin(&self, lease: Duration) -> TxnId {
        let id = TxnId::new();
        self.lock().txns.insert(
            id,
            Transaction {
                deadline: Instant::now() + lease,
                taken: Vec::new(),
                written: Vec::new(),
            },
        );
        id
    }

    async fn write(&self, envelope: Envelope, txn: Option<TxnId>) -> Result<(), SpaceError> {
        let mut state = self.lock();
        match txn {
            Some(txn) => {
                state.check(txn)?;
                if let Some(t) = state.txns.get_mut(&txn) {
                    t.written.push(envelope);
                }
            }
            None => {
                debug!("Space write {} ({:?}) for {}", envelope.id, envelope.state, envelope.role);
                state.visible.push_back(envelope);
                drop(state);
                self.changed.notify_waiters();
            }
        }
        Ok(())
    }

    async fn take(
        &self,
        templates: &[Template],
        txn: Option<TxnId>,
        timeout: Duration,
    ) -> Result<Option<Envelope>, SpaceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if let Some(txn) = txn {
                    state.check(txn)?;
                }

                let found = state
                    .visible
                    .iter()
                    .position(|env| templates.iter().any(|t| t.matches(env)));
                if let Some(mut env) = found.and_then(|pos| state.visible.remove(pos)) {
                    env.attempts += 1;
                    let answer = env.clone();
                    if let Some(txn) = txn {
                        env.state = EnvelopeState::Taken;
                        if let Some(t) = state.txns.get_mut(&txn) {
                            t.taken.push(env);
                        }
                    }
                    debug!("Space take {} (attempt {})", answer.id, answer.attempts);
                    return Ok(Some(answer));
                }

                match state.next_deadline() {
                    Some(lease_end) => lease_end.min(deadline),
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn commit(&self, txn: TxnId) -> Result<(), SpaceError> {
        let mut state = self.lock();
        state.check(txn)?;
        if let Some(t) = state.txns.remove(&txn) {
            debug!(
                "Commit {}: {} consumed, {} written",
                txn,
                t.taken.len(),
                t.written.len()
            );
            let wrote = !t.written.is_empty();
            state.visible.extend(t.written);
            drop(state);
            if wrote {
                self.changed.notify_waiters();
            }
        }
        Ok(())
    }

    async fn abort(&self, txn: TxnId) -> Result<(), SpaceError> {
        let mut state = self.lock();
        state.check(txn)?;
        if let Some(t) = state.txns.remove(&txn) {
            debug!("Abort {}: {} returned", txn, t.taken.len());
            let returned = !t.taken.is_empty();
            state.restore(t.taken);
            drop(state);
            if returned {
                self.changed.notify_waiters();
            }
        }
        Ok(())
    }

    async fn count(&self, template: &Template) -> usize {
        self.lock().visible.iter().filter(|e| template.matches(e)).count()
    }
}
