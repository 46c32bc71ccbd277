//! Provider mutual exclusion, shared by direct invocation and workers.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Named leased locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try once to take `key` for `holder`. Held locks lapse after `lease`.
    async fn acquire(&self, key: &str, holder: &str, lease: Duration) -> bool;

    /// Release `key` if `holder` owns it.
    async fn release(&self, key: &str, holder: &str) -> bool;
}

struct Held {
    holder: String,
    until: Instant,
}

/// Lock table kept in this process.
#[derive(Default)]
pub struct InProcessLockService {
    locks: Mutex<HashMap<String, Held>>,
}

impl InProcessLockService {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InProcessLockService {
    async fn acquire(&self, key: &str, holder: &str, lease: Duration) -> bool {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(held) = locks.get(key) {
            if held.until > now && held.holder != holder {
                debug!("Lock {} busy, held by {}", key, held.holder);
                return false;
            }
        }
        locks.insert(
            key.to_string(),
            Held {
                holder: holder.to_string(),
                until: now + lease,
            },
        );
        true
    }

    async fn release(&self, key: &str, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(held) if held.holder == holder => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Run `work` under a lock the caller already holds, renewing the lease
/// at half its length, and release the lock once `work` finishes.
pub async fn hold_while<F: Future>(
    locks: &dyn LockService,
    key: &str,
    holder: &str,
    lease: Duration,
    work: F,
) -> F::Output {
    let period = (lease / 2).max(Duration::from_millis(1));
    let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tokio::pin!(work);
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            _ = renew.tick() => {
                if !locks.acquire(key, holder, lease).await {
                    warn!("Lock {} lost by {}", key, holder);
                }
            }
        }
    };
    locks.release(key, holder).await;
    output
}
