//! Process-wide execution lock.

use chrono::Utc;
use groupflow_core::{RunId, Time};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lock timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A lock held longer than this is considered abandoned
    pub lock_timeout_secs: u64,
    /// How often the watchdog checks for abandoned locks
    pub check_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 3600,
            check_interval_secs: 30,
        }
    }
}

impl LockConfig {
    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Watchdog interval as a duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Point-in-time view of the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    /// Whether a run holds the lock
    pub is_locked: bool,
    /// The holder
    pub current_execution_id: Option<RunId>,
    /// When the holder acquired it
    pub acquire_time: Option<Time>,
    /// How long it has been held
    pub held_for: Option<Duration>,
}

#[derive(Debug)]
struct Holder {
    run_id: RunId,
    since: Instant,
    since_wall: Time,
}

/// Guarantees that at most one run drives the backend at a time.
///
/// Re-acquiring with the holder's own run id succeeds without resetting
/// the acquire time. A lock held past its timeout is force-released by
/// the next acquire attempt or watchdog tick.
#[derive(Debug)]
pub struct ExecutionLock {
    holder: Mutex<Option<Holder>>,
    config: LockConfig,
}

impl ExecutionLock {
    /// Create an unlocked lock.
    pub fn new(config: LockConfig) -> Self {
        Self {
            holder: Mutex::new(None),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take the lock for a run.
    pub fn try_acquire(&self, run_id: &RunId) -> bool {
        let mut holder = self.state();
        self.expire_stale(&mut holder);

        match holder.as_ref() {
            None => {
                *holder = Some(Holder {
                    run_id: run_id.clone(),
                    since: Instant::now(),
                    since_wall: Utc::now(),
                });
                info!("Execution lock acquired by run {}", run_id);
                true
            }
            Some(current) if current.run_id == *run_id => {
                debug!("Run {} already holds the execution lock", run_id);
                true
            }
            Some(current) => {
                info!(
                    "Execution lock busy: run {} rejected, held by {}",
                    run_id, current.run_id
                );
                false
            }
        }
    }

    /// Release the lock if `run_id` holds it.
    pub fn release(&self, run_id: &RunId) -> bool {
        let mut holder = self.state();
        match holder.as_ref() {
            Some(current) if current.run_id == *run_id => {
                *holder = None;
                info!("Execution lock released by run {}", run_id);
                true
            }
            Some(current) => {
                warn!(
                    "Lock release mismatch: run {} tried to release lock held by {}",
                    run_id, current.run_id
                );
                false
            }
            None => {
                debug!("Run {} released an unheld lock", run_id);
                false
            }
        }
    }

    /// Clear the lock whoever holds it. Returns the previous holder.
    pub fn force_release(&self) -> Option<RunId> {
        let previous = self.state().take().map(|h| h.run_id);
        if let Some(run_id) = &previous {
            warn!("Execution lock force-released (was held by {})", run_id);
        }
        previous
    }

    /// Force-release the lock if it has been held past the timeout.
    pub fn check_timeout(&self) -> bool {
        let mut holder = self.state();
        self.expire_stale(&mut holder)
    }

    fn expire_stale(&self, holder: &mut Option<Holder>) -> bool {
        let expired = holder
            .as_ref()
            .is_some_and(|h| h.since.elapsed() > self.config.lock_timeout());
        if expired {
            if let Some(stale) = holder.take() {
                warn!(
                    "Execution lock held by {} for {:?} exceeded timeout, releasing",
                    stale.run_id,
                    stale.since.elapsed()
                );
            }
        }
        expired
    }

    /// Current holder.
    pub fn holder(&self) -> Option<RunId> {
        self.state().as_ref().map(|h| h.run_id.clone())
    }

    /// Whether any run holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state().is_some()
    }

    /// Snapshot of the lock.
    pub fn info(&self) -> LockInfo {
        let holder = self.state();
        LockInfo {
            is_locked: holder.is_some(),
            current_execution_id: holder.as_ref().map(|h| h.run_id.clone()),
            acquire_time: holder.as_ref().map(|h| h.since_wall),
            held_for: holder.as_ref().map(|h| h.since.elapsed()),
        }
    }

    /// The lock's timing.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Run [`check_timeout`](Self::check_timeout) periodically.
    ///
    /// The task stops once the lock is dropped; abort the handle to stop
    /// it earlier.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let lock = Arc::downgrade(self);
        let period = self.config.check_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(lock) = lock.upgrade() else {
                    debug!("Execution lock dropped, watchdog exiting");
                    break;
                };
                lock.check_timeout();
            }
        })
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}
