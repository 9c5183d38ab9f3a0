use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

pub const DEFAULT_UNDO_DELAY: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
}

/// Result of trying to take back a deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The action had not started; its effect will never run.
    Cancelled,
    /// The effect is already executing and was left to finish.
    InFlight,
    /// Nothing is scheduled for the key.
    NotPending,
}

#[derive(Debug)]
struct PendingAction {
    generation: u64,
    fire_at: Instant,
    phase: Phase,
    handle: JoinHandle<()>,
    // Shared by successive actions of one key so their effects never overlap.
    gate: Arc<AsyncMutex<()>>,
}

type PendingMap<K> = Arc<Mutex<HashMap<K, PendingAction>>>;

/// Delays an effect per key so it can still be taken back.
///
/// An entry lives from `start` until its effect has finished (or panicked), so
/// `is_pending` stays true while the effect is in flight. Only an action whose
/// effect has not begun can be cancelled or replaced; an in-flight effect always
/// runs to completion, and an action started meanwhile for the same key waits for
/// it before its own effect begins. At most one effect per key executes at a time.
///
/// Must be used from within a tokio runtime.
pub struct DeferredActionScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pending: PendingMap<K>,
    next_generation: AtomicU64,
    default_delay: Duration,
}

impl<K> DeferredActionScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_default_delay(DEFAULT_UNDO_DELAY)
    }

    pub fn with_default_delay(default_delay: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            default_delay,
        }
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn start<F>(&self, key: K, effect: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start_with_delay(key, effect, self.default_delay);
    }

    pub fn start_with_delay<F>(&self, key: K, effect: F, delay: Duration)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fire_at = Instant::now() + delay;

        let mut pending = lock(&self.pending);
        let gate = match pending.remove(&key) {
            Some(previous) => {
                if previous.phase == Phase::Waiting {
                    previous.handle.abort();
                    debug!(?key, "replaced pending action");
                } else {
                    debug!(?key, "queued behind in-flight effect");
                }
                previous.gate
            }
            None => Arc::new(AsyncMutex::new(())),
        };

        let handle = tokio::spawn(fire_when_due(
            Arc::clone(&self.pending),
            key.clone(),
            generation,
            fire_at,
            Arc::clone(&gate),
            effect,
        ));
        pending.insert(
            key,
            PendingAction {
                generation,
                fire_at,
                phase: Phase::Waiting,
                handle,
                gate,
            },
        );
    }

    /// Takes back the action for `key` if its effect has not begun.
    pub fn try_cancel(&self, key: &K) -> CancelOutcome {
        let mut pending = lock(&self.pending);
        match pending.get(key).map(|action| action.phase) {
            Some(Phase::Waiting) => {
                if let Some(action) = pending.remove(key) {
                    action.handle.abort();
                }
                debug!(?key, "cancelled pending action");
                CancelOutcome::Cancelled
            }
            Some(Phase::Running) => CancelOutcome::InFlight,
            None => CancelOutcome::NotPending,
        }
    }

    /// Returns true when a not-yet-started action was removed; its effect will never run.
    pub fn cancel(&self, key: &K) -> bool {
        self.try_cancel(key) == CancelOutcome::Cancelled
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }

    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.pending)
            .get(key)
            .is_some_and(|action| action.phase == Phase::Running)
    }

    /// Zero once the timer has fired, while the effect is still in flight.
    pub fn remaining_time(&self, key: &K) -> Option<Duration> {
        lock(&self.pending)
            .get(key)
            .map(|action| action.fire_at.saturating_duration_since(Instant::now()))
    }

    pub fn pending_keys(&self) -> Vec<K> {
        lock(&self.pending).keys().cloned().collect()
    }

    /// Stops every timer that has not fired. In-flight effects finish on their own.
    pub fn clear_all(&self) {
        let drained: Vec<(K, PendingAction)> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "clearing pending actions");
        }
        for (_, action) in drained {
            if action.phase == Phase::Waiting {
                action.handle.abort();
            }
        }
    }
}

impl<K> Default for DeferredActionScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for DeferredActionScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn drop(&mut self) {
        self.clear_all();
    }
}

async fn fire_when_due<K, F>(
    pending: PendingMap<K>,
    key: K,
    generation: u64,
    fire_at: Instant,
    gate: Arc<AsyncMutex<()>>,
    effect: F,
) where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    sleep_until(fire_at).await;
    let _turn = gate.lock().await;

    // The action stays cancellable until it is marked running under the lock.
    {
        let mut guard = lock(&pending);
        match guard.get_mut(&key) {
            Some(action) if action.generation == generation => action.phase = Phase::Running,
            _ => return,
        }
    }

    debug!(?key, "pending action fired");
    // The effect owns its error handling; a panic must not take the runtime worker down.
    if let Err(error) = tokio::spawn(effect).await {
        if error.is_panic() {
            warn!(?key, "deferred effect panicked");
        }
    }

    let mut guard = lock(&pending);
    if guard
        .get(&key)
        .is_some_and(|action| action.generation == generation)
    {
        guard.remove(&key);
    }
}

fn lock<K>(pending: &Mutex<HashMap<K, PendingAction>>) -> MutexGuard<'_, HashMap<K, PendingAction>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
