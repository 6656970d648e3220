//! Pollers: one dedicated worker per distinct `(source, role, query)` triple

use crate::cohort::CohortMap;
use crate::util::{CancelableJoinHandle, DelayedInit, InitDropped, Initializer, StopSignal};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identifier for a `Poller`, assigned when it wins the
/// insert-if-absent race in `PollerMap::get_or_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollerId(Uuid);

impl PollerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PollerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Everything about a running Poller that only exists once its worker has
/// actually been spawned: its assigned id, the stop flag the worker polls
/// between ticks, and a cancel-on-drop handle to the worker task itself.
///
/// This is the value published through `Poller::io_state` — see
/// `crate::util::DelayedInit` for the write-once cell it rides on, which
/// guarantees a reader never observes a torn or partially-built value.
pub struct PollerIoState {
    poller_id: PollerId,
    stop: Arc<StopSignal>,
    _worker: CancelableJoinHandle<()>,
}

impl PollerIoState {
    #[must_use]
    pub fn poller_id(&self) -> PollerId {
        self.poller_id
    }

    #[must_use]
    pub fn stop_signal(&self) -> &Arc<StopSignal> {
        &self.stop
    }
}

/// A handle to a `PollerIoState`, cheap to clone and safe to hand to
/// every reader racing `get_or_create`.
pub type PollerIoStateHandle = Arc<PollerIoState>;

/// Owns one multiplexed query's cohorts and the write-once state that
/// publishes its worker.
///
/// `CK` is the cohort key type this Poller's subscribers resolve their
/// variables into — opaque to the core beyond `Eq + Hash + Clone`.
pub struct Poller<CK: Eq + Hash + Clone + Send + Sync + 'static> {
    cohorts: CohortMap<CK>,
    io_state: DelayedInit<PollerIoStateHandle>,
}

impl<CK: Eq + Hash + Clone + Send + Sync + 'static> Poller<CK> {
    fn new() -> (Initializer<PollerIoStateHandle>, Self) {
        let (initializer, io_state) = DelayedInit::new();
        (initializer, Self { cohorts: CohortMap::new(), io_state })
    }

    #[must_use]
    pub fn cohorts(&self) -> &CohortMap<CK> {
        &self.cohorts
    }

    /// Waits for `io_state` to be published. Resolves immediately once
    /// the Poller has been fully set up; callers racing `get_or_create`
    /// with the winner's setup wait here rather than assuming readiness.
    ///
    /// # Errors
    ///
    /// Fails only if the winning caller dropped its `Initializer` without
    /// calling `init` (e.g. it panicked during worker spawn).
    pub async fn io_state(&self) -> Result<PollerIoStateHandle, InitDropped> {
        self.io_state.get().await
    }

    /// Requests the worker to stop at its next opportunity. A no-op if
    /// `io_state` was never published.
    pub async fn request_stop(&self) {
        if let Ok(state) = self.io_state().await {
            state.stop.request_stop();
        }
    }
}

/// Process-wide mapping `PollerKey -> Poller`, lifecycle = process
/// lifetime.
pub struct PollerMap<PK, CK>(DashMap<PK, Arc<Poller<CK>>>)
where
    PK: Eq + Hash + Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static;

impl<PK, CK> Default for PollerMap<PK, CK>
where
    PK: Eq + Hash + Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self(DashMap::new())
    }
}

impl<PK, CK> PollerMap<PK, CK>
where
    PK: Eq + Hash + Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up the Poller currently registered for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &PK) -> Option<Arc<Poller<CK>>> {
        self.0.get(key).map(|entry| entry.value().clone())
    }

    /// Atomically looks up `key`; if absent, creates a new Poller with an
    /// empty CohortMap and an empty `io_state`, inserts it, and runs
    /// `spawn_worker` to populate `io_state` exactly once. Returns the
    /// Poller either way.
    ///
    /// `spawn_worker` receives the freshly assigned `PollerId`, a handle
    /// to the new Poller (so the worker can read its CohortMap each
    /// tick), and the `StopSignal` it must poll between ticks; it
    /// returns a cancel-on-drop handle to the spawned task.
    pub fn get_or_create<F>(&self, key: PK, spawn_worker: F) -> Arc<Poller<CK>>
    where
        F: FnOnce(PollerId, Arc<Poller<CK>>, Arc<StopSignal>) -> CancelableJoinHandle<()>,
    {
        if let Some(existing) = self.0.get(&key) {
            return existing.clone();
        }
        let (initializer, poller) = Poller::new();
        let poller = Arc::new(poller);
        match self.0.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                entry.insert(poller.clone());
                let poller_id = PollerId::new();
                let stop = Arc::new(StopSignal::new());
                let worker = spawn_worker(poller_id, poller.clone(), stop.clone());
                initializer.init(Arc::new(PollerIoState {
                    poller_id,
                    stop,
                    _worker: worker,
                }));
                poller
            }
        }
    }

    /// If the Poller at `key` is both present and still `poller` (i.e.
    /// nobody already replaced it) and its CohortMap is empty, removes it
    /// from the map. Race-safe with a concurrent `add_subscriber`
    /// reintroducing a cohort: the emptiness check and the removal happen
    /// inside one DashMap entry critical section.
    ///
    /// Returns whether the Poller was removed; the caller is responsible
    /// for then calling `poller.request_stop()` to signal the worker, the
    /// way `remove_subscription` does — stopping the worker requires
    /// awaiting `io_state`, which this (synchronous) method cannot do.
    pub fn stop_if_empty(&self, key: &PK, poller: &Arc<Poller<CK>>) -> bool {
        let Entry::Occupied(entry) = self.0.entry(key.clone()) else {
            return false;
        };
        if !Arc::ptr_eq(entry.get(), poller) {
            return false;
        }
        if entry.get().cohorts().is_empty() {
            entry.remove();
            true
        } else {
            false
        }
    }

    /// Read-only snapshot of every `(PollerKey, Poller)` pair, for
    /// `dump_poller_map` and metrics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PK, Arc<Poller<CK>>)> {
        self.0
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
