//! Grouping of subscribers that share identical resolved variables

use crate::hash::ResponseHash;
use crate::subscriber::{Subscriber, SubscriberId, SubscriberMap};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque 128-bit random identifier embedded into the multiplexed SQL so
/// the database can tag returned payloads by cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortId(Uuid);

impl CohortId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CohortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A read/write handle onto a `Cohort`'s `previous_response_hash` cell.
///
/// Cloning shares the same cell; this is what lets `snapshot_and_promote`
/// hand a tick the ability to write back a post-diff hash without holding
/// a reference into the `CohortMap` across the whole tick.
pub type HashCellHandle = Arc<RwLock<Option<ResponseHash>>>;

/// A set of subscribers sharing identical variables within a `Poller`.
///
/// Invariants upheld by this type and its owning `CohortMap`:
/// - `existing_subscribers` and `new_subscribers` never contain the same
///   `SubscriberId` — a subscriber is inserted into exactly one of
///   the two maps, and `snapshot_and_promote` is the only way to move it.
/// - `previous_response_hash` is `None` until the first successful,
///   non-error push.
pub struct Cohort {
    id: CohortId,
    previous_response_hash: HashCellHandle,
    existing_subscribers: SubscriberMap,
    new_subscribers: SubscriberMap,
}

impl Cohort {
    fn new() -> Self {
        Self {
            id: CohortId::new(),
            previous_response_hash: Arc::new(RwLock::new(None)),
            existing_subscribers: SubscriberMap::new(),
            new_subscribers: SubscriberMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> CohortId {
        self.id
    }

    /// Total subscribers across both maps. A `Cohort` with zero total
    /// subscribers must not exist in its `CohortMap`; see
    /// `CohortMap::remove_subscriber` for the fused check-and-remove.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.existing_subscribers.len() + self.new_subscribers.len()
    }

    /// Inserts `subscriber` into `new_subscribers`.
    pub fn add_subscriber(&self, subscriber: Subscriber) {
        self.new_subscribers.insert(subscriber);
    }

    /// Removes `subscriber_id` from whichever map currently holds it.
    fn remove_subscriber(&self, subscriber_id: SubscriberId) -> Option<Subscriber> {
        self.existing_subscribers
            .remove(subscriber_id)
            .or_else(|| self.new_subscribers.remove(subscriber_id))
    }

    /// Read-only counts and hash state, for introspection. Unlike
    /// `snapshot_and_promote`, this never moves `new_subscribers` into
    /// `existing_subscribers` — safe to call from `dump_poller_map`
    /// without disturbing the next tick's view of who's new.
    fn peek(&self) -> CohortPeek {
        CohortPeek {
            cohort_id: self.id,
            existing_count: self.existing_subscribers.len(),
            new_count: self.new_subscribers.len(),
            previous_hash: *self.previous_response_hash.read(),
        }
    }

    /// Atomically (a) reads `previous_response_hash`, (b) copies
    /// `existing_subscribers`, (c) copies `new_subscribers`, (d) moves
    /// every new subscriber into `existing_subscribers`, (e) leaves
    /// `new_subscribers` empty.
    fn snapshot_and_promote<K: Clone>(&self, cohort_key: K) -> CohortSnapshot<K> {
        let previous_hash = *self.previous_response_hash.read();
        let existing = self.existing_subscribers.snapshot();
        let new = self.new_subscribers.snapshot();
        self.new_subscribers.drain_into(&self.existing_subscribers);
        CohortSnapshot {
            cohort_key,
            cohort_id: self.id,
            hash_cell: self.previous_response_hash.clone(),
            previous_hash,
            existing,
            new,
        }
    }
}

/// Read-only view of a `Cohort`'s counts and hash state, for introspection.
pub struct CohortPeek {
    pub cohort_id: CohortId,
    pub existing_count: usize,
    pub new_count: usize,
    pub previous_hash: Option<ResponseHash>,
}

/// Result of `snapshot_and_promote`: a consistent per-cohort view used for
/// exactly one tick.
#[derive(Clone)]
pub struct CohortSnapshot<K> {
    pub cohort_key: K,
    pub cohort_id: CohortId,
    pub hash_cell: HashCellHandle,
    pub previous_hash: Option<ResponseHash>,
    pub existing: Vec<Subscriber>,
    pub new: Vec<Subscriber>,
}

/// Mapping `CohortKey -> Cohort` with atomic insert, remove, and
/// snapshot-iteration.
pub struct CohortMap<K: Eq + Hash + Clone + Send + Sync + 'static>(DashMap<K, Cohort>);

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Default for CohortMap<K> {
    fn default() -> Self {
        Self(DashMap::new())
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> CohortMap<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Inserts `subscriber` into the cohort for `key`, creating it if
    /// absent. Returns the cohort's id.
    pub fn add_subscriber(&self, key: K, subscriber: Subscriber) -> CohortId {
        let cohort = self.0.entry(key).or_insert_with(Cohort::new);
        cohort.add_subscriber(subscriber);
        cohort.id
    }

    /// Removes `subscriber_id` from the cohort at `key`. If the cohort's
    /// total subscriber count reaches zero, the cohort is removed from
    /// the map in the same atomic action: this fuses removal-of-subscriber
    /// with removal-of-empty-cohort so a zero-subscriber `Cohort` is never
    /// observable by another task.
    pub fn remove_subscriber(&self, key: &K, subscriber_id: SubscriberId) -> Option<Subscriber> {
        let Entry::Occupied(entry) = self.0.entry(key.clone()) else {
            return None;
        };
        let removed = entry.get().remove_subscriber(subscriber_id);
        if entry.get().total_count() == 0 {
            entry.remove();
        }
        removed
    }

    /// Snapshots every `(CohortKey, Cohort)` pair, promoting new to
    /// existing subscribers for each as it goes. Promotions across
    /// cohorts are not jointly atomic — acceptable since cohorts are
    /// independent of one another.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<CohortSnapshot<K>> {
        self.0
            .iter()
            .map(|entry| entry.value().snapshot_and_promote(entry.key().clone()))
            .collect()
    }

    /// Read-only per-cohort counts and hash state, keyed by `CohortKey`.
    /// Does not promote `new_subscribers` — safe for introspection paths
    /// that must not perturb the next tick.
    #[must_use]
    pub fn peek_all(&self) -> Vec<(K, CohortPeek)> {
        self.0
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().peek()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::test_support::{subscriber, RecordingSink};

    fn sub() -> Subscriber {
        subscriber(Arc::new(RecordingSink::default()))
    }

    #[test]
    fn add_subscriber_creates_cohort_once_per_key() {
        let map: CohortMap<&'static str> = CohortMap::new();
        let id1 = map.add_subscriber("v1", sub());
        let id2 = map.add_subscriber("v1", sub());
        assert_eq!(id1, id2, "same key must share one cohort");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_cohorts() {
        let map: CohortMap<&'static str> = CohortMap::new();
        let id1 = map.add_subscriber("v1", sub());
        let id2 = map.add_subscriber("v2", sub());
        assert_ne!(id1, id2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn removing_last_subscriber_removes_cohort() {
        let map: CohortMap<&'static str> = CohortMap::new();
        let subscriber = sub();
        let sid = subscriber.id();
        map.add_subscriber("v1", subscriber);
        assert_eq!(map.len(), 1);
        map.remove_subscriber(&"v1", sid);
        assert!(map.is_empty(), "a cohort with zero subscribers must not persist");
    }

    #[test]
    fn removing_one_of_two_keeps_cohort() {
        let map: CohortMap<&'static str> = CohortMap::new();
        let a = sub();
        let b = sub();
        let (id_a, id_b) = (a.id(), b.id());
        map.add_subscriber("v1", a);
        map.add_subscriber("v1", b);
        map.remove_subscriber(&"v1", id_a);
        assert_eq!(map.len(), 1);
        map.remove_subscriber(&"v1", id_b);
        assert!(map.is_empty());
    }

    #[test]
    fn snapshot_and_promote_moves_new_into_existing() {
        let map: CohortMap<&'static str> = CohortMap::new();
        map.add_subscriber("v1", sub());
        let snapshots = map.snapshot_all();
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.new.len(), 1, "first snapshot sees the subscriber as new");
        assert_eq!(snap.existing.len(), 0);
        assert!(snap.previous_hash.is_none());

        // A second snapshot without any new arrivals must see it promoted.
        let snapshots2 = map.snapshot_all();
        let snap2 = &snapshots2[0];
        assert_eq!(snap2.new.len(), 0, "new_subscribers must be empty after promotion");
        assert_eq!(snap2.existing.len(), 1);
    }
}
