//! Multiplexed live-query poller core.
//!
//! Subscribers sharing a `(source, role, query)` triple share a
//! [`Poller`]; within a `Poller`, subscribers sharing resolved variables
//! share a [`Cohort`]. Each tick, every live cohort is batched into
//! multiplexed source queries, results are content-hashed, and only
//! changed results (or brand-new subscribers) are pushed to clients. See
//! the crate's `DESIGN.md` for how each module is grounded.

pub mod cohort;
pub mod config;
pub mod details;
pub mod dump;
pub mod error;
pub mod hash;
pub mod hooks;
pub mod poller;
pub mod push;
pub mod response;
pub mod subscriber;
pub mod tick;
mod util;

use cohort::CohortId;
use config::LiveQueryOptions;
use hooks::{PostPollHook, QueryExecutor};
use poller::{Poller, PollerId, PollerMap};
use std::hash::Hash;
use std::sync::Arc;
use subscriber::{Subscriber, SubscriberId};
use tick::{worker_loop, TickContext};
use util::{CancelableJoinHandle, StopSignal};

pub use error::Error;
pub use response::LiveQueryResponse;

/// Everything needed to spin up a brand-new Poller's worker, bound once
/// at spawn time. Passed through to
/// [`add_subscription`] so the caller only has to provide it for the
/// `is_new == true` path, never manage the worker lifecycle itself.
pub struct PollerSpawnConfig {
    pub source: String,
    pub role: String,
    pub options: LiveQueryOptions,
    /// The multiplexed SQL text this Poller's ticks execute; surfaced
    /// verbatim as `PollDetails::generated_sql`.
    pub generated_sql: String,
    /// Hash of the parameterised query this Poller was built from;
    /// surfaced verbatim as `PollDetails::parameterized_query_hash`.
    pub parameterized_query_hash: String,
    pub executor: Arc<dyn QueryExecutor>,
    pub post_poll_hook: Arc<dyn PostPollHook>,
}

/// Idempotently constructs the `Poller` for `poller_key` (spawning its
/// worker if this is the first subscriber to need it) and the `Cohort`
/// for `cohort_key` within it, then inserts `subscriber` into that
/// cohort's `new_subscribers`.
pub async fn add_subscription<PK, CK>(
    poller_map: &PollerMap<PK, CK>,
    poller_key: PK,
    cohort_key: CK,
    subscriber: Subscriber,
    spawn_config: impl FnOnce() -> PollerSpawnConfig,
) -> (PollerId, CohortId, SubscriberId)
where
    PK: Eq + Hash + Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + serde::Serialize + 'static,
{
    let subscriber_id = subscriber.id();
    let poller = poller_map.get_or_create(poller_key, |poller_id, poller, stop| {
        spawn_poller_worker(poller_id, poller, stop, spawn_config())
    });
    let cohort_id = poller.cohorts().add_subscriber(cohort_key, subscriber);

    // A caller that loses the `get_or_create` race for a brand-new
    // `PollerKey` can observe the freshly inserted `Poller` before the
    // winner has finished publishing `io_state` (the insert and the
    // publish are two separate steps — see §5 "Race to create a
    // Poller"). Waiting here, rather than asserting it's already
    // published, is what makes that the normal path instead of a panic.
    let poller_id = poller
        .io_state()
        .await
        .expect("initializer is never dropped without publishing")
        .poller_id();
    (poller_id, cohort_id, subscriber_id)
}

/// Removes `subscriber_id` from the cohort at `cohort_key`; removes the
/// cohort if it becomes empty; stops and removes the Poller at
/// `poller_key` if its CohortMap becomes empty as a result.
pub async fn remove_subscription<PK, CK>(
    poller_map: &PollerMap<PK, CK>,
    poller_key: &PK,
    cohort_key: &CK,
    subscriber_id: SubscriberId,
) where
    PK: Eq + Hash + Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
{
    let Some(poller) = poller_map.get(poller_key) else {
        return;
    };
    poller.cohorts().remove_subscriber(cohort_key, subscriber_id);
    if poller_map.stop_if_empty(poller_key, &poller) {
        poller.request_stop().await;
    }
}

fn spawn_poller_worker<CK>(
    poller_id: PollerId,
    poller: Arc<Poller<CK>>,
    stop: Arc<StopSignal>,
    spawn_config: PollerSpawnConfig,
) -> CancelableJoinHandle<()>
where
    CK: Eq + Hash + Clone + Send + Sync + serde::Serialize + 'static,
{
    let ctx = TickContext {
        poller_id,
        source: spawn_config.source,
        role: spawn_config.role,
        options: spawn_config.options,
        generated_sql: spawn_config.generated_sql,
        parameterized_query_hash: spawn_config.parameterized_query_hash,
        executor: spawn_config.executor,
        post_poll_hook: spawn_config.post_poll_hook,
    };
    CancelableJoinHandle::spawn(worker_loop(ctx, poller, stop), &tokio::runtime::Handle::current())
}
