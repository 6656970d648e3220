//! Per-tick diagnostic schema handed to `PostPollHook::on_poll`

use crate::cohort::CohortId;
use crate::poller::PollerId;
use crate::subscriber::{SubscriberId, SubscriberMetadata};
use serde::Serialize;
use std::time::Duration;

fn serialize_duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// `{subscriber_id, subscriber_metadata}` — one line per subscriber in a
/// cohort's pushed or ignored list.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberExecutionDetails {
    pub subscriber_id: SubscriberId,
    pub subscriber_metadata: SubscriberMetadata,
}

/// One cohort's outcome within a batch: who got pushed, who was ignored,
/// and (on success) the response size.
#[derive(Debug, Clone, Serialize)]
pub struct CohortExecutionDetails {
    pub cohort_id: CohortId,
    pub variables: serde_json::Value,
    pub response_size: Option<usize>,
    pub pushed_to: Vec<SubscriberExecutionDetails>,
    pub ignored: Vec<SubscriberExecutionDetails>,
    pub batch_id: u32,
}

/// One multiplexed query execution and its push phase.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExecutionDetails {
    #[serde(serialize_with = "serialize_duration_secs")]
    pub pg_execution_time: Duration,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub push_time: Duration,
    pub batch_id: u32,
    pub cohorts: Vec<CohortExecutionDetails>,
    pub batch_response_size_bytes: Option<u64>,
}

/// The full per-tick report.
///
/// `generated_sql`, `live_query_options` and `parameterized_query_hash`
/// are the Poller's static spawn-time identity (bound once in
/// `TickContext`/`PollerSpawnConfig`) rather than per-tick
/// measurements, so `run_tick` always populates them; they're `Option`
/// only because this is also the schema `crate::dump::dump_poller_map`
/// mirrors for its own non-extended/extended split, where they may
/// genuinely be absent.
#[derive(Debug, Clone, Serialize)]
pub struct PollDetails {
    pub poller_id: PollerId,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub snapshot_time: Duration,
    pub batches: Vec<BatchExecutionDetails>,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub total_time: Duration,
    pub source: String,
    pub role: String,
    pub generated_sql: Option<String>,
    pub live_query_options: Option<crate::config::LiveQueryOptions>,
    pub parameterized_query_hash: Option<String>,
}
