//! Read-only introspection of a `PollerMap`

use crate::poller::PollerMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::hash::Hash;

/// Non-extended summary of one Poller.
#[derive(Serialize)]
struct PollerSummary {
    poller_id: String,
    poller_key: Value,
    cohort_count: usize,
    subscriber_count: usize,
}

/// Extended per-cohort detail, only present when `extended` is requested.
#[derive(Serialize)]
struct CohortSummary {
    cohort_key: Value,
    cohort_id: String,
    existing_count: usize,
    new_count: usize,
    last_hash: Option<String>,
}

#[derive(Serialize)]
struct ExtendedPollerSummary {
    #[serde(flatten)]
    base: PollerSummary,
    cohorts: Vec<CohortSummary>,
}

/// Snapshots `poller_map` into a JSON `Value` for diagnostics.
///
/// Non-extended: `{poller_id, poller_key, cohort_count, subscriber_count}`
/// per Poller. Extended additionally lists each cohort's key, id, and
/// `new`/`existing` subscriber counts, mirroring `PollDetails`' own
/// base/extended split.
pub fn dump_poller_map<PK, CK>(poller_map: &PollerMap<PK, CK>, extended: bool) -> Value
where
    PK: Eq + Hash + Clone + Send + Sync + Serialize + 'static,
    CK: Eq + Hash + Clone + Send + Sync + Serialize + 'static,
{
    let pollers: Vec<Value> = poller_map
        .snapshot()
        .into_iter()
        .map(|(key, poller)| {
            // `peek_all`, unlike `snapshot_all`, never promotes new
            // subscribers into existing ones — this dump must not perturb
            // what the next tick sees as newly arrived.
            let cohort_peeks = poller.cohorts().peek_all();
            // get_or_create can return a Poller whose io_state isn't
            // published yet (the caller raced the insert against another
            // subscriber on the same new key, see lib::add_subscription) —
            // this dump is synchronous and must not block on it, so a
            // still-publishing Poller simply yields an empty id here
            // instead of the real one.
            let poller_id = poller
                .io_state()
                .now_or_never()
                .and_then(Result::ok)
                .map(|state| state.poller_id().to_string())
                .unwrap_or_default();
            let base = PollerSummary {
                poller_id,
                poller_key: serde_json::to_value(&key).unwrap_or(Value::Null),
                cohort_count: cohort_peeks.len(),
                subscriber_count: cohort_peeks
                    .iter()
                    .map(|(_, peek)| peek.existing_count + peek.new_count)
                    .sum(),
            };
            if extended {
                let cohorts = cohort_peeks
                    .iter()
                    .map(|(cohort_key, peek)| CohortSummary {
                        cohort_key: serde_json::to_value(cohort_key).unwrap_or(Value::Null),
                        cohort_id: peek.cohort_id.to_string(),
                        existing_count: peek.existing_count,
                        new_count: peek.new_count,
                        last_hash: peek.previous_hash.map(|h| h.to_hex()),
                    })
                    .collect();
                serde_json::to_value(ExtendedPollerSummary { base, cohorts }).unwrap_or(Value::Null)
            } else {
                serde_json::to_value(base).unwrap_or(Value::Null)
            }
        })
        .collect();
    Value::Array(pollers)
}
