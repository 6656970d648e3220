//! Push-to-cohort: diff against the last hash, then fan out

use crate::cohort::CohortSnapshot;
use crate::details::{CohortExecutionDetails, SubscriberExecutionDetails};
use crate::hash::ResponseHash;
use crate::response::LiveQueryResponse;
use crate::subscriber::Subscriber;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// What a single batch-execution operation produced for one cohort,
/// after the multiplexed query ran.
pub enum CohortOutcome {
    /// `run_multiplexed_query` returned a payload for this cohort.
    Success { bytes: Arc<[u8]>, execution_time: Duration },
    /// The whole batch failed; every cohort in it gets this.
    BatchError { message: Arc<str> },
}

/// Diffs `outcome` against `snapshot`'s previous hash, notifies whoever
/// needs notifying, and reports who was pushed to and who was ignored.
///
/// Error results are always delivered (with
/// the hash reset to `None` so a repeated identical error doesn't
/// re-suppress once the source recovers); a changed or first-ever hash
/// delivers to everyone and clears `ignored`; an unchanged hash delivers
/// only to brand-new subscribers and reports the rest as `ignored`.
pub async fn push_to_cohort<K>(
    snapshot: &CohortSnapshot<K>,
    outcome: CohortOutcome,
    batch_id: u32,
) -> CohortExecutionDetails
where
    K: serde::Serialize,
{
    let previous_hash = *snapshot.hash_cell.read();

    let (response, new_hash) = match &outcome {
        CohortOutcome::Success { bytes, execution_time } => {
            (LiveQueryResponse::data(bytes.clone(), *execution_time), Some(ResponseHash::hash(bytes)))
        }
        CohortOutcome::BatchError { message } => (LiveQueryResponse::error(message.clone()), None),
    };

    let should_push_to_existing = response.is_error() || new_hash != previous_hash;

    let (notify, ignored): (Vec<Subscriber>, Vec<Subscriber>) = if should_push_to_existing {
        *snapshot.hash_cell.write() = new_hash;
        let mut notify = snapshot.existing.clone();
        notify.extend(snapshot.new.iter().cloned());
        (notify, Vec::new())
    } else {
        (snapshot.new.clone(), snapshot.existing.clone())
    };

    let response_size = match &outcome {
        CohortOutcome::Success { bytes, .. } => Some(bytes.len()),
        CohortOutcome::BatchError { .. } => None,
    };

    // Each callback is spawned onto its own task rather than simply
    // awaited in a shared `join_all`: a panicking callback aborts only
    // the task it's running in, so one bad subscriber can never take
    // down the push to its siblings or the tick itself.
    join_all(notify.iter().cloned().map(|subscriber| {
        let response = response.clone();
        async move {
            let id = subscriber.id();
            if let Err(join_err) = tokio::spawn(async move { subscriber.notify(response).await }).await {
                warn!(subscriber_id = %id, error = %join_err, "subscriber callback panicked");
            }
        }
    }))
    .await;

    CohortExecutionDetails {
        cohort_id: snapshot.cohort_id,
        variables: serde_json::to_value(&snapshot.cohort_key).unwrap_or(serde_json::Value::Null),
        response_size,
        pushed_to: notify.iter().map(subscriber_details).collect(),
        ignored: ignored.iter().map(subscriber_details).collect(),
        batch_id,
    }
}

fn subscriber_details(subscriber: &Subscriber) -> SubscriberExecutionDetails {
    SubscriberExecutionDetails {
        subscriber_id: subscriber.id(),
        subscriber_metadata: subscriber.metadata().clone(),
    }
}
