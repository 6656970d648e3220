//! The poll loop: snapshot, batch, execute, push; plus scheduling

use crate::cohort::CohortSnapshot;
use crate::config::LiveQueryOptions;
use crate::details::{BatchExecutionDetails, PollDetails};
use crate::hooks::{CohortVariables, PostPollHook, QueryExecutor};
use crate::poller::{Poller, PollerId};
use crate::push::{push_to_cohort, CohortOutcome};
use crate::util::StopSignal;
use futures::future::join_all;
use futures::FutureExt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Static, per-Poller identity bound once at spawn.
/// Independent of the cohort key type, so one `TickContext` shape works
/// for every `Poller<CK>`.
pub struct TickContext {
    pub poller_id: PollerId,
    pub source: String,
    pub role: String,
    pub options: LiveQueryOptions,
    /// The multiplexed SQL text executed every tick; surfaced verbatim as
    /// `PollDetails::generated_sql`.
    pub generated_sql: String,
    /// Hash of the parameterised query this Poller was built from;
    /// surfaced verbatim as `PollDetails::parameterized_query_hash`.
    pub parameterized_query_hash: String,
    pub executor: Arc<dyn QueryExecutor>,
    pub post_poll_hook: Arc<dyn PostPollHook>,
}

/// Runs one complete snapshot -> batch -> execute -> push cycle for
/// `poller` and returns the report handed to `post_poll_hook`.
#[instrument(skip_all, fields(poller_id = %ctx.poller_id))]
pub async fn run_tick<CK>(ctx: &TickContext, poller: &Poller<CK>) -> PollDetails
where
    CK: Eq + Hash + Clone + Send + Sync + serde::Serialize + 'static,
{
    let t_total = Instant::now();

    let t_snapshot = Instant::now();
    let snapshots = poller.cohorts().snapshot_all();
    let snapshot_time = t_snapshot.elapsed();

    let batch_size = ctx.options.batch_size().get();
    let batches: Vec<Vec<CohortSnapshot<CK>>> =
        snapshots.chunks(batch_size).map(<[CohortSnapshot<CK>]>::to_vec).collect();

    let batch_details = join_all(
        batches
            .into_iter()
            .enumerate()
            .map(|(index, batch)| run_batch(ctx, (index + 1) as u32, batch)),
    )
    .await;

    let total_time = t_total.elapsed();
    let details = PollDetails {
        poller_id: ctx.poller_id,
        snapshot_time,
        batches: batch_details,
        total_time,
        source: ctx.source.clone(),
        role: ctx.role.clone(),
        generated_sql: Some(ctx.generated_sql.clone()),
        live_query_options: Some(ctx.options),
        parameterized_query_hash: Some(ctx.parameterized_query_hash.clone()),
    };
    ctx.post_poll_hook.on_poll(&details).await;
    details
}

async fn run_batch<CK>(
    ctx: &TickContext,
    batch_id: u32,
    batch: Vec<CohortSnapshot<CK>>,
) -> BatchExecutionDetails
where
    CK: Eq + Hash + Clone + Send + Sync + serde::Serialize + 'static,
{
    let query_input: Vec<(crate::cohort::CohortId, CohortVariables)> = batch
        .iter()
        .map(|snapshot| {
            let variables = serde_json::to_vec(&snapshot.cohort_key).unwrap_or_default();
            (snapshot.cohort_id, Arc::from(variables))
        })
        .collect();

    // pg_execution_time is measured by the executor itself
    let (pg_execution_time, result) = ctx.executor.run_multiplexed_query(&query_input).await;

    let t_push = Instant::now();
    let (batch_response_size_bytes, cohort_details) = match result {
        Err(err) => {
            warn!(%err, batch_id, "multiplexed query failed for whole batch");
            let details = join_all(batch.iter().map(|snapshot| {
                push_to_cohort(
                    snapshot,
                    CohortOutcome::BatchError {
                        message: Arc::from(err.0.as_ref()),
                    },
                    batch_id,
                )
            }))
            .await;
            (None, details)
        }
        Ok(rows) => {
            let mut by_id: std::collections::HashMap<_, _> = rows.into_iter().collect();
            let mut total_bytes = 0u64;
            let mut operations = Vec::with_capacity(batch.len());
            for snapshot in &batch {
                let Some(bytes) = by_id.remove(&snapshot.cohort_id) else {
                    debug!(cohort_id = %snapshot.cohort_id, batch_id, "no row returned for cohort this tick");
                    continue;
                };
                total_bytes += bytes.len() as u64;
                operations.push((snapshot, Arc::<[u8]>::from(bytes)));
            }
            if !by_id.is_empty() {
                debug!(batch_id, stray = by_id.len(), "response rows with no matching cohort snapshot");
            }
            // Every cohort here has an independent hash cell and
            // subscriber set, so the pushes run concurrently rather than
            // one at a time — matching the error branch above and the
            // spec's push-phase concurrency requirement.
            let details = join_all(operations.iter().map(|(snapshot, bytes)| {
                push_to_cohort(
                    snapshot,
                    CohortOutcome::Success {
                        bytes: bytes.clone(),
                        execution_time: pg_execution_time,
                    },
                    batch_id,
                )
            }))
            .await;
            (Some(total_bytes), details)
        }
    };
    let push_time = t_push.elapsed();

    BatchExecutionDetails {
        pg_execution_time,
        push_time,
        batch_id,
        cohorts: cohort_details,
        batch_response_size_bytes,
    }
}

/// The immortal per-Poller worker loop: run a tick, sleep
/// `refetch_interval`, repeat; never exits except on `stop`. Recoverable
/// per-tick failures (batch errors, inconsistent cohort ids, subscriber
/// callback panics) are already handled inside `run_tick`/`push_to_cohort`
/// and never reach here. What this loop guards against is an escaped
/// panic from a collaborator awaited directly in the tick body — a
/// `QueryExecutor` or `PostPollHook` implementation that panics instead
/// of returning — which would otherwise kill this worker's task for
/// good; `catch_unwind` turns that into a logged error followed by the
/// usual sleep-then-retry instead.
pub async fn worker_loop<CK>(ctx: TickContext, poller: Arc<Poller<CK>>, stop: Arc<StopSignal>)
where
    CK: Eq + Hash + Clone + Send + Sync + serde::Serialize + 'static,
{
    info!(poller_id = %ctx.poller_id, "poller worker started");
    while !stop.is_stop_requested() {
        if let Err(payload) = AssertUnwindSafe(run_tick(&ctx, &poller)).catch_unwind().await {
            error!(poller_id = %ctx.poller_id, message = %panic_message(&payload), "poll tick panicked; resuming after sleep");
        }
        if stop.is_stop_requested() {
            break;
        }
        tokio::time::sleep(ctx.options.refetch_interval()).await;
    }
    info!(poller_id = %ctx.poller_id, "poller worker stopping");
    stop.mark_done();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortId;
    use crate::hooks::{BatchExecutionError, NoopPostPollHook};
    use crate::poller::PollerMap;
    use crate::subscriber::test_support::{subscriber, RecordingSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedExecutor {
        responses: Mutex<std::vec::IntoIter<Result<Vec<(CohortId, Vec<u8>)>, BatchExecutionError>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueryExecutor for ScriptedExecutor {
        async fn run_multiplexed_query(
            &self,
            _cohorts: &[(CohortId, CohortVariables)],
        ) -> (Duration, Result<Vec<(CohortId, Vec<u8>)>, BatchExecutionError>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().await.next().expect("script exhausted");
            (Duration::from_millis(1), next)
        }
    }

    #[tokio::test]
    async fn single_unchanged_result_is_ignored_on_second_tick() {
        let poller_map: PollerMap<&'static str, &'static str> = PollerMap::new();
        let poller = poller_map.get_or_create("k1", |_id, _p, stop| {
            crate::util::CancelableJoinHandle::spawn(
                async move { stop.wait_done().await },
                &tokio::runtime::Handle::current(),
            )
        });

        let sink = Arc::new(RecordingSink::default());
        poller.cohorts().add_subscriber("v1", subscriber(sink.clone()));
        let cohort_id = poller.cohorts().snapshot_all()[0].cohort_id;

        let executor = Arc::new(ScriptedExecutor {
            responses: Mutex::new(
                vec![Ok(vec![(cohort_id, b"same".to_vec())]), Ok(vec![(cohort_id, b"same".to_vec())])]
                    .into_iter(),
            ),
            calls: AtomicUsize::new(0),
        });
        let ctx = TickContext {
            poller_id: crate::poller::PollerId::new(),
            source: "s".into(),
            role: "r".into(),
            options: LiveQueryOptions::default(),
            generated_sql: "select * from multiplexed($1)".into(),
            parameterized_query_hash: "test-hash".into(),
            executor: executor.clone(),
            post_poll_hook: Arc::new(NoopPostPollHook),
        };

        run_tick(&ctx, &poller).await; // first tick: new subscriber, always pushed
        run_tick(&ctx, &poller).await; // second tick: unchanged, must not push again

        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_result_pushes_again() {
        let poller_map: PollerMap<&'static str, &'static str> = PollerMap::new();
        let poller = poller_map.get_or_create("k1", |_id, _p, stop| {
            crate::util::CancelableJoinHandle::spawn(
                async move { stop.wait_done().await },
                &tokio::runtime::Handle::current(),
            )
        });

        let sink = Arc::new(RecordingSink::default());
        poller.cohorts().add_subscriber("v1", subscriber(sink.clone()));
        let cohort_id = poller.cohorts().snapshot_all()[0].cohort_id;

        let executor = Arc::new(ScriptedExecutor {
            responses: Mutex::new(
                vec![Ok(vec![(cohort_id, b"one".to_vec())]), Ok(vec![(cohort_id, b"two".to_vec())])]
                    .into_iter(),
            ),
            calls: AtomicUsize::new(0),
        });
        let ctx = TickContext {
            poller_id: crate::poller::PollerId::new(),
            source: "s".into(),
            role: "r".into(),
            options: LiveQueryOptions::default(),
            generated_sql: "select * from multiplexed($1)".into(),
            parameterized_query_hash: "test-hash".into(),
            executor,
            post_poll_hook: Arc::new(NoopPostPollHook),
        };

        run_tick(&ctx, &poller).await;
        run_tick(&ctx, &poller).await;

        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_error_then_recovery_pushes_same_payload_again() {
        let poller_map: PollerMap<&'static str, &'static str> = PollerMap::new();
        let poller = poller_map.get_or_create("k1", |_id, _p, stop| {
            crate::util::CancelableJoinHandle::spawn(
                async move { stop.wait_done().await },
                &tokio::runtime::Handle::current(),
            )
        });

        let sink = Arc::new(RecordingSink::default());
        poller.cohorts().add_subscriber("v1", subscriber(sink.clone()));
        let cohort_id = poller.cohorts().snapshot_all()[0].cohort_id;

        let executor = Arc::new(ScriptedExecutor {
            responses: Mutex::new(
                vec![
                    Ok(vec![(cohort_id, b"X".to_vec())]),
                    Err(BatchExecutionError(Arc::from("boom"))),
                    Ok(vec![(cohort_id, b"X".to_vec())]),
                ]
                .into_iter(),
            ),
            calls: AtomicUsize::new(0),
        });
        let ctx = TickContext {
            poller_id: crate::poller::PollerId::new(),
            source: "s".into(),
            role: "r".into(),
            options: LiveQueryOptions::default(),
            generated_sql: "select * from multiplexed($1)".into(),
            parameterized_query_hash: "test-hash".into(),
            executor,
            post_poll_hook: Arc::new(NoopPostPollHook),
        };

        run_tick(&ctx, &poller).await; // tick 1: "X" pushed (new)
        run_tick(&ctx, &poller).await; // tick 2: error pushed, hash reset
        run_tick(&ctx, &poller).await; // tick 3: "X" pushed again since hash was reset

        assert_eq!(sink.count.load(Ordering::SeqCst), 3);
        let deliveries = sink.deliveries.lock().await;
        assert!(!deliveries[0].is_error());
        assert!(deliveries[1].is_error());
        assert!(!deliveries[2].is_error());
    }

    #[tokio::test]
    async fn two_cohorts_one_batch_each_gets_own_payload() {
        let poller_map: PollerMap<&'static str, &'static str> = PollerMap::new();
        let poller = poller_map.get_or_create("k1", |_id, _p, stop| {
            crate::util::CancelableJoinHandle::spawn(
                async move { stop.wait_done().await },
                &tokio::runtime::Handle::current(),
            )
        });

        let sink1 = Arc::new(RecordingSink::default());
        let sink2 = Arc::new(RecordingSink::default());
        poller.cohorts().add_subscriber("v1", subscriber(sink1.clone()));
        poller.cohorts().add_subscriber("v2", subscriber(sink2.clone()));
        let snaps = poller.cohorts().snapshot_all();
        let id1 = snaps.iter().find(|s| s.cohort_key == "v1").unwrap().cohort_id;
        let id2 = snaps.iter().find(|s| s.cohort_key == "v2").unwrap().cohort_id;

        let executor = Arc::new(ScriptedExecutor {
            responses: Mutex::new(
                vec![Ok(vec![(id1, b"A".to_vec()), (id2, b"B".to_vec())])].into_iter(),
            ),
            calls: AtomicUsize::new(0),
        });
        let options = LiveQueryOptions::new(10, Duration::from_secs(1)).unwrap();
        let ctx = TickContext {
            poller_id: crate::poller::PollerId::new(),
            source: "s".into(),
            role: "r".into(),
            options,
            generated_sql: "select * from multiplexed($1)".into(),
            parameterized_query_hash: "test-hash".into(),
            executor,
            post_poll_hook: Arc::new(NoopPostPollHook),
        };

        run_tick(&ctx, &poller).await;

        assert_eq!(sink1.count.load(Ordering::SeqCst), 1);
        assert_eq!(sink2.count.load(Ordering::SeqCst), 1);
        assert!(!sink1.deliveries.lock().await[0].is_error());
    }

    struct PanickingExecutor;

    #[async_trait]
    impl QueryExecutor for PanickingExecutor {
        async fn run_multiplexed_query(
            &self,
            _cohorts: &[(CohortId, CohortVariables)],
        ) -> (Duration, Result<Vec<(CohortId, Vec<u8>)>, BatchExecutionError>) {
            panic!("executor blew up");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_a_panicking_executor() {
        let poller_map: PollerMap<&'static str, &'static str> = PollerMap::new();
        let sink = Arc::new(RecordingSink::default());
        let options = LiveQueryOptions::new(10, Duration::from_millis(5)).unwrap();
        let poller = poller_map.get_or_create("k1", move |id, poller, stop| {
            let ctx = TickContext {
                poller_id: id,
                source: "s".into(),
                role: "r".into(),
                options,
                generated_sql: "select * from multiplexed($1)".into(),
                parameterized_query_hash: "test-hash".into(),
                executor: Arc::new(PanickingExecutor),
                post_poll_hook: Arc::new(NoopPostPollHook),
            };
            crate::util::CancelableJoinHandle::spawn(
                worker_loop(ctx, poller, stop),
                &tokio::runtime::Handle::current(),
            )
        });
        poller.cohorts().add_subscriber("v1", subscriber(sink.clone()));

        // A handful of ticks all panic inside the executor; the worker
        // must keep sleeping and retrying rather than dying silently.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(poller_map.len(), 1, "a panicking tick must not kill the worker or drop the poller");
        assert_eq!(sink.count.load(Ordering::SeqCst), 0, "a batch that only ever panics never succeeds a push");
    }
}
