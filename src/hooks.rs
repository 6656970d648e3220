//! External interfaces collaborators implement

use crate::cohort::CohortId;
use crate::details::PollDetails;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One cohort's resolved variables, opaque bytes ready to inject into the
/// multiplexed query. What these bytes mean is entirely up to the
/// `QueryExecutor` implementation; the core only ever moves them around.
pub type CohortVariables = Arc<[u8]>;

/// The database integration: runs one multiplexed query against a batch
/// of cohorts and returns, per cohort, the serialised payload bytes.
///
/// A batch-level error means the whole batch failed and every cohort in
/// it receives an error response; a cohort absent from a
/// successful response's list simply receives no update this tick.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run_multiplexed_query(
        &self,
        cohorts: &[(CohortId, CohortVariables)],
    ) -> (Duration, Result<Vec<(CohortId, Vec<u8>)>, BatchExecutionError>);
}

/// The database-integration failure reported for an entire batch.
#[derive(Debug, Clone)]
pub struct BatchExecutionError(pub Arc<str>);

impl std::fmt::Display for BatchExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BatchExecutionError {}

/// Consumes per-tick telemetry. Implementations are expected to log or
/// export metrics; the core never inspects what they do with the report.
#[async_trait]
pub trait PostPollHook: Send + Sync {
    async fn on_poll(&self, details: &PollDetails);
}

/// A `PostPollHook` that does nothing, for configurations with no
/// telemetry consumer.
pub struct NoopPostPollHook;

#[async_trait]
impl PostPollHook for NoopPostPollHook {
    async fn on_poll(&self, _details: &PollDetails) {}
}
