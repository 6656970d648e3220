//! Per-Poller configuration

use serde::Serialize;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Tuning knobs bound once per `Poller` at spawn time.
///
/// Effects are exactly: `batch_size` chunks the cohort snapshot list for
/// multiplexed execution (tick phase 3), `refetch_interval` is the sleep
/// between the end of one tick and the start of the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveQueryOptions {
    batch_size: NonZeroUsize,
    refetch_interval: Duration,
}

impl LiveQueryOptions {
    /// Builds options, rejecting a zero `batch_size` eagerly rather than
    /// letting it surface as a divide-by-zero deep in the poll loop.
    pub fn new(batch_size: usize, refetch_interval: Duration) -> Result<Self, InvalidLiveQueryOptions> {
        let batch_size = NonZeroUsize::new(batch_size).ok_or(InvalidLiveQueryOptions::ZeroBatchSize)?;
        Ok(Self {
            batch_size,
            refetch_interval,
        })
    }

    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    #[must_use]
    pub fn refetch_interval(&self) -> Duration {
        self.refetch_interval
    }
}

impl Default for LiveQueryOptions {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(100).expect("100 is nonzero"),
            refetch_interval: Duration::from_secs(1),
        }
    }
}

/// Rejected [`LiveQueryOptions`] construction.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidLiveQueryOptions {
    #[error("batch_size must be positive")]
    ZeroBatchSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec() {
        let opts = LiveQueryOptions::default();
        assert_eq!(opts.batch_size().get(), 100);
        assert_eq!(opts.refetch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_batch_size() {
        assert_eq!(
            LiveQueryOptions::new(0, Duration::from_secs(1)).unwrap_err(),
            InvalidLiveQueryOptions::ZeroBatchSize
        );
    }
}
