//! Fatal, programmer-error conditions
//!
//! All *recoverable* failures (batch execution errors, inconsistent
//! cohort ids, subscriber callback errors, worker panics) are recovered
//! locally inside the tick and never reach this type — they are logged and
//! folded into [`crate::details::PollDetails`] instead. `Error` is reserved
//! for violated invariants that should be reported fatally.

/// A violated invariant of the poller core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `Cohort` was observed with zero subscribers in both its `new` and
    /// `existing` maps. Per the `CohortMap` invariant, removal of the
    /// last subscriber must fuse with removal of the cohort itself; seeing
    /// this means that fusion was bypassed somewhere.
    #[error("cohort {0} has zero subscribers but was not removed from its CohortMap")]
    EmptyCohortPersisted(crate::cohort::CohortId),

    /// `Poller::io_state` was initialized twice. The write-once discipline
    /// guarantees this never happens when `get_or_create` is
    /// used correctly; observing it means a caller spawned a second worker
    /// for a Poller that already had one.
    #[error("poller {0} io_state was initialized more than once")]
    PollerAlreadyInitialized(crate::poller::PollerId),
}
