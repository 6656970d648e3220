//! The payload handed to a subscriber's callback

use std::sync::Arc;
use std::time::Duration;

/// What gets delivered to a subscriber's `on_change_callback`.
///
/// Either a successful payload plus how long the source query took to
/// produce it, or a GraphQL-level error. Error results are always
/// delivered — subscribers must learn that their query failed — but carry
/// no payload bytes.
#[derive(Debug, Clone)]
pub enum LiveQueryResponse {
    /// A successful per-cohort payload.
    Data {
        bytes: Arc<[u8]>,
        execution_time: Duration,
    },
    /// The source query failed for the whole batch this cohort was part of.
    Error { message: Arc<str> },
}

impl LiveQueryResponse {
    #[must_use]
    pub fn data(bytes: Arc<[u8]>, execution_time: Duration) -> Self {
        Self::Data { bytes, execution_time }
    }

    #[must_use]
    pub fn error(message: impl Into<Arc<str>>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
