//! Subscriber identity and the concurrent membership map a [`crate::cohort::Cohort`] is built from

use crate::response::LiveQueryResponse;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque unique identifier for a subscriber, immutable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Free-form, transport-supplied metadata. Opaque to the core; carried
/// through to [`crate::details::SubscriberExecutionDetails`] untouched.
pub type SubscriberMetadata = serde_json::Value;

/// An id supplied by the transport for the originating GraphQL request.
/// Opaque to the core beyond equality/display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Arc<str>);

impl RequestId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivers a [`LiveQueryResponse`] to a client. Crosses the core/transport
/// boundary: treated as potentially slow and potentially failing. Must be
/// safe to invoke concurrently with other subscribers' callbacks, and
/// reentrancy-safe with respect to itself across ticks.
#[async_trait]
pub trait SubscriberSink: Send + Sync {
    async fn on_change(&self, response: LiveQueryResponse);
}

/// A single client subscription within a [`crate::cohort::Cohort`].
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    metadata: SubscriberMetadata,
    request_id: RequestId,
    operation_name: Option<String>,
    sink: Arc<dyn SubscriberSink>,
}

impl Subscriber {
    #[must_use]
    pub fn new(
        metadata: SubscriberMetadata,
        request_id: RequestId,
        operation_name: Option<String>,
        sink: Arc<dyn SubscriberSink>,
    ) -> Self {
        Self {
            id: SubscriberId::new(),
            metadata,
            request_id,
            operation_name,
            sink,
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub fn metadata(&self) -> &SubscriberMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub async fn notify(&self, response: LiveQueryResponse) {
        self.sink.on_change(response).await;
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("operation_name", &self.operation_name)
            .finish_non_exhaustive()
    }
}

/// A concurrent, iterable mapping from [`SubscriberId`] to [`Subscriber`].
///
/// Used twice per [`crate::cohort::Cohort`] — once for `new_subscribers`,
/// once for `existing_subscribers` — and never directly shared between
/// the two: a subscriber moves from one `SubscriberMap` to the other via
/// [`SubscriberMap::drain_into`], never lives in both at once.
#[derive(Debug, Default)]
pub struct SubscriberMap(DashMap<SubscriberId, Subscriber>);

impl SubscriberMap {
    #[must_use]
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn insert(&self, subscriber: Subscriber) {
        self.0.insert(subscriber.id(), subscriber);
    }

    pub fn remove(&self, id: SubscriberId) -> Option<Subscriber> {
        self.0.remove(&id).map(|(_, s)| s)
    }

    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.0.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a `Vec` clone of the current members without removing them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.0.iter().map(|e| e.value().clone()).collect()
    }

    /// Moves every current member out of `self` and into `dest`, leaving
    /// `self` empty. Used by `snapshot_and_promote` to move `new` into
    /// `existing` atomically per-entry.
    pub fn drain_into(&self, dest: &SubscriberMap) {
        for (id, subscriber) in self.0.clone().into_iter() {
            if self.0.remove(&id).is_some() {
                dest.insert(subscriber);
            }
        }
    }
}
