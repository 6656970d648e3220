//! Small concurrency primitives shared by `poller` and `tick`

use futures::{channel, Future, FutureExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::task::Poll;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

/// The sending counterpart to a [`DelayedInit`].
pub struct Initializer<T>(channel::oneshot::Sender<T>);

impl<T> Initializer<T> {
    /// Sends `value` to the linked [`DelayedInit`]. A failure to send
    /// (no recipients remain) is not a relevant case to signal here.
    pub fn init(self, value: T) {
        let _ = self.0.send(value);
    }
}

/// A value that must be published exactly once by an external writer.
///
/// This is the write-once publication primitive `Poller::io_state` is
/// built on: create the cell empty, insert it into the
/// `PollerMap` atomically, then fill it exactly once. Readers that find
/// the cell empty wait rather than assume the Poller is uninitialized.
pub struct DelayedInit<T> {
    state: RwLock<ReceiverState<T>>,
}

enum ReceiverState<T> {
    Waiting(channel::oneshot::Receiver<T>),
    Ready(Result<T, InitDropped>),
}

impl<T> DelayedInit<T> {
    /// Returns an empty cell with no value, along with its linked
    /// [`Initializer`].
    #[must_use]
    pub fn new() -> (Initializer<T>, Self) {
        let (tx, rx) = channel::oneshot::channel();
        (
            Initializer(tx),
            DelayedInit {
                state: RwLock::new(ReceiverState::Waiting(rx)),
            },
        )
    }
}

impl<T: Clone + Send + Sync> DelayedInit<T> {
    /// Waits for the value to be available and returns it.
    ///
    /// Calling `get` again once a value is available always returns a
    /// clone of the same value — never a torn or second value.
    ///
    /// # Errors
    ///
    /// Fails if the linked [`Initializer`] was dropped before `init` was
    /// called.
    pub async fn get(&self) -> Result<T, InitDropped> {
        Get(self).await
    }
}

struct Get<'a, T>(&'a DelayedInit<T>);

impl<T: Clone> Future for Get<'_, T> {
    type Output = Result<T, InitDropped>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let read_lock = self.0.state.read().unwrap();
        if let ReceiverState::Ready(v) = &*read_lock {
            trace!("io_state already initialized, fast path");
            return Poll::Ready(v.clone());
        }
        drop(read_lock);
        let mut state = self.0.state.write().unwrap();
        match &mut *state {
            ReceiverState::Waiting(rx) => {
                if let Poll::Ready(value) = rx.poll_unpin(cx).map_err(|_| InitDropped) {
                    *state = ReceiverState::Ready(value.clone());
                    Poll::Ready(value)
                } else {
                    Poll::Pending
                }
            }
            ReceiverState::Ready(v) => Poll::Ready(v.clone()),
        }
    }
}

/// The linked [`Initializer`] was dropped before it published a value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("initializer was dropped before io_state was published")]
pub struct InitDropped;

/// A [`JoinHandle`] that cancels the underlying task when dropped rather
/// than detaching it. Used so that dropping a `PollerMap` (or losing the
/// last handle to a `Poller`) cannot leak a live worker task.
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T: Send + 'static> CancelableJoinHandle<T> {
    pub fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(Result::unwrap)
    }
}

/// A stop flag the worker loop polls between ticks, paired with a
/// `Notify`-based completion signal so `stop_if_empty` callers can await
/// actual worker termination instead of polling for it.
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    done: AtomicBool,
    done_notify: Notify,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Called by the worker exactly once, after it has left its loop.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.done_notify.notify_waiters();
    }

    /// Waits until `mark_done` has been called. Safe to call concurrently
    /// and repeatedly, and safe even if `mark_done` already ran.
    pub async fn wait_done(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let notified = self.done_notify.notified();
        if self.done.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delayed_init_allows_single_reader() {
        let (tx, rx) = DelayedInit::<u8>::new();
        tx.init(1);
        assert_eq!(rx.get().await, Ok(1));
    }

    #[tokio::test]
    async fn delayed_init_memoizes_after_ready() {
        let (tx, rx) = DelayedInit::<u8>::new();
        tx.init(7);
        assert_eq!(rx.get().await, Ok(7));
        assert_eq!(rx.get().await, Ok(7));
    }

    #[tokio::test]
    async fn delayed_init_reports_dropped_initializer() {
        let (tx, rx) = DelayedInit::<u8>::new();
        drop(tx);
        assert_eq!(rx.get().await, Err(InitDropped));
    }

    #[tokio::test]
    async fn stop_signal_wait_done_after_mark() {
        let sig = StopSignal::new();
        sig.mark_done();
        sig.wait_done().await; // must not hang
    }

    #[tokio::test]
    async fn stop_signal_wait_done_before_mark() {
        let sig = std::sync::Arc::new(StopSignal::new());
        let sig2 = sig.clone();
        let waiter = tokio::spawn(async move { sig2.wait_done().await });
        tokio::task::yield_now().await;
        sig.mark_done();
        waiter.await.unwrap();
    }
}
