//! Ownership of a running subscription.
//!
//! An [`ActiveStream`] bundles the subscription handle, the reader task that
//! drains its batches, and a [`StreamGuard`] the reader checks before touching
//! the store. Shutting a stream down flips the guard first, so a batch already
//! in flight when `stop()` runs is discarded instead of applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use casefeed_core::{Disposable, Error, SubscriptionHandle};
use tokio::task::JoinHandle;

/// Shared "still subscribed" flag for one stream.
#[derive(Debug, Clone)]
pub struct StreamGuard(Arc<AtomicBool>);

impl StreamGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription together with the task reading it.
#[derive(Debug)]
pub struct ActiveStream {
    name: String,
    handle: SubscriptionHandle,
    guard: StreamGuard,
    reader: Option<JoinHandle<()>>,
}

impl ActiveStream {
    pub fn new(
        name: impl Into<String>, handle: SubscriptionHandle, guard: StreamGuard, reader: JoinHandle<()>,
    ) -> Self {
        Self { name: name.into(), handle, guard, reader: Some(reader) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel, close and stop reading, logging a failed close.
    pub fn shutdown(mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(stream = %self.name, error = %e, "failed to close subscription");
        }
    }
}

impl Disposable for ActiveStream {
    fn dispose(&mut self) -> Result<(), Error> {
        self.guard.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.handle.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casefeed_core::CloseSubscription;

    struct FailingCloser;

    impl CloseSubscription for FailingCloser {
        fn close(&self) -> Result<(), Error> {
            Err(Error::Dispose("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_dispose_cancels_guard_and_reader() {
        let guard = StreamGuard::new();
        let reader = tokio::spawn(std::future::pending::<()>());
        let handle = SubscriptionHandle::new("cases#1", Box::new(FailingCloser));
        let mut stream = ActiveStream::new("cases:search", handle, guard.clone(), reader);

        assert!(stream.dispose().is_err());
        assert!(!guard.is_active());
        // second dispose is a no-op on the closed handle
        assert!(stream.dispose().is_ok());
    }
}
