//! Remote shape subscription boundary.
//!
//! A shape is a filtered subset of a remote resource, synchronized as one unit.
//! The wire protocol lives behind [`ShapeSource`]; this module only fixes the
//! client-side contract:
//!
//! - `open` returns a [`Subscription`], which splits into a [`SubscriptionHandle`]
//!   (the single disposal path) and a [`BatchStream`] (an async channel of batches).
//! - Closing a handle is idempotent; after it returns no further batches are
//!   produced by the source for that subscription.

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::{ChangeBatch, Error, Predicate};

/// Whether a subscription starts with a snapshot of matching rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeMode {
    /// Initial snapshot followed by live changes.
    Full,
    /// Live changes only.
    ChangesOnly,
}

impl fmt::Display for ShapeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeMode::Full => f.write_str("full"),
            ShapeMode::ChangesOnly => f.write_str("changes_only"),
        }
    }
}

/// Parameters for opening a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub resource: String,
    pub predicate: Option<Predicate>,
    pub mode: ShapeMode,
}

impl ShapeRequest {
    pub fn full(resource: &str, predicate: Option<Predicate>) -> Self {
        Self { resource: resource.to_string(), predicate: predicate.filter(|p| !p.is_empty()), mode: ShapeMode::Full }
    }

    pub fn changes_only(resource: &str) -> Self {
        Self { resource: resource.to_string(), predicate: None, mode: ShapeMode::ChangesOnly }
    }

    /// Predicate string as sent over the wire, if any.
    pub fn where_clause(&self) -> Option<String> {
        self.predicate.as_ref().map(ToString::to_string)
    }

    /// Stable identifier for this request, used to name streams.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.resource.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.mode.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.where_clause().unwrap_or_default().as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Item yielded by a [`BatchStream`].
pub type BatchResult = Result<ChangeBatch, Error>;

/// Producer half of a subscription's batch channel.
pub type BatchSender = mpsc::UnboundedSender<BatchResult>;

/// Create the channel a source uses to deliver batches.
pub fn batch_channel() -> (BatchSender, BatchStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, BatchStream { rx })
}

/// Ordered stream of batches from one subscription.
#[derive(Debug)]
pub struct BatchStream {
    rx: mpsc::UnboundedReceiver<BatchResult>,
}

impl BatchStream {
    /// Next batch, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<BatchResult> {
        self.rx.recv().await
    }
}

/// Source-specific teardown for a subscription.
pub trait CloseSubscription: Send + Sync {
    fn close(&self) -> Result<(), Error>;
}

/// Owning handle used to dispose a subscription.
pub struct SubscriptionHandle {
    id: String,
    closer: Option<Box<dyn CloseSubscription>>,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>, closer: Box<dyn CloseSubscription>) -> Self {
        Self { id: id.into(), closer: Some(closer) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    /// Close the subscription. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.closer.take() {
            Some(closer) => closer.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An open subscription as returned by [`ShapeSource::open`].
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub stream: BatchStream,
}

impl Subscription {
    pub fn split(self) -> (SubscriptionHandle, BatchStream) {
        (self.handle, self.stream)
    }
}

/// Remote subscription protocol.
#[async_trait]
pub trait ShapeSource: Send + Sync {
    /// Open a subscription.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the subscription cannot be established.
    async fn open(&self, request: ShapeRequest) -> Result<Subscription, Error>;
}

/// Something holding a remote resource that must be released exactly once.
pub trait Disposable: Send {
    fn dispose(&mut self) -> Result<(), Error>;
}

impl Disposable for SubscriptionHandle {
    fn dispose(&mut self) -> Result<(), Error> {
        self.close()
    }
}
