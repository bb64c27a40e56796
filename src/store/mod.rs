//! The remote document store holding each driver's ride state.
//! See [Port].

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};

mod document;
pub mod firestore;
pub mod memory;

pub use document::{
    DocumentSnapshot, DocumentUpdate, DriverDocument, DriverId, DriverProfile, InvalidLocation,
    LocationComponent, RawLocation, RideStatus,
};

/// Name of the collection holding driver documents.
pub const COLLECTION: &str = "ambulances";

/// Error returned by the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The driver's document does not exist.
    #[error("Driver document {0} not found")]
    NotFound(DriverId),
    /// Attempted to create a document that already exists.
    #[error("Driver document {0} already exists")]
    AlreadyExists(DriverId),
    /// The stored document could not be understood.
    #[error("Unable to decode driver document {key}: {message}")]
    Decode {
        /// Key of the document.
        key: DriverId,
        /// What was wrong with it.
        message: String,
    },
    /// The request to Firestore failed.
    #[error("Firestore request failed")]
    Firestore(#[from] firestore_rest::Error),
}

/// A stream of snapshots of one document. The first item is the state of the document at the
/// time of subscribing, after that an item is produced each time the document changes.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    stream: BoxStream<'static, Result<DocumentSnapshot, StoreError>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    /// A subscription backed directly by `stream`.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<DocumentSnapshot, StoreError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            task: None,
        }
    }

    /// A subscription fed by a background `task`, which is aborted when the subscription is
    /// dropped.
    pub fn with_task<S>(stream: S, task: tokio::task::JoinHandle<()>) -> Self
    where
        S: Stream<Item = Result<DocumentSnapshot, StoreError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            task: Some(task),
        }
    }
}

impl Stream for Subscription {
    type Item = Result<DocumentSnapshot, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Trait used to allow mocking the document store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Port: Send + Sync {
    /// Read the current state of a driver's document.
    async fn get(&self, key: &DriverId) -> Result<Option<DriverDocument>, StoreError>;
    /// Create a driver's document, failing with [`StoreError::AlreadyExists`] if it exists.
    async fn create(&self, key: &DriverId, document: &DriverDocument) -> Result<(), StoreError>;
    /// Apply a partial update, failing with [`StoreError::NotFound`] if the document does not
    /// exist.
    async fn update(&self, key: &DriverId, update: &DocumentUpdate) -> Result<(), StoreError>;
    /// Subscribe to changes of a driver's document.
    fn subscribe(&self, key: &DriverId) -> Subscription;
}
