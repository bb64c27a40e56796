//! An in-process document store, for running without a backend.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{
    DocumentSnapshot, DocumentUpdate, DriverDocument, DriverId, Port, StoreError, Subscription,
};

/// In-memory implementation of [`Port`]. Each document is held in a [`watch`] channel so that
/// subscribers observe every write.
#[derive(Default)]
pub struct Gateway {
    documents: Mutex<HashMap<DriverId, watch::Sender<Option<DriverDocument>>>>,
}

impl Gateway {
    /// Construct an empty [`Gateway`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a [`Gateway`] holding one document.
    #[must_use]
    pub fn with_document(key: DriverId, document: DriverDocument) -> Self {
        let gateway = Self::new();
        gateway.with_channel(&key, |sender| {
            sender.send_replace(Some(document));
        });
        gateway
    }

    /// Overwrite a document, as the dispatcher would.
    pub fn put(&self, key: &DriverId, document: DriverDocument) {
        self.with_channel(key, |sender| {
            sender.send_replace(Some(document));
        });
    }

    fn with_channel<R>(
        &self,
        key: &DriverId,
        f: impl FnOnce(&watch::Sender<Option<DriverDocument>>) -> R,
    ) -> R {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = documents
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0);
        f(sender)
    }
}

#[async_trait]
impl Port for Gateway {
    async fn get(&self, key: &DriverId) -> Result<Option<DriverDocument>, StoreError> {
        Ok(self.with_channel(key, |sender| sender.borrow().clone()))
    }

    async fn create(&self, key: &DriverId, document: &DriverDocument) -> Result<(), StoreError> {
        self.with_channel(key, |sender| {
            if sender.borrow().is_some() {
                return Err(StoreError::AlreadyExists(key.clone()));
            }
            sender.send_replace(Some(document.clone()));
            Ok(())
        })
    }

    async fn update(&self, key: &DriverId, update: &DocumentUpdate) -> Result<(), StoreError> {
        self.with_channel(key, |sender| {
            if sender.borrow().is_none() {
                return Err(StoreError::NotFound(key.clone()));
            }
            sender.send_modify(|document| {
                if let Some(document) = document {
                    update.apply(document);
                }
            });
            Ok(())
        })
    }

    fn subscribe(&self, key: &DriverId) -> Subscription {
        let receiver = self.with_channel(key, watch::Sender::subscribe);
        let key = key.clone();
        Subscription::new(WatchStream::new(receiver).map(move |document| {
            Ok(DocumentSnapshot {
                key: key.clone(),
                document,
            })
        }))
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;

    use crate::{
        gis::Coordinate,
        store::{DocumentUpdate, DriverDocument, DriverId, Port, RideStatus, StoreError},
    };

    use super::Gateway;

    fn driver_id() -> DriverId {
        DriverId::new("driver-1")
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = Gateway::new();
        let error = store
            .update(&driver_id(), &DocumentUpdate::complete_ride())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_existing_document() {
        let store = Gateway::with_document(driver_id(), DriverDocument::default());
        let error = store
            .create(&driver_id(), &DriverDocument::default())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_subscribe_observes_writes() {
        let store = Gateway::new();
        let mut subscription = store.subscribe(&driver_id());

        let initial = subscription.next().await.unwrap().unwrap();
        assert_eq!(None, initial.document);

        store
            .create(&driver_id(), &DriverDocument::default())
            .await
            .unwrap();
        let created = subscription.next().await.unwrap().unwrap();
        assert_eq!(Some(RideStatus::Free), created.document.map(|d| d.status));

        let location = Coordinate::new(33.6844, 73.0479);
        store
            .update(&driver_id(), &DocumentUpdate::driver_location(location))
            .await
            .unwrap();
        let updated = subscription.next().await.unwrap().unwrap();
        assert_eq!(
            Some(location),
            updated.document.and_then(|d| d.driver_location)
        );
        assert_eq!(
            Some(location),
            store
                .get(&driver_id())
                .await
                .unwrap()
                .and_then(|d| d.driver_location)
        );
    }
}
