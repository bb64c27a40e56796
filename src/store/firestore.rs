//! [`Port`] implementation over the Firestore REST API.
//!
//! The REST API has no push channel, so [`Gateway::subscribe()`] polls the document and emits a
//! snapshot whenever its `updateTime` changes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use firestore_rest::{Database, Document, DocumentPath, Fields, Patch, Value};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{gis::Coordinate, time};

use super::{
    DocumentSnapshot, DocumentUpdate, DriverDocument, DriverId, LocationComponent, Port,
    RawLocation, RideStatus, StoreError, Subscription, COLLECTION,
};

/// Concrete implementation of [`Port`] backed by Firestore.
#[derive(Clone)]
pub struct Gateway {
    http_client: reqwest::Client,
    database: Database,
    bearer_token: Option<SecretString>,
    poll_interval: Duration,
    time: Arc<dyn time::Port>,
}

impl Gateway {
    /// Construct a new [`Gateway`]. `poll_interval` is how often subscriptions re-read the
    /// document.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        database: Database,
        bearer_token: Option<SecretString>,
        poll_interval: Duration,
        time: Arc<dyn time::Port>,
    ) -> Self {
        Self {
            http_client,
            database,
            bearer_token,
            poll_interval,
            time,
        }
    }

    fn bearer_token(&self) -> Option<&str> {
        self.bearer_token
            .as_ref()
            .map(|token| token.expose_secret().as_str())
    }

    async fn fetch(&self, key: &DriverId) -> Result<Option<Document>, StoreError> {
        Ok(firestore_rest::get_document(
            &self.http_client,
            &self.database,
            self.bearer_token(),
            &DocumentPath::new(COLLECTION, key.as_ref()),
        )
        .await?)
    }

    async fn poll_document(
        &self,
        key: DriverId,
        sender: mpsc::Sender<Result<DocumentSnapshot, StoreError>>,
    ) {
        // `None` until the first read; then the `updateTime` of the last emitted snapshot, also
        // `None` once the document is observed to be missing.
        let mut last_seen: Option<Option<String>> = None;
        loop {
            let item = match self.fetch(&key).await {
                Ok(document) => {
                    let update_time = document
                        .as_ref()
                        .map(|document| document.update_time.clone().unwrap_or_default());
                    if last_seen.as_ref() == Some(&update_time) {
                        None
                    } else {
                        last_seen = Some(update_time);
                        Some(
                            document
                                .map(|document| decode_document(&key, &document.fields))
                                .transpose()
                                .map(|document| DocumentSnapshot {
                                    key: key.clone(),
                                    document,
                                }),
                        )
                    }
                }
                Err(error) => Some(Err(error)),
            };

            if let Some(item) = item {
                if sender.send(item).await.is_err() {
                    tracing::debug!("Subscription to {} dropped", key);
                    break;
                }
            }
            self.time.async_sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Port for Gateway {
    async fn get(&self, key: &DriverId) -> Result<Option<DriverDocument>, StoreError> {
        self.fetch(key)
            .await?
            .map(|document| decode_document(key, &document.fields))
            .transpose()
    }

    async fn create(&self, key: &DriverId, document: &DriverDocument) -> Result<(), StoreError> {
        firestore_rest::create_document(
            &self.http_client,
            &self.database,
            self.bearer_token(),
            COLLECTION,
            key.as_ref(),
            &encode_document(document),
        )
        .await
        .map_err(|error| match error {
            firestore_rest::Error::AlreadyExists => StoreError::AlreadyExists(key.clone()),
            error => StoreError::Firestore(error),
        })?;
        Ok(())
    }

    async fn update(&self, key: &DriverId, update: &DocumentUpdate) -> Result<(), StoreError> {
        firestore_rest::patch_document(
            &self.http_client,
            &self.database,
            self.bearer_token(),
            &DocumentPath::new(COLLECTION, key.as_ref()),
            &encode_update(update),
        )
        .await
        .map_err(|error| match error {
            firestore_rest::Error::NotFound => StoreError::NotFound(key.clone()),
            error => StoreError::Firestore(error),
        })?;
        Ok(())
    }

    fn subscribe(&self, key: &DriverId) -> Subscription {
        let (sender, receiver) = mpsc::channel(4);
        let gateway = self.clone();
        let key = key.clone();
        let task = tokio::spawn(async move { gateway.poll_document(key, sender).await });
        Subscription::with_task(ReceiverStream::new(receiver), task)
    }
}

fn decode_string(fields: &Fields, name: &str) -> String {
    fields
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn decode_component(value: &Value) -> Option<LocationComponent> {
    match value {
        Value::StringValue(text) => Some(LocationComponent::Text(text.clone())),
        value => value.as_f64().map(LocationComponent::Number),
    }
}

/// Locations are stored as `{latitude, longitude}` maps, `[latitude, longitude]` arrays or geo
/// points, with either numeric or textual components.
fn decode_location(value: &Value) -> Option<RawLocation> {
    if let Value::GeoPointValue(point) = value {
        return Some(Coordinate::new(point.latitude, point.longitude).into());
    }
    let (latitude, longitude) = if let Some(fields) = value.as_map() {
        (fields.get("latitude")?, fields.get("longitude")?)
    } else {
        match value.as_array()? {
            [latitude, longitude] => (latitude, longitude),
            _ => return None,
        }
    };
    Some(RawLocation {
        latitude: decode_component(latitude)?,
        longitude: decode_component(longitude)?,
    })
}

fn decode_document(key: &DriverId, fields: &Fields) -> Result<DriverDocument, StoreError> {
    let status = match fields.get("status") {
        None | Some(Value::NullValue(())) => RideStatus::Free,
        Some(value) => RideStatus::from_store(value.as_str().ok_or_else(|| StoreError::Decode {
            key: key.clone(),
            message: format!("status is not a string: {:?}", value),
        })?),
    };

    let driver_location = fields.get("driverLocation").and_then(|value| {
        let location = decode_location(value).map(|location| location.parse());
        match location {
            Some(Ok(coordinate)) => coordinate,
            Some(Err(error)) => {
                tracing::warn!("Ignoring invalid driverLocation of {}: {}", key, error);
                None
            }
            None => {
                tracing::warn!("Ignoring malformed driverLocation of {}: {:?}", key, value);
                None
            }
        }
    });

    let patient_location = fields.get("patientLocation").and_then(|value| {
        let location = decode_location(value);
        if location.is_none() {
            tracing::warn!("Ignoring malformed patientLocation of {}: {:?}", key, value);
        }
        location
    });

    Ok(DriverDocument {
        status,
        driver_location,
        patient_location,
        driver_name: decode_string(fields, "driverName"),
        make: decode_string(fields, "make"),
        number_plate: decode_string(fields, "numberPlate"),
    })
}

fn encode_coordinate(coordinate: &Coordinate) -> Value {
    let mut fields = Fields::new();
    fields.insert(
        "latitude".to_string(),
        Value::DoubleValue(coordinate.latitude),
    );
    fields.insert(
        "longitude".to_string(),
        Value::DoubleValue(coordinate.longitude),
    );
    Value::map(fields)
}

fn encode_component(component: &LocationComponent) -> Value {
    match component {
        LocationComponent::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
            Value::integer(*value as i64)
        }
        LocationComponent::Number(value) => Value::DoubleValue(*value),
        LocationComponent::Text(text) => Value::string(text.clone()),
    }
}

fn encode_location(location: &RawLocation) -> Value {
    Value::array(vec![
        encode_component(&location.latitude),
        encode_component(&location.longitude),
    ])
}

fn encode_document(document: &DriverDocument) -> Fields {
    let mut fields = Fields::new();
    fields.insert("status".to_string(), Value::string(document.status.as_str()));
    fields.insert(
        "driverName".to_string(),
        Value::string(document.driver_name.clone()),
    );
    fields.insert("make".to_string(), Value::string(document.make.clone()));
    fields.insert(
        "numberPlate".to_string(),
        Value::string(document.number_plate.clone()),
    );
    if let Some(driver_location) = &document.driver_location {
        fields.insert(
            "driverLocation".to_string(),
            encode_coordinate(driver_location),
        );
    }
    if let Some(patient_location) = &document.patient_location {
        fields.insert(
            "patientLocation".to_string(),
            encode_location(patient_location),
        );
    }
    fields
}

fn encode_update(update: &DocumentUpdate) -> Patch {
    let mut patch = Patch {
        must_exist: true,
        ..Patch::default()
    };
    if let Some(status) = update.status {
        patch
            .fields
            .insert("status".to_string(), Value::string(status.as_str()));
        patch.field_paths.push("status".to_string());
    }
    if let Some(driver_location) = &update.driver_location {
        patch.fields.insert(
            "driverLocation".to_string(),
            encode_coordinate(driver_location),
        );
        patch.field_paths.push("driverLocation".to_string());
    }
    if let Some(patient_location) = &update.patient_location {
        patch.fields.insert(
            "patientLocation".to_string(),
            encode_location(patient_location),
        );
        patch.field_paths.push("patientLocation".to_string());
    }
    patch
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use firestore_rest::Database;
    use futures::StreamExt;
    use secrecy::SecretString;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use crate::{
        gis::Coordinate,
        store::{
            DocumentUpdate, DriverDocument, DriverId, DriverProfile, Port, RideStatus, StoreError,
        },
        time,
    };

    use super::{encode_document, Gateway};

    const DOCUMENT_PATH: &str =
        "/v1/projects/dispatch/databases/(default)/documents/ambulances/driver-1";

    fn gateway(server: &MockServer) -> Gateway {
        Gateway::new(
            reqwest::Client::new(),
            Database {
                base_url: server.uri(),
                ..Database::new("dispatch")
            },
            Some(SecretString::new("token".to_string())),
            Duration::from_millis(10),
            Arc::new(time::Gateway),
        )
    }

    fn busy_document(update_time: &str) -> serde_json::Value {
        serde_json::json!({
            "name": "projects/dispatch/databases/(default)/documents/ambulances/driver-1",
            "fields": {
                "status": { "stringValue": "busy" },
                "driverName": { "stringValue": "Ahmed Raza" },
                "make": { "stringValue": "Toyota Hiace" },
                "numberPlate": { "stringValue": "ICT-4521" },
                "driverLocation": { "mapValue": { "fields": {
                    "latitude": { "doubleValue": 33.6844 },
                    "longitude": { "doubleValue": 73.0479 },
                } } },
                "patientLocation": { "mapValue": { "fields": {
                    "latitude": { "stringValue": "33.7001" },
                    "longitude": { "stringValue": "73.0612" },
                } } },
            },
            "createTime": "2024-09-01T10:00:00.000000Z",
            "updateTime": update_time,
        })
    }

    #[tokio::test]
    async fn test_get_decodes_document() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path(DOCUMENT_PATH))
            .and(matchers::header("authorization", "Bearer token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(busy_document("2024-09-01T10:05:00.000000Z")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let document = gateway(&server)
            .get(&DriverId::new("driver-1"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(RideStatus::Busy, document.status);
        assert_eq!("Ahmed Raza", document.driver_name);
        assert_eq!("ICT-4521", document.number_plate);
        assert_eq!(
            Some(Coordinate::new(33.6844, 73.0479)),
            document.driver_location
        );
        assert_eq!(
            Ok(Some(Coordinate::new(33.7001, 73.0612))),
            document.patient_target()
        );
    }

    #[tokio::test]
    async fn test_get_decodes_cleared_patient_location() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path(DOCUMENT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "projects/dispatch/databases/(default)/documents/ambulances/driver-1",
                "fields": {
                    "status": { "stringValue": "free" },
                    "patientLocation": { "arrayValue": { "values": [
                        { "integerValue": "0" },
                        { "integerValue": "0" },
                    ] } },
                },
                "updateTime": "2024-09-01T10:05:00.000000Z",
            })))
            .mount(&server)
            .await;

        let document = gateway(&server)
            .get(&DriverId::new("driver-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(RideStatus::Free, document.status);
        assert!(document.patient_location.is_some());
        assert_eq!(Ok(None), document.patient_target());
    }

    #[tokio::test]
    async fn test_update_driver_location() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .and(matchers::path(DOCUMENT_PATH))
            .and(matchers::query_param("updateMask.fieldPaths", "driverLocation"))
            .and(matchers::query_param("currentDocument.exists", "true"))
            .and(matchers::body_json(serde_json::json!({
                "fields": { "driverLocation": { "mapValue": { "fields": {
                    "latitude": { "doubleValue": 33.6844 },
                    "longitude": { "doubleValue": 73.0479 },
                } } } }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(busy_document("2024-09-01T10:06:00.000000Z")),
            )
            .expect(1)
            .mount(&server)
            .await;

        gateway(&server)
            .update(
                &DriverId::new("driver-1"),
                &DocumentUpdate::driver_location(Coordinate::new(33.6844, 73.0479)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_ride_clears_patient_location() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .and(matchers::path(DOCUMENT_PATH))
            .and(matchers::body_json(serde_json::json!({
                "fields": {
                    "status": { "stringValue": "free" },
                    "patientLocation": { "arrayValue": { "values": [
                        { "integerValue": "0" },
                        { "integerValue": "0" },
                    ] } },
                }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(busy_document("2024-09-01T10:07:00.000000Z")),
            )
            .expect(1)
            .mount(&server)
            .await;

        gateway(&server)
            .update(&DriverId::new("driver-1"), &DocumentUpdate::complete_ride())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "code": 404, "message": "No document to update", "status": "NOT_FOUND" }
            })))
            .mount(&server)
            .await;

        let error = gateway(&server)
            .update(&DriverId::new("driver-1"), &DocumentUpdate::complete_ride())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_emits_once_per_update_time() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path(DOCUMENT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(busy_document("2024-09-01T10:05:00.000000Z")),
            )
            .mount(&server)
            .await;

        let mut subscription = gateway(&server).subscribe(&DriverId::new("driver-1"));
        let first = subscription.next().await.unwrap().unwrap();
        assert_eq!(
            Some(RideStatus::Busy),
            first.document.map(|document| document.status)
        );

        // The document does not change, so polling should not produce another snapshot.
        let second = tokio::time::timeout(Duration::from_millis(100), subscription.next()).await;
        assert!(second.is_err());
    }

    #[test]
    fn test_encode_new_driver_document() {
        let document = DriverDocument::from_profile(&DriverProfile {
            driver_name: "Ahmed Raza".to_string(),
            make: "Toyota Hiace".to_string(),
            number_plate: "ICT-4521".to_string(),
        });
        insta::assert_json_snapshot!(encode_document(&document), @r###"
        {
          "driverName": {
            "stringValue": "Ahmed Raza"
          },
          "make": {
            "stringValue": "Toyota Hiace"
          },
          "numberPlate": {
            "stringValue": "ICT-4521"
          },
          "patientLocation": {
            "arrayValue": {
              "values": [
                {
                  "stringValue": "0"
                },
                {
                  "stringValue": "0"
                }
              ]
            }
          },
          "status": {
            "stringValue": "free"
          }
        }
        "###);
    }
}
