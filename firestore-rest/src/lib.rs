//! A small client for the Firestore REST document API.
//!
//! Only the calls needed to read, create and partially update single documents are
//! implemented. See <https://firebase.google.com/docs/firestore/reference/rest>.

use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Default host of the Firestore REST API.
pub const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com";

/// The fields of a document (or of a map value), keyed by field name.
pub type Fields = BTreeMap<String, Value>;

/// A typed Firestore value, encoded the way the REST API expects it, e.g.
/// `{"stringValue": "busy"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    NullValue(()),
    BooleanValue(bool),
    /// The REST API transports 64 bit integers as decimal strings.
    IntegerValue(String),
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
    MapValue(MapValue),
    ArrayValue(ArrayValue),
    GeoPointValue(LatLng),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

impl Value {
    pub fn integer(value: i64) -> Self {
        Self::IntegerValue(value.to_string())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::StringValue(value.into())
    }

    pub fn map(fields: Fields) -> Self {
        Self::MapValue(MapValue { fields })
    }

    pub fn array(values: Vec<Value>) -> Self {
        Self::ArrayValue(ArrayValue { values })
    }

    /// Numeric value of an integer or double, `None` for every other kind.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::DoubleValue(value) => Some(*value),
            Value::IntegerValue(value) => value.parse::<i64>().ok().map(|value| value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::StringValue(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::MapValue(map) => Some(&map.fields),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::ArrayValue(array) => Some(&array.values),
            _ => None,
        }
    }
}

/// A document as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name, `projects/{p}/databases/{d}/documents/{collection}/{id}`.
    pub name: String,
    #[serde(default)]
    pub fields: Fields,
    /// Changes every time the document is written, used to detect changes while polling.
    pub update_time: Option<String>,
}

/// Identifies a database within a project.
#[derive(Debug, Clone)]
pub struct Database {
    pub base_url: String,
    pub project_id: String,
    pub database_id: String,
}

impl Database {
    /// The `(default)` database of `project_id` on the public API host.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
        }
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/{}/documents",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            self.database_id
        )
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.documents_url(), collection)
    }

    fn document_url(&self, path: &DocumentPath) -> String {
        format!(
            "{}/{}/{}",
            self.documents_url(),
            path.collection,
            path.document_id
        )
    }
}

/// Path of a document in a top level collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPath {
    pub collection: String,
    pub document_id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

/// A partial update of a document.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    /// New values of the fields named in `field_paths`.
    pub fields: Fields,
    /// Fields to overwrite. Fields listed here but missing from `fields` are deleted.
    pub field_paths: Vec<String>,
    /// Fail with [`Error::NotFound`] instead of creating the document.
    pub must_exist: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error deserializing document")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error performing http request")]
    Reqwest(#[from] reqwest::Error),
    #[error("Document not found")]
    NotFound,
    #[error("Document already exists")]
    AlreadyExists,
    #[error("Firestore responded with status {status}: {message}")]
    Status { status: StatusCode, message: String },
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    fields: &'a Fields,
}

fn authorize(request: reqwest::RequestBuilder, bearer_token: Option<&str>) -> reqwest::RequestBuilder {
    match bearer_token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn read_document(response: reqwest::Response) -> Result<Document, Error> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|response| response.error.message)
            .unwrap_or(body);
        return Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound,
            StatusCode::CONFLICT => Error::AlreadyExists,
            _ => Error::Status { status, message },
        });
    }
    Ok(serde_json::from_str(&body)?)
}

/// Read a document, `Ok(None)` if it does not exist.
pub async fn get_document(
    client: &reqwest::Client,
    database: &Database,
    bearer_token: Option<&str>,
    path: &DocumentPath,
) -> Result<Option<Document>, Error> {
    let url = database.document_url(path);
    tracing::trace!("GET {}", url);
    let response = authorize(client.get(url), bearer_token).send().await?;
    match read_document(response).await {
        Ok(document) => Ok(Some(document)),
        Err(Error::NotFound) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Create a new document with id `document_id` in `collection`.
pub async fn create_document(
    client: &reqwest::Client,
    database: &Database,
    bearer_token: Option<&str>,
    collection: &str,
    document_id: &str,
    fields: &Fields,
) -> Result<Document, Error> {
    let url = database.collection_url(collection);
    tracing::trace!("POST {} documentId={}", url, document_id);
    let request = client
        .post(url)
        .query(&[("documentId", document_id)])
        .json(&WriteBody { fields });
    read_document(authorize(request, bearer_token).send().await?).await
}

/// Apply a partial update to a document.
pub async fn patch_document(
    client: &reqwest::Client,
    database: &Database,
    bearer_token: Option<&str>,
    path: &DocumentPath,
    patch: &Patch,
) -> Result<Document, Error> {
    let url = database.document_url(path);
    tracing::trace!("PATCH {} fields {:?}", url, patch.field_paths);
    let mut query: Vec<(&str, &str)> = patch
        .field_paths
        .iter()
        .map(|field_path| ("updateMask.fieldPaths", field_path.as_str()))
        .collect();
    if patch.must_exist {
        query.push(("currentDocument.exists", "true"));
    }
    let request = client
        .patch(url)
        .query(&query)
        .json(&WriteBody {
            fields: &patch.fields,
        });
    read_document(authorize(request, bearer_token).send().await?).await
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use crate::{get_document, patch_document, Database, DocumentPath, Error, Fields, Patch, Value};

    fn database(server: &MockServer) -> Database {
        Database {
            base_url: server.uri(),
            ..Database::new("dispatch")
        }
    }

    #[test]
    fn test_serialize_values() {
        let mut location = Fields::new();
        location.insert("latitude".to_string(), Value::DoubleValue(33.5));
        location.insert("longitude".to_string(), Value::DoubleValue(73.25));

        let value = Value::array(vec![
            Value::integer(0),
            Value::string("0"),
            Value::map(location),
            Value::NullValue(()),
        ]);

        assert_eq!(
            serde_json::json!({
                "arrayValue": {
                    "values": [
                        { "integerValue": "0" },
                        { "stringValue": "0" },
                        { "mapValue": { "fields": {
                            "latitude": { "doubleValue": 33.5 },
                            "longitude": { "doubleValue": 73.25 },
                        } } },
                        { "nullValue": null },
                    ]
                }
            }),
            serde_json::to_value(&value).unwrap()
        );
    }

    #[test]
    fn test_deserialize_empty_containers() {
        let array: Value = serde_json::from_str(r#"{"arrayValue": {}}"#).unwrap();
        assert_eq!(Some(&[][..]), array.as_array());
        let map: Value = serde_json::from_str(r#"{"mapValue": {}}"#).unwrap();
        assert!(map.as_map().unwrap().is_empty());
    }

    #[test]
    fn test_numeric_values() {
        assert_eq!(Some(42.0), Value::integer(42).as_f64());
        assert_eq!(Some(1.5), Value::DoubleValue(1.5).as_f64());
        assert_eq!(None, Value::string("1.5").as_f64());
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path(
                "/v1/projects/dispatch/databases/(default)/documents/ambulances/missing",
            ))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "code": 404, "message": "Document not found", "status": "NOT_FOUND" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let document = get_document(
            &reqwest::Client::new(),
            &database(&server),
            None,
            &DocumentPath::new("ambulances", "missing"),
        )
        .await
        .unwrap();
        assert!(document.is_none());
    }

    #[tokio::test]
    async fn test_patch_document() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .and(matchers::path(
                "/v1/projects/dispatch/databases/(default)/documents/ambulances/driver-1",
            ))
            .and(matchers::query_param("updateMask.fieldPaths", "status"))
            .and(matchers::query_param("currentDocument.exists", "true"))
            .and(matchers::header("authorization", "Bearer token"))
            .and(matchers::body_json(serde_json::json!({
                "fields": { "status": { "stringValue": "free" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "projects/dispatch/databases/(default)/documents/ambulances/driver-1",
                "fields": { "status": { "stringValue": "free" } },
                "createTime": "2024-09-01T10:00:00.000000Z",
                "updateTime": "2024-09-01T10:05:00.000000Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = Fields::new();
        fields.insert("status".to_string(), Value::string("free"));
        let document = patch_document(
            &reqwest::Client::new(),
            &database(&server),
            Some("token"),
            &DocumentPath::new("ambulances", "driver-1"),
            &Patch {
                fields,
                field_paths: vec!["status".to_string()],
                must_exist: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            Some("free"),
            document.fields.get("status").and_then(Value::as_str)
        );
        assert_eq!(
            Some("2024-09-01T10:05:00.000000Z"),
            document.update_time.as_deref()
        );
    }

    #[tokio::test]
    async fn test_patch_rejected() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": { "code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED" }
            })))
            .mount(&server)
            .await;

        let error = patch_document(
            &reqwest::Client::new(),
            &database(&server),
            None,
            &DocumentPath::new("ambulances", "driver-1"),
            &Patch::default(),
        )
        .await
        .unwrap_err();

        match error {
            Error::Status { status, message } => {
                assert_eq!(403, status.as_u16());
                assert_eq!("Missing or insufficient permissions.", message);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
