//! REST adapter for the hosted backend.
//!
//! Routes:
//! - `GET    {base}/health`            reachability
//! - `GET    {base}/{type}`            full listing
//! - `POST   {base}/{type}`            create
//! - `PUT    {base}/{type}/{key}`      update
//! - `DELETE {base}/{type}/{key}`      delete
//!
//! Every mutation carries the operation id in an `Idempotency-Key` header so a
//! backend can drop a replay after an ambiguous failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RemoteBackend, RemoteError};
use crate::model::{Entity, EntityType, OperationKind, QueuedOperation};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Entity as listed by the backend.
#[derive(Debug, Deserialize)]
struct WireEntity {
    key: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    version: i64,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
}

/// Request body for create and update.
#[derive(Debug, Serialize)]
struct WireMutation<'a> {
    key: &'a str,
    payload: &'a serde_json::Value,
}

/// HTTP implementation of [`RemoteBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpBackend {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration, auth_token: Option<String>) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid base URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidResponse(format!(
                "base URL '{base_url}' cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            auth_token,
            timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        allow_not_found: bool,
    ) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() || (allow_not_found && status == reqwest::StatusCode::NOT_FOUND) {
            return Ok(response);
        }
        let reason = response
            .text()
            .await
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            reason,
        })
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn ping(&self) -> Result<(), RemoteError> {
        let response = self
            .request(reqwest::Method::GET, self.url(&["health"]))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        self.check_status(response, false).await.map(|_| ())
    }

    async fn fetch_all(&self, entity_type: EntityType) -> Result<Vec<Entity>, RemoteError> {
        let response = self
            .request(reqwest::Method::GET, self.url(&[entity_type.as_str()]))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let response = self.check_status(response, false).await?;
        let items: Vec<WireEntity> = response.json().await.map_err(|e| self.map_transport(e))?;
        debug!(entity_type = %entity_type, count = items.len(), "fetched remote entities");

        Ok(items
            .into_iter()
            .map(|w| Entity {
                entity_type,
                key: w.key,
                payload: w.payload,
                version: w.version,
                updated_at: w.updated_at,
            })
            .collect())
    }

    async fn apply(&self, op: &QueuedOperation) -> Result<(), RemoteError> {
        let type_name = op.entity_type.as_str();
        let body = WireMutation {
            key: &op.entity_key,
            payload: &op.payload,
        };
        let builder = match op.kind {
            OperationKind::Create => self
                .request(reqwest::Method::POST, self.url(&[type_name]))
                .json(&body),
            OperationKind::Update => self
                .request(reqwest::Method::PUT, self.url(&[type_name, &op.entity_key]))
                .json(&body),
            OperationKind::Delete => {
                self.request(reqwest::Method::DELETE, self.url(&[type_name, &op.entity_key]))
            }
        };

        let response = builder
            .header(IDEMPOTENCY_HEADER, &op.id)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        // Deleting something already gone is the outcome we wanted.
        self.check_status(response, op.kind == OperationKind::Delete)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(server: &mockito::Server) -> HttpBackend {
        HttpBackend::new(&server.url(), Duration::from_secs(2), Some("secret".into())).unwrap()
    }

    #[tokio::test]
    async fn ping_hits_health() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .create_async()
            .await;

        backend(&server).ping().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_all_decodes_entities() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/material")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"key": "M1", "payload": {"name": "Flour"}, "version": 3,
                     "updated_at": "2026-01-05T10:00:00Z"},
                    {"key": "M2", "payload": {"name": "Sugar"}}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let entities = backend(&server).fetch_all(EntityType::Material).await.unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].key, "M1");
        assert_eq!(entities[0].version, 3);
        assert_eq!(entities[1].entity_type, EntityType::Material);
        assert_eq!(entities[1].version, 0);
    }

    #[tokio::test]
    async fn update_puts_with_idempotency_key() {
        let mut server = mockito::Server::new_async().await;
        let op = QueuedOperation::new(
            OperationKind::Update,
            EntityType::Material,
            "M 1",
            json!({"name": "Flour", "qty": 15}),
        );
        let mock = server
            .mock("PUT", "/material/M%201")
            .match_header("idempotency-key", op.id.as_str())
            .match_body(mockito::Matcher::PartialJson(json!({"payload": {"qty": 15}})))
            .with_status(204)
            .create_async()
            .await;

        backend(&server).apply(&op).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejection_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/product")
            .with_status(422)
            .with_body("name already taken")
            .create_async()
            .await;

        let op = QueuedOperation::new(
            OperationKind::Create,
            EntityType::Product,
            "P1",
            json!({"name": "Bread"}),
        );
        let err = backend(&server).apply(&op).await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 422,
                reason: "name already taken".into()
            }
        );
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn delete_of_missing_entity_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/batch/B9")
            .with_status(404)
            .create_async()
            .await;

        let op = QueuedOperation::new(
            OperationKind::Delete,
            EntityType::Batch,
            "B9",
            serde_json::Value::Null,
        );
        backend(&server).apply(&op).await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_connectivity_error() {
        // Nothing listens on the discard port.
        let backend = HttpBackend::new("http://127.0.0.1:9", Duration::from_secs(1), None).unwrap();
        let err = backend.ping().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(HttpBackend::new("not a url", Duration::from_secs(1), None).is_err());
    }
}
