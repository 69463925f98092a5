//! REST client for a Kubernetes-style declarative store.
//!
//! Paths follow `/apis/{group}/{version}[/namespaces/{ns}]/{plural}[/{name}][/status]`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error};

use super::{PatchTarget, ResourceKind, StateStore, StoreError};

const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP-backed [`StateStore`].
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    /// Create a client for the store at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self, kind: &ResourceKind) -> String {
        format!("{}/{}", self.base_url, kind.path())
    }

    fn record_url(&self, kind: &ResourceKind, name: &str) -> String {
        format!("{}/{}", self.collection_url(kind), name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map non-success responses onto [`StoreError`].
    async fn check(kind: &ResourceKind, name: &str, response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            StatusCode::CONFLICT if body.contains("AlreadyExists") => Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            StatusCode::CONFLICT => Err(StoreError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
                Err(StoreError::Unavailable(format!("{status}: {body}")))
            }
            _ => {
                error!(status = %status, body = %body, kind = %kind, name = %name, "Store request failed");
                Err(StoreError::Api {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl StateStore for HttpStore {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<Value>, StoreError> {
        let url = self.collection_url(kind);
        debug!(url = %url, "Listing records");

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check(kind, "", response).await?;

        let mut list: Value = response.json().await?;
        match list.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    async fn get(&self, kind: &ResourceKind, name: &str) -> Result<Option<Value>, StoreError> {
        let url = self.record_url(kind, name);

        let response = self.authorize(self.client.get(&url)).send().await?;
        match Self::check(kind, name, response).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, kind: &ResourceKind, object: Value) -> Result<Value, StoreError> {
        let url = self.collection_url(kind);
        let name = object
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(url = %url, name = %name, "Creating record");

        let response = self
            .authorize(self.client.post(&url).json(&object))
            .send()
            .await?;
        let response = Self::check(kind, &name, response).await?;

        Ok(response.json().await?)
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        patch: Value,
        target: PatchTarget,
    ) -> Result<Value, StoreError> {
        let url = match target {
            PatchTarget::Main => self.record_url(kind, name),
            PatchTarget::Status => format!("{}/status", self.record_url(kind, name)),
        };
        debug!(url = %url, "Patching record");

        let body = serde_json::to_vec(&patch)?;
        let response = self
            .authorize(
                self.client
                    .patch(&url)
                    .header(CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
                    .body(body),
            )
            .send()
            .await?;
        let response = Self::check(kind, name, response).await?;

        Ok(response.json().await?)
    }

    async fn delete(&self, kind: &ResourceKind, name: &str) -> Result<(), StoreError> {
        let url = self.record_url(kind, name);
        debug!(url = %url, "Deleting record");

        let response = self.authorize(self.client.delete(&url)).send().await?;
        Self::check(kind, name, response).await?;

        Ok(())
    }
}
