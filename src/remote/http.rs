//! HTTP remote store and passage lookup.
//!
//! JSON over HTTP. Every request carries the configured timeout. Transport
//! failures, timeouts and gateway errors are classified as
//! `Error::Connectivity`; other non-success statuses as `Error::Remote`.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Item, ItemKey, Progress, ReviewEvent};

use super::{
    BatchRequest, BatchResponse, LookupRequest, LookupResponse, PassageLookup, RemoteProgress,
    RemoteStore,
};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the remote replica.
pub struct HttpRemote {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRemote {
    /// Create a client for `endpoint` (trailing slashes are ignored).
    #[must_use]
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.timeout(self.timeout);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and turn transport and status failures into errors.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .prepare(request)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| Error::Remote(format!("failed to parse response: {e}")))
    }

    /// Like [`Self::json`], but a 404 is `Ok(None)`.
    async fn json_optional<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = self
            .prepare(request)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| Error::Remote(format!("failed to parse response: {e}")))
    }
}

fn classify_status(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => Error::Connectivity(format!("remote returned {status}")),
        _ => Error::Remote(format!("remote returned {status}: {body}")),
    }
}

#[derive(Debug, Serialize)]
struct UpsertBody<'a> {
    item: &'a Item,
    progress: &'a Progress,
}

#[derive(Debug, Serialize)]
struct ReviewBody<'a> {
    item: &'a ItemKey,
    event: &'a ReviewEvent,
}

#[derive(Debug, Deserialize)]
struct DuplicateBody {
    existing_progress: Progress,
}

#[derive(Debug, Deserialize)]
struct ValidationBody {
    #[serde(default)]
    message: Option<String>,
}

impl RemoteStore for HttpRemote {
    async fn is_available(&self) -> bool {
        let request = self.client.get(self.url("/health"));
        match self.send(request).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Remote unavailable");
                false
            }
        }
    }

    async fn pull_progress_since(&self, owner_id: &str, since: i64) -> Result<Vec<RemoteProgress>> {
        let request = self
            .client
            .get(self.url(&format!("/owners/{owner_id}/progress")))
            .query(&[("since", since.to_string())]);
        self.json(request).await
    }

    async fn find_progress(&self, owner_id: &str, item: &ItemKey) -> Result<Option<RemoteProgress>> {
        let request = self
            .client
            .get(self.url(&format!("/owners/{owner_id}/progress/find")))
            .query(&[
                ("reference", item.canonical_reference.as_str()),
                ("translation", item.source_translation.as_str()),
            ]);
        self.json_optional(request).await
    }

    async fn fetch_item(&self, item: &ItemKey) -> Result<Option<Item>> {
        let request = self.client.get(self.url("/items")).query(&[
            ("reference", item.canonical_reference.as_str()),
            ("translation", item.source_translation.as_str()),
        ]);
        self.json_optional(request).await
    }

    async fn upsert_progress(&self, owner_id: &str, item: &Item, progress: &Progress) -> Result<RemoteProgress> {
        let request = self
            .client
            .put(self.url(&format!("/owners/{owner_id}/progress")))
            .json(&UpsertBody { item, progress });
        self.json(request).await
    }

    async fn review_events_between(
        &self,
        owner_id: &str,
        item: &ItemKey,
        from: i64,
        to: i64,
    ) -> Result<Vec<ReviewEvent>> {
        let request = self
            .client
            .get(self.url(&format!("/owners/{owner_id}/reviews")))
            .query(&[
                ("reference", item.canonical_reference.clone()),
                ("translation", item.source_translation.clone()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ]);
        self.json(request).await
    }

    async fn insert_review_event(&self, owner_id: &str, item: &ItemKey, event: &ReviewEvent) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("/owners/{owner_id}/reviews")))
            .json(&ReviewBody { item, event });
        self.send(request).await?;
        Ok(())
    }

    async fn execute_batch(&self, request: &BatchRequest) -> Result<BatchResponse> {
        debug!(batch_id = %request.batch_id, operations = request.operations.len(), "Sending batch");
        let builder = self.client.post(self.url("/batch")).json(request);
        self.json(builder).await
    }
}

impl PassageLookup for HttpRemote {
    async fn lookup(&self, request: &LookupRequest) -> Result<LookupResponse> {
        let response = self
            .prepare(self.client.post(self.url("/passages/lookup")).json(request))
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("lookup failed: {e}")))?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| Error::Remote(format!("failed to parse lookup response: {e}"))),
            StatusCode::CONFLICT => {
                let body: DuplicateBody = response
                    .json()
                    .await
                    .map_err(|e| Error::Remote(format!("failed to parse duplicate response: {e}")))?;
                Err(Error::Duplicate {
                    existing: Box::new(body.existing_progress),
                    on_remote: true,
                })
            }
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                let body: ValidationBody = response.json().await.unwrap_or(ValidationBody { message: None });
                Err(Error::Validation {
                    reference: request.reference.clone(),
                    message: body
                        .message
                        .unwrap_or_else(|| "not a recognized passage".to_string()),
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_status(status, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trailing_slash() {
        let remote = HttpRemote::new("http://localhost:8080/api/", None, DEFAULT_TIMEOUT);
        assert_eq!(remote.url("/health"), "http://localhost:8080/api/health");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_connectivity());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_connectivity());
        assert!(!classify_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).is_connectivity());
    }

    #[tokio::test]
    async fn test_unreachable_is_connectivity() {
        // Port 9 (discard) on localhost is not an HTTP server
        let remote = HttpRemote::new("http://127.0.0.1:9", None, Duration::from_millis(500));
        assert!(!remote.is_available().await);

        let err = remote
            .pull_progress_since("owner", 0)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }
}
