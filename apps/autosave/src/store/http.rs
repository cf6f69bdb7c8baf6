//! HTTP client for the CV document API.
//!
//! `GET   {base}/api/v1/cvs/{id}`            → snapshot
//! `PATCH {base}/api/v1/cvs/{id}` `{field: value}` → snapshot
//!
//! Error bodies follow `{"error": {"code": ..., "message": ...}}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::cv::CvSnapshot;
use crate::store::{DocumentStore, StoreError};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        Self::new(&config.document_store_url, config.store_timeout)
    }

    fn document_url(&self, cv_id: Uuid) -> String {
        format!("{}/api/v1/cvs/{}", self.base_url, cv_id)
    }

    /// Sends the request built by `build`, retrying transport failures, 429
    /// and 5xx with exponential backoff. Other statuses are returned as-is.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // 200ms, 400ms
                let delay = Duration::from_millis(BACKOFF_BASE_MS * (1 << (attempt - 1)));
                warn!(
                    "Document store attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(StoreError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(StoreError::Api {
                    status: status.as_u16(),
                    message: extract_error_message(&body),
                });
                continue;
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or(StoreError::Api {
            status: 0,
            message: "no attempt was made".to_string(),
        }))
    }

    async fn read_snapshot(response: Response, cv_id: Uuid) -> Result<CvSnapshot, StoreError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(cv_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch(&self, cv_id: Uuid) -> Result<CvSnapshot, StoreError> {
        let url = self.document_url(cv_id);
        let response = self.send_with_retry(|| self.client.get(&url)).await?;
        let snapshot = Self::read_snapshot(response, cv_id).await?;
        debug!(cv_id = %cv_id, sections = snapshot.sections.len(), "Fetched CV snapshot");
        Ok(snapshot)
    }

    async fn patch(
        &self,
        cv_id: Uuid,
        field: &str,
        value: Value,
    ) -> Result<CvSnapshot, StoreError> {
        let url = self.document_url(cv_id);
        let body = patch_body(field, value);
        let response = self
            .send_with_retry(|| self.client.patch(&url).json(&body))
            .await?;
        let snapshot = Self::read_snapshot(response, cv_id).await?;
        debug!(cv_id = %cv_id, field, "Patched CV");
        Ok(snapshot)
    }
}

fn patch_body(field: &str, value: Value) -> Value {
    let mut body = Map::new();
    body.insert(field.to_string(), value);
    Value::Object(body)
}

/// Pulls `error.message` out of an API error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SNAPSHOT_BODY: &str = r#"{"id":"00000000-0000-0000-0000-000000000000","sections":{"summary":"Hi"},"updated_at":null}"#;

    fn api_error(message: &str) -> String {
        json!({ "error": { "code": "TEST", "message": message } }).to_string()
    }

    /// Answers one connection per scripted response, then stops listening.
    /// Returns the base URL and a counter of requests served.
    async fn stub_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (format!("http://{addr}"), hits)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    fn client(base_url: &str) -> HttpDocumentStore {
        HttpDocumentStore::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_retries_rate_limit_and_server_error() {
        let (url, hits) = stub_server(vec![
            (429, api_error("slow down")),
            (503, api_error("maintenance")),
            (200, SNAPSHOT_BODY.to_string()),
        ])
        .await;

        let snapshot = client(&url).fetch(Uuid::nil()).await.unwrap();
        assert_eq!(snapshot.field("summary"), Some(&json!("Hi")));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_server_errors() {
        let (url, hits) = stub_server(vec![
            (500, api_error("database down")),
            (500, api_error("database down")),
            (500, api_error("database down")),
        ])
        .await;

        let err = client(&url)
            .patch(Uuid::nil(), "summary", json!("Hi"))
            .await
            .unwrap_err();
        match err {
            StoreError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "database down");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let (url, hits) = stub_server(vec![(404, String::new())]).await;
        let id = Uuid::new_v4();

        let err = client(&url).fetch(id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(missing) if missing == id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, hits) = stub_server(vec![(400, api_error("unknown field"))]).await;

        let err = client(&url)
            .patch(Uuid::nil(), "nickname", json!("Ada"))
            .await
            .unwrap_err();
        match err {
            StoreError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "unknown field");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_document_url_trims_trailing_slash() {
        let store = HttpDocumentStore::new("http://cv.local/", Duration::from_secs(5)).unwrap();
        let id = Uuid::nil();
        assert_eq!(
            store.document_url(id),
            "http://cv.local/api/v1/cvs/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_patch_body_is_single_field_object() {
        assert_eq!(
            patch_body("skills", json!([{ "id": "s1" }])),
            json!({ "skills": [{ "id": "s1" }] })
        );
    }

    #[test]
    fn test_extract_structured_error_message() {
        let body = r#"{"error": {"code": "VALIDATION_ERROR", "message": "field too large"}}"#;
        assert_eq!(extract_error_message(body), "field too large");
    }

    #[test]
    fn test_extract_error_message_falls_back_to_body() {
        assert_eq!(extract_error_message("Bad Gateway"), "Bad Gateway");
    }
}
