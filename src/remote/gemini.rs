//! Gemini File Search REST client.
//!
//! Talks to `{base_url}/v1beta` with the API key in the `x-goog-api-key`
//! header. Uploads use the two-step resumable protocol against
//! `{base_url}/upload/v1beta`.
//!
//! # Retry Strategy
//!
//! Idempotent calls (reads, deletes, generation) are retried with
//! exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - network errors → retry
//! - other 4xx → fail immediately
//!
//! Store creation and uploads are sent once.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    DocumentInfo, FileInfo, GenerateRequest, GenerateResponse, RemoteOperation, RemoteStore,
    StoreInfo,
};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

const API_VERSION: &str = "v1beta";
const PAGE_SIZE: &str = "100";

pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiClient {
    /// Builds a client, reading the API key from `config.api_key_env`.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} not set", config.api_key_env))?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &RemoteConfig, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_VERSION, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("x-goog-api-key", &self.api_key)
    }

    /// Sends `request`, retrying transient failures when `idempotent`.
    async fn send(&self, request: RequestBuilder, idempotent: bool) -> Result<Response, RemoteError> {
        let request = self.authed(request);
        let retries = if idempotent { self.max_retries } else { 0 };
        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ... capped at 32s
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let Some(attempt_request) = request.try_clone() else {
                return Err(RemoteError::Transport(
                    "request body cannot be replayed".to_string(),
                ));
            };

            let err = match attempt_request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => status_error(response).await,
                Err(e) => RemoteError::from(e),
            };

            if !err.is_retryable() || attempt == retries {
                return Err(err);
            }
            warn!(attempt = attempt + 1, error = %err, "Remote call failed, retrying");
            last_err = Some(err);
        }

        Err(last_err
            .unwrap_or_else(|| RemoteError::Transport("remote call failed after retries".into())))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self.send(self.http.get(self.api_url(path)), true).await?;
        Ok(response.json().await?)
    }

    /// Collects every page of a list call. `key` names the array field.
    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
    ) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(self.api_url(path))
                .query(&[("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let mut page: Value = self.send(request, true).await?.json().await?;
            if let Some(list) = page.get_mut(key).map(Value::take) {
                let batch: Vec<T> = serde_json::from_value(list)
                    .map_err(|e| RemoteError::Decode(e.to_string()))?;
                items.extend(batch);
            }

            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(String::from);
            if page_token.is_none() {
                return Ok(items);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for GeminiClient {
    async fn create_store(&self, display_name: &str) -> Result<StoreInfo, RemoteError> {
        let request = self
            .http
            .post(self.api_url("fileSearchStores"))
            .json(&json!({ "displayName": display_name }));
        Ok(self.send(request, false).await?.json().await?)
    }

    async fn list_stores(&self) -> Result<Vec<StoreInfo>, RemoteError> {
        self.list_all("fileSearchStores", "fileSearchStores").await
    }

    async fn get_store(&self, name: &str) -> Result<StoreInfo, RemoteError> {
        self.get_json(name).await
    }

    async fn delete_store(&self, name: &str, force: bool) -> Result<(), RemoteError> {
        let mut request = self.http.delete(self.api_url(name));
        if force {
            request = request.query(&[("force", "true")]);
        }
        self.send(request, true).await?;
        Ok(())
    }

    async fn upload_to_store(
        &self,
        store: &str,
        path: &Path,
        display_name: &str,
        mime_type: &str,
    ) -> Result<RemoteOperation, RemoteError> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len();

        let start_url = format!(
            "{}/upload/{}/{}:uploadToFileSearchStore",
            self.base_url, API_VERSION, store
        );
        let start = self
            .http
            .post(start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "displayName": display_name, "mimeType": mime_type }));
        let response = self.send(start, false).await?;

        let upload_url = response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| RemoteError::Decode("missing x-goog-upload-url header".into()))?;
        debug!(store, display_name, size, "Upload session opened");

        let finish = self
            .http
            .post(upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .body(bytes);
        Ok(self.send(finish, false).await?.json().await?)
    }

    async fn get_operation(&self, name: &str) -> Result<RemoteOperation, RemoteError> {
        self.get_json(name).await
    }

    async fn list_documents(&self, store: &str) -> Result<Vec<DocumentInfo>, RemoteError> {
        self.list_all(&format!("{}/documents", store), "documents")
            .await
    }

    async fn delete_document(&self, store: &str, document_id: &str) -> Result<(), RemoteError> {
        let url = self.api_url(&format!("{}/documents/{}", store, document_id));
        self.send(self.http.delete(url).query(&[("force", "true")]), true)
            .await?;
        Ok(())
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, RemoteError> {
        let model = request
            .model
            .strip_prefix("models/")
            .unwrap_or(request.model.as_str());
        let url = self.api_url(&format!("models/{}:generateContent", model));
        let body = generate_body(&request);

        let reply: Value = self
            .send(self.http.post(url).json(&body), true)
            .await?
            .json()
            .await?;
        Ok(parse_generate_response(&reply))
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, RemoteError> {
        self.list_all("files", "files").await
    }

    async fn get_file(&self, name: &str) -> Result<FileInfo, RemoteError> {
        self.get_json(name).await
    }
}

/// Turns a non-success response into [`RemoteError::Status`], preferring
/// the `error.message` field of Google's error body.
async fn status_error(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Status {
        status,
        message: error_message(&body),
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn generate_body(request: &GenerateRequest) -> Value {
    let mut parts: Vec<Value> = request
        .files
        .iter()
        .map(|f| json!({ "fileData": { "fileUri": f.uri, "mimeType": f.mime_type } }))
        .collect();
    parts.push(json!({ "text": request.prompt }));

    let mut body = json!({
        "systemInstruction": { "parts": [{ "text": request.system_instruction }] },
        "contents": [{ "role": "user", "parts": parts }],
    });

    if !request.store_names.is_empty() {
        let mut file_search = json!({ "fileSearchStoreNames": request.store_names });
        if let Some(filter) = &request.metadata_filter {
            file_search["metadataFilter"] = json!(filter);
        }
        body["tools"] = json!([{ "fileSearch": file_search }]);
    }
    body
}

fn parse_generate_response(reply: &Value) -> GenerateResponse {
    let candidate = reply.pointer("/candidates/0");
    let text = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();
    let grounding = candidate
        .and_then(|c| c.get("groundingMetadata"))
        .cloned();

    GenerateResponse { text, grounding }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FileRef;
    use axum::body::{to_bytes, Body};
    use axum::extract::{Request, State};
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::response::IntoResponse;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn error_message_prefers_google_envelope() {
        let body = r#"{"error":{"code":404,"message":"Store not found","status":"NOT_FOUND"}}"#;
        assert_eq!(error_message(body), "Store not found");
        assert_eq!(error_message("  plain text\n"), "plain text");
    }

    #[test]
    fn generate_body_with_store_and_filter() {
        let body = generate_body(&GenerateRequest {
            model: "gemini-2.5-flash".into(),
            system_instruction: "be brief".into(),
            prompt: "what?".into(),
            store_names: vec!["fileSearchStores/a".into()],
            metadata_filter: Some("author=\"x\"".into()),
            files: vec![],
        });
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "what?");
        assert_eq!(
            body["tools"][0]["fileSearch"]["fileSearchStoreNames"][0],
            "fileSearchStores/a"
        );
        assert_eq!(body["tools"][0]["fileSearch"]["metadataFilter"], "author=\"x\"");
    }

    #[test]
    fn generate_body_puts_files_before_prompt() {
        let body = generate_body(&GenerateRequest {
            prompt: "summarize".into(),
            files: vec![FileRef {
                uri: "https://example.invalid/files/a".into(),
                mime_type: "application/pdf".into(),
            }],
            ..Default::default()
        });
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["fileData"]["mimeType"], "application/pdf");
        assert_eq!(parts[1]["text"], "summarize");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn parse_concatenates_first_candidate_parts() {
        let reply = json!({
            "candidates": [
                {
                    "content": { "parts": [{ "text": "Hello, " }, { "text": "world" }] },
                    "groundingMetadata": { "groundingChunks": [] }
                },
                { "content": { "parts": [{ "text": "ignored" }] } }
            ]
        });
        let parsed = parse_generate_response(&reply);
        assert_eq!(parsed.text, "Hello, world");
        assert!(parsed.grounding.is_some());

        let empty = parse_generate_response(&json!({}));
        assert_eq!(empty.text, "");
        assert!(empty.grounding.is_none());
    }

    #[derive(Clone, Default)]
    struct Fake {
        addr: Arc<Mutex<String>>,
        operation_calls: Arc<AtomicUsize>,
        uploaded: Arc<Mutex<Vec<u8>>>,
        api_keys: Arc<Mutex<Vec<String>>>,
    }

    async fn fake_api(State(fake): State<Fake>, request: Request) -> axum::response::Response {
        let (parts, body) = request.into_parts();
        let headers: HeaderMap = parts.headers;
        if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
            fake.api_keys.lock().unwrap().push(key.to_string());
        }
        let path = parts.uri.path().to_string();

        match (parts.method, path.as_str()) {
            (Method::POST, "/upload/v1beta/fileSearchStores/s1:uploadToFileSearchStore") => {
                assert_eq!(headers["x-goog-upload-command"], "start");
                let url = format!("http://{}/resumable/1", fake.addr.lock().unwrap());
                ([("x-goog-upload-url", url)], "{}").into_response()
            }
            (Method::POST, "/resumable/1") => {
                assert_eq!(headers["x-goog-upload-command"], "upload, finalize");
                let bytes = to_bytes(body, usize::MAX).await.unwrap();
                *fake.uploaded.lock().unwrap() = bytes.to_vec();
                axum::Json(json!({ "name": "fileSearchStores/s1/upload/operations/op1" }))
                    .into_response()
            }
            (Method::GET, "/v1beta/fileSearchStores/s1/upload/operations/op1") => {
                if fake.operation_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
                }
                axum::Json(json!({ "name": "fileSearchStores/s1/upload/operations/op1", "done": true }))
                    .into_response()
            }
            (Method::GET, "/v1beta/fileSearchStores") => {
                let page = parts.uri.query().unwrap_or_default().contains("pageToken=p2");
                if page {
                    axum::Json(json!({ "fileSearchStores": [{ "name": "fileSearchStores/b" }] }))
                        .into_response()
                } else {
                    axum::Json(json!({
                        "fileSearchStores": [{ "name": "fileSearchStores/a", "activeDocumentsCount": "2" }],
                        "nextPageToken": "p2"
                    }))
                    .into_response()
                }
            }
            (Method::GET, "/v1beta/fileSearchStores/missing") => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({ "error": { "code": 404, "message": "no such store" } })),
            )
                .into_response(),
            _ => (StatusCode::NOT_FOUND, Body::empty()).into_response(),
        }
    }

    async fn start_fake() -> (GeminiClient, Fake) {
        let fake = Fake::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        *fake.addr.lock().unwrap() = addr.to_string();

        let app = Router::new().fallback(fake_api).with_state(fake.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = RemoteConfig {
            base_url: format!("http://{}", addr),
            max_retries: 2,
            timeout_secs: 5,
            ..Default::default()
        };
        let client = GeminiClient::with_key(&config, "test-key".into()).unwrap();
        (client, fake)
    }

    #[tokio::test]
    async fn resumable_upload_then_poll_with_retry() {
        let (client, fake) = start_fake().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let op = client
            .upload_to_store("fileSearchStores/s1", &path, "doc.txt", "text/plain")
            .await
            .unwrap();
        assert_eq!(fake.uploaded.lock().unwrap().as_slice(), b"payload");
        let name = op.name.unwrap();

        let polled = client.get_operation(&name).await.unwrap();
        assert!(polled.done);
        assert_eq!(fake.operation_calls.load(Ordering::SeqCst), 2);
        assert!(fake.api_keys.lock().unwrap().iter().all(|k| k == "test-key"));
    }

    #[tokio::test]
    async fn list_follows_page_tokens() {
        let (client, _fake) = start_fake().await;
        let stores = client.list_stores().await.unwrap();
        let names: Vec<_> = stores.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["fileSearchStores/a", "fileSearchStores/b"]);
        assert_eq!(stores[0].active_documents_count, 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (client, fake) = start_fake().await;
        let err = client.get_store("fileSearchStores/missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("no such store"));
        assert_eq!(fake.api_keys.lock().unwrap().len(), 1);
    }
}
