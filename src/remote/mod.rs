//! The remote file-search service boundary.
//!
//! [`RemoteStore`] is the narrow interface the rest of the proxy depends on.
//! Two implementations ship:
//!
//! - **[`GeminiClient`]** — the Gemini File Search REST API.
//! - **[`InMemoryRemote`]** — an offline backend for local development and
//!   tests, with knobs for simulating slow or failing operations.
//!
//! Use [`from_config`] to build the backend named by `[remote].provider`.

pub mod gemini;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::RemoteConfig;
use crate::error::RemoteError;

pub use gemini::GeminiClient;
pub use memory::InMemoryRemote;

/// Handle to a long-running remote job. Only these three fields are read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<OperationStatus>,
}

impl RemoteOperation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            done: false,
            error: None,
        }
    }
}

/// Error detail attached to a finished operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: String,
}

/// A file-search store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default, deserialize_with = "int64_or_string")]
    pub active_documents_count: u64,
}

/// A document indexed inside a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
}

/// A Files API file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub sha256_hash: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

/// A file passed to the model by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    pub uri: String,
    pub mime_type: String,
}

/// One generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: String,
    pub prompt: String,
    /// Stores searched by the file-search tool. Empty disables the tool.
    pub store_names: Vec<String>,
    pub metadata_filter: Option<String>,
    /// Files API files attached ahead of the prompt.
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
    pub grounding: Option<serde_json::Value>,
}

/// Operations the proxy needs from the remote service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_store(&self, display_name: &str) -> Result<StoreInfo, RemoteError>;

    async fn list_stores(&self) -> Result<Vec<StoreInfo>, RemoteError>;

    async fn get_store(&self, name: &str) -> Result<StoreInfo, RemoteError>;

    async fn delete_store(&self, name: &str, force: bool) -> Result<(), RemoteError>;

    /// Uploads the file at `path` into `store` and returns the indexing job.
    async fn upload_to_store(
        &self,
        store: &str,
        path: &Path,
        display_name: &str,
        mime_type: &str,
    ) -> Result<RemoteOperation, RemoteError>;

    async fn get_operation(&self, name: &str) -> Result<RemoteOperation, RemoteError>;

    async fn list_documents(&self, store: &str) -> Result<Vec<DocumentInfo>, RemoteError>;

    async fn delete_document(&self, store: &str, document_id: &str) -> Result<(), RemoteError>;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, RemoteError>;

    async fn list_files(&self) -> Result<Vec<FileInfo>, RemoteError>;

    async fn get_file(&self, name: &str) -> Result<FileInfo, RemoteError>;
}

/// Builds the backend selected in configuration.
pub fn from_config(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiClient::new(config)?)),
        "memory" => Ok(Arc::new(InMemoryRemote::new())),
        other => bail!("Unknown remote provider: '{}'. Must be gemini or memory.", other),
    }
}

/// The REST API encodes int64 fields as JSON strings.
fn int64_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Num(n)) => Ok(n),
        Some(Raw::Str(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_count_accepts_string_and_number() {
        let a: StoreInfo = serde_json::from_str(
            r#"{"name":"fileSearchStores/a","activeDocumentsCount":"12"}"#,
        )
        .unwrap();
        assert_eq!(a.active_documents_count, 12);

        let b: StoreInfo =
            serde_json::from_str(r#"{"name":"fileSearchStores/b","activeDocumentsCount":3}"#)
                .unwrap();
        assert_eq!(b.active_documents_count, 3);

        let c: StoreInfo = serde_json::from_str(r#"{"name":"fileSearchStores/c"}"#).unwrap();
        assert_eq!(c.active_documents_count, 0);
    }

    #[test]
    fn operation_defaults_when_fields_absent() {
        let op: RemoteOperation = serde_json::from_str(r#"{"name":"ops/1"}"#).unwrap();
        assert_eq!(op, RemoteOperation::pending("ops/1"));

        let failed: RemoteOperation = serde_json::from_str(
            r#"{"name":"ops/2","done":true,"error":{"code":13,"message":"boom"}}"#,
        )
        .unwrap();
        assert!(failed.done);
        assert_eq!(failed.error.unwrap().message, "boom");
    }
}
