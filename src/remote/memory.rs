//! In-memory [`RemoteStore`] for offline development and tests.
//!
//! Stores, documents, files, and operations live in maps behind a
//! `std::sync::Mutex`. Uploads read the staged file from disk like the real
//! client does, so a missing staged file surfaces as an error here too.
//! [`MemoryBehavior`] scripts slow, failing, or flaky operations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    DocumentInfo, FileInfo, GenerateRequest, GenerateResponse, OperationStatus, RemoteOperation,
    RemoteStore, StoreInfo,
};
use crate::error::RemoteError;

/// Scripted behavior for subsequent calls.
#[derive(Debug, Clone, Default)]
pub struct MemoryBehavior {
    /// Reject every upload with a 500 carrying this message.
    pub upload_failure: Option<String>,
    /// Polls an upload operation needs before it reports done. Zero means
    /// the upload call itself returns a finished operation.
    pub polls_until_done: u32,
    /// Operations never report done.
    pub never_complete: bool,
    /// Operations finish with this error instead of indexing the document.
    pub operation_error: Option<String>,
    /// The next N status polls fail with a transport error.
    pub poll_failures: u32,
}

/// One call to `upload_to_store`, as observed by the backend.
#[derive(Debug, Clone)]
pub struct UploadLog {
    pub store: String,
    pub display_name: String,
    pub mime_type: String,
    pub size: u64,
    pub staged_path: PathBuf,
}

struct MemoryStore {
    info: StoreInfo,
    documents: Vec<DocumentInfo>,
}

struct PendingOperation {
    store: String,
    document: DocumentInfo,
    polls_left: u32,
    never_complete: bool,
    error: Option<String>,
    done: bool,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    behavior: MemoryBehavior,
    poll_failures_left: u32,
    polls: u64,
    stores: BTreeMap<String, MemoryStore>,
    operations: HashMap<String, PendingOperation>,
    files: BTreeMap<String, FileInfo>,
    uploads: Vec<UploadLog>,
    generate_calls: Vec<GenerateRequest>,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn finish(&mut self, op_name: &str) -> RemoteOperation {
        let Some(op) = self.operations.get_mut(op_name) else {
            return RemoteOperation::default();
        };
        let first = !op.done;
        op.done = true;
        if let Some(message) = op.error.clone() {
            return RemoteOperation {
                name: Some(op_name.to_string()),
                done: true,
                error: Some(OperationStatus {
                    code: Some(13),
                    message,
                }),
            };
        }
        let (store, document) = (op.store.clone(), op.document.clone());
        if first {
            if let Some(target) = self.stores.get_mut(&store) {
                target.documents.push(document);
                target.info.active_documents_count = target.documents.len() as u64;
            }
        }
        RemoteOperation {
            name: Some(op_name.to_string()),
            done: true,
            error: None,
        }
    }
}

/// Offline remote backend.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MemoryBehavior) -> Self {
        let remote = Self::new();
        remote.set_behavior(behavior);
        remote
    }

    pub fn set_behavior(&self, behavior: MemoryBehavior) {
        let mut state = self.lock();
        state.poll_failures_left = behavior.poll_failures;
        state.behavior = behavior;
    }

    /// Registers a Files API file.
    pub fn add_file(&self, file: FileInfo) {
        self.lock().files.insert(file.name.clone(), file);
    }

    pub fn uploads(&self) -> Vec<UploadLog> {
        self.lock().uploads.clone()
    }

    /// Total `get_operation` calls, failed ones included.
    pub fn polls(&self) -> u64 {
        self.lock().polls
    }

    pub fn generate_calls(&self) -> Vec<GenerateRequest> {
        self.lock().generate_calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(what: &str, name: &str) -> RemoteError {
    RemoteError::Status {
        status: 404,
        message: format!("{} not found: {}", what, name),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn create_store(&self, display_name: &str) -> Result<StoreInfo, RemoteError> {
        let mut state = self.lock();
        let id = state.next_id();
        let info = StoreInfo {
            name: format!("fileSearchStores/store-{}", id),
            display_name: Some(display_name.to_string()),
            create_time: Some(Utc::now().to_rfc3339()),
            active_documents_count: 0,
        };
        state.stores.insert(
            info.name.clone(),
            MemoryStore {
                info: info.clone(),
                documents: Vec::new(),
            },
        );
        Ok(info)
    }

    async fn list_stores(&self) -> Result<Vec<StoreInfo>, RemoteError> {
        Ok(self.lock().stores.values().map(|s| s.info.clone()).collect())
    }

    async fn get_store(&self, name: &str) -> Result<StoreInfo, RemoteError> {
        self.lock()
            .stores
            .get(name)
            .map(|s| s.info.clone())
            .ok_or_else(|| not_found("store", name))
    }

    async fn delete_store(&self, name: &str, force: bool) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let store = state.stores.get(name).ok_or_else(|| not_found("store", name))?;
        if !store.documents.is_empty() && !force {
            return Err(RemoteError::Status {
                status: 400,
                message: format!("store {} is not empty; pass force to delete", name),
            });
        }
        state.stores.remove(name);
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

        let mut state = self.lock();
        if !state.stores.contains_key(store) {
            return Err(not_found("store", store));
        }
        state.uploads.push(UploadLog {
            store: store.to_string(),
            display_name: display_name.to_string(),
            mime_type: mime_type.to_string(),
            size: bytes.len() as u64,
            staged_path: path.to_path_buf(),
        });
        if let Some(message) = state.behavior.upload_failure.clone() {
            return Err(RemoteError::Status {
                status: 500,
                message,
            });
        }

        let id = state.next_id();
        let op_name = format!("{}/upload/operations/op-{}", store, id);
        let document = DocumentInfo {
            name: format!("{}/documents/doc-{}", store, id),
            display_name: Some(display_name.to_string()),
            state: Some("STATE_ACTIVE".to_string()),
            create_time: Some(Utc::now().to_rfc3339()),
        };
        let behavior = state.behavior.clone();
        state.operations.insert(
            op_name.clone(),
            PendingOperation {
                store: store.to_string(),
                document,
                polls_left: behavior.polls_until_done,
                never_complete: behavior.never_complete,
                error: behavior.operation_error,
                done: false,
            },
        );

        if behavior.polls_until_done == 0 && !behavior.never_complete {
            return Ok(state.finish(&op_name));
        }
        Ok(RemoteOperation::pending(op_name))
    }

    async fn get_operation(&self, name: &str) -> Result<RemoteOperation, RemoteError> {
        let mut state = self.lock();
        state.polls += 1;
        if state.poll_failures_left > 0 {
            state.poll_failures_left -= 1;
            return Err(RemoteError::Transport(
                "simulated status check failure".to_string(),
            ));
        }

        let op = state
            .operations
            .get_mut(name)
            .ok_or_else(|| not_found("operation", name))?;
        if op.done {
            return Ok(state.finish(name));
        }
        if op.never_complete {
            return Ok(RemoteOperation::pending(name));
        }
        op.polls_left = op.polls_left.saturating_sub(1);
        if op.polls_left > 0 {
            return Ok(RemoteOperation::pending(name));
        }
        Ok(state.finish(name))
    }

    async fn list_documents(&self, store: &str) -> Result<Vec<DocumentInfo>, RemoteError> {
        self.lock()
            .stores
            .get(store)
            .map(|s| s.documents.clone())
            .ok_or_else(|| not_found("store", store))
    }

    async fn delete_document(&self, store: &str, document_id: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let target = state
            .stores
            .get_mut(store)
            .ok_or_else(|| not_found("store", store))?;
        let name = format!("{}/documents/{}", store, document_id);
        let before = target.documents.len();
        target.documents.retain(|d| d.name != name);
        if target.documents.len() == before {
            return Err(not_found("document", &name));
        }
        target.info.active_documents_count = target.documents.len() as u64;
        Ok(())
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, RemoteError> {
        let mut state = self.lock();
        let sources: usize = request
            .store_names
            .iter()
            .filter_map(|name| state.stores.get(name))
            .map(|s| s.documents.len())
            .sum::<usize>()
            + request.files.len();
        let grounding = (!request.store_names.is_empty()).then(|| {
            serde_json::json!({
                "retrievalQueries": [request.prompt],
                "fileSearchStores": request.store_names,
            })
        });
        let text = format!("{} source(s) consulted for: {}", sources, request.prompt);
        state.generate_calls.push(request);
        Ok(GenerateResponse { text, grounding })
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, RemoteError> {
        Ok(self.lock().files.values().cloned().collect())
    }

    async fn get_file(&self, name: &str) -> Result<FileInfo, RemoteError> {
        self.lock()
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("file", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn staged(tmp: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = tmp.path().join("staged.bin");
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn immediate_upload_indexes_document() {
        let tmp = TempDir::new().unwrap();
        let remote = InMemoryRemote::new();
        let store = remote.create_store("docs").await.unwrap();
        let path = staged(&tmp, b"hello").await;

        let op = remote
            .upload_to_store(&store.name, &path, "hello.txt", "text/plain")
            .await
            .unwrap();
        assert!(op.done);

        let docs = remote.list_documents(&store.name).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].display_name.as_deref(), Some("hello.txt"));
        assert_eq!(remote.uploads()[0].size, 5);
    }

    #[tokio::test]
    async fn operation_completes_after_scripted_polls() {
        let tmp = TempDir::new().unwrap();
        let remote = InMemoryRemote::with_behavior(MemoryBehavior {
            polls_until_done: 2,
            ..Default::default()
        });
        let store = remote.create_store("docs").await.unwrap();
        let path = staged(&tmp, b"x").await;

        let op = remote
            .upload_to_store(&store.name, &path, "x", "text/plain")
            .await
            .unwrap();
        let name = op.name.unwrap();
        assert!(!remote.get_operation(&name).await.unwrap().done);
        assert!(remote.get_operation(&name).await.unwrap().done);
        assert_eq!(remote.list_documents(&store.name).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_to_unknown_store_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let remote = InMemoryRemote::new();
        let path = staged(&tmp, b"x").await;
        let err = remote
            .upload_to_store("fileSearchStores/missing", &path, "x", "text/plain")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn non_empty_store_needs_force() {
        let tmp = TempDir::new().unwrap();
        let remote = InMemoryRemote::new();
        let store = remote.create_store("docs").await.unwrap();
        let path = staged(&tmp, b"x").await;
        remote
            .upload_to_store(&store.name, &path, "x", "text/plain")
            .await
            .unwrap();

        assert!(remote.delete_store(&store.name, false).await.is_err());
        remote.delete_store(&store.name, true).await.unwrap();
        assert!(remote.get_store(&store.name).await.unwrap_err().is_not_found());
    }
}
