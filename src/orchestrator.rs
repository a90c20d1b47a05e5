//! The duplicate-aware upload pipeline.
//!
//! # Per-file flow
//!
//! ```text
//! fingerprint ─▶ lock ─▶ ledger hit? ──yes──▶ skipped
//!                             │no
//!                             ▼
//!                  stage ─▶ upload ─▶ wait ─▶ release ─▶ record ─▶ success
//!                    └──────── any failure ──▶ release ─────────▶ error
//! ```
//!
//! Files are processed one at a time in arrival order and every file gets
//! exactly one outcome. Only batch-level validation aborts the call.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::UploadError;
use crate::fingerprint::Fingerprint;
use crate::fingerprint_lock::FingerprintLocks;
use crate::ledger::Ledger;
use crate::remote::RemoteStore;
use crate::staging::{ScratchDir, StagedFile};
use crate::waiter::OperationWaiter;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One file received in a request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            bytes: bytes.into(),
        }
    }

    fn mime_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
    }
}

/// Result for a single file of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FileOutcome {
    Success {
        filename: String,
        size: u64,
        hash: String,
    },
    Skipped {
        filename: String,
        duplicate: String,
    },
    Error {
        filename: String,
        error: String,
        /// The remote upload succeeded but the ledger could not be written.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        inconsistent: bool,
    },
}

impl FileOutcome {
    pub fn filename(&self) -> &str {
        match self {
            FileOutcome::Success { filename, .. }
            | FileOutcome::Skipped { filename, .. }
            | FileOutcome::Error { filename, .. } => filename,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub summary: BatchSummary,
    pub results: Vec<FileOutcome>,
}

impl BatchResult {
    fn from_outcomes(results: Vec<FileOutcome>) -> Self {
        let mut summary = BatchSummary {
            total: results.len(),
            ..Default::default()
        };
        for outcome in &results {
            match outcome {
                FileOutcome::Success { .. } => summary.success += 1,
                FileOutcome::Skipped { .. } => summary.skipped += 1,
                FileOutcome::Error { .. } => summary.failed += 1,
            }
        }
        Self { summary, results }
    }
}

pub struct UploadOrchestrator {
    remote: Arc<dyn RemoteStore>,
    ledger: Arc<Ledger>,
    scratch: Arc<ScratchDir>,
    waiter: OperationWaiter,
    locks: FingerprintLocks,
}

impl UploadOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        ledger: Arc<Ledger>,
        scratch: Arc<ScratchDir>,
        waiter: OperationWaiter,
    ) -> Self {
        Self {
            remote,
            ledger,
            scratch,
            waiter,
            locks: FingerprintLocks::new(),
        }
    }

    /// Ingests `files` into `store_id`, one outcome per file in input order.
    pub async fn ingest(
        &self,
        store_id: &str,
        files: Vec<UploadedFile>,
    ) -> Result<BatchResult, UploadError> {
        if store_id.trim().is_empty() {
            return Err(UploadError::Validation(
                "No store configured. Set a store with POST /config first.".to_string(),
            ));
        }
        if files.is_empty() {
            return Err(UploadError::Validation("No files uploaded".to_string()));
        }

        let mut outcomes = Vec::with_capacity(files.len());
        for file in &files {
            outcomes.push(self.ingest_one(store_id, file).await);
        }

        let result = BatchResult::from_outcomes(outcomes);
        info!(
            store = store_id,
            total = result.summary.total,
            success = result.summary.success,
            skipped = result.summary.skipped,
            failed = result.summary.failed,
            "Batch ingested"
        );
        Ok(result)
    }

    async fn ingest_one(&self, store_id: &str, file: &UploadedFile) -> FileOutcome {
        let fingerprint = Fingerprint::of(&file.bytes);
        let _guard = self.locks.acquire(&fingerprint).await;

        if let Some(existing) = self.ledger.lookup(&fingerprint).await {
            info!(
                filename = %file.filename,
                hash = fingerprint.short(),
                duplicate = %existing.filename,
                "Skipping duplicate content"
            );
            return FileOutcome::Skipped {
                filename: file.filename.clone(),
                duplicate: existing.filename,
            };
        }

        if let Err(e) = self.upload(store_id, file).await {
            warn!(filename = %file.filename, error = %e, "Upload failed");
            return FileOutcome::Error {
                filename: file.filename.clone(),
                error: e.to_string(),
                inconsistent: false,
            };
        }

        match self.ledger.record(&fingerprint, &file.filename).await {
            Ok(_) => {
                info!(
                    filename = %file.filename,
                    hash = fingerprint.short(),
                    size = file.bytes.len(),
                    "Uploaded"
                );
                FileOutcome::Success {
                    filename: file.filename.clone(),
                    size: file.bytes.len() as u64,
                    hash: fingerprint.short().to_string(),
                }
            }
            Err(e) => {
                let e = UploadError::from(e);
                error!(
                    filename = %file.filename,
                    hash = fingerprint.short(),
                    error = %e,
                    "Remote store holds a file the ledger does not"
                );
                FileOutcome::Error {
                    filename: file.filename.clone(),
                    error: e.to_string(),
                    inconsistent: true,
                }
            }
        }
    }

    /// Stage, upload, wait. The staged copy is released on every path.
    async fn upload(&self, store_id: &str, file: &UploadedFile) -> Result<(), UploadError> {
        let staged = self
            .scratch
            .stage(&file.bytes, &file.filename)
            .await
            .map_err(UploadError::Staging)?;

        let result = self.send_staged(store_id, &staged, file).await;

        if let Err(e) = staged.release().await {
            warn!(filename = %file.filename, error = %e, "Failed to remove staged file");
        }
        result
    }

    async fn send_staged(
        &self,
        store_id: &str,
        staged: &StagedFile,
        file: &UploadedFile,
    ) -> Result<(), UploadError> {
        let operation = self
            .remote
            .upload_to_store(store_id, staged.path(), &file.filename, file.mime_type())
            .await?;
        self.waiter.wait(operation).await?;
        Ok(())
    }
}
