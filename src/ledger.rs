//! Durable upload ledger and active-store pointer.
//!
//! Both live in a single JSON document on disk:
//!
//! ```json
//! {
//!   "activeStore": "fileSearchStores/abc",
//!   "uploads": {
//!     "<sha256 hex>": { "filename": "report.pdf", "createdAt": "2026-01-01T00:00:00Z" }
//!   }
//! }
//! ```
//!
//! The document is loaded once at startup. A missing or unreadable document
//! yields an empty ledger rather than a startup failure. Every mutation
//! rewrites the whole document (temp file + rename) before returning. The
//! in-memory state only changes once the write has landed, so readers never
//! observe an entry that is not on disk and are not held up by write retries.
//! Mutations are serialized among themselves.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::fingerprint::Fingerprint;

/// One ingested file, keyed by its content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub fingerprint: Fingerprint,
    pub filename: String,
    /// `None` for entries carried over from the plain `hash -> filename` format.
    pub created_at: Option<DateTime<Utc>>,
}

/// On-disk shape of an `uploads` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredUpload {
    Record {
        filename: String,
        #[serde(rename = "createdAt", default)]
        created_at: Option<DateTime<Utc>>,
    },
    Legacy(String),
}

impl StoredUpload {
    fn to_record(&self, fingerprint: &Fingerprint) -> UploadRecord {
        match self {
            StoredUpload::Record {
                filename,
                created_at,
            } => UploadRecord {
                fingerprint: fingerprint.clone(),
                filename: filename.clone(),
                created_at: *created_at,
            },
            StoredUpload::Legacy(filename) => UploadRecord {
                fingerprint: fingerprint.clone(),
                filename: filename.clone(),
                created_at: None,
            },
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    #[serde(default)]
    active_store: Option<String>,
    #[serde(default)]
    uploads: BTreeMap<String, StoredUpload>,
}

/// How hard to try before reporting a failed state write.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    /// Total write attempts, at least one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    pub backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Process-wide ledger of ingested content plus the active store.
pub struct Ledger {
    path: PathBuf,
    policy: PersistPolicy,
    state: RwLock<StateDocument>,
    writer: Mutex<()>,
}

impl Ledger {
    /// Loads the state document at `path`. Never fails.
    pub async fn load(path: impl Into<PathBuf>, policy: PersistPolicy) -> Self {
        let path = path.into();
        let state = read_state(&path).await;
        info!(
            path = %path.display(),
            active_store = ?state.active_store,
            uploads = state.uploads.len(),
            "state loaded"
        );
        Self {
            path,
            policy,
            state: RwLock::new(state),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<UploadRecord> {
        let state = self.state.read().await;
        state
            .uploads
            .get(fingerprint.as_str())
            .map(|stored| stored.to_record(fingerprint))
    }

    /// Appends a record and persists the document before returning.
    ///
    /// Records are never overwritten: if the fingerprint is already present
    /// the existing record is returned and nothing is written.
    pub async fn record(
        &self,
        fingerprint: &Fingerprint,
        filename: &str,
    ) -> Result<UploadRecord, PersistenceError> {
        let _writer = self.writer.lock().await;
        let mut next = {
            let state = self.state.read().await;
            if let Some(existing) = state.uploads.get(fingerprint.as_str()) {
                return Ok(existing.to_record(fingerprint));
            }
            state.clone()
        };

        let created_at = Utc::now();
        next.uploads.insert(
            fingerprint.to_string(),
            StoredUpload::Record {
                filename: filename.to_string(),
                created_at: Some(created_at),
            },
        );
        self.commit(next).await?;

        Ok(UploadRecord {
            fingerprint: fingerprint.clone(),
            filename: filename.to_string(),
            created_at: Some(created_at),
        })
    }

    pub async fn active_store(&self) -> Option<String> {
        self.state.read().await.active_store.clone()
    }

    /// Points the proxy at `store`. Last writer wins.
    pub async fn set_active_store(&self, store: &str) -> Result<(), PersistenceError> {
        let _writer = self.writer.lock().await;
        let mut next = self.state.read().await.clone();
        next.active_store = Some(store.to_string());
        self.commit(next).await
    }

    /// Clears the active store if it is `store`. Returns whether it was cleared.
    pub async fn clear_active_store_if(&self, store: &str) -> Result<bool, PersistenceError> {
        let _writer = self.writer.lock().await;
        let mut next = self.state.read().await.clone();
        if next.active_store.as_deref() != Some(store) {
            return Ok(false);
        }
        next.active_store = None;
        self.commit(next).await?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.uploads.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Writes `next` and then swaps it in. Callers hold `writer`.
    async fn commit(&self, next: StateDocument) -> Result<(), PersistenceError> {
        self.persist(&next).await?;
        *self.state.write().await = next;
        Ok(())
    }

    async fn persist(&self, state: &StateDocument) -> Result<(), PersistenceError> {
        let body = serde_json::to_string_pretty(state)?;
        let attempts = self.policy.attempts.max(1);

        let mut attempt = 0;
        loop {
            match write_atomic(&self.path, body.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= attempts => {
                    warn!(
                        path = %self.path.display(),
                        attempts,
                        error = %e,
                        "giving up on state write"
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = self.policy.backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        path = %self.path.display(),
                        attempt = attempt + 1,
                        error = %e,
                        "state write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

async fn read_state(path: &Path) -> StateDocument {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return StateDocument::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state, starting empty");
            return StateDocument::default();
        }
    };

    match serde_json::from_str::<StateDocument>(&content) {
        Ok(mut state) => {
            let before = state.uploads.len();
            state
                .uploads
                .retain(|key, _| Fingerprint::parse(key).is_some_and(|fp| fp.as_str() == key));
            if state.uploads.len() < before {
                warn!(
                    path = %path.display(),
                    dropped = before - state.uploads.len(),
                    "ignored malformed ledger keys"
                );
            }
            state
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse state, starting empty");
            StateDocument::default()
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_policy() -> PersistPolicy {
        PersistPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::load(tmp.path().join("data.json"), fast_policy()).await;
        assert!(ledger.is_empty().await);
        assert_eq!(ledger.active_store().await, None);
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        std::fs::write(&path, "{ not json").unwrap();

        let ledger = Ledger::load(&path, fast_policy()).await;
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn record_persists_and_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        let fp = Fingerprint::of(b"0123456789");

        let ledger = Ledger::load(&path, fast_policy()).await;
        assert!(ledger.lookup(&fp).await.is_none());
        let record = ledger.record(&fp, "ten.txt").await.unwrap();
        assert_eq!(record.filename, "ten.txt");
        assert!(record.created_at.is_some());

        let reloaded = Ledger::load(&path, fast_policy()).await;
        let found = reloaded.lookup(&fp).await.unwrap();
        assert_eq!(found.filename, "ten.txt");
        assert_eq!(found.created_at, record.created_at);
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn record_never_overwrites_existing_entry() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::load(tmp.path().join("data.json"), fast_policy()).await;
        let fp = Fingerprint::of(b"same bytes");

        ledger.record(&fp, "first.txt").await.unwrap();
        let second = ledger.record(&fp, "second.txt").await.unwrap();
        assert_eq!(second.filename, "first.txt");
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn legacy_string_entries_are_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        let fp = Fingerprint::of(b"legacy");
        std::fs::write(
            &path,
            format!(
                r#"{{ "activeStore": "fileSearchStores/old", "uploads": {{ "{}": "notes.md" }} }}"#,
                fp
            ),
        )
        .unwrap();

        let ledger = Ledger::load(&path, fast_policy()).await;
        let record = ledger.lookup(&fp).await.unwrap();
        assert_eq!(record.filename, "notes.md");
        assert_eq!(record.created_at, None);
        assert_eq!(
            ledger.active_store().await.as_deref(),
            Some("fileSearchStores/old")
        );
    }

    #[tokio::test]
    async fn failed_write_surfaces_error_and_rolls_back() {
        let tmp = TempDir::new().unwrap();
        // Parent of the state path is a regular file, so every write fails.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let ledger = Ledger::load(blocker.join("data.json"), fast_policy()).await;
        let fp = Fingerprint::of(b"payload");

        let err = ledger.record(&fp, "payload.bin").await.unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
        assert!(ledger.lookup(&fp).await.is_none());

        assert!(ledger.set_active_store("fileSearchStores/x").await.is_err());
        assert_eq!(ledger.active_store().await, None);
    }

    #[tokio::test]
    async fn reads_proceed_while_a_write_is_retrying() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let policy = PersistPolicy {
            attempts: 3,
            backoff: Duration::from_millis(200),
        };
        let ledger = std::sync::Arc::new(Ledger::load(blocker.join("data.json"), policy).await);
        let fp = Fingerprint::of(b"slow write");

        let writer = {
            let ledger = ledger.clone();
            let fp = fp.clone();
            tokio::spawn(async move { ledger.record(&fp, "slow.bin").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let read = tokio::time::timeout(Duration::from_millis(100), async {
            (ledger.lookup(&fp).await, ledger.active_store().await)
        })
        .await
        .expect("reads blocked behind the retrying write");
        assert_eq!(read, (None, None));

        assert!(writer.await.unwrap().is_err());
        assert!(ledger.lookup(&fp).await.is_none());
    }

    #[tokio::test]
    async fn active_store_set_and_conditionally_cleared() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        let ledger = Ledger::load(&path, fast_policy()).await;

        ledger.set_active_store("fileSearchStores/a").await.unwrap();
        assert!(!ledger.clear_active_store_if("fileSearchStores/b").await.unwrap());
        assert_eq!(
            ledger.active_store().await.as_deref(),
            Some("fileSearchStores/a")
        );

        assert!(ledger.clear_active_store_if("fileSearchStores/a").await.unwrap());
        let reloaded = Ledger::load(&path, fast_policy()).await;
        assert_eq!(reloaded.active_store().await, None);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::load(tmp.path().join("data.json"), fast_policy()).await;
        ledger.set_active_store("fileSearchStores/a").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.json".to_string()]);
    }
}
