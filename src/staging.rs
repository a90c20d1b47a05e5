//! Scratch-directory staging for uploads.
//!
//! The remote upload API takes a file path, so each in-memory upload is
//! written to a uniquely named file in a dedicated scratch directory for the
//! duration of the remote call. [`StagedFile`] is a scoped handle: call
//! [`StagedFile::release`] on every exit path, and if a handle is dropped
//! without being released (a cancelled request, a panic) the drop path
//! removes the file instead.
//!
//! Crashes can still skip both paths, so [`TempSweeper`] runs beside the
//! server and reclaims staged files older than a retention window.
//!
//! # Naming
//!
//! ```text
//! <scratch_dir>/<unix-millis>-<8 hex>-<sanitized name>
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Characters that may not appear in a staged file name.
const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Longest sanitized name kept, in bytes.
const MAX_NAME_LEN: usize = 120;

/// Replaces path separators, reserved characters, and control characters
/// with `_` so the result is a single plain path component.
pub fn sanitize_file_name(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| {
            if RESERVED.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    if safe.len() > MAX_NAME_LEN {
        let mut cut = MAX_NAME_LEN;
        while !safe.is_char_boundary(cut) {
            cut -= 1;
        }
        safe.truncate(cut);
    }

    let trimmed = safe.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return "upload".to_string();
    }
    safe
}

/// The directory staged files are written to.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    /// Opens the scratch directory, creating it if absent.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Writes `bytes` to a fresh uniquely named file.
    ///
    /// A partially written file is removed before the error is returned.
    pub async fn stage(&self, bytes: &[u8], suggested_name: &str) -> io::Result<StagedFile> {
        let token = Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            &token[..8],
            sanitize_file_name(suggested_name)
        );
        let staged = StagedFile {
            path: self.root.join(file_name),
            released: false,
        };

        tokio::fs::write(&staged.path, bytes).await?;
        debug!(path = %staged.path.display(), size = bytes.len(), "staged upload");
        Ok(staged)
    }

    /// Removes every regular file whose modification time is more than
    /// `max_age` before `now`. Individual failures are counted and logged.
    pub fn sweep_older_than(&self, max_age: Duration, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.root.display(), error = %e, "failed to read scratch directory");
                report.failed += 1;
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat staged file");
                    report.failed += 1;
                    continue;
                }
            };
            report.scanned += 1;

            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove stale staged file");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// A file written to the scratch directory. Removed on release or drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    released: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the staged file. A file that is already gone counts as released.
    pub async fn release(mut self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Periodic reclamation of stale staged files.
pub struct TempSweeper {
    scratch: Arc<ScratchDir>,
    max_age: Duration,
    interval: Duration,
}

impl TempSweeper {
    pub fn new(scratch: Arc<ScratchDir>, max_age: Duration, interval: Duration) -> Self {
        Self {
            scratch,
            max_age,
            interval,
        }
    }

    /// Runs a single pass against the given clock reading.
    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let report = self.scratch.sweep_older_than(self.max_age, now);
        if report.removed > 0 || report.failed > 0 {
            info!(
                removed = report.removed,
                failed = report.failed,
                scanned = report.scanned,
                "swept scratch directory"
            );
        }
        report
    }

    /// Spawns the sweep loop. The first pass runs one interval after start.
    pub fn start(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let sweeper = Arc::new(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + sweeper.interval,
                sweeper.interval,
            );
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let pass = sweeper.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            pass.sweep_once(SystemTime::now())
                        })
                        .await;
                        if let Err(e) = result {
                            warn!(error = %e, "scratch sweep task failed");
                        }
                    }
                }
            }
            debug!("scratch sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Owner of a running [`TempSweeper`] loop.
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the loop to exit and waits for it.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}
