//! Storage for the shared presence/lock record.
//!
//! The engine only needs `read` and `write` of a whole [`SharedDocument`].
//! [`JsonFileStore`] is the real backend (a JSON file on the shared drive);
//! [`MemoryStore`] backs tests and single-process embedding and can inject
//! failures.
//!
//! Every call site goes through [`read_with_retry`]/[`write_with_retry`]:
//! attempt `n` that fails waits `base_delay × n` before the next one, and
//! after the last attempt the caller gets [`StoreError::Unavailable`].

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::presence_file::SharedDocument;

/// Shared-file storage collaborator.
pub trait SharedStore: Send + Sync {
    /// Read the record. A missing file reads as an empty record.
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<SharedDocument, StoreError>>;

    /// Replace the record.
    fn write<'a>(
        &'a self,
        path: &'a Path,
        doc: &'a SharedDocument,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// JSON file on a (possibly network-mounted) filesystem.
///
/// Writes go to a sibling temp file that is then renamed over the target,
/// so readers never observe a half-written record.
#[derive(Debug, Clone, Default)]
pub struct JsonFileStore;

impl JsonFileStore {
    pub fn new() -> Self {
        Self
    }
}

impl SharedStore for JsonFileStore {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<SharedDocument, StoreError>> {
        Box::pin(async move {
            let raw = match tokio::fs::read(path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(SharedDocument::default());
                }
                Err(e) => return Err(e.into()),
            };
            if raw.iter().all(u8::is_ascii_whitespace) {
                return Ok(SharedDocument::default());
            }
            serde_json::from_slice(&raw).map_err(|e| StoreError::Parse(e.to_string()))
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a Path,
        doc: &'a SharedDocument,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let body = serde_json::to_vec_pretty(doc).map_err(|e| StoreError::Parse(e.to_string()))?;
            let tmp = temp_path_for(path);
            tokio::fs::write(&tmp, &body).await?;
            if let Err(e) = tokio::fs::rename(&tmp, path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            Ok(())
        })
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = format!("{name}.{}.tmp", uuid::Uuid::new_v4().simple());
    match path.parent() {
        Some(dir) => dir.join(tmp),
        None => PathBuf::from(tmp),
    }
}

/// In-process store. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<HashMap<PathBuf, SharedDocument>>>,
    fail_reads: Arc<AtomicU32>,
    fail_writes: Arc<AtomicU32>,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Successful and failed read attempts so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Direct peek, bypassing failure injection.
    pub async fn snapshot(&self, path: &Path) -> Option<SharedDocument> {
        self.docs.lock().await.get(path).cloned()
    }

    /// Direct overwrite, bypassing failure injection.
    pub async fn put(&self, path: &Path, doc: SharedDocument) {
        self.docs.lock().await.insert(path.to_path_buf(), doc);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SharedStore for MemoryStore {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<SharedDocument, StoreError>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.fail_reads) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "injected read failure",
                )));
            }
            Ok(self.docs.lock().await.get(path).cloned().unwrap_or_default())
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a Path,
        doc: &'a SharedDocument,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.fail_writes) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "injected write failure",
                )));
            }
            self.docs.lock().await.insert(path.to_path_buf(), doc.clone());
            Ok(())
        })
    }
}

async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    path: &Path,
    mut attempt_fn: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                log::debug!("{op} {} failed (attempt {attempt}/{attempts}): {e}", path.display());
                last = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }
    log::warn!("{op} {} gave up after {attempts} attempts: {last}", path.display());
    Err(StoreError::Unavailable { attempts, last })
}

/// Read with linear backoff.
pub async fn read_with_retry(
    store: &dyn SharedStore,
    path: &Path,
    policy: &RetryPolicy,
) -> Result<SharedDocument, StoreError> {
    with_retry(policy, "read", path, || store.read(path)).await
}

/// Write with linear backoff.
pub async fn write_with_retry(
    store: &dyn SharedStore,
    path: &Path,
    doc: &SharedDocument,
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    with_retry(policy, "write", path, || store.write(path, doc)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence_file::{color_for_session, PresenceEntry};
    use chrono::Utc;
    use std::time::Duration;

    fn sample_doc() -> SharedDocument {
        let mut doc = SharedDocument::default();
        let now = Utc::now();
        doc.upsert_presence(
            "a",
            PresenceEntry {
                name: "Alice".into(),
                color: color_for_session("a"),
                last_seen_at: now,
                started_at: now,
            },
        );
        doc.revision = 3;
        doc
    }

    #[tokio::test]
    async fn test_json_store_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new();
        let doc = store.read(&dir.path().join("none.json")).await.unwrap();
        assert_eq!(doc, SharedDocument::default());
    }

    #[tokio::test]
    async fn test_json_store_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".clip.mov.collab.json");
        let store = JsonFileStore::new();

        let doc = sample_doc();
        store.write(&path, &doc).await.unwrap();
        let read = store.read(&path).await.unwrap();
        assert_eq!(read, doc);

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_json_store_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = JsonFileStore::new().read(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Parse(_)));
    }

    #[tokio::test]
    async fn test_json_store_blank_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.json");
        std::fs::write(&path, b"  \n").unwrap();
        assert_eq!(JsonFileStore::new().read(&path).await.unwrap(), SharedDocument::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failures() {
        let store = MemoryStore::new();
        let path = PathBuf::from("/share/.a.collab.json");
        store.put(&path, sample_doc()).await;
        store.fail_next_reads(2);

        let policy = RetryPolicy { attempts: 3, base_delay_ms: 100 };
        let start = tokio::time::Instant::now();
        let doc = read_with_retry(&store, &path, &policy).await.unwrap();

        assert_eq!(doc.revision, 3);
        assert_eq!(store.read_count(), 3);
        // 100ms after attempt 1, 200ms after attempt 2
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let store = MemoryStore::new();
        let path = PathBuf::from("/share/.a.collab.json");
        store.fail_next_writes(5);

        let policy = RetryPolicy { attempts: 3, base_delay_ms: 100 };
        let err = write_with_retry(&store, &path, &sample_doc(), &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unavailable { attempts: 3, .. }));
        assert_eq!(store.write_count(), 3);
        assert!(store.snapshot(&path).await.is_none());
    }
}
