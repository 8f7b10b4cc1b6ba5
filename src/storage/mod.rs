//! Artifact persistence to object storage.
//!
//! [`ArtifactStore`] is the single-attempt seam over a storage backend.
//! [`Uploader`] adds the destination naming, per-attempt timeout and retry
//! budget on top of it.

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::retry::RetryPolicy;

/// URI of a persisted artifact, e.g. `s3://bucket/brt-data/brt_data_20251024_100000.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReference(String);

impl UploadReference {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An object found by [`ArtifactStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

/// A storage backend. `put` overwrites any object already at `key`, so
/// repeating it is idempotent.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, local_path: &Path, key: &str) -> Result<UploadReference, UploadError>;

    /// Every object whose key starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, UploadError>;
}

/// Key prefix for everything stored under `folder`.
fn folder_prefix(folder: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        String::new()
    } else {
        format!("{folder}/")
    }
}

/// Object key for an artifact: `<folder>/<file name>`.
pub fn object_key(folder: &str, local_path: &Path) -> Result<String, UploadError> {
    let name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| UploadError::MissingArtifact(local_path.to_path_buf()))?;
    let folder = folder.trim_matches('/');
    Ok(if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    })
}

/// Retrying uploader. Never touches the local file.
pub struct Uploader {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Uploader {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            attempt_timeout,
        }
    }

    /// Uploads `local_path` under `folder`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// [`UploadError::MissingArtifact`] straight away if the file is gone,
    /// otherwise [`UploadError::Exhausted`] once the retry budget is spent.
    #[tracing::instrument(skip(self), fields(path = %local_path.display()))]
    pub async fn upload(&self, local_path: &Path, folder: &str) -> Result<UploadReference, UploadError> {
        if !tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            return Err(UploadError::MissingArtifact(local_path.to_path_buf()));
        }
        let key = object_key(folder, local_path)?;
        let max_attempts = self.retry.max_attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, self.store.put(local_path, &key)).await {
                Ok(result) => result,
                Err(_) => Err(UploadError::Timeout(self.attempt_timeout)),
            };

            match result {
                Ok(reference) => {
                    info!(uri = %reference, attempt, "Upload complete");
                    return Ok(reference);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(UploadError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        retries_left = max_attempts - attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Upload attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Objects stored under `folder`, sorted by key. A single attempt bounded
    /// by the upload timeout.
    pub async fn list(&self, folder: &str) -> Result<Vec<StoredObject>, UploadError> {
        let prefix = folder_prefix(folder);
        let mut objects = tokio::time::timeout(self.attempt_timeout, self.store.list(&prefix))
            .await
            .map_err(|_| UploadError::Timeout(self.attempt_timeout))??;
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// CSV artifacts in `artifact_dir` with no object under `folder`, i.e.
    /// the ones a failed upload left behind.
    #[tracing::instrument(skip(self), fields(dir = %artifact_dir.display()))]
    pub async fn missing(&self, artifact_dir: &Path, folder: &str) -> Result<Vec<PathBuf>, UploadError> {
        let stored: HashSet<String> = self.list(folder).await?.into_iter().map(|o| o.key).collect();

        let mut missing = Vec::new();
        let mut entries = tokio::fs::read_dir(artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "csv") {
                continue;
            }
            if !stored.contains(&object_key(folder, &path)?) {
                missing.push(path);
            }
        }
        missing.sort();
        info!(stored = stored.len(), missing = missing.len(), "Compared local artifacts with storage");
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactStore for Flaky {
        async fn put(&self, _local_path: &Path, key: &str) -> Result<UploadReference, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(UploadError::Storage(format!("503 on call {call}")))
            } else {
                Ok(UploadReference::new(format!("mem://{key}")))
            }
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<StoredObject>, UploadError> {
            Ok(Vec::new())
        }
    }

    struct Hanging;

    #[async_trait]
    impl ArtifactStore for Hanging {
        async fn put(&self, _local_path: &Path, _key: &str) -> Result<UploadReference, UploadError> {
            std::future::pending().await
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<StoredObject>, UploadError> {
            std::future::pending().await
        }
    }

    fn artifact() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brt_data_20251024_100000.csv");
        std::fs::write(&path, "capture_timestamp\n").unwrap();
        (dir, path)
    }

    #[test]
    fn test_object_key() {
        let path = Path::new("/data/silver/brt_data_1.csv");
        assert_eq!(object_key("brt-data", path).unwrap(), "brt-data/brt_data_1.csv");
        assert_eq!(object_key("/brt-data/", path).unwrap(), "brt-data/brt_data_1.csv");
        assert_eq!(object_key("", path).unwrap(), "brt_data_1.csv");
    }

    #[tokio::test]
    async fn test_upload_retries_then_succeeds() {
        let (_dir, path) = artifact();
        let store = Arc::new(Flaky { failures: 2, calls: AtomicU32::new(0) });
        let uploader = Uploader::new(store.clone(), RetryPolicy::fixed(2, Duration::ZERO), Duration::from_secs(5));

        let reference = uploader.upload(&path, "brt-data").await.unwrap();

        assert_eq!(reference.as_str(), "mem://brt-data/brt_data_20251024_100000.csv");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_upload_exhausts_budget() {
        let (_dir, path) = artifact();
        let store = Arc::new(Flaky { failures: u32::MAX, calls: AtomicU32::new(0) });
        let uploader = Uploader::new(store.clone(), RetryPolicy::fixed(1, Duration::ZERO), Duration::from_secs(5));

        let err = uploader.upload(&path, "brt-data").await.unwrap_err();

        assert!(matches!(err, UploadError::Exhausted { attempts: 2, .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let uploader = Uploader::new(store.clone(), RetryPolicy::fixed(3, Duration::ZERO), Duration::from_secs(5));

        let err = uploader.upload(&dir.path().join("gone.csv"), "brt-data").await.unwrap_err();

        assert!(matches!(err, UploadError::MissingArtifact(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_upload_times_out() {
        let (_dir, path) = artifact();
        let uploader = Uploader::new(Arc::new(Hanging), RetryPolicy::none(), Duration::from_secs(30));

        let err = uploader.upload(&path, "brt-data").await.unwrap_err();

        match err {
            UploadError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, UploadError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_listing_times_out() {
        let uploader = Uploader::new(Arc::new(Hanging), RetryPolicy::none(), Duration::from_secs(30));
        let err = uploader.list("brt-data").await.unwrap_err();
        assert!(matches!(err, UploadError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_finds_artifacts_never_uploaded() {
        let data = tempfile::tempdir().unwrap();
        let bucket = tempfile::tempdir().unwrap();
        for name in ["brt_data_20251024_100000.csv", "brt_data_20251024_101000.csv", "notes.txt"] {
            std::fs::write(data.path().join(name), "capture_timestamp\n").unwrap();
        }
        let uploader = Uploader::new(
            Arc::new(LocalStore::new(bucket.path())),
            RetryPolicy::none(),
            Duration::from_secs(5),
        );
        uploader
            .upload(&data.path().join("brt_data_20251024_100000.csv"), "brt-data")
            .await
            .unwrap();

        let listed = uploader.list("brt-data").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "brt-data/brt_data_20251024_100000.csv");

        let missing = uploader.missing(data.path(), "brt-data").await.unwrap();
        assert_eq!(missing, vec![data.path().join("brt_data_20251024_101000.csv")]);
    }
}
