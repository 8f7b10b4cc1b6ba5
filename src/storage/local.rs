use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use super::{ArtifactStore, StoredObject, UploadReference};
use crate::error::UploadError;

/// Directory-backed object store for development runs and tests.
///
/// Objects are written to a temporary sibling and renamed into place, so a
/// reader never observes a partial object.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn put(&self, local_path: &Path, key: &str) -> Result<UploadReference, UploadError> {
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut part: OsString = dest.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        tokio::fs::copy(local_path, &part).await?;
        tokio::fs::rename(&part, &dest).await?;

        let abs = tokio::fs::canonicalize(&dest).await?;
        Ok(UploadReference::new(format!("file://{}", abs.display())))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, UploadError> {
        let mut objects = Vec::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    dirs.push(path);
                    continue;
                }
                // In-flight writes are not objects yet.
                if path.extension().is_some_and(|ext| ext == "part") {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    objects.push(StoredObject { key, size: meta.len() });
                }
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_twice_leaves_one_object() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let path = src.path().join("brt_data_20251024_100000.csv");
        std::fs::write(&path, "capture_timestamp,vehicle_id\n").unwrap();
        let store = LocalStore::new(root.path());

        let first = store.put(&path, "brt-data/brt_data_20251024_100000.csv").await.unwrap();
        let second = store.put(&path, "brt-data/brt_data_20251024_100000.csv").await.unwrap();

        assert_eq!(first, second);
        let objects: Vec<_> = std::fs::read_dir(root.path().join("brt-data"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(objects, vec![OsString::from("brt_data_20251024_100000.csv")]);
        assert_eq!(
            std::fs::read(root.path().join("brt-data/brt_data_20251024_100000.csv")).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix_and_skips_partial_writes() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("brt-data")).unwrap();
        std::fs::create_dir_all(root.path().join("brt-data-test")).unwrap();
        std::fs::write(root.path().join("brt-data/a.csv"), "abc").unwrap();
        std::fs::write(root.path().join("brt-data/b.csv.part"), "ab").unwrap();
        std::fs::write(root.path().join("brt-data-test/c.csv"), "x").unwrap();
        let store = LocalStore::new(root.path());

        let objects = store.list("brt-data/").await.unwrap();

        assert_eq!(
            objects,
            vec![StoredObject { key: "brt-data/a.csv".into(), size: 3 }]
        );
        assert_eq!(store.list("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(root.path().join("never-created"));
        assert!(store.list("brt-data/").await.unwrap().is_empty());
    }
}
