// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::{path::Path, ObjectStore};
use strata_core::Result;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Size and modification time of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Random access to the bytes of one file
#[async_trait]
pub trait Reader: Debug + Send + Sync {
    fn path(&self) -> &Path;

    /// Object/File size and modification time
    async fn info(&self) -> Result<FileInfo>;

    async fn get_range(&self, range: Range<u64>) -> Result<Bytes>;
}

/// Object Reader
///
/// Object Store + Path
#[derive(Debug)]
pub struct CloudObjectReader {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    info: OnceCell<FileInfo>,
}

impl CloudObjectReader {
    pub fn new(object_store: Arc<dyn ObjectStore>, path: Path) -> Self {
        Self {
            object_store,
            path,
            info: OnceCell::new(),
        }
    }

    /// Open a reader and make sure the file exists.
    ///
    /// A missing file is reported as [`strata_core::Error::NotFound`].
    pub async fn open(object_store: Arc<dyn ObjectStore>, path: Path) -> Result<Self> {
        let reader = Self::new(object_store, path);
        reader.info().await?;
        Ok(reader)
    }
}

#[async_trait]
impl Reader for CloudObjectReader {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn info(&self) -> Result<FileInfo> {
        self.info
            .get_or_try_init(|| async move {
                let meta = self.object_store.head(&self.path).await?;
                Ok(FileInfo {
                    size: meta.size,
                    last_modified: meta.last_modified,
                })
            })
            .await
            .cloned()
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_range(&self, range: Range<u64>) -> Result<Bytes> {
        Ok(self.object_store.get_range(&self.path, range).await?)
    }
}

#[cfg(test)]
mod tests {
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use strata_core::ErrorKind;

    use super::*;

    #[tokio::test]
    async fn test_open_and_read() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let path = Path::from("t/part-0");
        store
            .put(&path, Bytes::from_static(b"0123456789").into())
            .await
            .unwrap();

        let reader = CloudObjectReader::open(store, path).await.unwrap();
        assert_eq!(reader.info().await.unwrap().size, 10);
        assert_eq!(reader.get_range(2..5).await.unwrap().as_ref(), b"234");
    }

    #[tokio::test]
    async fn test_open_missing() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let err = CloudObjectReader::open(store, Path::from("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingResource);
    }

    #[tokio::test]
    async fn test_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"abcdefgh").unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());

        let reader = CloudObjectReader::open(store, Path::from("data.bin"))
            .await
            .unwrap();
        let info = reader.info().await.unwrap();
        assert_eq!(info.size, 8);
        assert!(info.last_modified <= Utc::now());
        assert_eq!(reader.get_range(6..8).await.unwrap().as_ref(), b"gh");
    }
}
