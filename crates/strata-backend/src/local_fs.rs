//! Local filesystem backend.
//!
//! Objects live at `<root>/<namespace>/cas/<shard>/<key>` where `shard` is
//! the first two hex characters of the key, keeping directory fan-out flat.
//! Writes go through a uniquely-named temp file followed by an atomic
//! rename so racing writers of the same key cannot observe torn content.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::{Backend, BackendError, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sharded local filesystem [`Backend`].
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Create a backend rooted at `root`. The directory is created lazily
    /// on first write; constructing the backend never touches the disk.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_root(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace).join("cas")
    }

    fn object_path(&self, namespace: &str, key: &str) -> PathBuf {
        let shard = &key[..2.min(key.len())];
        self.namespace_root(namespace).join(shard).join(key)
    }
}

#[async_trait]
impl Backend for LocalFsBackend {
    #[instrument(skip(self, data), level = "debug")]
    async fn store(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(namespace, key);

        // Content under a key never changes, so an existing file is a
        // completed earlier write.
        if fs::try_exists(&path).await? {
            debug!(key, "store skipped, key already present");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name survives concurrent writers of the same key.
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            key,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            // If another writer won the rename race the content is already
            // in place and identical.
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(());
            }
            return Err(BackendError::Io(e));
        }

        debug!(key, size = data.len(), "object stored");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn retrieve(&self, namespace: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(namespace, key);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    async fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(namespace, key)).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let path = self.object_path(namespace, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        fs::create_dir_all(self.namespace_root(namespace)).await?;
        Ok(())
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<()> {
        let ns_root = self.root.join(namespace);
        match fs::remove_dir_all(&ns_root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}
