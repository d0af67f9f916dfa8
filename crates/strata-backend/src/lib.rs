//! # strata-backend
//!
//! Polymorphic storage drivers for the Strata CAS.
//!
//! A [`Backend`] moves opaque, content-addressed blobs in and out of a
//! tenant namespace. Keys are assigned by the caller (they are content
//! hashes, but the backend does not care) and `store` is idempotent:
//! re-storing an existing key with the same bytes succeeds and leaves
//! identical content in place.
//!
//! Two drivers are provided:
//! - [`LocalFsBackend`]: sharded local filesystem layout
//!   (`<root>/<namespace>/cas/<shard>/<key>`)
//! - [`ObjectStoreBackend`]: S3-style HTTP object store

mod local_fs;
mod object_store;

pub use local_fs::LocalFsBackend;
pub use object_store::ObjectStoreBackend;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Storage driver contract.
///
/// All methods are scoped by a tenant namespace; a backend never reads or
/// writes outside the namespace it is handed. Implementations must be safe
/// for concurrent use from many tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `data` under `key`. Idempotent for identical content.
    async fn store(&self, namespace: &str, key: &str, data: Bytes) -> Result<()>;

    /// Fetch the bytes stored under `key`, or `NotFound`.
    async fn retrieve(&self, namespace: &str, key: &str) -> Result<Bytes>;

    /// Existence probe for `key`, without fetching the bytes.
    async fn contains(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Delete the object stored under `key`.
    ///
    /// Deleting an absent key returns `NotFound`; callers that treat
    /// already-gone as success check [`BackendError::is_not_found`].
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Create the namespace root. Idempotent; used by tenant provisioning.
    async fn create_namespace(&self, namespace: &str) -> Result<()>;

    /// Remove the namespace root and anything left under it.
    async fn remove_namespace(&self, namespace: &str) -> Result<()>;
}
