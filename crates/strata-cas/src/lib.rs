//! # strata-cas
//!
//! The Strata CAS core: content-addressed `put`/`get`/`delete` with
//! per-tenant deduplication, size-based storage planning, and reference
//! counting that gates physical deletion.
//!
//! [`CasService`] is the public façade; [`TenantProvisioner`] manages the
//! per-tenant storage namespace the service operates within.

mod planner;
mod provision;
mod service;

pub use planner::{ChunkPlanner, CHUNK_SIZE, MAX_INLINE_SIZE};
pub use provision::{TenantAttrs, TenantProvisioner};
pub use service::{CasService, ContentRef, PutOptions, MAX_CONTENT_SIZE};

use thiserror::Error;

use strata_backend::BackendError;
use strata_meta::MetaError;

/// Error taxonomy for CAS operations.
///
/// `ContentNotFound` and `BackendUnavailable` are deliberately distinct so
/// upstream layers can choose 404 vs 503-with-retry semantics.
#[derive(Error, Debug)]
pub enum CasError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("content not found: {hash} (tenant {tenant})")]
    ContentNotFound { tenant: String, hash: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("tenant not provisioned: {0}")]
    TenantNotProvisioned(String),

    #[error("tenant {tenant} still owns {objects} content object(s)")]
    TenantNotEmpty { tenant: String, objects: u64 },

    #[error("content already unreferenced: {hash} (tenant {tenant})")]
    AlreadyUnreferenced { tenant: String, hash: String },

    #[error("chunk integrity failure for {hash}: content hashed to {actual}")]
    ChunkIntegrity {
        hash: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

impl From<MetaError> for CasError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound { tenant, hash } => CasError::ContentNotFound { tenant, hash },
            MetaError::AlreadyUnreferenced { tenant, hash } => {
                CasError::AlreadyUnreferenced { tenant, hash }
            }
            MetaError::TenantNotFound(t) => CasError::TenantNotProvisioned(t),
            other if other.is_conflict() => CasError::MetadataConflict(other.to_string()),
            other => CasError::Metadata(other.to_string()),
        }
    }
}

/// Backend failures outside of `get` lookups: NotFound cannot legitimately
/// occur, so everything maps to availability.
impl From<BackendError> for CasError {
    fn from(e: BackendError) -> Self {
        CasError::BackendUnavailable(e.to_string())
    }
}
