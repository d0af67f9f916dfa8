//! # strata-meta
//!
//! Durable metadata for the Strata CAS: one row per unique content hash per
//! tenant, plus the restart-safe tenant registry.
//!
//! The reference-count mutations are the correctness-critical part of this
//! crate. "Insert or increment" and "decrement and check zero" each execute
//! as a single atomic store operation (upsert / guarded update inside a
//! transaction), never as an application-level read-then-write.

mod store;

pub use store::MetadataStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_hash::ContentHash;

/// Errors from the metadata store.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("chunk list encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("content not found: {hash} (tenant {tenant})")]
    NotFound { tenant: String, hash: String },

    #[error("content already unreferenced: {hash} (tenant {tenant})")]
    AlreadyUnreferenced { tenant: String, hash: String },

    #[error("tenant not found: {0}")]
    TenantNotFound(String),
}

impl MetaError {
    /// True when the store reported a concurrent-modification condition it
    /// could not resolve internally (SQLite busy/locked).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MetaError::Db(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// How an object's bytes are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Payload embedded in the metadata row.
    Inline,
    /// One backend object keyed by the content hash.
    Single,
    /// Ordered backend chunks, each keyed by its own hash.
    Chunked,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Inline => "inline",
            StorageType::Single => "single",
            StorageType::Chunked => "chunked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inline" => Some(StorageType::Inline),
            "single" => Some(StorageType::Single),
            "chunked" => Some(StorageType::Chunked),
            _ => None,
        }
    }
}

/// One chunk of a chunked object. `hash` is the chunk's own content address
/// in the backend, independent of the parent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
}

/// One row in `content_objects`.
#[derive(Debug, Clone)]
pub struct ContentObject {
    pub tenant_id: String,
    pub hash: ContentHash,
    pub size: u64,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub storage_type: StorageType,
    pub inline_data: Option<Vec<u8>>,
    pub chunks: Option<Vec<ChunkRef>>,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Fields for a first-time insert. `reference_count` and `created_at` are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewContentObject {
    pub hash: ContentHash,
    pub size: u64,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub storage_type: StorageType,
    pub inline_data: Option<Vec<u8>>,
    pub chunks: Option<Vec<ChunkRef>>,
}

/// A provisioned tenant and its storage scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub storage_namespace: String,
    pub created_at: DateTime<Utc>,
}

/// Tenant-scoped aggregates over `content_objects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub total_objects: u64,
    pub total_bytes: u64,
    pub avg_size: u64,
    pub total_references: u64,
    /// total_references / total_objects; 1.0 means no duplicate puts ever
    /// occurred.
    pub dedup_ratio: f64,
}
