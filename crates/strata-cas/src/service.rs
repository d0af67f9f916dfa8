//! The CAS façade.
//!
//! `put` follows a fixed sequence: hash, dedup check, storage-plan + backend
//! writes, then a single atomic metadata upsert. Identical content stored N
//! times costs one physical write and N reference-count increments.
//!
//! Operations on the same (tenant, hash) pair serialize on a keyed async
//! mutex; operations on different hashes run concurrently. Dropping an
//! in-flight `put` future aborts backend I/O before the metadata row exists,
//! so cancellation never leaves a row referencing unwritten bytes.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use strata_backend::{Backend, BackendError};
use strata_hash::{hash_bytes, ContentHash, StreamingHasher};
use strata_meta::{
    ChunkRef, ContentObject, MetadataStore, NewContentObject, StatsReport, StorageType, Tenant,
};

use crate::{CasError, ChunkPlanner, Result};

/// Hard cap on a single object (1 GiB). Anything larger is rejected as
/// `InvalidInput` before any I/O happens.
pub const MAX_CONTENT_SIZE: u64 = 1024 * 1024 * 1024;

/// Caller-supplied descriptive metadata for `put` operations.
///
/// On a dedup hit these are ignored: content under a hash is immutable,
/// including its first-write metadata.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// What callers get back from `put`. Carries no storage-location detail;
/// where the bytes live is internal to the service.
#[derive(Debug, Clone, Serialize)]
pub struct ContentRef {
    pub hash: ContentHash,
    pub size: u64,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub stored_at: DateTime<Utc>,
}

impl From<&ContentObject> for ContentRef {
    fn from(obj: &ContentObject) -> Self {
        Self {
            hash: obj.hash,
            size: obj.size,
            mime_type: obj.mime_type.clone(),
            filename: obj.filename.clone(),
            stored_at: obj.created_at,
        }
    }
}

/// Tenant-scoped content-addressable storage service.
pub struct CasService {
    backend: Arc<dyn Backend>,
    meta: Arc<MetadataStore>,
    planner: ChunkPlanner,
    max_content_size: u64,
    // Per-(tenant, hash) serialization. Entries are retained for the life
    // of the process; the map is bounded by the set of distinct keys
    // touched.
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CasService {
    pub fn new(backend: Arc<dyn Backend>, meta: Arc<MetadataStore>) -> Self {
        Self {
            backend,
            meta,
            planner: ChunkPlanner::default(),
            max_content_size: MAX_CONTENT_SIZE,
            key_locks: DashMap::new(),
        }
    }

    pub fn with_planner(mut self, planner: ChunkPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_max_content_size(mut self, max: u64) -> Self {
        self.max_content_size = max;
        self
    }

    /// Store `data` for `tenant_id`, deduplicating against existing content.
    #[instrument(skip(self, data, opts), level = "debug", fields(size = data.len()))]
    pub async fn put(&self, tenant_id: &str, data: Bytes, opts: PutOptions) -> Result<ContentRef> {
        self.check_payload(data.len() as u64)?;
        let tenant = self.resolve_tenant(tenant_id)?;
        let hash = hash_bytes(&data);

        let _guard = self.lock_key(tenant_id, &hash).await;
        self.put_locked(&tenant, hash, data, opts).await
    }

    /// Store a file, deriving `filename` and `mime_type` from the path when
    /// the caller did not supply them. Large files stream through
    /// [`Self::put_stream`] instead of being read whole.
    pub async fn put_file(
        &self,
        tenant_id: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<ContentRef> {
        let opts = PutOptions {
            filename: opts.filename.or_else(|| {
                path.file_name().map(|n| n.to_string_lossy().into_owned())
            }),
            mime_type: opts
                .mime_type
                .or_else(|| guess_mime(path).map(str::to_string)),
        };

        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        if len <= self.planner.chunk_size() {
            let data = tokio::fs::read(path).await?;
            self.put(tenant_id, Bytes::from(data), opts).await
        } else {
            self.put_stream(tenant_id, file, opts).await
        }
    }

    /// Store content from a byte stream without materializing it in memory.
    ///
    /// Each full chunk is written to the backend as soon as it is cut.
    /// Chunk keys are chunk hashes, so chunks spooled for content that turns
    /// out to be a dedup hit land on already-present keys idempotently.
    #[instrument(skip(self, reader, opts), level = "debug")]
    pub async fn put_stream<R>(
        &self,
        tenant_id: &str,
        mut reader: R,
        opts: PutOptions,
    ) -> Result<ContentRef>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tenant = self.resolve_tenant(tenant_id)?;
        let chunk_cap = self.planner.chunk_size() as usize;

        let mut hasher = StreamingHasher::new();
        let mut total: u64 = 0;
        let mut chunk_refs: Vec<ChunkRef> = Vec::new();

        let mut current = read_up_to(&mut reader, chunk_cap).await?;
        if current.is_empty() {
            return Err(CasError::InvalidInput("empty content".to_string()));
        }
        hasher.update(&current);
        total += current.len() as u64;
        self.check_payload(total)?;

        loop {
            let next = read_up_to(&mut reader, chunk_cap).await?;
            if next.is_empty() {
                break;
            }
            hasher.update(&next);
            total += next.len() as u64;
            self.check_payload(total)?;

            // More data follows, so `current` is a full chunk.
            let chunk_len = current.len() as u64;
            let chunk_hash = hash_bytes(&current);
            self.backend
                .store(&tenant.storage_namespace, &chunk_hash.to_hex(), Bytes::from(current))
                .await?;
            chunk_refs.push(ChunkRef {
                index: chunk_refs.len() as u32,
                hash: chunk_hash,
                size: chunk_len,
            });
            current = next;
        }

        if chunk_refs.is_empty() {
            // Whole payload fit in one buffer; hand off to the size-planned
            // path, which picks inline or single storage.
            let data = Bytes::from(current);
            let hash = hash_bytes(&data);
            let _guard = self.lock_key(tenant_id, &hash).await;
            return self.put_locked(&tenant, hash, data, opts).await;
        }

        let chunk_len = current.len() as u64;
        let chunk_hash = hash_bytes(&current);
        self.backend
            .store(&tenant.storage_namespace, &chunk_hash.to_hex(), Bytes::from(current))
            .await?;
        chunk_refs.push(ChunkRef {
            index: chunk_refs.len() as u32,
            hash: chunk_hash,
            size: chunk_len,
        });

        let hash = hasher.finalize();
        let _guard = self.lock_key(tenant_id, &hash).await;

        if let Some(existing) = self.meta.find_by_hash(tenant_id, &hash)? {
            let (stored, _) = self.meta.upsert_increment(tenant_id, &as_new(&existing))?;
            debug!(tenant = tenant_id, hash = %hash, refs = stored.reference_count, "stream dedup hit");
            return Ok(ContentRef::from(&stored));
        }

        // Spooling ran before this lock was held; a delete of the same hash
        // may have purged the spooled keys in that window.
        self.verify_chunks_present(&tenant.storage_namespace, &chunk_refs)
            .await?;

        let new = NewContentObject {
            hash,
            size: total,
            mime_type: opts.mime_type,
            filename: opts.filename,
            storage_type: StorageType::Chunked,
            inline_data: None,
            chunks: Some(chunk_refs),
        };
        let (stored, _) = self.meta.upsert_increment(tenant_id, &new)?;
        debug!(tenant = tenant_id, hash = %hash, size = total, "stream stored chunked");
        Ok(ContentRef::from(&stored))
    }

    /// Fetch content bytes by hash. Backend payloads are integrity-checked
    /// against their hashes before being returned.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, tenant_id: &str, hash: &ContentHash) -> Result<Bytes> {
        let tenant = self.resolve_tenant(tenant_id)?;
        let obj = self
            .meta
            .find_by_hash(tenant_id, hash)?
            .ok_or_else(|| content_not_found(tenant_id, hash))?;

        match obj.storage_type {
            StorageType::Inline => {
                let data = obj.inline_data.ok_or_else(|| {
                    CasError::Metadata(format!("inline row {hash} has no payload"))
                })?;
                Ok(Bytes::from(data))
            }
            StorageType::Single => {
                let data = self
                    .backend
                    .retrieve(&tenant.storage_namespace, &hash.to_hex())
                    .await
                    .map_err(|e| map_retrieve_err(e, tenant_id, hash))?;
                verify_integrity(hash, &data)?;
                Ok(data)
            }
            StorageType::Chunked => {
                let mut chunks = obj.chunks.ok_or_else(|| {
                    CasError::Metadata(format!("chunked row {hash} has no chunk list"))
                })?;
                chunks.sort_by_key(|c| c.index);

                let mut parts = Vec::with_capacity(chunks.len());
                for chunk in &chunks {
                    let data = self
                        .backend
                        .retrieve(&tenant.storage_namespace, &chunk.hash.to_hex())
                        .await
                        .map_err(|e| map_retrieve_err(e, tenant_id, hash))?;
                    verify_integrity(&chunk.hash, &data)?;
                    parts.push(data);
                }
                Ok(ChunkPlanner::reassemble(&parts))
            }
        }
    }

    /// Metadata-only existence check; no backend I/O.
    pub async fn exists(&self, tenant_id: &str, hash: &ContentHash) -> Result<bool> {
        self.resolve_tenant(tenant_id)?;
        Ok(self.meta.find_by_hash(tenant_id, hash)?.is_some())
    }

    /// Drop one reference, returning the new count. At zero the backend
    /// bytes are purged (every chunk included) and the metadata row removed;
    /// while references remain the object is untouched.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, tenant_id: &str, hash: &ContentHash) -> Result<u64> {
        let tenant = self.resolve_tenant(tenant_id)?;
        let _guard = self.lock_key(tenant_id, hash).await;

        let obj = self
            .meta
            .find_by_hash(tenant_id, hash)?
            .ok_or_else(|| content_not_found(tenant_id, hash))?;

        let new_count = self.meta.decrement_or_delete(tenant_id, hash)?;
        if new_count == 0 {
            self.purge(&tenant, &obj).await?;
            self.meta.remove_object(tenant_id, hash)?;
            debug!(tenant = tenant_id, hash = %hash, "object purged");
        }
        Ok(new_count)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<StatsReport> {
        self.resolve_tenant(tenant_id)?;
        Ok(self.meta.stats(tenant_id)?)
    }

    // --- internals ---

    /// Dedup-check-then-write for a fully materialized payload. Caller
    /// holds the key lock.
    async fn put_locked(
        &self,
        tenant: &Tenant,
        hash: ContentHash,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<ContentRef> {
        if let Some(existing) = self.meta.find_by_hash(&tenant.id, &hash)? {
            // Dedup hit: one atomic increment, no bytes touched, caller
            // metadata ignored.
            let (stored, _) = self.meta.upsert_increment(&tenant.id, &as_new(&existing))?;
            debug!(tenant = %tenant.id, hash = %hash, refs = stored.reference_count, "dedup hit");
            return Ok(ContentRef::from(&stored));
        }

        let size = data.len() as u64;
        let storage_type = self.planner.plan_storage(size);
        let (inline_data, chunks) = match storage_type {
            StorageType::Inline => (Some(data.to_vec()), None),
            StorageType::Single => {
                self.backend
                    .store(&tenant.storage_namespace, &hash.to_hex(), data)
                    .await?;
                (None, None)
            }
            StorageType::Chunked => {
                // All chunks are confirmed written before the metadata row
                // exists; a failure here leaves orphaned content-addressed
                // chunks but never a row referencing a partial set.
                let refs = self.store_chunks(&tenant.storage_namespace, &data).await?;
                // A sibling object sharing a chunk key can be purged between
                // the store above and the row insert below.
                self.verify_chunks_present(&tenant.storage_namespace, &refs)
                    .await?;
                (None, Some(refs))
            }
        };

        let new = NewContentObject {
            hash,
            size,
            mime_type: opts.mime_type,
            filename: opts.filename,
            storage_type,
            inline_data,
            chunks,
        };
        let (stored, _) = self.meta.upsert_increment(&tenant.id, &new)?;
        debug!(tenant = %tenant.id, hash = %hash, size, storage = storage_type.as_str(), "stored");
        Ok(ContentRef::from(&stored))
    }

    async fn store_chunks(&self, namespace: &str, data: &[u8]) -> Result<Vec<ChunkRef>> {
        let mut refs = Vec::new();
        for (index, chunk) in self.planner.split_into_chunks(data).enumerate() {
            let chunk_hash = hash_bytes(chunk);
            self.backend
                .store(namespace, &chunk_hash.to_hex(), Bytes::copy_from_slice(chunk))
                .await?;
            refs.push(ChunkRef {
                index: index as u32,
                hash: chunk_hash,
                size: chunk.len() as u64,
            });
        }
        Ok(refs)
    }

    async fn purge(&self, tenant: &Tenant, obj: &ContentObject) -> Result<()> {
        match obj.storage_type {
            StorageType::Inline => {}
            StorageType::Single => self.purge_key(tenant, &obj.hash, &obj.hash).await?,
            StorageType::Chunked => {
                for chunk in obj.chunks.iter().flatten() {
                    self.purge_key(tenant, &obj.hash, &chunk.hash).await?;
                }
            }
        }
        Ok(())
    }

    /// Delete one backend key unless another live row still needs it.
    ///
    /// Keys are content addresses shared tenant-wide, so a dying object may
    /// not own its chunks exclusively: another chunked object can list the
    /// same chunk hash, and a single-storage object's key can double as a
    /// chunk of a larger one. Concurrent purges of two sharers can each see
    /// the other's pending row and both skip; that leaves the key orphaned,
    /// never missing, and the next identical put re-owns it.
    async fn purge_key(
        &self,
        tenant: &Tenant,
        dying: &ContentHash,
        key: &ContentHash,
    ) -> Result<()> {
        if self.meta.key_referenced_elsewhere(&tenant.id, dying, key)? {
            debug!(tenant = %tenant.id, key = %key, "purge skipped, key still referenced");
            return Ok(());
        }
        self.delete_tolerant(&tenant.storage_namespace, &key.to_hex())
            .await
    }

    /// Confirm every chunk key is still present before a metadata row
    /// starts referencing it. Chunks are written before the row exists, so
    /// a purge of a sharing object can race the spool; failing here is
    /// retryable and never publishes a row over absent bytes.
    async fn verify_chunks_present(&self, namespace: &str, chunks: &[ChunkRef]) -> Result<()> {
        for chunk in chunks {
            if !self
                .backend
                .contains(namespace, &chunk.hash.to_hex())
                .await?
            {
                return Err(CasError::BackendUnavailable(format!(
                    "chunk {} was removed before the object row was written; retry the store",
                    chunk.hash
                )));
            }
        }
        Ok(())
    }

    /// Backend delete where an already-absent key counts as success.
    async fn delete_tolerant(&self, namespace: &str, key: &str) -> Result<()> {
        match self.backend.delete(namespace, key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_payload(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(CasError::InvalidInput("empty content".to_string()));
        }
        if size > self.max_content_size {
            return Err(CasError::InvalidInput(format!(
                "content exceeds hard cap of {} bytes",
                self.max_content_size
            )));
        }
        Ok(())
    }

    fn resolve_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        validate_tenant_id(tenant_id)?;
        self.meta
            .get_tenant(tenant_id)?
            .ok_or_else(|| CasError::TenantNotProvisioned(tenant_id.to_string()))
    }

    async fn lock_key(&self, tenant_id: &str, hash: &ContentHash) -> tokio::sync::OwnedMutexGuard<()> {
        let key = format!("{tenant_id}/{hash}");
        let lock = {
            // Entry guard must drop before awaiting the mutex.
            let entry = self.key_locks.entry(key).or_default();
            entry.clone()
        };
        lock.lock_owned().await
    }
}

pub(crate) fn validate_tenant_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(CasError::InvalidInput(format!("malformed tenant id: {id:?}")));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(CasError::InvalidInput(format!("malformed tenant id: {id:?}")));
    }
    Ok(())
}

fn as_new(obj: &ContentObject) -> NewContentObject {
    NewContentObject {
        hash: obj.hash,
        size: obj.size,
        mime_type: obj.mime_type.clone(),
        filename: obj.filename.clone(),
        storage_type: obj.storage_type,
        inline_data: obj.inline_data.clone(),
        chunks: obj.chunks.clone(),
    }
}

fn content_not_found(tenant: &str, hash: &ContentHash) -> CasError {
    CasError::ContentNotFound {
        tenant: tenant.to_string(),
        hash: hash.to_hex(),
    }
}

fn map_retrieve_err(e: BackendError, tenant: &str, hash: &ContentHash) -> CasError {
    if e.is_not_found() {
        content_not_found(tenant, hash)
    } else {
        CasError::BackendUnavailable(e.to_string())
    }
}

fn verify_integrity(expected: &ContentHash, data: &[u8]) -> Result<()> {
    let actual = hash_bytes(data);
    if actual != *expected {
        return Err(CasError::ChunkIntegrity {
            hash: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, cap: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; cap];
    let mut filled = 0;
    while filled < cap {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn guess_mime(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "txt" | "md" => Some("text/plain"),
        "html" => Some("text/html"),
        "csv" => Some("text/csv"),
        "json" => Some("application/json"),
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "zip" => Some("application/zip"),
        "gz" => Some("application/gzip"),
        _ => None,
    }
}
