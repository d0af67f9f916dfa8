//! SQLite-backed [`MetadataStore`].
//!
//! A single connection behind a mutex; every multi-statement operation runs
//! in a transaction and the lock is never held across backend I/O (this
//! crate does none).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use strata_hash::ContentHash;

use crate::{
    ChunkRef, ContentObject, MetaError, NewContentObject, Result, StatsReport, StorageType, Tenant,
};

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (creating if needed) the metadata database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                storage_namespace TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS content_objects (
                tenant_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT,
                filename TEXT,
                storage_type TEXT NOT NULL,
                inline_data BLOB,
                chunks TEXT,
                reference_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_content_objects_tenant
                ON content_objects(tenant_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- tenant registry ---

    /// Register a tenant. Idempotent: re-inserting an existing id returns
    /// the stored row untouched.
    pub fn insert_tenant(&self, tenant: &Tenant) -> Result<Tenant> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO tenants (id, slug, storage_namespace, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tenant.id,
                tenant.slug,
                tenant.storage_namespace,
                tenant.created_at.timestamp()
            ],
        )?;
        Self::read_tenant(&conn, &tenant.id)?
            .ok_or_else(|| MetaError::TenantNotFound(tenant.id.clone()))
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        Self::read_tenant(&conn, tenant_id)
    }

    pub fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM tenants WHERE id = ?1", params![tenant_id])?;
        if removed == 0 {
            return Err(MetaError::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Number of content rows a tenant still owns, purged or not.
    pub fn object_count(&self, tenant_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_objects WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Whether any row other than `exclude` still needs the backend object
    /// at `key`: a single-storage row whose content hash is the key, or a
    /// chunked row listing it.
    ///
    /// Chunk lists are stored as JSON; a 64-char hex string appearing as a
    /// substring of another 64-char hash implies equality, so a plain LIKE
    /// scan is exact here.
    pub fn key_referenced_elsewhere(
        &self,
        tenant_id: &str,
        exclude: &ContentHash,
        key: &ContentHash,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_objects
             WHERE tenant_id = ?1 AND hash != ?2
               AND ((hash = ?3 AND storage_type = 'single')
                    OR (chunks IS NOT NULL AND chunks LIKE '%' || ?3 || '%'))",
            params![tenant_id, exclude.to_hex(), key.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Rows decremented to zero but not yet removed. Nonzero only if a crash
    /// interrupted a delete between the decrement and the backend purge.
    pub fn unpurged_count(&self, tenant_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_objects
             WHERE tenant_id = ?1 AND reference_count = 0",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn read_tenant(conn: &Connection, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = conn
            .query_row(
                "SELECT id, slug, storage_namespace, created_at FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(id, slug, storage_namespace, ts)| Tenant {
            id,
            slug,
            storage_namespace,
            created_at: timestamp_to_utc(ts),
        }))
    }

    // --- content objects ---

    pub fn find_by_hash(&self, tenant_id: &str, hash: &ContentHash) -> Result<Option<ContentObject>> {
        let conn = self.conn.lock().unwrap();
        Self::read_object(&conn, tenant_id, hash)
    }

    /// Insert the object with `reference_count = 1`, or atomically increment
    /// the existing row's count. Returns the stored row and whether this
    /// call created it.
    ///
    /// The insert-or-increment is one SQL statement; concurrent callers can
    /// never both observe "not present" and double-insert.
    pub fn upsert_increment(
        &self,
        tenant_id: &str,
        obj: &NewContentObject,
    ) -> Result<(ContentObject, bool)> {
        let chunks_json = obj
            .chunks
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO content_objects
                (tenant_id, hash, size, mime_type, filename, storage_type,
                 inline_data, chunks, reference_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
             ON CONFLICT(tenant_id, hash) DO UPDATE SET
                 reference_count = reference_count + 1",
            params![
                tenant_id,
                obj.hash.to_hex(),
                obj.size as i64,
                obj.mime_type,
                obj.filename,
                obj.storage_type.as_str(),
                obj.inline_data,
                chunks_json,
                Utc::now().timestamp(),
            ],
        )?;

        let stored = Self::read_object(&tx, tenant_id, &obj.hash)?.ok_or_else(|| {
            MetaError::NotFound {
                tenant: tenant_id.to_string(),
                hash: obj.hash.to_hex(),
            }
        })?;
        tx.commit()?;

        let created = stored.reference_count == 1;
        debug!(tenant = tenant_id, hash = %obj.hash, refs = stored.reference_count, created, "upsert");
        Ok((stored, created))
    }

    /// Atomically decrement the reference count, returning the new value.
    ///
    /// The row is retained at 0 so the caller can purge backend bytes and
    /// then remove it explicitly; the count never goes negative.
    pub fn decrement_or_delete(&self, tenant_id: &str, hash: &ContentHash) -> Result<u64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE content_objects
             SET reference_count = reference_count - 1
             WHERE tenant_id = ?1 AND hash = ?2 AND reference_count > 0",
            params![tenant_id, hash.to_hex()],
        )?;

        if updated == 0 {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT reference_count FROM content_objects
                     WHERE tenant_id = ?1 AND hash = ?2",
                    params![tenant_id, hash.to_hex()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match existing {
                None => MetaError::NotFound {
                    tenant: tenant_id.to_string(),
                    hash: hash.to_hex(),
                },
                Some(_) => MetaError::AlreadyUnreferenced {
                    tenant: tenant_id.to_string(),
                    hash: hash.to_hex(),
                },
            });
        }

        let new_count: i64 = tx.query_row(
            "SELECT reference_count FROM content_objects
             WHERE tenant_id = ?1 AND hash = ?2",
            params![tenant_id, hash.to_hex()],
            |row| row.get(0),
        )?;
        tx.commit()?;

        debug!(tenant = tenant_id, hash = %hash, refs = new_count, "decrement");
        Ok(new_count as u64)
    }

    /// Remove a metadata row. Called only after the backend bytes are purged.
    pub fn remove_object(&self, tenant_id: &str, hash: &ContentHash) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM content_objects WHERE tenant_id = ?1 AND hash = ?2",
            params![tenant_id, hash.to_hex()],
        )?;
        if removed == 0 {
            return Err(MetaError::NotFound {
                tenant: tenant_id.to_string(),
                hash: hash.to_hex(),
            });
        }
        Ok(())
    }

    /// Explicit metadata merge. Content under a hash is immutable; only the
    /// descriptive fields may change, and only through this operation.
    pub fn merge_metadata(
        &self,
        tenant_id: &str,
        hash: &ContentHash,
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> Result<ContentObject> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE content_objects
             SET mime_type = COALESCE(?3, mime_type),
                 filename = COALESCE(?4, filename)
             WHERE tenant_id = ?1 AND hash = ?2",
            params![tenant_id, hash.to_hex(), mime_type, filename],
        )?;
        if updated == 0 {
            return Err(MetaError::NotFound {
                tenant: tenant_id.to_string(),
                hash: hash.to_hex(),
            });
        }
        Self::read_object(&conn, tenant_id, hash)?.ok_or_else(|| MetaError::NotFound {
            tenant: tenant_id.to_string(),
            hash: hash.to_hex(),
        })
    }

    pub fn stats(&self, tenant_id: &str) -> Result<StatsReport> {
        let conn = self.conn.lock().unwrap();
        let (objects, bytes, refs): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(SUM(reference_count), 0)
             FROM content_objects WHERE tenant_id = ?1",
            params![tenant_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let total_objects = objects as u64;
        let total_bytes = bytes as u64;
        let total_references = refs as u64;
        Ok(StatsReport {
            total_objects,
            total_bytes,
            avg_size: if total_objects == 0 {
                0
            } else {
                total_bytes / total_objects
            },
            total_references,
            dedup_ratio: if total_objects == 0 {
                1.0
            } else {
                total_references as f64 / total_objects as f64
            },
        })
    }

    fn read_object(
        conn: &Connection,
        tenant_id: &str,
        hash: &ContentHash,
    ) -> Result<Option<ContentObject>> {
        let row = conn
            .query_row(
                "SELECT size, mime_type, filename, storage_type, inline_data, chunks,
                        reference_count, created_at
                 FROM content_objects WHERE tenant_id = ?1 AND hash = ?2",
                params![tenant_id, hash.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((size, mime_type, filename, storage_type, inline_data, chunks_json, refs, ts)) =
            row
        else {
            return Ok(None);
        };

        let storage_type = StorageType::parse(&storage_type).ok_or_else(|| {
            MetaError::Db(rusqlite::Error::InvalidColumnName(format!(
                "unknown storage_type '{storage_type}'"
            )))
        })?;
        let chunks: Option<Vec<ChunkRef>> = chunks_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?;

        Ok(Some(ContentObject {
            tenant_id: tenant_id.to_string(),
            hash: *hash,
            size: size as u64,
            mime_type,
            filename,
            storage_type,
            inline_data,
            chunks,
            reference_count: refs as u64,
            created_at: timestamp_to_utc(ts),
        }))
    }
}

fn timestamp_to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_hash::hash_bytes;

    fn new_obj(data: &[u8]) -> NewContentObject {
        NewContentObject {
            hash: hash_bytes(data),
            size: data.len() as u64,
            mime_type: Some("text/plain".to_string()),
            filename: Some("a.txt".to_string()),
            storage_type: StorageType::Inline,
            inline_data: Some(data.to_vec()),
            chunks: None,
        }
    }

    #[test]
    fn upsert_then_increment() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"hello");

        let (stored, created) = store.upsert_increment("t1", &obj).unwrap();
        assert!(created);
        assert_eq!(stored.reference_count, 1);

        let (stored, created) = store.upsert_increment("t1", &obj).unwrap();
        assert!(!created);
        assert_eq!(stored.reference_count, 2);
        // dedup hit never rewrites descriptive metadata
        assert_eq!(stored.mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn decrement_retains_row_at_zero() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"refcounted");
        store.upsert_increment("t1", &obj).unwrap();

        assert_eq!(store.decrement_or_delete("t1", &obj.hash).unwrap(), 0);
        // row stays visible for the purge pass
        let row = store.find_by_hash("t1", &obj.hash).unwrap().unwrap();
        assert_eq!(row.reference_count, 0);

        store.remove_object("t1", &obj.hash).unwrap();
        assert!(store.find_by_hash("t1", &obj.hash).unwrap().is_none());
    }

    #[test]
    fn key_reference_lookup_spans_chunks_and_single() {
        let store = MetadataStore::open_in_memory().unwrap();
        let shared = hash_bytes(b"shared chunk bytes");

        let single = NewContentObject {
            hash: shared,
            size: 64,
            mime_type: None,
            filename: None,
            storage_type: StorageType::Single,
            inline_data: None,
            chunks: None,
        };
        store.upsert_increment("t1", &single).unwrap();

        let chunked = NewContentObject {
            hash: hash_bytes(b"parent content"),
            size: 128,
            mime_type: None,
            filename: None,
            storage_type: StorageType::Chunked,
            inline_data: None,
            chunks: Some(vec![ChunkRef {
                index: 0,
                hash: shared,
                size: 64,
            }]),
        };
        store.upsert_increment("t1", &chunked).unwrap();

        // each row sees that the other still needs the shared key
        assert!(store
            .key_referenced_elsewhere("t1", &chunked.hash, &shared)
            .unwrap());
        assert!(store
            .key_referenced_elsewhere("t1", &single.hash, &shared)
            .unwrap());
        // the parent's own content hash is not a backend key anyone shares
        assert!(!store
            .key_referenced_elsewhere("t1", &single.hash, &chunked.hash)
            .unwrap());
        // references never cross tenants
        assert!(!store
            .key_referenced_elsewhere("t2", &chunked.hash, &shared)
            .unwrap());

        store.decrement_or_delete("t1", &chunked.hash).unwrap();
        store.remove_object("t1", &chunked.hash).unwrap();
        assert!(!store
            .key_referenced_elsewhere("t1", &single.hash, &shared)
            .unwrap());
    }

    #[test]
    fn unpurged_count_tracks_zero_ref_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"leftover");
        store.upsert_increment("t1", &obj).unwrap();
        assert_eq!(store.unpurged_count("t1").unwrap(), 0);

        store.decrement_or_delete("t1", &obj.hash).unwrap();
        assert_eq!(store.unpurged_count("t1").unwrap(), 1);
        assert_eq!(store.object_count("t1").unwrap(), 1);

        store.remove_object("t1", &obj.hash).unwrap();
        assert_eq!(store.unpurged_count("t1").unwrap(), 0);
        assert_eq!(store.object_count("t1").unwrap(), 0);
    }

    #[test]
    fn decrement_never_goes_negative() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"once");
        store.upsert_increment("t1", &obj).unwrap();
        store.decrement_or_delete("t1", &obj.hash).unwrap();

        let err = store.decrement_or_delete("t1", &obj.hash).unwrap_err();
        assert!(matches!(err, MetaError::AlreadyUnreferenced { .. }));
        assert_eq!(
            store
                .find_by_hash("t1", &obj.hash)
                .unwrap()
                .unwrap()
                .reference_count,
            0
        );
    }

    #[test]
    fn decrement_missing_is_not_found() {
        let store = MetadataStore::open_in_memory().unwrap();
        let err = store
            .decrement_or_delete("t1", &hash_bytes(b"never stored"))
            .unwrap_err();
        assert!(matches!(err, MetaError::NotFound { .. }));
    }

    #[test]
    fn tenants_do_not_share_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"shared bytes");

        store.upsert_increment("t1", &obj).unwrap();
        store.upsert_increment("t1", &obj).unwrap();
        store.upsert_increment("t2", &obj).unwrap();

        assert_eq!(
            store.find_by_hash("t1", &obj.hash).unwrap().unwrap().reference_count,
            2
        );
        assert_eq!(
            store.find_by_hash("t2", &obj.hash).unwrap().unwrap().reference_count,
            1
        );
    }

    #[test]
    fn chunked_roundtrip_through_row() {
        let store = MetadataStore::open_in_memory().unwrap();
        let chunks = vec![
            ChunkRef {
                index: 0,
                hash: hash_bytes(b"chunk0"),
                size: 6,
            },
            ChunkRef {
                index: 1,
                hash: hash_bytes(b"chunk1"),
                size: 6,
            },
        ];
        let obj = NewContentObject {
            hash: hash_bytes(b"chunk0chunk1"),
            size: 12,
            mime_type: None,
            filename: None,
            storage_type: StorageType::Chunked,
            inline_data: None,
            chunks: Some(chunks.clone()),
        };
        store.upsert_increment("t1", &obj).unwrap();

        let row = store.find_by_hash("t1", &obj.hash).unwrap().unwrap();
        assert_eq!(row.storage_type, StorageType::Chunked);
        assert_eq!(row.chunks.unwrap(), chunks);
    }

    #[test]
    fn stats_aggregates() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert_eq!(
            store.stats("t1").unwrap(),
            StatsReport {
                total_objects: 0,
                total_bytes: 0,
                avg_size: 0,
                total_references: 0,
                dedup_ratio: 1.0,
            }
        );

        let a = new_obj(b"aaaa");
        let b = new_obj(b"bbbbbbbb");
        store.upsert_increment("t1", &a).unwrap();
        store.upsert_increment("t1", &a).unwrap();
        store.upsert_increment("t1", &b).unwrap();

        let stats = store.stats("t1").unwrap();
        assert_eq!(stats.total_objects, 2);
        assert_eq!(stats.total_bytes, 12);
        assert_eq!(stats.avg_size, 6);
        assert_eq!(stats.total_references, 3);
        assert_eq!(stats.dedup_ratio, 1.5);
    }

    #[test]
    fn merge_metadata_is_explicit_and_partial() {
        let store = MetadataStore::open_in_memory().unwrap();
        let obj = new_obj(b"merge me");
        store.upsert_increment("t1", &obj).unwrap();

        let row = store
            .merge_metadata("t1", &obj.hash, Some("application/json"), None)
            .unwrap();
        assert_eq!(row.mime_type.as_deref(), Some("application/json"));
        // unspecified field untouched
        assert_eq!(row.filename.as_deref(), Some("a.txt"));
    }

    #[test]
    fn tenant_registry_lifecycle() {
        let store = MetadataStore::open_in_memory().unwrap();
        let tenant = Tenant {
            id: "t1".to_string(),
            slug: "acme".to_string(),
            storage_namespace: "acme".to_string(),
            created_at: Utc::now(),
        };

        let stored = store.insert_tenant(&tenant).unwrap();
        assert_eq!(stored.slug, "acme");

        // idempotent re-insert keeps the original row
        let again = store.insert_tenant(&tenant).unwrap();
        assert_eq!(again.created_at, stored.created_at);

        assert!(store.get_tenant("t1").unwrap().is_some());
        store.remove_tenant("t1").unwrap();
        assert!(store.get_tenant("t1").unwrap().is_none());
        assert!(matches!(
            store.remove_tenant("t1").unwrap_err(),
            MetaError::TenantNotFound(_)
        ));
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("meta.db");

        let obj = new_obj(b"durable");
        {
            let store = MetadataStore::open(&db_path).unwrap();
            store.upsert_increment("t1", &obj).unwrap();
        }
        let store = MetadataStore::open(&db_path).unwrap();
        let row = store.find_by_hash("t1", &obj.hash).unwrap().unwrap();
        assert_eq!(row.inline_data.as_deref(), Some(&b"durable"[..]));
    }
}
