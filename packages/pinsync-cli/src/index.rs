// Pin mapping index: (backend, cid) -> artifact location and sync status
use crate::content::{Cid, ContentDigest};
use crate::db::MetadataDb;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Sync status of one mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Pending,
    Synced,
    Failed,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Synced => "synced",
            MappingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MappingStatus::Pending),
            "synced" => Ok(MappingStatus::Synced),
            "failed" => Ok(MappingStatus::Failed),
            other => Err(Error::CorruptRecord(format!("unknown mapping status '{other}'"))),
        }
    }
}

/// Association of a CID with one backend
#[derive(Debug, Clone, Serialize)]
pub struct PinMapping {
    pub backend_name: String,
    pub cid: Cid,
    pub artifact_location: Option<String>,
    /// Digest of the package the backend confirmed on the last sync
    pub digest: Option<ContentDigest>,
    pub metadata: serde_json::Value,
    pub status: MappingStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// One hit of a cross-backend CID lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CidLocation {
    pub backend_name: String,
    pub artifact_location: Option<String>,
    pub status: MappingStatus,
}

/// Mapping counts per status for one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    backend_name: String,
    cid: String,
    artifact_location: Option<String>,
    digest: Option<String>,
    metadata: String,
    status: String,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
}

impl TryFrom<MappingRow> for PinMapping {
    type Error = Error;

    fn try_from(row: MappingRow) -> Result<Self> {
        let digest = row
            .digest
            .map(|d| {
                d.parse::<ContentDigest>()
                    .map_err(|e| Error::CorruptRecord(format!("bad digest '{d}': {e}")))
            })
            .transpose()?;

        Ok(PinMapping {
            cid: row.cid.parse()?,
            digest,
            metadata: serde_json::from_str(&row.metadata)?,
            status: row.status.parse()?,
            backend_name: row.backend_name,
            artifact_location: row.artifact_location,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            synced_at: row.synced_at,
        })
    }
}

const MAPPING_COLUMNS: &str = "backend_name, cid, artifact_location, digest, metadata, status, \
                               last_error, created_at, updated_at, synced_at";

/// Durable per-backend pin index.
///
/// All backends share one table keyed by `(backend_name, cid)`; writes take
/// the per-backend lock so each backend has a single writer at a time.
pub struct PinIndex {
    db: MetadataDb,
    locks: Arc<KeyedLocks>,
}

impl PinIndex {
    pub fn new(db: MetadataDb, locks: Arc<KeyedLocks>) -> Self {
        Self { db, locks }
    }

    /// Insert or update a mapping.
    ///
    /// Re-adding an existing pair replaces its metadata and resets it to
    /// `pending`; `created_at` is kept. Fails with `NotFound` unless the
    /// backend is registered when the row is written.
    pub async fn add(
        &self,
        backend: &str,
        cid: &Cid,
        metadata: serde_json::Value,
    ) -> Result<PinMapping> {
        let _guard = self.locks.lock(backend).await;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO pin_mappings (backend_name, cid, metadata, status, created_at, updated_at) \
             SELECT name, ?, ?, 'pending', ?, ? FROM backends WHERE name = ? \
             ON CONFLICT (backend_name, cid) DO UPDATE SET \
                 metadata = excluded.metadata, \
                 status = 'pending', \
                 last_error = NULL, \
                 updated_at = excluded.updated_at",
        )
        .bind(cid.as_str())
        .bind(serde_json::to_string(&metadata)?)
        .bind(now)
        .bind(now)
        .bind(backend)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(backend.to_string()));
        }
        tracing::debug!("Upserted mapping {} on '{}'", cid, backend);

        self.get(backend, cid).await?.ok_or_else(|| Error::PinNotFound {
            backend: backend.to_string(),
            cid: cid.to_string(),
        })
    }

    pub async fn get(&self, backend: &str, cid: &Cid) -> Result<Option<PinMapping>> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM pin_mappings WHERE backend_name = ? AND cid = ?");
        sqlx::query_as::<_, MappingRow>(&sql)
            .bind(backend)
            .bind(cid.as_str())
            .fetch_optional(self.db.pool())
            .await?
            .map(PinMapping::try_from)
            .transpose()
    }

    /// Mappings for one backend, newest first
    pub async fn list(&self, backend: &str, limit: Option<u32>) -> Result<Vec<PinMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM pin_mappings WHERE backend_name = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query_as::<_, MappingRow>(&sql)
            .bind(backend)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter().map(PinMapping::try_from).collect()
    }

    /// Every backend holding a mapping for `cid`
    pub async fn find_by_cid(&self, cid: &Cid) -> Result<Vec<CidLocation>> {
        let rows: Vec<(String, Option<String>, String)> = sqlx::query_as(
            "SELECT backend_name, artifact_location, status FROM pin_mappings \
             WHERE cid = ? ORDER BY backend_name",
        )
        .bind(cid.as_str())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|(backend_name, artifact_location, status)| -> Result<CidLocation> {
                Ok(CidLocation {
                    backend_name,
                    artifact_location,
                    status: status.parse()?,
                })
            })
            .collect()
    }

    /// Mappings awaiting a sync attempt, oldest first
    pub async fn pending(&self, backend: &str) -> Result<Vec<PinMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM pin_mappings \
             WHERE backend_name = ? AND status IN ('pending', 'failed') \
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query_as::<_, MappingRow>(&sql)
            .bind(backend)
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter().map(PinMapping::try_from).collect()
    }

    /// Record a successful store.
    ///
    /// Applies only if the mapping is unchanged since it was read; a re-add
    /// in the meantime keeps it pending for the next pass. Returns whether
    /// the row was updated.
    pub async fn mark_synced(
        &self,
        mapping: &PinMapping,
        location: &str,
        digest: ContentDigest,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&mapping.backend_name).await;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE pin_mappings SET status = 'synced', artifact_location = ?, digest = ?, \
             last_error = NULL, updated_at = ?, synced_at = ? \
             WHERE backend_name = ? AND cid = ? AND updated_at = ?",
        )
        .bind(location)
        .bind(digest.to_string())
        .bind(now)
        .bind(now)
        .bind(&mapping.backend_name)
        .bind(mapping.cid.as_str())
        .bind(mapping.updated_at)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt, under the same staleness rule as [`Self::mark_synced`]
    pub async fn mark_failed(&self, mapping: &PinMapping, error: &str) -> Result<bool> {
        let _guard = self.locks.lock(&mapping.backend_name).await;

        let result = sqlx::query(
            "UPDATE pin_mappings SET status = 'failed', last_error = ?, updated_at = ? \
             WHERE backend_name = ? AND cid = ? AND updated_at = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(&mapping.backend_name)
        .bind(mapping.cid.as_str())
        .bind(mapping.updated_at)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete one mapping; returns whether it existed
    pub async fn remove(&self, backend: &str, cid: &Cid) -> Result<bool> {
        let _guard = self.locks.lock(backend).await;

        let result = sqlx::query("DELETE FROM pin_mappings WHERE backend_name = ? AND cid = ?")
            .bind(backend)
            .bind(cid.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hold the backend's write lock, blocking every mapping write for it
    pub(crate) async fn lock_backend(&self, backend: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(backend).await
    }

    /// Delete mappings whose backend is no longer registered
    pub async fn remove_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM pin_mappings WHERE backend_name NOT IN (SELECT name FROM backends)",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub async fn count(&self, backend: &str) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM pin_mappings WHERE backend_name = ?")
            .bind(backend)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    pub async fn counts(&self, backend: &str) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM pin_mappings WHERE backend_name = ? GROUP BY status",
        )
        .bind(backend)
        .fetch_all(self.db.pool())
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse()? {
                MappingStatus::Pending => counts.pending = n,
                MappingStatus::Synced => counts.synced = n,
                MappingStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}
