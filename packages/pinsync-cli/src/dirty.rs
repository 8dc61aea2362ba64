// Dirty-state tracker: which backends have unsynchronized work
use crate::db::MetadataDb;
use crate::error::{Error, Result};
use crate::health::HealthResult;
use crate::locks::KeyedLocks;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Staleness record of one backend.
///
/// Health and dirtiness are independent: a backend may be reachable with
/// pending work, or unreachable with nothing to do.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirtyState {
    pub is_dirty: bool,
    pub reason: String,
    pub marked_at: Option<DateTime<Utc>>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_health_check: Option<HealthResult>,
    /// Bumped in the database on every mark
    #[serde(skip)]
    generation: i64,
}

impl DirtyState {
    pub fn generation(&self) -> i64 {
        self.generation
    }
}

const STATE_COLUMNS: &str =
    "backend_name, is_dirty, reason, marked_at, last_sync_time, last_health_check, generation";

#[derive(sqlx::FromRow)]
struct StateRow {
    backend_name: String,
    is_dirty: bool,
    reason: String,
    marked_at: Option<DateTime<Utc>>,
    last_sync_time: Option<DateTime<Utc>>,
    last_health_check: Option<String>,
    generation: i64,
}

impl StateRow {
    fn into_state(self) -> Result<(String, DirtyState)> {
        let last_health_check = match self.last_health_check {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok((
            self.backend_name,
            DirtyState {
                is_dirty: self.is_dirty,
                reason: self.reason,
                marked_at: self.marked_at,
                last_sync_time: self.last_sync_time,
                last_health_check,
                generation: self.generation,
            },
        ))
    }
}

/// Per-backend dirty flags backed by the `backend_state` table.
///
/// The database is authoritative. Every write is a single statement that
/// returns the resulting row, and the in-memory view is only updated from
/// that row, under the backend's lock, after the statement succeeded.
/// Writes are refused for backends missing from the registry.
pub struct DirtyTracker {
    db: MetadataDb,
    states: DashMap<String, DirtyState>,
    locks: KeyedLocks,
}

impl DirtyTracker {
    /// Load persisted flags from the database
    pub async fn load(db: MetadataDb) -> Result<Self> {
        let rows = sqlx::query_as::<_, StateRow>(&format!("SELECT {STATE_COLUMNS} FROM backend_state"))
            .fetch_all(db.pool())
            .await?;

        let states = DashMap::new();
        for row in rows {
            let (name, state) = row.into_state()?;
            states.insert(name, state);
        }

        tracing::debug!("Loaded dirty state for {} backend(s)", states.len());
        Ok(Self {
            db,
            states,
            locks: KeyedLocks::new(),
        })
    }

    /// Start tracking a backend with a clean flag
    pub async fn track(&self, backend: &str) -> Result<()> {
        {
            let _guard = self.locks.lock(backend).await;
            sqlx::query(
                "INSERT INTO backend_state (backend_name) \
                 SELECT name FROM backends WHERE name = ? \
                 ON CONFLICT (backend_name) DO NOTHING",
            )
            .bind(backend)
            .execute(self.db.pool())
            .await?;
        }

        match self.refresh(backend).await? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(backend.to_string())),
        }
    }

    /// Mark a backend dirty
    pub async fn mark(&self, backend: &str, reason: &str) -> Result<DirtyState> {
        let sql = format!(
            "INSERT INTO backend_state (backend_name, is_dirty, reason, marked_at, generation) \
             SELECT name, 1, ?, ?, 1 FROM backends WHERE name = ? \
             ON CONFLICT (backend_name) DO UPDATE SET \
                 is_dirty = 1, \
                 reason = excluded.reason, \
                 marked_at = excluded.marked_at, \
                 generation = backend_state.generation + 1 \
             RETURNING {STATE_COLUMNS}"
        );

        let _guard = self.locks.lock(backend).await;
        let row = sqlx::query_as::<_, StateRow>(&sql)
            .bind(reason)
            .bind(Utc::now())
            .bind(backend)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(backend.to_string()))?;
        let state = self.store(row)?;

        tracing::info!("Marked backend '{}' dirty: {}", backend, reason);
        Ok(state)
    }

    /// Mark every named backend dirty with the same reason
    pub async fn mark_all<I>(&self, backends: I, reason: &str) -> Result<BTreeMap<String, DirtyState>>
    where
        I: IntoIterator<Item = String>,
    {
        let marks = backends.into_iter().map(|name| async move {
            let state = self.mark(&name, reason).await?;
            Ok::<_, Error>((name, state))
        });

        futures::future::try_join_all(marks)
            .await
            .map(|states| states.into_iter().collect())
    }

    #[cfg(test)]
    pub fn is_dirty(&self, backend: &str) -> bool {
        self.states
            .get(backend)
            .map(|state| state.is_dirty)
            .unwrap_or(false)
    }

    pub fn dirty_backends(&self) -> BTreeSet<String> {
        self.states
            .iter()
            .filter(|entry| entry.is_dirty)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get(&self, backend: &str) -> Option<DirtyState> {
        self.states.get(backend).map(|state| state.clone())
    }

    /// Reload one backend's state from the database.
    ///
    /// Picks up marks written by other processes sharing the database.
    pub async fn refresh(&self, backend: &str) -> Result<Option<DirtyState>> {
        let _guard = self.locks.lock(backend).await;
        let row = sqlx::query_as::<_, StateRow>(&format!(
            "SELECT {STATE_COLUMNS} FROM backend_state WHERE backend_name = ?"
        ))
        .bind(backend)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => self.store(row).map(Some),
            None => {
                self.states.remove(backend);
                Ok(None)
            }
        }
    }

    /// Reload every backend's state from the database
    pub async fn refresh_all(&self) -> Result<()> {
        let persisted: Vec<String> = sqlx::query_scalar("SELECT backend_name FROM backend_state")
            .fetch_all(self.db.pool())
            .await?;
        let names: BTreeSet<String> = persisted
            .into_iter()
            .chain(self.states.iter().map(|entry| entry.key().clone()))
            .collect();

        futures::future::try_join_all(names.iter().map(|name| self.refresh(name))).await?;
        Ok(())
    }

    /// Clear the flag after a fully successful sync pass.
    ///
    /// Only the sync engine calls this. The flag is left set if the backend
    /// was marked again, by this process or another, after `generation` was
    /// read, since that mark may cover work the pass never saw. Returns
    /// whether the flag was cleared.
    pub(crate) async fn clear(&self, backend: &str, generation: i64) -> Result<bool> {
        let now = Utc::now();
        let _guard = self.locks.lock(backend).await;

        let row = sqlx::query_as::<_, StateRow>(&format!(
            "UPDATE backend_state SET is_dirty = 0, reason = '', last_sync_time = ? \
             WHERE backend_name = ? AND generation = ? \
             RETURNING {STATE_COLUMNS}"
        ))
        .bind(now)
        .bind(backend)
        .bind(generation)
        .fetch_optional(self.db.pool())
        .await?;

        let cleared = row.is_some();
        let row = match row {
            Some(row) => Some(row),
            None => {
                sqlx::query_as::<_, StateRow>(&format!(
                    "UPDATE backend_state SET last_sync_time = ? WHERE backend_name = ? \
                     RETURNING {STATE_COLUMNS}"
                ))
                .bind(now)
                .bind(backend)
                .fetch_optional(self.db.pool())
                .await?
            }
        };
        if let Some(row) = row {
            self.store(row)?;
        }

        if cleared {
            tracing::info!("Cleared dirty flag on '{}'", backend);
        } else {
            tracing::debug!("Backend '{}' re-marked during sync; flag kept", backend);
        }
        Ok(cleared)
    }

    /// Keep the flag set and record why the last pass failed
    pub(crate) async fn record_failure(&self, backend: &str, reason: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO backend_state (backend_name, is_dirty, reason, marked_at) \
             SELECT name, 1, ?, ? FROM backends WHERE name = ? \
             ON CONFLICT (backend_name) DO UPDATE SET \
                 marked_at = CASE WHEN backend_state.is_dirty = 1 \
                     THEN backend_state.marked_at ELSE excluded.marked_at END, \
                 is_dirty = 1, \
                 reason = excluded.reason \
             RETURNING {STATE_COLUMNS}"
        );

        let _guard = self.locks.lock(backend).await;
        let row = sqlx::query_as::<_, StateRow>(&sql)
            .bind(reason)
            .bind(Utc::now())
            .bind(backend)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(backend.to_string()))?;
        self.store(row)?;
        Ok(())
    }

    pub async fn record_health(&self, backend: &str, result: HealthResult) -> Result<()> {
        let sql = format!(
            "INSERT INTO backend_state (backend_name, last_health_check) \
             SELECT name, ? FROM backends WHERE name = ? \
             ON CONFLICT (backend_name) DO UPDATE SET \
                 last_health_check = excluded.last_health_check \
             RETURNING {STATE_COLUMNS}"
        );

        let _guard = self.locks.lock(backend).await;
        let row = sqlx::query_as::<_, StateRow>(&sql)
            .bind(serde_json::to_string(&result)?)
            .bind(backend)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(backend.to_string()))?;
        self.store(row)?;
        Ok(())
    }

    /// Point-in-time copy of every tracked backend
    pub fn snapshot(&self) -> BTreeMap<String, DirtyState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Stop tracking a backend
    pub async fn forget(&self, backend: &str) -> Result<()> {
        let guard = self.locks.lock(backend).await;

        sqlx::query("DELETE FROM backend_state WHERE backend_name = ?")
            .bind(backend)
            .execute(self.db.pool())
            .await?;
        self.states.remove(backend);
        drop(guard);
        self.locks.forget(backend);
        Ok(())
    }

    /// Drop state for backends missing from the registry
    pub async fn remove_orphans(&self) -> Result<Vec<String>> {
        let orphans: Vec<String> = sqlx::query_scalar(
            "SELECT backend_name FROM backend_state \
             WHERE backend_name NOT IN (SELECT name FROM backends)",
        )
        .fetch_all(self.db.pool())
        .await?;

        for name in &orphans {
            self.forget(name).await?;
        }
        Ok(orphans)
    }

    /// Replace the cached entry with a row the database just returned.
    /// Callers hold the backend's lock.
    fn store(&self, row: StateRow) -> Result<DirtyState> {
        let (name, state) = row.into_state()?;
        self.states.insert(name, state.clone());
        Ok(state)
    }
}
