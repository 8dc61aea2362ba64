// Backend registry: the persisted catalog of backend configurations
use crate::backend::{BackendConfig, BackendKind, BackendUpdate, ConfigMap, Visibility};
use crate::db::MetadataDb;
use crate::error::{Error, Result};
use crate::index::PinIndex;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(sqlx::FromRow)]
struct BackendRow {
    name: String,
    kind: String,
    config: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BackendRow> for BackendConfig {
    type Error = Error;

    fn try_from(row: BackendRow) -> Result<Self> {
        Ok(BackendConfig {
            kind: row.kind.parse()?,
            config: serde_json::from_str(&row.config)?,
            name: row.name,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Result of removing a backend
#[derive(Debug, Clone, serde::Serialize)]
pub struct RemovedBackend {
    pub name: String,
    pub mappings_removed: u64,
}

/// Sole owner of [`BackendConfig`] records.
///
/// Reads go straight to the pool and run concurrently; writes are
/// serialized through `write_lock`.
pub struct BackendRegistry {
    db: MetadataDb,
    write_lock: Mutex<()>,
}

impl BackendRegistry {
    pub fn new(db: MetadataDb) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Register a new backend
    pub async fn create(
        &self,
        name: &str,
        kind: BackendKind,
        config: ConfigMap,
        enabled: bool,
    ) -> Result<BackendConfig> {
        validate_name(name)?;
        kind.validate(name, &config)?;

        let _guard = self.write_lock.lock().await;

        let exists: Option<String> = sqlx::query_scalar("SELECT name FROM backends WHERE name = ?")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?;
        if exists.is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let now = Utc::now();
        let backend = BackendConfig {
            name: name.to_string(),
            kind,
            config,
            enabled,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO backends (name, kind, config, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&backend.name)
        .bind(backend.kind.as_str())
        .bind(serde_json::to_string(&backend.config)?)
        .bind(backend.enabled)
        .bind(backend.created_at)
        .bind(backend.updated_at)
        .execute(self.db.pool())
        .await?;

        tracing::info!("Registered {} backend '{}'", kind, name);
        Ok(backend)
    }

    /// Look up a backend by name
    pub async fn get(&self, name: &str, visibility: Visibility) -> Result<BackendConfig> {
        let row = sqlx::query_as::<_, BackendRow>("SELECT * FROM backends WHERE name = ?")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        Ok(BackendConfig::try_from(row)?.with_visibility(visibility))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT name FROM backends WHERE name = ?")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(found.is_some())
    }

    /// List backends ordered by name
    pub async fn list(
        &self,
        include_disabled: bool,
        visibility: Visibility,
    ) -> Result<Vec<BackendConfig>> {
        let rows = sqlx::query_as::<_, BackendRow>(
            "SELECT * FROM backends WHERE enabled = 1 OR ? ORDER BY name",
        )
        .bind(include_disabled)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|row| Ok(BackendConfig::try_from(row)?.with_visibility(visibility)))
            .collect()
    }

    /// Names of every registered backend
    pub async fn names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM backends ORDER BY name")
            .fetch_all(self.db.pool())
            .await?;
        Ok(names)
    }

    /// Merge a partial update into an existing backend.
    ///
    /// Config keys in the update overwrite existing keys; keys not mentioned
    /// are kept.
    pub async fn update(&self, name: &str, update: BackendUpdate) -> Result<BackendConfig> {
        let _guard = self.write_lock.lock().await;

        let mut backend = self.get(name, Visibility::Sensitive).await?;
        for key in &update.remove_keys {
            backend.config.remove(key);
        }
        for (key, value) in update.config {
            backend.config.insert(key, value);
        }
        if let Some(enabled) = update.enabled {
            backend.enabled = enabled;
        }
        backend.kind.validate(name, &backend.config)?;
        backend.updated_at = Utc::now();

        sqlx::query("UPDATE backends SET config = ?, enabled = ?, updated_at = ? WHERE name = ?")
            .bind(serde_json::to_string(&backend.config)?)
            .bind(backend.enabled)
            .bind(backend.updated_at)
            .bind(name)
            .execute(self.db.pool())
            .await?;

        tracing::info!("Updated backend '{}'", name);
        Ok(backend)
    }

    /// Remove a backend.
    ///
    /// Refused while the backend still has pin mappings unless `force` is set,
    /// in which case its mappings are deleted with it. The check and every
    /// delete run in one transaction while the backend's mapping writes are
    /// blocked, so a concurrent pin add either lands before the count or
    /// fails with `NotFound` afterwards.
    pub async fn remove(&self, name: &str, force: bool, index: &PinIndex) -> Result<RemovedBackend> {
        let _guard = self.write_lock.lock().await;
        let _mappings = index.lock_backend(name).await;

        let mut tx = self.db.pool().begin().await?;

        let found: Option<String> = sqlx::query_scalar("SELECT name FROM backends WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        if found.is_none() {
            return Err(Error::NotFound(name.to_string()));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pin_mappings WHERE backend_name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 && !force {
            return Err(Error::HasPendingMappings {
                name: name.to_string(),
                count,
            });
        }

        let mappings_removed = if count > 0 {
            sqlx::query("DELETE FROM pin_mappings WHERE backend_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            0
        };
        sqlx::query("DELETE FROM backend_state WHERE backend_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backends WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            "Removed backend '{}' ({} mapping(s) dropped)",
            name,
            mappings_removed
        );
        Ok(RemovedBackend {
            name: name.to_string(),
            mappings_removed,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::invalid_config(
            name,
            "backend names use letters, digits, '-', '_' or '.'",
        ));
    }
    Ok(())
}
