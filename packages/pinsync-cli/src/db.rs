// SQLite metadata database
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS backends (
    name        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    config      TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pin_mappings (
    backend_name       TEXT NOT NULL,
    cid                TEXT NOT NULL,
    artifact_location  TEXT,
    digest             TEXT,
    metadata           TEXT NOT NULL DEFAULT '{}',
    status             TEXT NOT NULL DEFAULT 'pending',
    last_error         TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    synced_at          TEXT,
    PRIMARY KEY (backend_name, cid)
);

CREATE INDEX IF NOT EXISTS idx_pin_mappings_cid ON pin_mappings (cid);
CREATE INDEX IF NOT EXISTS idx_pin_mappings_status ON pin_mappings (backend_name, status, created_at);

CREATE TABLE IF NOT EXISTS backend_state (
    backend_name       TEXT PRIMARY KEY,
    is_dirty           INTEGER NOT NULL DEFAULT 0,
    reason             TEXT NOT NULL DEFAULT '',
    marked_at          TEXT,
    last_sync_time     TEXT,
    last_health_check  TEXT,
    generation         INTEGER NOT NULL DEFAULT 0
);
"#;

/// Metadata database wrapper
#[derive(Clone)]
pub struct MetadataDb {
    pool: Pool<Sqlite>,
}

impl MetadataDb {
    /// Create or open database at path
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let db = Self { pool };
        db.migrate().await?;

        tracing::debug!("Opened metadata database: {}", db_path.display());
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
