// Backend manager: the single entry point composing registry, index,
// dirty tracker, health monitor and sync engine
use crate::adapter::{bounded, AdapterFactory, BackendStats, DefaultAdapterFactory};
use crate::artifact::PinManifest;
use crate::backend::{BackendConfig, BackendKind, BackendUpdate, ConfigMap, Visibility};
use crate::config::ControllerConfig;
use crate::content::{Cid, ContentDigest};
use crate::db::MetadataDb;
use crate::dirty::{DirtyState, DirtyTracker};
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, HealthResult};
use crate::index::{CidLocation, MappingStatus, PinIndex, PinMapping, StatusCounts};
use crate::locks::KeyedLocks;
use crate::registry::{BackendRegistry, RemovedBackend};
use crate::sync::{BackendSyncReport, SyncEngine, SyncPhase, SyncResults};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A backend with its mapping counts and dirty state
#[derive(Debug, Clone, Serialize)]
pub struct BackendDetails {
    #[serde(flatten)]
    pub backend: BackendConfig,
    pub mappings: StatusCounts,
    pub state: Option<DirtyState>,
}

/// Dirty state of one backend plus where its last sync attempt stands
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub state: DirtyState,
    pub phase: SyncPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedPin {
    pub backend: String,
    pub cid: Cid,
    /// Whether the stored package was deleted from the backend as well
    pub purged: bool,
}

/// A pin package read back from a backend
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPin {
    pub backend: String,
    pub location: Option<String>,
    pub digest: ContentDigest,
    pub size: usize,
    pub manifest: PinManifest,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub mappings_removed: u64,
    pub states_removed: Vec<String>,
}

fn visibility(include_sensitive: bool) -> Visibility {
    if include_sensitive {
        Visibility::Sensitive
    } else {
        Visibility::Redacted
    }
}

/// Replication controller facade.
///
/// Callers only request transitions through these operations; pin status and
/// dirty flags are written by the sync engine.
pub struct BackendManager {
    registry: Arc<BackendRegistry>,
    index: Arc<PinIndex>,
    tracker: Arc<DirtyTracker>,
    health: HealthMonitor,
    engine: SyncEngine,
    factory: Arc<dyn AdapterFactory>,
    call_timeout: Duration,
}

impl BackendManager {
    /// Open the controller with the built-in adapters
    pub async fn open(config: &ControllerConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(DefaultAdapterFactory)).await
    }

    pub async fn with_factory(
        config: &ControllerConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self> {
        let db = MetadataDb::new(&config.db_path()).await?;

        let registry = Arc::new(BackendRegistry::new(db.clone()));
        let index = Arc::new(PinIndex::new(db.clone(), Arc::new(KeyedLocks::new())));
        let tracker = Arc::new(DirtyTracker::load(db).await?);

        let health = HealthMonitor::new(
            registry.clone(),
            tracker.clone(),
            factory.clone(),
            config.health_concurrency,
            config.call_timeout(),
        );
        let engine = SyncEngine::new(
            registry.clone(),
            index.clone(),
            tracker.clone(),
            factory.clone(),
            config.engine_settings(),
        );

        Ok(Self {
            registry,
            index,
            tracker,
            health,
            engine,
            factory,
            call_timeout: config.call_timeout(),
        })
    }

    // Backends

    pub async fn create_backend(
        &self,
        name: &str,
        kind: BackendKind,
        config: ConfigMap,
        enabled: bool,
    ) -> Result<BackendConfig> {
        let backend = self.registry.create(name, kind, config, enabled).await?;
        self.tracker.track(name).await?;
        Ok(backend.redacted())
    }

    pub async fn list_backends(
        &self,
        include_disabled: bool,
        include_sensitive: bool,
    ) -> Result<Vec<BackendConfig>> {
        self.registry
            .list(include_disabled, visibility(include_sensitive))
            .await
    }

    pub async fn show_backend(&self, name: &str, include_sensitive: bool) -> Result<BackendDetails> {
        let backend = self.registry.get(name, visibility(include_sensitive)).await?;
        let mappings = self.index.counts(name).await?;

        Ok(BackendDetails {
            backend,
            mappings,
            state: self.tracker.get(name),
        })
    }

    /// Merge a partial update; the backend is marked dirty since its remote
    /// side may now differ from what was last synced
    pub async fn update_backend(&self, name: &str, update: BackendUpdate) -> Result<BackendConfig> {
        let backend = self.registry.update(name, update).await?;
        self.tracker.mark(name, "configuration updated").await?;
        Ok(backend.redacted())
    }

    pub async fn remove_backend(&self, name: &str, force: bool) -> Result<RemovedBackend> {
        let removed = self.registry.remove(name, force, &self.index).await?;
        self.tracker.forget(name).await?;
        Ok(removed)
    }

    pub async fn backend_stats(&self, name: &str) -> Result<BackendStats> {
        let backend = self.registry.get(name, Visibility::Sensitive).await?;
        let adapter = self.factory.build(&backend)?;
        bounded("statistics", self.call_timeout, adapter.statistics()).await
    }

    // Pins

    /// Associate a CID with a backend and mark the backend dirty.
    ///
    /// Both writes check registration in the same statement, so a pin added
    /// to a backend that is being removed either fails or is removed with it.
    pub async fn add_pin(
        &self,
        backend: &str,
        cid: &Cid,
        metadata: serde_json::Value,
    ) -> Result<PinMapping> {
        let mapping = self.index.add(backend, cid, metadata).await?;
        self.tracker
            .mark(backend, &format!("pin added: {cid}"))
            .await?;
        Ok(mapping)
    }

    pub async fn list_pins(&self, backend: &str, limit: Option<u32>) -> Result<Vec<PinMapping>> {
        self.ensure_backend(backend).await?;
        self.index.list(backend, limit).await
    }

    pub async fn find_pin(&self, cid: &Cid) -> Result<Vec<CidLocation>> {
        self.index.find_by_cid(cid).await
    }

    /// Remove a mapping.
    ///
    /// A synced mapping is only removed while another backend holds a synced
    /// copy of the same CID, unless `allow_last_copy` is set. With `purge` the
    /// stored package is deleted from the backend too.
    pub async fn remove_pin(
        &self,
        backend: &str,
        cid: &Cid,
        allow_last_copy: bool,
        purge: bool,
    ) -> Result<RemovedPin> {
        let config = self.registry.get(backend, Visibility::Sensitive).await?;
        let mapping = self.index.get(backend, cid).await?.ok_or_else(|| Error::PinNotFound {
            backend: backend.to_string(),
            cid: cid.to_string(),
        })?;

        if mapping.status == MappingStatus::Synced && !allow_last_copy {
            let replicas = self
                .index
                .find_by_cid(cid)
                .await?
                .into_iter()
                .filter(|hit| hit.backend_name != backend && hit.status == MappingStatus::Synced)
                .count();
            if replicas == 0 {
                return Err(Error::LastReplica {
                    backend: backend.to_string(),
                    cid: cid.to_string(),
                });
            }
        }

        let mut purged = false;
        if purge {
            let adapter = self.factory.build(&config)?;
            if bounded("exists", self.call_timeout, adapter.exists(cid)).await? {
                bounded("delete", self.call_timeout, adapter.delete(cid)).await?;
                purged = true;
            } else {
                tracing::debug!("No stored package for {} on '{}'", cid, backend);
            }
        }

        self.index.remove(backend, cid).await?;
        tracing::info!("Removed pin {} from '{}'", cid, backend);

        Ok(RemovedPin {
            backend: backend.to_string(),
            cid: cid.clone(),
            purged,
        })
    }

    /// Read a pin's package back from a backend.
    ///
    /// The package must name the CID and, once synced, match the digest the
    /// backend confirmed at sync time.
    pub async fn retrieve_pin(&self, backend: &str, cid: &Cid) -> Result<RetrievedPin> {
        let config = self.registry.get(backend, Visibility::Sensitive).await?;
        let mapping = self.index.get(backend, cid).await?.ok_or_else(|| Error::PinNotFound {
            backend: backend.to_string(),
            cid: cid.to_string(),
        })?;

        let adapter = self.factory.build(&config)?;
        let artifact = bounded("retrieve", self.call_timeout, adapter.retrieve(cid)).await?;

        if artifact.cid() != cid {
            return Err(Error::Integrity {
                cid: cid.to_string(),
                expected: cid.to_string(),
                actual: artifact.cid().to_string(),
            });
        }
        if let Some(expected) = mapping.digest {
            if artifact.digest() != expected {
                return Err(Error::Integrity {
                    cid: cid.to_string(),
                    expected: expected.to_string(),
                    actual: artifact.digest().to_string(),
                });
            }
        }

        Ok(RetrievedPin {
            backend: backend.to_string(),
            location: mapping.artifact_location,
            digest: artifact.digest(),
            size: artifact.len(),
            manifest: artifact.manifest().clone(),
        })
    }

    // Dirty state and sync

    pub async fn mark_dirty(&self, backend: &str, reason: &str) -> Result<DirtyState> {
        self.tracker.mark(backend, reason).await
    }

    /// Mark every registered backend dirty
    pub async fn mark_all_dirty(&self, reason: &str) -> Result<BTreeMap<String, DirtyState>> {
        let names = self.registry.names().await?;
        self.tracker.mark_all(names, reason).await
    }

    pub async fn sync_dirty(&self) -> SyncResults {
        self.engine.sync_dirty().await
    }

    pub async fn sync_all(&self, force: bool) -> Result<SyncResults> {
        self.engine.sync_all(force).await
    }

    /// Run one pass on `backend` whether or not it is dirty
    pub async fn sync_backend(&self, backend: &str) -> BackendSyncReport {
        self.engine.sync_backend(backend).await
    }

    // Health and housekeeping

    pub async fn check_health(&self, backend: &str) -> Result<HealthResult> {
        self.health.check(backend).await
    }

    pub async fn check_all_health(&self) -> Result<BTreeMap<String, HealthResult>> {
        self.health.check_all().await
    }

    /// Current state of every backend, reloaded from the database
    pub async fn status_snapshot(&self) -> Result<BTreeMap<String, BackendStatus>> {
        self.tracker.refresh_all().await?;
        Ok(self
            .tracker
            .snapshot()
            .into_iter()
            .map(|(name, state)| {
                let phase = self.engine.phase(&name);
                (name, BackendStatus { state, phase })
            })
            .collect())
    }

    /// Drop index rows and dirty state left behind by removed backends
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let mappings_removed = self.index.remove_orphans().await?;
        let states_removed = self.tracker.remove_orphans().await?;

        tracing::info!(
            "Cleanup removed {} orphaned mapping(s) and {} orphaned state(s)",
            mappings_removed,
            states_removed.len()
        );
        Ok(CleanupReport {
            mappings_removed,
            states_removed,
        })
    }

    async fn ensure_backend(&self, name: &str) -> Result<()> {
        if self.registry.exists(name).await? {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }
}
