// Sync engine: pushes pending pin mappings to dirty backends
use crate::adapter::{bounded, AdapterFactory, BackendAdapter};
use crate::artifact::Artifact;
use crate::backend::Visibility;
use crate::content::ContentDigest;
use crate::content::Cid;
use crate::dirty::DirtyTracker;
use crate::error::{Error, ErrorBody, Result};
use crate::index::{PinIndex, PinMapping};
use crate::registry::BackendRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub const FORCED_REASON: &str = "forced";

/// Lifecycle of a sync attempt on one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Succeeded,
    PartiallyFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingFailure {
    pub cid: Cid,
    pub error: ErrorBody,
}

/// Result of one pass over one backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendSyncReport {
    pub success: bool,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<MappingFailure>,
}

impl BackendSyncReport {
    fn rejected(err: &Error) -> Self {
        Self {
            error: Some(err.into()),
            ..Default::default()
        }
    }

    /// Reason recorded on the dirty flag when the pass did not fully succeed
    fn failure_reason(&self) -> String {
        let detail = self
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("unknown error");
        if self.attempted > 0 {
            format!("{} of {} mapping(s) failed: {}", self.failed, self.attempted, detail)
        } else {
            detail.to_string()
        }
    }
}

/// Per-backend results of a sync request
pub type SyncResults = BTreeMap<String, BackendSyncReport>;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Backends synced at once
    pub concurrency: usize,
    /// Deadline for each adapter call
    pub call_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Resets the phase to `Idle` if a pass is dropped before finishing
struct PassGuard<'a> {
    phases: &'a DashMap<String, SyncPhase>,
    name: String,
    finished: bool,
}

impl PassGuard<'_> {
    fn finish(mut self, phase: SyncPhase) {
        self.phases.insert(self.name.clone(), phase);
        self.finished = true;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.phases.insert(self.name.clone(), SyncPhase::Idle);
        }
    }
}

/// Orchestrates sync passes.
///
/// Only dirty backends are contacted. Within a backend mappings are pushed
/// oldest first; backends run concurrently up to `settings.concurrency`.
/// The dirty flag is cleared only after every mapping write of the pass has
/// been recorded and none failed.
pub struct SyncEngine {
    registry: Arc<BackendRegistry>,
    index: Arc<PinIndex>,
    tracker: Arc<DirtyTracker>,
    factory: Arc<dyn AdapterFactory>,
    settings: EngineSettings,
    phases: DashMap<String, SyncPhase>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        index: Arc<PinIndex>,
        tracker: Arc<DirtyTracker>,
        factory: Arc<dyn AdapterFactory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            index,
            tracker,
            factory,
            settings,
            phases: DashMap::new(),
        }
    }

    pub fn phase(&self, backend: &str) -> SyncPhase {
        self.phases
            .get(backend)
            .map(|phase| *phase)
            .unwrap_or(SyncPhase::Idle)
    }

    /// Sync every backend currently marked dirty
    pub async fn sync_dirty(&self) -> SyncResults {
        if let Err(e) = self.tracker.refresh_all().await {
            tracing::warn!("Failed to reload dirty state, using cached flags: {}", e);
        }
        let dirty = self.tracker.dirty_backends();
        if dirty.is_empty() {
            tracing::info!("No dirty backends; nothing to sync");
            return SyncResults::new();
        }
        self.sync_set(dirty).await
    }

    /// Sync every enabled backend when `force` is set, otherwise only
    /// dirty ones. Disabled backends are never force-marked.
    pub async fn sync_all(&self, force: bool) -> Result<SyncResults> {
        if force {
            let names = self
                .registry
                .list(false, Visibility::Redacted)
                .await?
                .into_iter()
                .map(|backend| backend.name);
            self.tracker.mark_all(names, FORCED_REASON).await?;
        }
        Ok(self.sync_dirty().await)
    }

    /// Sync one backend regardless of its dirty flag
    pub async fn sync_backend(&self, name: &str) -> BackendSyncReport {
        self.sync_one(name).await
    }

    async fn sync_set(&self, names: BTreeSet<String>) -> SyncResults {
        tracing::info!("Syncing {} backend(s)", names.len());

        let results: SyncResults = stream::iter(names)
            .map(|name| async move {
                let report = self.sync_one(&name).await;
                (name, report)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let failed = results.values().filter(|r| !r.success).count();
        tracing::info!(
            "Sync finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    async fn sync_one(&self, name: &str) -> BackendSyncReport {
        let Some(guard) = self.begin(name) else {
            tracing::warn!("Rejected sync of '{}': already syncing", name);
            return BackendSyncReport::rejected(&Error::AlreadySyncing(name.to_string()));
        };
        // Marks persisted after this read, by any process, keep the flag set.
        let generation = match self.tracker.refresh(name).await {
            Ok(state) => state.map(|state| state.generation()).unwrap_or_default(),
            Err(e) => {
                guard.finish(SyncPhase::PartiallyFailed);
                return BackendSyncReport::rejected(&e);
            }
        };

        let mut report = match self.run_pass(name).await {
            Ok(report) => report,
            Err(e) => BackendSyncReport::rejected(&e),
        };

        let phase = if report.success {
            SyncPhase::Succeeded
        } else {
            SyncPhase::PartiallyFailed
        };

        if let Err(e) = self.settle(name, generation, &report).await {
            tracing::warn!("Failed to record sync outcome for '{}': {}", name, e);
            report.success = false;
            report.error = Some((&e).into());
        }

        guard.finish(phase);
        report
    }

    fn begin(&self, name: &str) -> Option<PassGuard<'_>> {
        match self.phases.entry(name.to_string()) {
            Entry::Occupied(entry) if *entry.get() == SyncPhase::Syncing => return None,
            Entry::Occupied(mut entry) => {
                entry.insert(SyncPhase::Syncing);
            }
            Entry::Vacant(entry) => {
                entry.insert(SyncPhase::Syncing);
            }
        }

        Some(PassGuard {
            phases: &self.phases,
            name: name.to_string(),
            finished: false,
        })
    }

    /// Update the dirty flag from a finished pass
    async fn settle(&self, name: &str, generation: i64, report: &BackendSyncReport) -> Result<()> {
        if report.success {
            self.tracker.clear(name, generation).await?;
            return Ok(());
        }

        // A backend removed from the registry has nothing left to flag.
        if !self.registry.exists(name).await? {
            return Ok(());
        }
        self.tracker.record_failure(name, &report.failure_reason()).await
    }

    async fn run_pass(&self, name: &str) -> Result<BackendSyncReport> {
        let backend = self.registry.get(name, Visibility::Sensitive).await?;
        if !backend.enabled {
            return Err(Error::Disabled(name.to_string()));
        }

        let adapter = self.factory.build(&backend)?;
        let pending = self.index.pending(name).await?;
        tracing::debug!(
            "Backend '{}' ({}): {} mapping(s) pending",
            name,
            adapter.kind(),
            pending.len()
        );

        if pending.is_empty() {
            return self.verify(name, adapter.as_ref()).await;
        }

        let mut report = BackendSyncReport::default();
        for mapping in &pending {
            report.attempted += 1;

            match self.push(adapter.as_ref(), mapping).await {
                Ok((location, digest)) => {
                    self.index.mark_synced(mapping, &location, digest).await?;
                    report.synced += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!("Sync of {} to '{}' failed, will retry: {}", mapping.cid, name, e);
                    } else {
                        tracing::error!("Sync of {} to '{}' failed: {}", mapping.cid, name, e);
                    }
                    self.index.mark_failed(mapping, &e.to_string()).await?;
                    report.failed += 1;
                    report.error = Some((&e).into());
                    report.failures.push(MappingFailure {
                        cid: mapping.cid.clone(),
                        error: (&e).into(),
                    });
                }
            }
        }

        report.success = report.failed == 0;
        tracing::info!(
            "Backend '{}': {}/{} mapping(s) synced",
            name,
            report.synced,
            report.attempted
        );
        Ok(report)
    }

    /// Store one mapping's artifact and check what the backend wrote
    async fn push(
        &self,
        adapter: &dyn BackendAdapter,
        mapping: &PinMapping,
    ) -> Result<(String, ContentDigest)> {
        let artifact = Artifact::package(&mapping.cid, &mapping.metadata, mapping.created_at)?;
        let receipt = bounded("store", self.settings.call_timeout, adapter.store(&artifact)).await?;

        if receipt.digest != artifact.digest() {
            return Err(Error::Integrity {
                cid: mapping.cid.to_string(),
                expected: artifact.digest().to_string(),
                actual: receipt.digest.to_string(),
            });
        }
        Ok((receipt.location, receipt.digest))
    }

    /// A dirty backend with nothing pending is reconciled by a connectivity probe
    async fn verify(&self, name: &str, adapter: &dyn BackendAdapter) -> Result<BackendSyncReport> {
        let probe = async { Ok(adapter.test_connection().await) };
        let health = bounded("test_connection", self.settings.call_timeout, probe).await?;
        self.tracker.record_health(name, health.clone()).await?;

        if !health.healthy {
            return Err(Error::Connectivity(
                health.error.unwrap_or_else(|| "probe failed".to_string()),
            ));
        }

        Ok(BackendSyncReport {
            success: true,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::db::MetadataDb;
    use crate::index::MappingStatus;
    use crate::locks::KeyedLocks;
    use crate::testing::ScriptedFactory;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        engine: Arc<SyncEngine>,
        index: Arc<PinIndex>,
        tracker: Arc<DirtyTracker>,
        registry: Arc<BackendRegistry>,
        factory: ScriptedFactory,
        db: MetadataDb,
        _temp: TempDir,
    }

    async fn fixture(backends: &[&str], settings: EngineSettings) -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = MetadataDb::new(&temp.path().join("pinsync.db")).await.unwrap();
        let registry = Arc::new(BackendRegistry::new(db.clone()));
        let index = Arc::new(PinIndex::new(db.clone(), Arc::new(KeyedLocks::new())));
        let tracker = Arc::new(DirtyTracker::load(db.clone()).await.unwrap());
        let factory = ScriptedFactory::new();

        for name in backends {
            registry
                .create(
                    name,
                    BackendKind::Local,
                    json!({"path": "/unused"}).as_object().cloned().unwrap(),
                    true,
                )
                .await
                .unwrap();
            tracker.track(name).await.unwrap();
        }

        let engine = Arc::new(SyncEngine::new(
            registry.clone(),
            index.clone(),
            tracker.clone(),
            Arc::new(factory.clone()),
            settings,
        ));

        Fixture {
            engine,
            index,
            tracker,
            registry,
            factory,
            db,
            _temp: temp,
        }
    }

    async fn pin(f: &Fixture, backend: &str, cid: &str) {
        f.index
            .add(backend, &cid.parse().unwrap(), json!({"cid": cid}))
            .await
            .unwrap();
        f.tracker.mark(backend, "pin added").await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_backends_are_untouched() {
        let f = fixture(&["a", "b"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;

        let results = f.engine.sync_dirty().await;

        assert_eq!(results.len(), 1);
        assert!(results["a"].success);
        assert_eq!(f.factory.script("b").calls(), 0);
        assert!(!f.tracker.is_dirty("a"));
        assert!(!f.tracker.is_dirty("b"));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_flag() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;
        pin(&f, "a", "bafy2").await;
        f.factory.script("a").fail_cid("bafy2");

        let report = &f.engine.sync_dirty().await["a"];
        assert!(!report.success);
        assert_eq!((report.attempted, report.synced, report.failed), (2, 1, 1));
        assert_eq!(report.failures[0].cid.as_str(), "bafy2");

        let state = f.tracker.get("a").unwrap();
        assert!(state.is_dirty);
        assert!(state.reason.contains("injected store failure for bafy2"));
        assert_eq!(f.engine.phase("a"), SyncPhase::PartiallyFailed);

        let ok = f.index.get("a", &"bafy1".parse().unwrap()).await.unwrap().unwrap();
        let bad = f.index.get("a", &"bafy2".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(ok.status, MappingStatus::Synced);
        assert_eq!(ok.artifact_location.as_deref(), Some("mock://a/bafy1"));
        assert!(ok.digest.is_some());
        assert!(bad.digest.is_none());
        assert_eq!(bad.status, MappingStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_after_failure_only_pushes_failed() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;
        pin(&f, "a", "bafy2").await;
        let script = f.factory.script("a");
        script.fail_cid("bafy2");

        f.engine.sync_dirty().await;
        assert_eq!(script.store_calls(), 2);

        // The dirty flag survived, so the next pass retries bafy2 alone
        let report = &f.engine.sync_dirty().await["a"];
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failures[0].cid.as_str(), "bafy2");
        assert_eq!(script.store_calls(), 3);
        assert_eq!(script.stored_count(), 1);
    }

    #[tokio::test]
    async fn test_oldest_mapping_first() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;
        pin(&f, "a", "bafy2").await;
        pin(&f, "a", "bafy3").await;
        f.factory.script("a").set_fail_store(true);

        let report = &f.engine.sync_dirty().await["a"];
        let order: Vec<_> = report.failures.iter().map(|m| m.cid.as_str()).collect();
        assert_eq!(order, ["bafy1", "bafy2", "bafy3"]);
    }

    #[tokio::test]
    async fn test_timeout_is_a_mapping_failure() {
        let settings = EngineSettings {
            concurrency: 2,
            call_timeout: Duration::from_millis(50),
        };
        let f = fixture(&["a"], settings).await;
        pin(&f, "a", "bafy1").await;
        pin(&f, "a", "bafy2").await;
        f.factory.script("a").set_delay(Duration::from_secs(5));

        let report = &f.engine.sync_dirty().await["a"];
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 2);
        assert!(f.tracker.get("a").unwrap().reason.contains("timed out"));
        assert!(f.tracker.is_dirty("a"));
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_mapping() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;
        f.factory.script("a").set_corrupt(true);

        let report = &f.engine.sync_dirty().await["a"];
        assert!(!report.success);
        assert_eq!(
            report.failures[0].error.class,
            crate::error::ErrorClass::DataIntegrity
        );
        let mapping = f.index.get("a", &"bafy1".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Failed);
    }

    #[tokio::test]
    async fn test_manual_mark_with_nothing_pending_probes() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        f.tracker.mark("a", "policy change").await.unwrap();

        let results = f.engine.sync_dirty().await;
        assert!(results["a"].success);
        assert_eq!(f.factory.script("a").calls(), 1);
        assert!(!f.tracker.is_dirty("a"));
        assert!(f.tracker.get("a").unwrap().last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_backend_stays_dirty() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        f.tracker.mark("a", "policy change").await.unwrap();
        f.factory.script("a").set_unreachable(true);

        let report = &f.engine.sync_dirty().await["a"];
        assert!(!report.success);
        assert!(f.tracker.is_dirty("a"));
        assert!(f.tracker.get("a").unwrap().reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_force_sync_reaches_every_backend() {
        let f = fixture(&["a", "b", "c"], EngineSettings::default()).await;
        pin(&f, "b", "bafy1").await;

        let results = f.engine.sync_all(true).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.success));
        for name in ["a", "b", "c"] {
            assert!(f.factory.script(name).calls() >= 1);
            assert!(!f.tracker.is_dirty(name));
        }
    }

    #[tokio::test]
    async fn test_disabled_backend_is_not_contacted() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        pin(&f, "a", "bafy1").await;
        f.registry
            .update(
                "a",
                crate::backend::BackendUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = &f.engine.sync_dirty().await["a"];
        assert!(!report.success);
        assert_eq!(f.factory.builds(), 0);
        assert!(f.tracker.is_dirty("a"));
    }

    #[tokio::test]
    async fn test_concurrent_sync_of_same_backend_rejected() {
        let settings = EngineSettings {
            concurrency: 4,
            call_timeout: Duration::from_secs(5),
        };
        let f = fixture(&["a", "b"], settings).await;
        pin(&f, "a", "bafy1").await;
        f.factory.script("a").set_delay(Duration::from_millis(200));

        let engine = f.engine.clone();
        let first = tokio::spawn(async move { engine.sync_backend("a").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.engine.phase("a"), SyncPhase::Syncing);
        let second = f.engine.sync_backend("a").await;
        assert!(!second.success);
        assert_eq!(
            second.error.as_ref().unwrap().class,
            crate::error::ErrorClass::TransientSync
        );

        // Other backends are not blocked
        f.tracker.mark("b", "manual").await.unwrap();
        assert!(f.engine.sync_backend("b").await.success);

        assert!(first.await.unwrap().success);
        assert_eq!(f.engine.phase("a"), SyncPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_mark_during_pass_keeps_flag() {
        let settings = EngineSettings {
            concurrency: 1,
            call_timeout: Duration::from_secs(5),
        };
        let f = fixture(&["a"], settings).await;
        pin(&f, "a", "bafy1").await;
        f.factory.script("a").set_delay(Duration::from_millis(200));

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_dirty().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pin(&f, "a", "bafy2").await;

        let results = pass.await.unwrap();
        assert!(results["a"].success);
        assert!(f.tracker.is_dirty("a"));

        let results = f.engine.sync_dirty().await;
        assert!(results["a"].success);
        assert!(!f.tracker.is_dirty("a"));
    }

    #[tokio::test]
    async fn test_force_sync_skips_disabled_backends() {
        let f = fixture(&["a", "b"], EngineSettings::default()).await;
        f.registry
            .update(
                "b",
                crate::backend::BackendUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let results = f.engine.sync_all(true).await.unwrap();
        assert_eq!(results.keys().collect::<Vec<_>>(), ["a"]);
        assert!(results["a"].success);
        assert!(!f.tracker.is_dirty("b"));
        assert_eq!(f.factory.script("b").calls(), 0);
    }

    #[tokio::test]
    async fn test_fanout_bounded_by_concurrency() {
        let settings = EngineSettings {
            concurrency: 2,
            call_timeout: Duration::from_secs(5),
        };
        let names = ["a", "b", "c", "d", "e"];
        let f = fixture(&names, settings).await;
        for name in names {
            pin(&f, name, "bafy1").await;
            f.factory.script(name).set_delay(Duration::from_millis(50));
        }

        let results = f.engine.sync_dirty().await;
        assert_eq!(results.len(), 5);
        assert!(results.values().all(|r| r.success));
        assert_eq!(f.factory.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_mark_from_other_process_during_pass_keeps_flag() {
        let settings = EngineSettings {
            concurrency: 1,
            call_timeout: Duration::from_secs(5),
        };
        let f = fixture(&["a"], settings).await;
        pin(&f, "a", "bafy1").await;
        f.factory.script("a").set_delay(Duration::from_millis(200));
        let other = DirtyTracker::load(f.db.clone()).await.unwrap();

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_dirty().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        other.mark("a", "policy change").await.unwrap();

        assert!(pass.await.unwrap()["a"].success);
        assert!(f.tracker.is_dirty("a"));
        let persisted = DirtyTracker::load(f.db.clone()).await.unwrap();
        assert!(persisted.get("a").unwrap().is_dirty);
    }

    #[tokio::test]
    async fn test_sync_dirty_sees_marks_from_other_process() {
        let f = fixture(&["a"], EngineSettings::default()).await;
        let other = DirtyTracker::load(f.db.clone()).await.unwrap();
        other.mark("a", "policy change").await.unwrap();

        let results = f.engine.sync_dirty().await;
        assert!(results["a"].success);
        assert!(!f.tracker.is_dirty("a"));
    }
}
