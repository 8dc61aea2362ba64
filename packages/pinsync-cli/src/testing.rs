// Scriptable in-memory adapters for tests
use crate::adapter::{AdapterFactory, BackendAdapter, BackendStats, StoreReceipt};
use crate::artifact::Artifact;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::{Cid, ContentDigest};
use crate::error::{Error, Result};
use crate::health::HealthResult;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behaviour and call counters for one backend
#[derive(Default)]
pub struct Script {
    fail_store: AtomicBool,
    failing_cids: DashSet<String>,
    unreachable: AtomicBool,
    corrupt: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    store_calls: AtomicUsize,
    stored: DashMap<Cid, Artifact>,
}

impl Script {
    pub fn set_fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cid(&self, cid: &str) {
        self.failing_cids.insert(cid.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Report a digest that does not match what was sent
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Adapter calls of any kind
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }

    /// Overwrite what the backend holds for `artifact`'s CID
    pub fn replace_stored(&self, artifact: Artifact) {
        self.stored.insert(artifact.cid().clone(), artifact);
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Adapter calls in flight across every backend of one factory
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(self: &Arc<Self>) -> InFlight {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self.clone())
    }

    /// Most calls ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<Gauge>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands out [`ScriptedAdapter`]s that share per-backend scripts
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    scripts: Arc<DashMap<String, Arc<Script>>>,
    builds: Arc<AtomicUsize>,
    gauge: Arc<Gauge>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, backend: &str) -> Arc<Script> {
        self.scripts
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Script::default()))
            .clone()
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gauge.peak()
    }
}

impl AdapterFactory for ScriptedFactory {
    fn build(&self, backend: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedAdapter {
            name: backend.name.clone(),
            kind: backend.kind,
            script: self.script(&backend.name),
            gauge: self.gauge.clone(),
        }))
    }
}

pub struct ScriptedAdapter {
    name: String,
    kind: BackendKind,
    script: Arc<Script>,
    gauge: Arc<Gauge>,
}

impl ScriptedAdapter {
    async fn enter(&self) -> InFlight {
        let flight = self.gauge.enter();
        self.script.enter().await;
        flight
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn test_connection(&self) -> HealthResult {
        let _flight = self.enter().await;
        if self.script.unreachable.load(Ordering::SeqCst) {
            HealthResult::unhealthy(Duration::from_millis(1), "connection refused")
        } else {
            HealthResult::healthy(Duration::from_millis(1))
        }
    }

    async fn store(&self, artifact: &Artifact) -> Result<StoreReceipt> {
        let _flight = self.enter().await;
        self.script.store_calls.fetch_add(1, Ordering::SeqCst);
        let cid = artifact.cid();

        if self.script.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connectivity(format!("{} unreachable", self.name)));
        }
        if self.script.fail_store.load(Ordering::SeqCst)
            || self.script.failing_cids.contains(cid.as_str())
        {
            return Err(Error::Transient(format!("injected store failure for {cid}")));
        }

        let created = self
            .script
            .stored
            .insert(cid.clone(), artifact.clone())
            .is_none();
        let digest = if self.script.corrupt.load(Ordering::SeqCst) {
            ContentDigest::of(b"corrupted")
        } else {
            artifact.digest()
        };

        Ok(StoreReceipt {
            location: format!("mock://{}/{}", self.name, cid),
            digest,
            created,
        })
    }

    async fn retrieve(&self, cid: &Cid) -> Result<Artifact> {
        let _flight = self.enter().await;
        self.script
            .stored
            .get(cid)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ArtifactNotFound {
                backend: self.name.clone(),
                cid: cid.to_string(),
            })
    }

    async fn exists(&self, cid: &Cid) -> Result<bool> {
        let _flight = self.enter().await;
        Ok(self.script.stored.contains_key(cid))
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        let _flight = self.enter().await;
        self.script
            .stored
            .remove(cid)
            .map(|_| ())
            .ok_or_else(|| Error::ArtifactNotFound {
                backend: self.name.clone(),
                cid: cid.to_string(),
            })
    }

    async fn statistics(&self) -> Result<BackendStats> {
        let _flight = self.enter().await;
        Ok(BackendStats {
            item_count: Some(self.script.stored.len() as u64),
            total_bytes: None,
            extra: Default::default(),
        })
    }
}
