// Health monitor: connectivity probes against every configured backend
use crate::adapter::{bounded, AdapterFactory};
use crate::backend::{BackendConfig, Visibility};
use crate::dirty::DirtyTracker;
use crate::error::Result;
use crate::registry::BackendRegistry;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one connectivity probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthResult {
    pub fn healthy(elapsed: Duration) -> Self {
        Self {
            healthy: true,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Probes backends and records results on their dirty-state entry.
///
/// Results are advisory: the sync engine does not consult them before
/// attempting a pass.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    tracker: Arc<DirtyTracker>,
    factory: Arc<dyn AdapterFactory>,
    concurrency: usize,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        tracker: Arc<DirtyTracker>,
        factory: Arc<dyn AdapterFactory>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            factory,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Probe one backend
    pub async fn check(&self, name: &str) -> Result<HealthResult> {
        let backend = self.registry.get(name, Visibility::Sensitive).await?;
        self.probe(&backend).await
    }

    /// Probe every configured backend with bounded fan-out
    pub async fn check_all(&self) -> Result<BTreeMap<String, HealthResult>> {
        let backends = self.registry.list(true, Visibility::Sensitive).await?;

        let results: Vec<(String, Result<HealthResult>)> = stream::iter(backends)
            .map(|backend| async move {
                let result = self.probe(&backend).await;
                (backend.name, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .map(|(name, result)| result.map(|health| (name, health)))
            .collect()
    }

    async fn probe(&self, backend: &BackendConfig) -> Result<HealthResult> {
        let started = Instant::now();

        let result = match self.factory.build(backend) {
            Ok(adapter) => {
                let call = async { Ok(adapter.test_connection().await) };
                match bounded("test_connection", self.timeout, call).await {
                    Ok(result) => result,
                    Err(e) => HealthResult::unhealthy(started.elapsed(), e.to_string()),
                }
            }
            Err(e) => HealthResult::unhealthy(started.elapsed(), e.to_string()),
        };

        if result.healthy {
            tracing::debug!(
                "Backend '{}' healthy ({:.1}ms)",
                backend.name,
                result.response_time_ms
            );
        } else {
            tracing::warn!(
                "Backend '{}' unhealthy: {}",
                backend.name,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        self.tracker.record_health(&backend.name, result.clone()).await?;
        Ok(result)
    }
}
