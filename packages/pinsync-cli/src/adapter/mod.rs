// Backend adapter trait and implementations
use crate::artifact::Artifact;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::{Cid, ContentDigest};
use crate::error::{Error, Result};
use crate::health::HealthResult;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

mod archive_host;
mod content_network;
mod local;
mod model_hub;
mod object_store;
mod remote_fs;
mod tree;

pub use archive_host::ArchiveHostLayout;
pub use content_network::ContentNetworkLayout;
pub use local::LocalLayout;
pub use model_hub::ModelHubLayout;
pub use object_store::ObjectStoreLayout;
pub use remote_fs::RemoteFsLayout;
pub use tree::{Layout, TreeAdapter};

/// What an adapter reports after writing an artifact
#[derive(Debug, Clone, Serialize)]
pub struct StoreReceipt {
    /// Backend-specific locator of the stored package
    pub location: String,
    /// Digest of the bytes the backend now holds
    pub digest: ContentDigest,
    /// False when identical content was already present
    pub created: bool,
}

/// Best-effort usage figures; `None` means the backend could not say.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub item_count: Option<u64>,
    pub total_bytes: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Uniform capability surface over one configured backend
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Probe connectivity. Never fails; errors are captured in the result.
    async fn test_connection(&self) -> HealthResult;

    /// Store an artifact. Storing identical content twice leaves one copy.
    async fn store(&self, artifact: &Artifact) -> Result<StoreReceipt>;

    async fn retrieve(&self, cid: &Cid) -> Result<Artifact>;

    async fn exists(&self, cid: &Cid) -> Result<bool>;

    async fn delete(&self, cid: &Cid) -> Result<()>;

    async fn statistics(&self) -> Result<BackendStats>;
}

/// Builds adapters from registry records
pub trait AdapterFactory: Send + Sync {
    fn build(&self, backend: &BackendConfig) -> Result<Arc<dyn BackendAdapter>>;
}

/// Factory for the built-in backend types
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, backend: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
        let adapter: Arc<dyn BackendAdapter> = match backend.kind {
            BackendKind::Local => Arc::new(TreeAdapter::new(
                &backend.name,
                LocalLayout::from_config(backend)?,
            )),
            BackendKind::ObjectStore => Arc::new(TreeAdapter::new(
                &backend.name,
                ObjectStoreLayout::from_config(backend)?,
            )),
            BackendKind::ContentAddressedNetwork => Arc::new(TreeAdapter::new(
                &backend.name,
                ContentNetworkLayout::from_config(backend)?,
            )),
            BackendKind::ArchiveHost => Arc::new(TreeAdapter::new(
                &backend.name,
                ArchiveHostLayout::from_config(backend)?,
            )),
            BackendKind::ModelHub => Arc::new(TreeAdapter::new(
                &backend.name,
                ModelHubLayout::from_config(backend)?,
            )),
            BackendKind::RemoteFilesystem => Arc::new(TreeAdapter::new(
                &backend.name,
                RemoteFsLayout::from_config(backend)?,
            )),
        };
        Ok(adapter)
    }
}

/// Run an adapter call under a deadline; elapsing is a transient failure.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}
