// Remote filesystem backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Pins written through a mounted remote filesystem.
///
/// The mount point is never created here; if it is missing the remote is
/// treated as unreachable.
#[derive(Debug, Clone)]
pub struct RemoteFsLayout {
    host: String,
    remote_path: String,
    mount_point: PathBuf,
}

impl RemoteFsLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        let remote_path = backend.param_or("remote_path", "/").trim_end_matches('/');
        let remote_path = if remote_path.starts_with('/') {
            remote_path.to_string()
        } else {
            format!("/{remote_path}")
        };

        Ok(Self {
            host: backend.require("host")?.to_string(),
            remote_path,
            mount_point: PathBuf::from(backend.require("mount_point")?),
        })
    }
}

impl Layout for RemoteFsLayout {
    const KIND: BackendKind = BackendKind::RemoteFilesystem;

    fn root(&self) -> &Path {
        &self.mount_point
    }

    fn locator(&self, _cid: &Cid, key: &str) -> String {
        format!("sftp://{}{}/{}", self.host, self.remote_path.trim_end_matches('/'), key)
    }

    fn creates_root(&self) -> bool {
        false
    }

    fn describe(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("host".to_string(), Value::from(self.host.clone()))])
    }
}
