// Content-addressed network backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_GATEWAY: &str = "ipfs://";

/// Pins exported into the node's repository directory; the network addresses
/// content by CID so the locator is the CID itself behind the gateway.
#[derive(Debug, Clone)]
pub struct ContentNetworkLayout {
    repo_path: PathBuf,
    gateway: String,
}

impl ContentNetworkLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        Ok(Self {
            repo_path: PathBuf::from(backend.require("repo_path")?),
            gateway: backend.param_or("gateway", DEFAULT_GATEWAY).to_string(),
        })
    }
}

impl Layout for ContentNetworkLayout {
    const KIND: BackendKind = BackendKind::ContentAddressedNetwork;

    fn root(&self) -> &Path {
        &self.repo_path
    }

    fn locator(&self, cid: &Cid, _key: &str) -> String {
        if self.gateway.ends_with('/') {
            format!("{}{}", self.gateway, cid)
        } else {
            format!("{}/{}", self.gateway, cid)
        }
    }

    fn describe(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("gateway".to_string(), Value::from(self.gateway.clone()))])
    }
}
