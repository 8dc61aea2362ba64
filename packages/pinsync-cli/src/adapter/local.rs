// Local filesystem backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Pins written under a local directory
#[derive(Debug, Clone)]
pub struct LocalLayout {
    root: PathBuf,
}

impl LocalLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(backend.require("path")?),
        })
    }
}

impl Layout for LocalLayout {
    const KIND: BackendKind = BackendKind::Local;

    fn root(&self) -> &Path {
        &self.root
    }

    fn locator(&self, _cid: &Cid, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
