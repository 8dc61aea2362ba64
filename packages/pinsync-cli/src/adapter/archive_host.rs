// Git-hosted archive backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Pins committed into a working checkout of an archive repository
#[derive(Debug, Clone)]
pub struct ArchiveHostLayout {
    repository: String,
    branch: String,
    checkout: PathBuf,
}

impl ArchiveHostLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        let repository = backend
            .require("repository")?
            .trim_start_matches("https://")
            .trim_end_matches(".git")
            .to_string();

        Ok(Self {
            repository,
            branch: backend.param_or("branch", "main").to_string(),
            checkout: PathBuf::from(backend.require("checkout")?),
        })
    }
}

impl Layout for ArchiveHostLayout {
    const KIND: BackendKind = BackendKind::ArchiveHost;

    fn root(&self) -> &Path {
        &self.checkout
    }

    fn locator(&self, _cid: &Cid, key: &str) -> String {
        format!("git+https://{}@{}#{}", self.repository, self.branch, key)
    }

    fn describe(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("repository".to_string(), Value::from(self.repository.clone())),
            ("branch".to_string(), Value::from(self.branch.clone())),
        ])
    }
}
