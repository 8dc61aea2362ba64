// Model-hub repository backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Pins written into a local clone of a hub repository
#[derive(Debug, Clone)]
pub struct ModelHubLayout {
    repo_id: String,
    revision: String,
    local_dir: PathBuf,
}

impl ModelHubLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        Ok(Self {
            repo_id: backend.require("repo_id")?.to_string(),
            revision: backend.param_or("revision", "main").to_string(),
            local_dir: PathBuf::from(backend.require("local_dir")?),
        })
    }
}

impl Layout for ModelHubLayout {
    const KIND: BackendKind = BackendKind::ModelHub;

    fn root(&self) -> &Path {
        &self.local_dir
    }

    fn locator(&self, _cid: &Cid, key: &str) -> String {
        format!("hf://{}@{}/{}", self.repo_id, self.revision, key)
    }

    fn describe(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("repo_id".to_string(), Value::from(self.repo_id.clone())),
            ("revision".to_string(), Value::from(self.revision.clone())),
        ])
    }
}
