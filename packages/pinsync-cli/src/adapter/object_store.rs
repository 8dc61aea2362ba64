// Object store (S3-compatible) backend
use super::Layout;
use crate::backend::{BackendConfig, BackendKind};
use crate::content::Cid;
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Pins staged under `{staging_dir}/{bucket}/{prefix}` for upload by the
/// bucket sync tooling; locators name the bucket key.
#[derive(Debug, Clone)]
pub struct ObjectStoreLayout {
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    root: PathBuf,
}

impl ObjectStoreLayout {
    pub fn from_config(backend: &BackendConfig) -> Result<Self> {
        let bucket = backend.require("bucket")?.to_string();
        let prefix = backend.param_or("prefix", "").trim_matches('/').to_string();

        let mut root = PathBuf::from(backend.require("staging_dir")?).join(&bucket);
        if !prefix.is_empty() {
            root = root.join(&prefix);
        }

        Ok(Self {
            bucket,
            prefix,
            endpoint: backend.param("endpoint").map(str::to_string),
            root,
        })
    }
}

impl Layout for ObjectStoreLayout {
    const KIND: BackendKind = BackendKind::ObjectStore;

    fn root(&self) -> &Path {
        &self.root
    }

    fn locator(&self, _cid: &Cid, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}/{}", self.bucket, key)
        } else {
            format!("s3://{}/{}/{}", self.bucket, self.prefix, key)
        }
    }

    fn describe(&self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::from([("bucket".to_string(), Value::from(self.bucket.clone()))]);
        if let Some(endpoint) = &self.endpoint {
            fields.insert("endpoint".into(), endpoint.clone().into());
        }
        fields
    }
}
