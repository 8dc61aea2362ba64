// Backend configuration model
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const REDACTED: &str = "***REDACTED***";

const SENSITIVE_MARKERS: [&str; 4] = ["key", "secret", "token", "password"];

/// Opaque connection parameters handed to an adapter
pub type ConfigMap = Map<String, Value>;

/// The closed set of supported backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ObjectStore,
    ContentAddressedNetwork,
    ArchiveHost,
    ModelHub,
    RemoteFilesystem,
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::ObjectStore,
        BackendKind::ContentAddressedNetwork,
        BackendKind::ArchiveHost,
        BackendKind::ModelHub,
        BackendKind::RemoteFilesystem,
        BackendKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::ObjectStore => "object-store",
            BackendKind::ContentAddressedNetwork => "content-addressed-network",
            BackendKind::ArchiveHost => "archive-host",
            BackendKind::ModelHub => "model-hub",
            BackendKind::RemoteFilesystem => "remote-filesystem",
            BackendKind::Local => "local",
        }
    }

    /// Config keys that must be present as non-empty strings
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            BackendKind::ObjectStore => &["bucket", "staging_dir"],
            BackendKind::ContentAddressedNetwork => &["repo_path"],
            BackendKind::ArchiveHost => &["repository", "checkout"],
            BackendKind::ModelHub => &["repo_id", "local_dir"],
            BackendKind::RemoteFilesystem => &["host", "mount_point"],
            BackendKind::Local => &["path"],
        }
    }

    /// Validate a config map for this backend type
    pub fn validate(&self, name: &str, config: &ConfigMap) -> Result<()> {
        for key in self.required_keys() {
            match config.get(*key) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(_) => {
                    return Err(Error::invalid_config(
                        name,
                        format!("'{key}' must be a non-empty string"),
                    ))
                }
                None => {
                    return Err(Error::invalid_config(
                        name,
                        format!("missing required key '{key}' for {self} backend"),
                    ))
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "object-store" | "s3" => BackendKind::ObjectStore,
            "content-addressed-network" | "ipfs" | "cas" => BackendKind::ContentAddressedNetwork,
            "archive-host" | "github" | "git" => BackendKind::ArchiveHost,
            "model-hub" | "huggingface" | "hf" => BackendKind::ModelHub,
            "remote-filesystem" | "sshfs" | "remote-fs" => BackendKind::RemoteFilesystem,
            "local" | "fs" | "filesystem" => BackendKind::Local,
            _ => {
                let expected: Vec<_> = BackendKind::ALL.iter().map(BackendKind::as_str).collect();
                return Err(Error::InvalidType {
                    value: s.to_string(),
                    expected: expected.join(", "),
                });
            }
        };
        Ok(kind)
    }
}

/// Whether a config key holds a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Which config values a read may surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Secret-like keys replaced with [`REDACTED`]
    Redacted,
    /// Raw values, for adapter construction and explicit operator requests
    Sensitive,
}

/// A registered backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub config: ConfigMap,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackendConfig {
    /// String parameter from the config map
    pub fn param(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).unwrap_or(default)
    }

    /// Required string parameter; validation guarantees presence for required keys
    pub fn require(&self, key: &str) -> Result<&str> {
        self.param(key)
            .ok_or_else(|| Error::invalid_config(&self.name, format!("missing '{key}'")))
    }

    pub fn with_visibility(self, visibility: Visibility) -> Self {
        match visibility {
            Visibility::Sensitive => self,
            Visibility::Redacted => self.redacted(),
        }
    }

    pub fn redacted(mut self) -> Self {
        for (key, value) in self.config.iter_mut() {
            if is_sensitive_key(key) {
                *value = Value::String(REDACTED.to_string());
            }
        }
        self
    }
}

/// Partial update merged into an existing backend
#[derive(Debug, Clone, Default)]
pub struct BackendUpdate {
    pub config: ConfigMap,
    pub remove_keys: Vec<String>,
    pub enabled: Option<bool>,
}

impl BackendUpdate {
    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.remove_keys.is_empty() && self.enabled.is_none()
    }
}
