// Pin artifact packages written to backends
use crate::content::{Cid, ContentDigest};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0";

/// Manifest schema version 1.0
///
/// Serialized with `serde_json`'s sorted maps, so identical mapping content
/// always yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinManifest {
    pub schema_version: String,
    pub cid: Cid,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub pinned_at: DateTime<Utc>,
}

/// A serialized pin manifest and its digest
#[derive(Debug, Clone)]
pub struct Artifact {
    manifest: PinManifest,
    bytes: Vec<u8>,
    digest: ContentDigest,
}

impl Artifact {
    /// Package a pin for storage on a backend
    pub fn package(cid: &Cid, metadata: &serde_json::Value, pinned_at: DateTime<Utc>) -> Result<Self> {
        let manifest = PinManifest {
            schema_version: SCHEMA_VERSION.to_string(),
            cid: cid.clone(),
            metadata: metadata.clone(),
            pinned_at,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let digest = ContentDigest::of(&bytes);

        Ok(Self {
            manifest,
            bytes,
            digest,
        })
    }

    /// Parse a package read back from a backend
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let manifest: PinManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedArtifact(e.to_string()))?;

        if manifest.schema_version != SCHEMA_VERSION {
            return Err(Error::MalformedArtifact(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }

        let digest = ContentDigest::of(&bytes);
        Ok(Self {
            manifest,
            bytes,
            digest,
        })
    }

    pub fn cid(&self) -> &Cid {
        &self.manifest.cid
    }

    pub fn manifest(&self) -> &PinManifest {
        &self.manifest
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cid() -> Cid {
        "bafytest".parse().unwrap()
    }

    #[test]
    fn test_package_is_deterministic() {
        let at = Utc::now();
        let a = Artifact::package(&cid(), &json!({"b": 2, "a": 1}), at).unwrap();
        let b = Artifact::package(&cid(), &json!({"a": 1, "b": 2}), at).unwrap();

        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_metadata_changes_digest() {
        let at = Utc::now();
        let a = Artifact::package(&cid(), &json!({"tier": "hot"}), at).unwrap();
        let b = Artifact::package(&cid(), &json!({"tier": "cold"}), at).unwrap();

        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_from_bytes_roundtrip_keeps_digest() {
        let packaged = Artifact::package(&cid(), &json!({"name": "genome"}), Utc::now()).unwrap();
        let parsed = Artifact::from_bytes(packaged.bytes().to_vec()).unwrap();

        assert_eq!(parsed.cid(), packaged.cid());
        assert_eq!(parsed.digest(), packaged.digest());
        assert_eq!(parsed.manifest().metadata["name"], "genome");
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let err = Artifact::from_bytes(b"not json".to_vec()).unwrap_err();
        assert!(matches!(err, Error::MalformedArtifact(_)));

        let wrong_version = br#"{"schema_version":"9","cid":"bafy","pinned_at":"2024-01-01T00:00:00Z"}"#;
        assert!(Artifact::from_bytes(wrong_version.to_vec()).is_err());
    }
}
