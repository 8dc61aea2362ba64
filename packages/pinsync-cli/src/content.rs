// Content identifiers and BLAKE3 digests
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_CID_LEN: usize = 256;

/// Content identifier of a pinned object.
///
/// CIDs are opaque to the controller; parsing only guarantees the value is
/// safe to use as a single path component in every adapter layout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// BLAKE3 digest of the identifier itself, used for directory fan-out
    pub fn fanout_digest(&self) -> ContentDigest {
        ContentDigest::of(self.0.as_bytes())
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidCid {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("empty identifier"));
        }
        if s.len() > MAX_CID_LEN {
            return Err(invalid("identifier too long"));
        }
        if s.starts_with('.') {
            return Err(invalid("identifier may not start with '.'"));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("unexpected character {c:?}")));
        }

        Ok(Cid(s.to_string()))
    }
}

impl TryFrom<String> for Cid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// BLAKE3 digest of a stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest(blake3::Hash);

impl ContentDigest {
    pub fn of(data: &[u8]) -> Self {
        ContentDigest(blake3::hash(data))
    }

    /// Hex string without prefix
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.to_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);

        if hex.len() != 64 {
            anyhow::bail!("Invalid BLAKE3 digest length: expected 64 hex chars, got {}", hex.len());
        }

        let bytes = hex::decode(hex)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);

        Ok(ContentDigest(blake3::Hash::from(digest)))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentDigest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_accepts_common_encodings() {
        for value in [
            "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
            "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
            "sha256-abc_def.v1",
        ] {
            let cid: Cid = value.parse().unwrap();
            assert_eq!(cid.as_str(), value);
        }
    }

    #[test]
    fn test_cid_rejects_unsafe_values() {
        assert!(Cid::from_str("").is_err());
        assert!(Cid::from_str("../etc/passwd").is_err());
        assert!(Cid::from_str("a/b").is_err());
        assert!(Cid::from_str(".hidden").is_err());
        assert!(Cid::from_str("with space").is_err());
        assert!(Cid::from_str(&"a".repeat(MAX_CID_LEN + 1)).is_err());
    }

    #[test]
    fn test_cid_deserialize_validates() {
        assert!(serde_json::from_str::<Cid>("\"bafy123\"").is_ok());
        assert!(serde_json::from_str::<Cid>("\"a/b\"").is_err());
    }

    #[test]
    fn test_digest_known_value() {
        let digest = ContentDigest::of(b"hello world");
        assert_eq!(
            digest.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
        assert!(digest.to_string().starts_with("blake3:"));
    }

    #[test]
    fn test_digest_parse() {
        let digest = ContentDigest::of(b"parse me");
        assert_eq!(ContentDigest::from_str(&digest.to_string()).unwrap(), digest);
        assert_eq!(ContentDigest::from_str(&digest.to_hex()).unwrap(), digest);
        assert!(ContentDigest::from_str("blake3:tooshort").is_err());
        assert!(ContentDigest::from_str(&format!("blake3:{}", "z".repeat(64))).is_err());
    }

    #[test]
    fn test_fanout_digest_is_stable() {
        let cid: Cid = "bafy123".parse().unwrap();
        assert_eq!(cid.fanout_digest(), ContentDigest::of(b"bafy123"));
    }
}
