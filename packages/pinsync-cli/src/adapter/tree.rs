// On-disk pin tree shared by every adapter variant
use super::{BackendAdapter, BackendStats, StoreReceipt};
use crate::artifact::Artifact;
use crate::backend::BackendKind;
use crate::content::{Cid, ContentDigest};
use crate::error::{Error, Result};
use crate::health::HealthResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const PIN_DIR: &str = "pins";

/// Pin artifacts stored in a hierarchical directory structure:
/// `{root}/pins/{d[:2]}/{d[2:4]}/{cid}.json`, where `d` is the BLAKE3 hex of
/// the CID. This avoids having too many files in a single directory.
#[derive(Debug, Clone)]
pub struct ObjectTree {
    root: PathBuf,
}

impl ObjectTree {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of a CID relative to the root, always `/`-separated
    pub fn key(cid: &Cid) -> String {
        let hex = cid.fanout_digest().to_hex();
        format!("{}/{}/{}/{}.json", PIN_DIR, &hex[..2], &hex[2..4], cid)
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        let hex = cid.fanout_digest().to_hex();
        self.root
            .join(PIN_DIR)
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{cid}.json"))
    }

    /// Write `data` for `cid` unless identical bytes are already present.
    ///
    /// Returns the digest of what is on disk afterwards and whether a write
    /// happened.
    pub async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(ContentDigest, bool)> {
        let path = self.path_for(cid);
        let wanted = ContentDigest::of(data);

        if let Some(existing) = read_optional(&path).await? {
            if ContentDigest::of(&existing) == wanted {
                tracing::debug!("Artifact already present: {}", cid);
                return Ok((wanted, false));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename so readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        let written = fs::read(&path).await?;
        tracing::debug!("Stored artifact: {} ({} bytes)", cid, data.len());

        Ok((ContentDigest::of(&written), true))
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path_for(cid)).await
    }

    pub async fn exists(&self, cid: &Cid) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(cid)).await?)
    }

    /// Remove a stored artifact; returns whether it existed
    pub async fn delete(&self, cid: &Cid) -> Result<bool> {
        let path = self.path_for(cid);

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        self.cleanup_empty_dirs(&path).await;
        Ok(true)
    }

    /// Count stored artifacts and their total size
    pub async fn stats(&self) -> std::io::Result<(u64, u64)> {
        let mut count = 0;
        let mut bytes = 0;
        let mut pending = vec![self.root.join(PIN_DIR)];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.path().extension().is_some_and(|ext| ext == "json") {
                    count += 1;
                    bytes += entry.metadata().await?.len();
                }
            }
        }

        Ok((count, bytes))
    }

    /// Check the root is writable.
    ///
    /// With `create` unset a missing root is an error; mounted trees must
    /// already exist.
    pub async fn probe(&self, create: bool) -> std::io::Result<()> {
        if create {
            fs::create_dir_all(&self.root).await?;
        } else if !fs::metadata(&self.root).await?.is_dir() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not a directory", self.root.display()),
            ));
        }

        let probe = self.root.join(format!(".pinsync-probe-{}", std::process::id()));
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    /// Clean up empty parent directories after file deletion
    async fn cleanup_empty_dirs(&self, path: &Path) {
        let pins = self.root.join(PIN_DIR);
        let mut current = path.parent();

        while let Some(dir) = current {
            if dir == pins || !dir.starts_with(&pins) {
                break;
            }
            // Only succeeds when empty
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reclassify I/O failures a retry or a reconnect can fix
fn classify(err: Error) -> Error {
    let Error::Io(e) = err else {
        return err;
    };
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            Error::Transient(e.to_string())
        }
        ErrorKind::NotConnected
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => Error::Connectivity(e.to_string()),
        _ => Error::Io(e),
    }
}

/// Per-variant placement and addressing rules
pub trait Layout: Send + Sync + 'static {
    const KIND: BackendKind;

    /// Directory the pin tree lives under
    fn root(&self) -> &Path;

    /// External locator for an artifact stored under `key`
    fn locator(&self, cid: &Cid, key: &str) -> String;

    /// Whether a missing root may be created on demand
    fn creates_root(&self) -> bool {
        true
    }

    /// Variant-specific fields reported alongside statistics
    fn describe(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }
}

/// A backend adapter writing through an [`ObjectTree`] laid out by `L`
pub struct TreeAdapter<L: Layout> {
    name: String,
    layout: L,
    tree: ObjectTree,
}

impl<L: Layout> TreeAdapter<L> {
    pub fn new(name: &str, layout: L) -> Self {
        let tree = ObjectTree::new(layout.root());
        Self {
            name: name.to_string(),
            layout,
            tree,
        }
    }
}

#[async_trait]
impl<L: Layout> BackendAdapter for TreeAdapter<L> {
    fn kind(&self) -> BackendKind {
        L::KIND
    }

    async fn test_connection(&self) -> HealthResult {
        let started = Instant::now();
        match self.tree.probe(self.layout.creates_root()).await {
            Ok(()) => HealthResult::healthy(started.elapsed()),
            Err(e) => {
                tracing::debug!("Probe of '{}' failed: {}", self.name, e);
                HealthResult::unhealthy(
                    started.elapsed(),
                    format!("{}: {}", self.tree.root().display(), e),
                )
            }
        }
    }

    async fn store(&self, artifact: &Artifact) -> Result<StoreReceipt> {
        let cid = artifact.cid();
        if !self.layout.creates_root() && !fs::try_exists(self.tree.root()).await.unwrap_or(false) {
            return Err(Error::Connectivity(format!(
                "{} is not mounted",
                self.tree.root().display()
            )));
        }

        let (digest, created) = self.tree.put(cid, artifact.bytes()).await.map_err(classify)?;
        Ok(StoreReceipt {
            location: self.layout.locator(cid, &ObjectTree::key(cid)),
            digest,
            created,
        })
    }

    async fn retrieve(&self, cid: &Cid) -> Result<Artifact> {
        let bytes = self
            .tree
            .get(cid)
            .await
            .map_err(classify)?
            .ok_or_else(|| Error::ArtifactNotFound {
                backend: self.name.clone(),
                cid: cid.to_string(),
            })?;

        let artifact = Artifact::from_bytes(bytes)?;
        if artifact.cid() != cid {
            return Err(Error::MalformedArtifact(format!(
                "expected {}, package names {}",
                cid,
                artifact.cid()
            )));
        }
        Ok(artifact)
    }

    async fn exists(&self, cid: &Cid) -> Result<bool> {
        self.tree.exists(cid).await.map_err(classify)
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        if !self.tree.delete(cid).await.map_err(classify)? {
            return Err(Error::ArtifactNotFound {
                backend: self.name.clone(),
                cid: cid.to_string(),
            });
        }
        tracing::info!("Deleted {} from '{}'", cid, self.name);
        Ok(())
    }

    async fn statistics(&self) -> Result<BackendStats> {
        let mut extra = self.layout.describe();
        let (item_count, total_bytes) = match self.tree.stats().await {
            Ok((count, bytes)) => (Some(count), Some(bytes)),
            // Nothing stored yet on a tree we own
            Err(e) if e.kind() == ErrorKind::NotFound && self.layout.creates_root() => {
                (Some(0), Some(0))
            }
            Err(e) => {
                extra.insert("error".into(), e.to_string().into());
                (None, None)
            }
        };

        Ok(BackendStats {
            item_count,
            total_bytes,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestLayout {
        root: PathBuf,
        mounted: bool,
    }

    impl Layout for TestLayout {
        const KIND: BackendKind = BackendKind::Local;

        fn root(&self) -> &Path {
            &self.root
        }

        fn locator(&self, _cid: &Cid, key: &str) -> String {
            format!("test://{key}")
        }

        fn creates_root(&self) -> bool {
            !self.mounted
        }
    }

    fn cid(s: &str) -> Cid {
        s.parse().unwrap()
    }

    fn artifact(name: &str, meta: serde_json::Value) -> Artifact {
        Artifact::package(&cid(name), &meta, Utc::now()).unwrap()
    }

    fn adapter(root: &Path, mounted: bool) -> TreeAdapter<TestLayout> {
        TreeAdapter::new(
            "test",
            TestLayout {
                root: root.to_path_buf(),
                mounted,
            },
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let temp = TempDir::new().unwrap();
        let tree = ObjectTree::new(temp.path());

        let (digest, created) = tree.put(&cid("bafy1"), b"payload").await.unwrap();
        assert!(created);
        assert_eq!(digest, ContentDigest::of(b"payload"));
        assert_eq!(tree.get(&cid("bafy1")).await.unwrap().unwrap(), b"payload");
        assert!(tree.get(&cid("bafy2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_deduplicates() {
        let temp = TempDir::new().unwrap();
        let tree = ObjectTree::new(temp.path());

        let (first, created) = tree.put(&cid("bafy1"), b"same").await.unwrap();
        assert!(created);
        let (second, created) = tree.put(&cid("bafy1"), b"same").await.unwrap();
        assert!(!created);
        assert_eq!(first, second);

        let (_, created) = tree.put(&cid("bafy1"), b"changed").await.unwrap();
        assert!(created);
        assert_eq!(tree.stats().await.unwrap().0, 1);
    }

    #[test]
    fn test_io_errors_are_classified() {
        let io = |kind| Error::Io(std::io::Error::new(kind, "nfs"));

        let timed_out = classify(io(ErrorKind::TimedOut));
        assert!(matches!(timed_out, Error::Transient(_)));
        assert!(timed_out.is_transient());

        let reset = classify(io(ErrorKind::ConnectionReset));
        assert_eq!(reset.class(), crate::error::ErrorClass::Connectivity);

        assert!(matches!(classify(io(ErrorKind::PermissionDenied)), Error::Io(_)));
        assert!(matches!(
            classify(Error::MalformedArtifact("x".into())),
            Error::MalformedArtifact(_)
        ));
    }

    #[tokio::test]
    async fn test_key_structure() {
        let key = ObjectTree::key(&cid("bafy1"));
        let hex = cid("bafy1").fanout_digest().to_hex();
        assert_eq!(key, format!("pins/{}/{}/bafy1.json", &hex[..2], &hex[2..4]));
    }

    #[tokio::test]
    async fn test_delete_cleans_empty_dirs() {
        let temp = TempDir::new().unwrap();
        let tree = ObjectTree::new(temp.path());

        tree.put(&cid("bafy1"), b"x").await.unwrap();
        assert!(tree.delete(&cid("bafy1")).await.unwrap());
        assert!(!tree.delete(&cid("bafy1")).await.unwrap());

        let mut entries = fs::read_dir(temp.path().join(PIN_DIR)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_files() {
        let temp = TempDir::new().unwrap();
        let tree = ObjectTree::new(temp.path());

        tree.put(&cid("bafy1"), b"abc").await.unwrap();
        tree.put(&cid("bafy2"), b"defgh").await.unwrap();
        assert_eq!(tree.stats().await.unwrap(), (2, 8));
    }

    #[tokio::test]
    async fn test_adapter_store_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(temp.path(), false);
        let pkg = artifact("bafy1", json!({"a": 1}));

        let first = adapter.store(&pkg).await.unwrap();
        let second = adapter.store(&pkg).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.location, second.location);
        assert_eq!(first.digest, pkg.digest());
        assert_eq!(adapter.statistics().await.unwrap().item_count, Some(1));
    }

    #[tokio::test]
    async fn test_adapter_retrieve() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(temp.path(), false);
        let pkg = artifact("bafy1", json!({"a": 1}));
        adapter.store(&pkg).await.unwrap();

        let back = adapter.retrieve(&cid("bafy1")).await.unwrap();
        assert_eq!(back.digest(), pkg.digest());
        assert!(matches!(
            adapter.retrieve(&cid("bafy2")).await,
            Err(Error::ArtifactNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmounted_tree() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp.path().join("not-mounted"), true);

        let health = adapter.test_connection().await;
        assert!(!health.healthy);
        assert!(health.error.is_some());

        let err = adapter.store(&artifact("bafy1", json!({}))).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));

        let stats = adapter.statistics().await.unwrap();
        assert_eq!(stats.item_count, None);
        assert_eq!(stats.total_bytes, None);
    }

    #[tokio::test]
    async fn test_owned_tree_stats_before_first_store() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp.path().join("fresh"), false);

        let stats = adapter.statistics().await.unwrap();
        assert_eq!(stats.item_count, Some(0));
        assert!(adapter.test_connection().await.healthy);
    }
}
