//! Execution history and build cache
//!
//! Two injected collaborators:
//! - [`ExecutionHistory`]: node id -> last successful execution (identity,
//!   output fingerprints, incremental input files)
//! - [`BuildCache`]: identity -> produced outputs, with file contents so
//!   they can be restored without running the action
//!
//! Both persist to sled trees (JSON encoded); in-memory versions exist for
//! tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::graph::NodeId;
use crate::hasher::Fingerprint;
use crate::identity::Identity;
use crate::schema::{OutputKind, OutputProperty, OutputSnapshot};

const HISTORY_TREE: &str = "history";
const BUILD_CACHE_TREE: &str = "build-cache";

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Last successful execution of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub identity: Identity,
    pub implementation: String,
    /// Input property fingerprints by name
    pub inputs: BTreeMap<String, Fingerprint>,
    pub outputs: BTreeMap<String, OutputSnapshot>,
    /// Per-file fingerprints of incremental properties
    #[serde(default)]
    pub incremental_inputs: BTreeMap<String, BTreeMap<String, Fingerprint>>,
    pub recorded_at: u64,
    pub duration_ms: u64,
}

impl HistoryRecord {
    /// Output fingerprints by property name
    pub fn output_fingerprints(&self) -> BTreeMap<&str, &Fingerprint> {
        self.outputs
            .iter()
            .map(|(name, snapshot)| (name.as_str(), &snapshot.fingerprint))
            .collect()
    }
}

/// Key-value store of last known good executions, keyed by node id
pub trait ExecutionHistory: Send + Sync {
    fn load(&self, node: &NodeId) -> Result<Option<HistoryRecord>, CacheError>;
    fn store(&self, node: &NodeId, record: &HistoryRecord) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|source| CacheError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|source| CacheError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// History kept in process memory, stored as encoded bytes like the sled store
#[derive(Default)]
pub struct InMemoryHistory {
    records: RwLock<HashMap<NodeId, Vec<u8>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes for a node, bypassing encoding
    pub fn insert_raw(&self, node: &NodeId, bytes: Vec<u8>) {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node.clone(), bytes);
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionHistory for InMemoryHistory {
    fn load(&self, node: &NodeId) -> Result<Option<HistoryRecord>, CacheError> {
        let records = self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        records
            .get(node)
            .map(|bytes| decode(node.as_str(), bytes))
            .transpose()
    }

    fn store(&self, node: &NodeId, record: &HistoryRecord) -> Result<(), CacheError> {
        let bytes = encode(node.as_str(), record)?;
        self.insert_raw(node, bytes);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}

/// History persisted in a sled tree
pub struct SledHistory {
    tree: sled::Tree,
}

impl SledHistory {
    pub fn new(db: &sled::Db) -> Result<Self, CacheError> {
        Ok(Self {
            tree: db.open_tree(HISTORY_TREE)?,
        })
    }
}

impl ExecutionHistory for SledHistory {
    fn load(&self, node: &NodeId) -> Result<Option<HistoryRecord>, CacheError> {
        match self.tree.get(node.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode(node.as_str(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, node: &NodeId, record: &HistoryRecord) -> Result<(), CacheError> {
        let bytes = encode(node.as_str(), record)?;
        self.tree.insert(node.as_str().as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// One file of a cached output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub relative_path: String,
    pub fingerprint: Fingerprint,
    #[serde(with = "hex_bytes")]
    pub contents: Vec<u8>,
}

/// One output property of a cached result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    pub property: String,
    pub kind: OutputKind,
    /// False when the action left this output absent
    pub present: bool,
    pub files: Vec<CachedFile>,
}

/// Outputs produced for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: Identity,
    pub outputs: Vec<CachedOutput>,
    pub created_at: u64,
}

impl CacheEntry {
    /// Capture the current contents of `outputs` as described by `snapshots`
    pub fn capture(
        identity: &Identity,
        outputs: &[OutputProperty],
        snapshots: &BTreeMap<String, OutputSnapshot>,
    ) -> Result<Self, CacheError> {
        let mut captured = Vec::with_capacity(outputs.len());
        for output in outputs {
            let files = match snapshots.get(&output.name) {
                Some(snapshot) => &snapshot.files,
                None => continue,
            };
            let mut cached = Vec::with_capacity(files.len());
            for file in files {
                let path = output_file_path(output, &file.relative_path);
                cached.push(CachedFile {
                    relative_path: file.relative_path.clone(),
                    fingerprint: file.fingerprint.clone(),
                    contents: fs::read(&path)?,
                });
            }
            captured.push(CachedOutput {
                property: output.name.clone(),
                kind: output.kind,
                present: output.path.exists(),
                files: cached,
            });
        }
        Ok(Self {
            identity: identity.clone(),
            outputs: captured,
            created_at: now_secs(),
        })
    }

    /// Whether `snapshots` show exactly the files this entry recorded
    pub fn matches(&self, snapshots: &BTreeMap<String, OutputSnapshot>) -> bool {
        self.outputs.iter().all(|cached| {
            let files = snapshots.get(&cached.property).map(|s| s.files.as_slice()).unwrap_or(&[]);
            files.len() == cached.files.len()
                && files
                    .iter()
                    .zip(&cached.files)
                    .all(|(file, c)| file.relative_path == c.relative_path && file.fingerprint == c.fingerprint)
        })
    }

    /// Replace the declared outputs with this entry's contents
    ///
    /// Stale outputs are removed first so nothing from a previous
    /// execution survives next to restored files.
    pub fn restore(&self, outputs: &[OutputProperty]) -> Result<(), CacheError> {
        for output in outputs {
            let Some(cached) = self.outputs.iter().find(|c| c.property == output.name) else {
                continue;
            };
            remove_path(&output.path)?;
            if !cached.present {
                continue;
            }
            if output.kind == OutputKind::Directory {
                fs::create_dir_all(&output.path)?;
            }
            for file in &cached.files {
                let path = output_file_path(output, &file.relative_path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, &file.contents)?;
            }
        }
        Ok(())
    }
}

fn output_file_path(output: &OutputProperty, relative: &str) -> PathBuf {
    if relative.is_empty() {
        output.path.clone()
    } else {
        relative.split('/').fold(output.path.clone(), |path, part| path.join(part))
    }
}

fn remove_path(path: &Path) -> Result<(), CacheError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Identity -> produced outputs
pub trait BuildCache: Send + Sync {
    fn load(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError>;
    fn store(&self, identity: &Identity, entry: &CacheEntry) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Default)]
pub struct InMemoryBuildCache {
    entries: RwLock<HashMap<Identity, CacheEntry>>,
}

impl InMemoryBuildCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildCache for InMemoryBuildCache {
    fn load(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(identity)
            .cloned())
    }

    fn store(&self, identity: &Identity, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity.clone(), entry.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}

/// Build cache persisted in a sled tree
pub struct LocalBuildCache {
    tree: sled::Tree,
}

impl LocalBuildCache {
    pub fn new(db: &sled::Db) -> Result<Self, CacheError> {
        Ok(Self {
            tree: db.open_tree(BUILD_CACHE_TREE)?,
        })
    }

    /// Open a standalone cache database at `directory`
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, CacheError> {
        fs::create_dir_all(directory.as_ref())?;
        let db = sled::open(directory.as_ref())?;
        Self::new(&db)
    }
}

impl BuildCache for LocalBuildCache {
    fn load(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError> {
        match self.tree.get(identity.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode(identity.as_str(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, identity: &Identity, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = encode(identity.as_str(), entry)?;
        self.tree.insert(identity.as_str().as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Tiered build cache: the in-build memory tier first, then persistent tiers
///
/// A controller lives for one build; persistent tiers are shared between
/// controllers.
pub struct BuildCacheController {
    memory: InMemoryBuildCache,
    tiers: Vec<Arc<dyn BuildCache>>,
}

impl BuildCacheController {
    pub fn new() -> Self {
        Self {
            memory: InMemoryBuildCache::new(),
            tiers: Vec::new(),
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn BuildCache>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn has_persistent_tiers(&self) -> bool {
        !self.tiers.is_empty()
    }

    /// First hit across tiers; unreadable tiers are skipped with a warning
    pub fn load(&self, identity: &Identity) -> Option<CacheEntry> {
        if let Ok(Some(entry)) = self.memory.load(identity) {
            return Some(entry);
        }
        for tier in &self.tiers {
            match tier.load(identity) {
                Ok(Some(entry)) if entry.identity == *identity => {
                    debug!(identity = %identity, "build cache hit");
                    return Some(entry);
                }
                Ok(_) => {}
                Err(e) => warn!(identity = %identity, "build cache entry ignored: {}", e),
            }
        }
        None
    }

    /// Write to every tier; a failing tier only logs
    pub fn store(&self, identity: &Identity, entry: &CacheEntry) {
        if let Err(e) = self.memory.store(identity, entry) {
            warn!(identity = %identity, "could not store build cache entry: {}", e);
        }
        for tier in &self.tiers {
            if let Err(e) = tier.store(identity, entry) {
                warn!(identity = %identity, "could not store build cache entry: {}", e);
            }
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.memory.clear()?;
        for tier in &self.tiers {
            tier.clear()?;
        }
        Ok(())
    }
}

impl Default for BuildCacheController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Fingerprinter;
    use crate::schema::WorkSchema;
    use tempfile::TempDir;

    fn record(identity: &str) -> HistoryRecord {
        HistoryRecord {
            identity: Identity::from_hex(identity.to_string()),
            implementation: "compile".into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            incremental_inputs: BTreeMap::new(),
            recorded_at: 1,
            duration_ms: 2,
        }
    }

    #[test]
    fn test_in_memory_history() {
        let history = InMemoryHistory::new();
        let node = NodeId::from(":compile");
        assert!(history.load(&node).unwrap().is_none());

        history.store(&node, &record("abc")).unwrap();
        assert_eq!(history.load(&node).unwrap(), Some(record("abc")));

        history.clear().unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_corrupt_history_is_an_error() {
        let history = InMemoryHistory::new();
        let node = NodeId::from(":compile");
        history.insert_raw(&node, b"{not json".to_vec());
        assert!(matches!(history.load(&node), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_sled_history_persists() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::from(":app:jar");
        {
            let db = sled::open(dir.path()).unwrap();
            SledHistory::new(&db).unwrap().store(&node, &record("def")).unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let history = SledHistory::new(&db).unwrap();
        assert_eq!(history.load(&node).unwrap(), Some(record("def")));
    }

    #[test]
    fn test_capture_and_restore() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("sub")).unwrap();
        fs::write(out.join("a.txt"), b"alpha").unwrap();
        fs::write(out.join("sub/b.txt"), b"beta").unwrap();

        let schema = WorkSchema::builder()
            .output(OutputProperty::directory("out", &out))
            .build();
        let fingerprinter = Fingerprinter::default();
        let snapshots = schema.snapshot_outputs(&fingerprinter).unwrap();
        let identity = Identity::from_hex("1234".into());
        let entry = CacheEntry::capture(&identity, schema.outputs(), &snapshots).unwrap();

        // Stale content must not survive a restore
        fs::write(out.join("a.txt"), b"changed").unwrap();
        fs::write(out.join("stale.txt"), b"stale").unwrap();

        entry.restore(schema.outputs()).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(out.join("sub/b.txt")).unwrap(), b"beta");
        assert!(!out.join("stale.txt").exists());
        assert_eq!(schema.snapshot_outputs(&fingerprinter).unwrap(), snapshots);
        assert!(entry.matches(&snapshots));
    }

    #[test]
    fn test_tampered_entry_does_not_match_restored_outputs() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.bin");
        fs::write(&out, b"original").unwrap();
        let schema = WorkSchema::builder().output(OutputProperty::file("bin", &out)).build();
        let fingerprinter = Fingerprinter::default();
        let snapshots = schema.snapshot_outputs(&fingerprinter).unwrap();
        let mut entry = CacheEntry::capture(&Identity::from_hex("beef".into()), schema.outputs(), &snapshots).unwrap();

        entry.outputs[0].files[0].contents = b"bit rot".to_vec();
        entry.restore(schema.outputs()).unwrap();
        assert!(!entry.matches(&schema.snapshot_outputs(&fingerprinter).unwrap()));
    }

    #[test]
    fn test_local_cache_round_trip_and_controller_tiers() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::from_hex("feed".into());
        let entry = CacheEntry {
            identity: identity.clone(),
            outputs: vec![CachedOutput {
                property: "bin".into(),
                kind: OutputKind::File,
                present: true,
                files: vec![CachedFile {
                    relative_path: String::new(),
                    fingerprint: Fingerprint::from_hex("00".into()),
                    contents: vec![0, 159, 146, 150],
                }],
            }],
            created_at: 7,
        };

        {
            let controller = BuildCacheController::new()
                .with_tier(Arc::new(LocalBuildCache::open(dir.path()).unwrap()));
            assert!(controller.load(&identity).is_none());
            controller.store(&identity, &entry);
        }

        // A fresh controller only has the persistent tier to go on
        let controller = BuildCacheController::new()
            .with_tier(Arc::new(LocalBuildCache::open(dir.path()).unwrap()));
        assert_eq!(controller.load(&identity), Some(entry));
    }
}
