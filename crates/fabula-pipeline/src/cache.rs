//! Disk-backed stage cache with manifest-tracked completion and downstream
//! invalidation.
//!
//! Every stage artifact is one file under `<output-dir>/.cache/<fingerprint>/`
//! named `<stage>[_<partition>].data`, next to a `manifest.json` recording
//! what finished and when.  The fingerprint covers the input book and the
//! target size, so unrelated runs never collide and identical runs reuse
//! their storage.  Re-running a stage invalidates everything after it; the
//! first partition written under a partitioned stage does the same sweep
//! once, and siblings then append freely.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use fabula_types::{FabulaError, Result, SourceBook};

use crate::stage::{Stage, StageKey};

/// Name of the manifest control file inside a fingerprint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ArtifactStore — byte-level storage boundary
// ---------------------------------------------------------------------------

/// Byte-level storage the cache runs on.  Production uses [`DiskStore`];
/// tests substitute [`MemoryStore`] so cache semantics are checked without
/// touching the filesystem.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Vec<u8>>;
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn exists(&self, name: &str) -> bool;
}

/// Store rooted at one cache directory on disk.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ArtifactStore for DiskStore {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path_of(name)).await?)
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_of(name), bytes).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_of(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_of(name)).await.unwrap_or(false)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.files.lock().await.get(name).cloned().ok_or_else(|| {
            FabulaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such artifact: {name}"),
            ))
        })
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.files.lock().await.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.files.lock().await.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        self.files.lock().await.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Manifest — completion records per stage
// ---------------------------------------------------------------------------

/// Completion record for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    /// File name relative to the fingerprint directory.
    pub file: String,
    pub completed_at: DateTime<Utc>,
}

/// A single-valued stage's entry, or one entry per partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRecord {
    Single(StepEntry),
    Partitioned(BTreeMap<String, StepEntry>),
}

/// The manifest control record, one per fingerprint directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub version: u32,
    pub title: String,
    pub author: String,
    pub target_node_count: usize,
    pub input_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
}

impl CacheManifest {
    fn fresh(book: &SourceBook, target_node_count: usize, fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            title: book.title.clone(),
            author: book.author.clone(),
            target_node_count,
            input_fingerprint: fingerprint.to_string(),
            created_at: now,
            updated_at: now,
            steps: BTreeMap::new(),
        }
    }

    fn entry(&self, key: &StageKey) -> Option<&StepEntry> {
        match (self.steps.get(key.stage().name())?, key) {
            (StepRecord::Single(entry), StageKey::Single(_)) => Some(entry),
            (StepRecord::Partitioned(map), StageKey::Partitioned(_, partition)) => {
                map.get(partition)
            }
            _ => None,
        }
    }

    fn record(&mut self, key: &StageKey, entry: StepEntry) {
        match key {
            StageKey::Single(stage) => {
                self.steps.insert(stage.name().to_string(), StepRecord::Single(entry));
            }
            StageKey::Partitioned(stage, partition) => {
                let record = self
                    .steps
                    .entry(stage.name().to_string())
                    .or_insert_with(|| StepRecord::Partitioned(BTreeMap::new()));
                match record {
                    StepRecord::Partitioned(map) => {
                        map.insert(partition.clone(), entry);
                    }
                    // A single entry under a partitioned key means the stage
                    // changed shape between versions; start the map over.
                    StepRecord::Single(_) => {
                        *record = StepRecord::Partitioned(BTreeMap::from([(
                            partition.clone(),
                            entry,
                        )]));
                    }
                }
            }
        }
    }
}

/// Digest namespacing the cache directory: covers the full book text plus
/// the target node count, truncated to sixteen hex characters so directory
/// names stay readable.
pub fn input_fingerprint(book: &SourceBook, target_node_count: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(book.title.as_bytes());
    hasher.update([0u8]);
    hasher.update(book.author.as_bytes());
    hasher.update([0u8]);
    for chapter in &book.chapters {
        hasher.update(chapter.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chapter.number.to_le_bytes());
        hasher.update(chapter.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(chapter.text.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update((target_node_count as u64).to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

// ---------------------------------------------------------------------------
// CacheStore — stage-level cache over an ArtifactStore
// ---------------------------------------------------------------------------

/// Stage-level cache.  All bytes go through the [`ArtifactStore`]; the
/// manifest sits behind a mutex so parallel partition saves serialize at
/// their await points.
pub struct CacheStore {
    store: Arc<dyn ArtifactStore>,
    manifest: Mutex<CacheManifest>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open (or create) the on-disk cache for this input under
    /// `<output_dir>/.cache/<fingerprint>/`.
    pub async fn open_on_disk(
        output_dir: &Path,
        book: &SourceBook,
        target_node_count: usize,
    ) -> Result<Self> {
        let fingerprint = input_fingerprint(book, target_node_count);
        let root = output_dir.join(".cache").join(&fingerprint);
        Self::open(Arc::new(DiskStore::new(root)), book, target_node_count).await
    }

    /// Open the cache over an arbitrary store.
    ///
    /// An existing manifest resumes the run it belongs to; a manifest for a
    /// different fingerprint is ignored and replaced, never merged.  An
    /// unreadable manifest is [`FabulaError::CacheCorruption`].
    pub async fn open(
        store: Arc<dyn ArtifactStore>,
        book: &SourceBook,
        target_node_count: usize,
    ) -> Result<Self> {
        let fingerprint = input_fingerprint(book, target_node_count);
        let manifest = if store.exists(MANIFEST_FILE).await {
            let bytes = store.read(MANIFEST_FILE).await?;
            let existing: CacheManifest =
                serde_json::from_slice(&bytes).map_err(|e| FabulaError::CacheCorruption {
                    detail: format!("manifest is unreadable: {e}"),
                })?;
            if existing.input_fingerprint == fingerprint {
                tracing::debug!(
                    fingerprint = %fingerprint,
                    steps = existing.steps.len(),
                    "Resuming existing cache"
                );
                existing
            } else {
                tracing::debug!(
                    found = %existing.input_fingerprint,
                    expected = %fingerprint,
                    "Manifest belongs to a different input, starting fresh"
                );
                CacheManifest::fresh(book, target_node_count, &fingerprint)
            }
        } else {
            CacheManifest::fresh(book, target_node_count, &fingerprint)
        };
        Ok(Self {
            store,
            manifest: Mutex::new(manifest),
        })
    }

    /// Creation time of the manifest, stable across resumed runs.
    pub async fn created_at(&self) -> DateTime<Utc> {
        self.manifest.lock().await.created_at
    }

    /// The fingerprint this cache is namespaced under.
    pub async fn fingerprint(&self) -> String {
        self.manifest.lock().await.input_fingerprint.clone()
    }

    /// True iff the key has a manifest entry and its artifact is present.
    pub async fn has(&self, key: &StageKey) -> bool {
        let file = {
            let manifest = self.manifest.lock().await;
            manifest.entry(key).map(|entry| entry.file.clone())
        };
        match file {
            Some(file) => self.store.exists(&file).await,
            None => false,
        }
    }

    /// Load a cached artifact.  Callers check [`has`](Self::has) first: a
    /// manifest entry whose artifact is gone is corruption, not a miss.
    pub async fn load<T: DeserializeOwned>(&self, key: &StageKey) -> Result<T> {
        let file = {
            let manifest = self.manifest.lock().await;
            manifest
                .entry(key)
                .map(|entry| entry.file.clone())
                .ok_or_else(|| FabulaError::CacheCorruption {
                    detail: format!("no manifest entry for {key}"),
                })?
        };
        let bytes = self.store.read(&file).await.map_err(|_| FabulaError::CacheCorruption {
            detail: format!("manifest entry for {key} references a missing artifact ({file})"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| FabulaError::CacheCorruption {
            detail: format!("artifact for {key} is unreadable: {e}"),
        })
    }

    /// Persist a stage artifact and record its completion.
    ///
    /// A single-valued save always invalidates every later stage first, even
    /// when the new data happens to be unchanged.  A partitioned save sweeps
    /// later stages only when the manifest holds nothing under that stage
    /// yet; sibling partitions then append without another sweep.
    pub async fn save<T: Serialize>(&self, key: &StageKey, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut manifest = self.manifest.lock().await;

        let sweep = match key {
            StageKey::Single(_) => true,
            StageKey::Partitioned(stage, _) => !manifest.steps.contains_key(stage.name()),
        };
        if sweep {
            self.invalidate_later(&mut manifest, key.stage()).await?;
        }

        let file = key.file_name();
        self.store.write(&file, &bytes).await?;
        manifest.record(key, StepEntry { file, completed_at: Utc::now() });
        manifest.updated_at = Utc::now();
        self.persist_manifest(&manifest).await?;
        tracing::debug!(key = %key, "Stage artifact saved");
        Ok(())
    }

    async fn invalidate_later(
        &self,
        manifest: &mut CacheManifest,
        stage: Stage,
    ) -> Result<()> {
        for later in stage.later_stages() {
            let Some(record) = manifest.steps.remove(later.name()) else {
                continue;
            };
            let files: Vec<String> = match record {
                StepRecord::Single(entry) => vec![entry.file],
                StepRecord::Partitioned(map) => map.into_values().map(|e| e.file).collect(),
            };
            for file in files {
                self.store.delete(&file).await?;
            }
            tracing::debug!(stage = later.name(), "Invalidated downstream stage");
        }
        Ok(())
    }

    async fn persist_manifest(&self, manifest: &CacheManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        self.store.write(MANIFEST_FILE, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_types::BookChapter;

    fn book() -> SourceBook {
        SourceBook {
            title: "Around the World in Eighty Days".into(),
            author: "Jules Verne".into(),
            chapters: vec![
                BookChapter {
                    id: "ch-1".into(),
                    number: 1,
                    title: "The Wager".into(),
                    text: "In which Phileas Fogg accepts a bet.".into(),
                },
                BookChapter {
                    id: "ch-2".into(),
                    number: 2,
                    title: "The Departure".into(),
                    text: "In which the journey begins.".into(),
                },
            ],
        }
    }

    async fn memory_cache() -> CacheStore {
        CacheStore::open(Arc::new(MemoryStore::new()), &book(), 40)
            .await
            .unwrap()
    }

    // --- fingerprint ---

    #[test]
    fn fingerprint_is_stable_and_sixteen_hex_chars() {
        let a = input_fingerprint(&book(), 40);
        let b = input_fingerprint(&book(), 40);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_tracks_text_and_target() {
        let base = input_fingerprint(&book(), 40);

        let mut changed = book();
        changed.chapters[1].text.push_str(" And so it goes.");
        assert_ne!(input_fingerprint(&changed, 40), base);

        assert_ne!(input_fingerprint(&book(), 80), base);
    }

    // --- has / load / save ---

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let cache = memory_cache().await;
        let key = Stage::Summary.key();

        assert!(!cache.has(&key).await);
        cache.save(&key, &vec!["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(cache.has(&key).await);

        let value: Vec<String> = cache.load(&key).await.unwrap();
        assert_eq!(value, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn load_without_entry_is_corruption() {
        let cache = memory_cache().await;
        let err = cache.load::<String>(&Stage::World.key()).await.unwrap_err();
        assert!(matches!(err, FabulaError::CacheCorruption { .. }));
    }

    #[tokio::test]
    async fn entry_with_missing_artifact_is_corruption() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::open(store.clone(), &book(), 40).await.unwrap();
        let key = Stage::World.key();
        cache.save(&key, &"world".to_string()).await.unwrap();

        store.delete(&key.file_name()).await.unwrap();

        assert!(!cache.has(&key).await);
        let err = cache.load::<String>(&key).await.unwrap_err();
        assert!(matches!(err, FabulaError::CacheCorruption { .. }));
    }

    // --- invalidation ---

    #[tokio::test]
    async fn single_valued_save_invalidates_all_later_stages() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::open(store.clone(), &book(), 40).await.unwrap();

        cache.save(&Stage::Summary.key(), &"s1".to_string()).await.unwrap();
        cache.save(&Stage::World.key(), &"w1".to_string()).await.unwrap();
        cache.save(&Stage::Graph.key(), &"g1".to_string()).await.unwrap();
        cache.save(&Stage::Content.partition("batch-000"), &"c1".to_string()).await.unwrap();

        // 1. Re-saving summary wipes everything after it.
        cache.save(&Stage::Summary.key(), &"s2".to_string()).await.unwrap();

        assert!(cache.has(&Stage::Summary.key()).await);
        assert!(!cache.has(&Stage::World.key()).await);
        assert!(!cache.has(&Stage::Graph.key()).await);
        assert!(!cache.has(&Stage::Content.partition("batch-000")).await);

        // 2. Backing files for the invalidated stages are gone too.
        assert!(!store.exists(&Stage::World.key().file_name()).await);
        assert!(!store.exists(&Stage::Graph.key().file_name()).await);
        assert!(!store.exists(&Stage::Content.partition("batch-000").file_name()).await);
    }

    #[tokio::test]
    async fn first_partition_sweeps_once_then_siblings_append() {
        let cache = memory_cache().await;

        cache.save(&Stage::Graph.key(), &"graph".to_string()).await.unwrap();
        cache.save(&Stage::Content.partition("batch-000"), &"b0".to_string()).await.unwrap();
        cache.save(&Stage::Enrichment.key(), &"e".to_string()).await.unwrap();

        // A sibling partition must not re-sweep: enrichment survives and so
        // does the first batch.
        cache.save(&Stage::Content.partition("batch-001"), &"b1".to_string()).await.unwrap();

        assert!(cache.has(&Stage::Content.partition("batch-000")).await);
        assert!(cache.has(&Stage::Content.partition("batch-001")).await);
        assert!(cache.has(&Stage::Enrichment.key()).await);
    }

    #[tokio::test]
    async fn first_partition_save_sweeps_later_stages_exactly_once() {
        let cache = memory_cache().await;

        cache.save(&Stage::Enrichment.key(), &"e".to_string()).await.unwrap();
        cache.save(&Stage::Validation.key(), &"v".to_string()).await.unwrap();

        // 1. First content partition: manifest holds nothing under content
        //    yet, so enrichment and validation are swept.
        cache.save(&Stage::Content.partition("batch-000"), &"b0".to_string()).await.unwrap();
        assert!(!cache.has(&Stage::Enrichment.key()).await);
        assert!(!cache.has(&Stage::Validation.key()).await);

        // 2. A later stage written after the sweep survives sibling appends.
        cache.save(&Stage::Enrichment.key(), &"e2".to_string()).await.unwrap();
        cache.save(&Stage::Content.partition("batch-001"), &"b1".to_string()).await.unwrap();
        assert!(cache.has(&Stage::Enrichment.key()).await);
        assert!(cache.has(&Stage::Content.partition("batch-000")).await);
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let cache = memory_cache().await;

        cache.save(&Stage::Chapters.partition("act-1"), &"a1".to_string()).await.unwrap();
        cache.save(&Stage::Chapters.partition("act-2"), &"a2".to_string()).await.unwrap();

        let a1: String = cache.load(&Stage::Chapters.partition("act-1")).await.unwrap();
        let a2: String = cache.load(&Stage::Chapters.partition("act-2")).await.unwrap();
        assert_eq!(a1, "a1");
        assert_eq!(a2, "a2");
        assert!(!cache.has(&Stage::Chapters.partition("act-3")).await);
    }

    // --- persistence across reopen ---

    #[tokio::test]
    async fn reopen_resumes_entries_and_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let book = book();

        let first = CacheStore::open_on_disk(dir.path(), &book, 40).await.unwrap();
        first.save(&Stage::Summary.key(), &"synopsis".to_string()).await.unwrap();
        let created = first.created_at().await;
        drop(first);

        let second = CacheStore::open_on_disk(dir.path(), &book, 40).await.unwrap();
        assert!(second.has(&Stage::Summary.key()).await);
        let value: String = second.load(&Stage::Summary.key()).await.unwrap();
        assert_eq!(value, "synopsis");
        assert_eq!(second.created_at().await, created);
    }

    #[tokio::test]
    async fn artifacts_land_in_fingerprint_directory() {
        let dir = tempfile::tempdir().unwrap();
        let book = book();
        let fingerprint = input_fingerprint(&book, 40);

        let cache = CacheStore::open_on_disk(dir.path(), &book, 40).await.unwrap();
        cache.save(&Stage::Scenes.partition("ch-1"), &"nodes".to_string()).await.unwrap();

        let root = dir.path().join(".cache").join(&fingerprint);
        assert!(root.join("manifest.json").exists());
        assert!(root.join("scenes_ch-1.data").exists());
    }

    #[tokio::test]
    async fn corrupt_manifest_fails_open() {
        let store = Arc::new(MemoryStore::new());
        store.write(MANIFEST_FILE, b"{ not json").await.unwrap();

        let err = CacheStore::open(store, &book(), 40).await.unwrap_err();
        assert!(matches!(err, FabulaError::CacheCorruption { .. }));
    }

    #[tokio::test]
    async fn foreign_fingerprint_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::open(store.clone(), &book(), 40).await.unwrap();
        cache.save(&Stage::Summary.key(), &"s".to_string()).await.unwrap();

        // Same store, different target: the old manifest must be ignored.
        let other = CacheStore::open(store, &book(), 80).await.unwrap();
        assert!(!other.has(&Stage::Summary.key()).await);
    }
}
