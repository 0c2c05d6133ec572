//! Representation cache: every stored reference paired with its embedding.
//!
//! The cache is either absent or a complete snapshot of the identity store.
//! Readers share snapshots through `Arc`; a rebuild only installs its result
//! when no invalidation happened while it was running, so a snapshot taken
//! before an enrollment can never be installed after it.
//!
//! The on-disk artifact records a digest of every reference it was built
//! from and is only reused when the store still holds exactly those files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decode::decode_image;
use crate::errors::{AppError, AppResult};
use crate::faces::embedder::FaceEmbedder;
use crate::faces::store::{write_atomically, IdentityStore, StoredReference};

const ARTIFACT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: String,
    pub image_id: String,
    pub embedding: Vec<f64>,
}

/// Identifies the exact bytes of one stored reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceFingerprint {
    pub identity: String,
    pub image_id: String,
    /// blake3 of the stored bytes, hex encoded.
    pub digest: String,
}

impl ReferenceFingerprint {
    pub fn of(reference: &StoredReference) -> Self {
        Self {
            identity: reference.identity.clone(),
            image_id: reference.image_id.clone(),
            digest: blake3::hash(&reference.bytes).to_hex().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub embedder: String,
    pub built_at: String,
    /// Sorted by identity key, then image id.
    pub entries: Vec<CacheEntry>,
    /// Every reference listed during the build, including skipped ones.
    pub sources: Vec<ReferenceFingerprint>,
}

impl CacheSnapshot {
    pub fn from_entries(embedder: impl Into<String>, mut entries: Vec<CacheEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.identity
                .cmp(&b.identity)
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        Self {
            embedder: embedder.into(),
            built_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            entries,
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, mut sources: Vec<ReferenceFingerprint>) -> Self {
        sources.sort();
        self.sources = sources;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedding_for(&self, identity: &str, image_id: &str) -> Option<&[f64]> {
        self.entries
            .iter()
            .find(|entry| entry.identity == identity && entry.image_id == image_id)
            .map(|entry| entry.embedding.as_slice())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Where the snapshot is mirrored on disk; `None` keeps it in memory only.
    pub artifact_path: Option<PathBuf>,
    /// Upper bound for a single rebuild.
    pub rebuild_timeout: Option<Duration>,
}

pub fn artifact_path(root: &Path, embedder: &str) -> PathBuf {
    root.join(format!("representations_{embedder}.json"))
}

struct CacheState {
    snapshot: Option<Arc<CacheSnapshot>>,
    generation: u64,
    artifact_usable: bool,
}

pub struct RepresentationCache<S, E> {
    store: Arc<S>,
    embedder: Arc<E>,
    options: CacheOptions,
    state: RwLock<CacheState>,
    rebuild: Mutex<()>,
    rebuilds: AtomicUsize,
}

impl<S, E> RepresentationCache<S, E>
where
    S: IdentityStore,
    E: FaceEmbedder,
{
    pub fn new(store: Arc<S>, embedder: Arc<E>, options: CacheOptions) -> Self {
        Self {
            store,
            embedder,
            options,
            state: RwLock::new(CacheState {
                snapshot: None,
                generation: 0,
                artifact_usable: true,
            }),
            rebuild: Mutex::new(()),
            rebuilds: AtomicUsize::new(0),
        }
    }

    /// Returns the valid snapshot, building it first when absent.
    pub fn get_or_build(&self) -> AppResult<Arc<CacheSnapshot>> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        // Concurrent misses queue here and pick up the winner's snapshot.
        let _rebuild = self.rebuild.lock();
        loop {
            let (generation, artifact_usable) = {
                let state = self.state.read();
                if let Some(snapshot) = &state.snapshot {
                    return Ok(Arc::clone(snapshot));
                }
                (state.generation, state.artifact_usable)
            };

            let (snapshot, from_artifact) = match self.load_artifact(artifact_usable) {
                Some(snapshot) => (snapshot, true),
                None => (self.rebuild_from_store()?, false),
            };
            let snapshot = Arc::new(snapshot);
            // Written outside the state lock so readers never wait on disk.
            let persisted = !from_artifact && artifact_usable && self.persist_artifact(&snapshot);

            let mut state = self.state.write();
            if state.generation != generation {
                if persisted {
                    self.remove_artifact(&mut state);
                }
                debug!("cache invalidated during rebuild; starting over");
                continue;
            }
            state.snapshot = Some(Arc::clone(&snapshot));
            return Ok(snapshot);
        }
    }

    /// Drops the snapshot; the next `get_or_build` recomputes from scratch.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        state.snapshot = None;
        state.generation = state.generation.wrapping_add(1);
        self.remove_artifact(&mut state);
    }

    pub fn current(&self) -> Option<Arc<CacheSnapshot>> {
        self.state.read().snapshot.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().snapshot.is_some()
    }

    /// Number of rebuilds that embedded references from the store.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn rebuild_from_store(&self) -> AppResult<CacheSnapshot> {
        let started = Instant::now();
        let deadline = self
            .options
            .rebuild_timeout
            .map(|timeout| (started + timeout, timeout));

        let mut entries = Vec::new();
        let mut sources = Vec::new();
        let mut skipped = 0usize;
        for reference in self.store.list_references()? {
            check_deadline(deadline)?;
            let reference = reference?;
            sources.push(ReferenceFingerprint::of(&reference));
            let embedded =
                decode_image(&reference.bytes).and_then(|image| self.embedder.embed(&image));
            match embedded {
                Ok(embedding) => entries.push(CacheEntry {
                    identity: reference.identity,
                    image_id: reference.image_id,
                    embedding,
                }),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        identity = %reference.identity,
                        image = %reference.image_id,
                        error = %err,
                        "skipping reference that could not be embedded"
                    );
                }
            }
        }
        check_deadline(deadline)?;

        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(
            entries = entries.len(),
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rebuilt representation cache"
        );
        Ok(CacheSnapshot::from_entries(self.embedder.name(), entries).with_sources(sources))
    }

    fn fingerprint_store(&self) -> AppResult<Vec<ReferenceFingerprint>> {
        let mut sources = self
            .store
            .list_references()?
            .map(|reference| reference.map(|reference| ReferenceFingerprint::of(&reference)))
            .collect::<AppResult<Vec<_>>>()?;
        sources.sort();
        Ok(sources)
    }

    fn load_artifact(&self, artifact_usable: bool) -> Option<CacheSnapshot> {
        if !artifact_usable {
            return None;
        }
        let path = self.options.artifact_path.as_deref()?;
        match read_artifact(path) {
            Ok(Some(snapshot)) if snapshot.embedder == self.embedder.name() => {
                let current = match self.fingerprint_store() {
                    Ok(current) => current,
                    Err(err) => {
                        warn!(error = %err, "cannot check cache artifact against the store");
                        return None;
                    }
                };
                if current != snapshot.sources {
                    info!(
                        path = %path.display(),
                        "cache artifact no longer matches the identity store"
                    );
                    return None;
                }
                info!(
                    path = %path.display(),
                    entries = snapshot.len(),
                    "loaded representation cache artifact"
                );
                Some(snapshot)
            }
            Ok(Some(snapshot)) => {
                debug!(
                    path = %path.display(),
                    embedder = %snapshot.embedder,
                    "ignoring cache artifact from another embedder"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable cache artifact");
                None
            }
        }
    }

    fn persist_artifact(&self, snapshot: &CacheSnapshot) -> bool {
        let Some(path) = &self.options.artifact_path else {
            return false;
        };
        match write_artifact(path, snapshot) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to persist cache artifact");
                false
            }
        }
    }

    fn remove_artifact(&self, state: &mut CacheState) {
        let Some(path) = &self.options.artifact_path else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed cache artifact"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                // A stale artifact must never be read back.
                state.artifact_usable = false;
                warn!(path = %path.display(), error = %err, "failed to remove cache artifact");
            }
        }
    }
}

fn check_deadline(deadline: Option<(Instant, Duration)>) -> AppResult<()> {
    match deadline {
        Some((at, timeout)) if Instant::now() > at => Err(AppError::Transient {
            operation: "cache rebuild",
            timeout,
        }),
        _ => Ok(()),
    }
}

#[derive(Serialize)]
struct ArtifactOut<'a> {
    version: u32,
    embedder: &'a str,
    built_at: &'a str,
    entries: &'a [CacheEntry],
    sources: &'a [ReferenceFingerprint],
}

#[derive(Deserialize)]
struct ArtifactIn {
    version: u32,
    embedder: String,
    built_at: String,
    entries: Vec<CacheEntry>,
    sources: Vec<ReferenceFingerprint>,
}

pub fn read_artifact(path: &Path) -> AppResult<Option<CacheSnapshot>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(AppError::storage(path, source)),
    };

    let artifact: ArtifactIn =
        serde_json::from_slice(&data).map_err(|err| AppError::CacheArtifact {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    if artifact.version != ARTIFACT_VERSION {
        return Err(AppError::CacheArtifact {
            path: path.to_path_buf(),
            message: format!("unsupported artifact version {}", artifact.version),
        });
    }

    let mut snapshot = CacheSnapshot::from_entries(artifact.embedder, artifact.entries)
        .with_sources(artifact.sources);
    snapshot.built_at = artifact.built_at;
    Ok(Some(snapshot))
}

pub fn write_artifact(path: &Path, snapshot: &CacheSnapshot) -> AppResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AppError::storage(parent, source))?;
    let payload = serde_json::to_vec_pretty(&ArtifactOut {
        version: ARTIFACT_VERSION,
        embedder: &snapshot.embedder,
        built_at: &snapshot.built_at,
        entries: &snapshot.entries,
        sources: &snapshot.sources,
    })?;
    write_atomically(parent, path, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    use crate::decode::encode_png;
    use crate::faces::store::{FilesystemIdentityStore, InMemoryIdentityStore};

    /// Embeds an image as its top-left pixel, counting calls.
    #[derive(Default)]
    struct PixelEmbedder {
        calls: AtomicUsize,
    }

    impl FaceEmbedder for PixelEmbedder {
        fn name(&self) -> String {
            "pixel".into()
        }

        fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let pixel = image.get_pixel(0, 0);
            if pixel[0] == 0 {
                return Err(AppError::NoFaceDetected);
            }
            Ok(pixel.0.iter().map(|v| f64::from(*v)).collect())
        }
    }

    fn png(r: u8) -> Vec<u8> {
        encode_png(&RgbImage::from_pixel(2, 2, Rgb([r, 10, 20]))).unwrap()
    }

    fn in_memory_cache() -> (
        Arc<InMemoryIdentityStore>,
        Arc<PixelEmbedder>,
        RepresentationCache<InMemoryIdentityStore, PixelEmbedder>,
    ) {
        let store = Arc::new(InMemoryIdentityStore::new());
        let embedder = Arc::new(PixelEmbedder::default());
        let cache = RepresentationCache::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            CacheOptions::default(),
        );
        (store, embedder, cache)
    }

    #[test]
    fn get_or_build_is_idempotent() {
        let (store, embedder, cache) = in_memory_cache();
        store.put_reference("alice@example.com", &png(200)).unwrap();

        let first = cache.get_or_build().unwrap();
        let second = cache.get_or_build().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.entries, second.entries);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.rebuild_count(), 1);
    }

    #[test]
    fn invalidate_forces_full_rebuild() {
        let (store, embedder, cache) = in_memory_cache();
        store.put_reference("alice@example.com", &png(200)).unwrap();
        cache.get_or_build().unwrap();

        store.put_reference("bob@example.com", &png(100)).unwrap();
        assert_eq!(cache.get_or_build().unwrap().len(), 1);

        cache.invalidate();
        assert!(!cache.is_valid());
        let rebuilt = cache.get_or_build().unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(
            rebuilt.embedding_for("bob@example.com", "face.png"),
            Some(&[100.0, 10.0, 20.0][..])
        );
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failed_references_are_skipped() {
        let (store, _embedder, cache) = in_memory_cache();
        store.put_reference("alice@example.com", &png(200)).unwrap();
        store.put_reference("faceless@example.com", &png(0)).unwrap();
        store.insert_reference("garbage@example.com", "face.png", b"not an image");

        let snapshot = cache.get_or_build().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.entries[0].identity, "alice@example.com");
    }

    #[test]
    fn entries_are_sorted_by_identity() {
        let (store, _embedder, cache) = in_memory_cache();
        store.put_reference("carol@example.com", &png(30)).unwrap();
        store.put_reference("alice@example.com", &png(10)).unwrap();
        store.put_reference("bob@example.com", &png(20)).unwrap();

        let identities: Vec<String> = cache
            .get_or_build()
            .unwrap()
            .entries
            .iter()
            .map(|entry| entry.identity.clone())
            .collect();
        assert_eq!(
            identities,
            vec!["alice@example.com", "bob@example.com", "carol@example.com"]
        );
    }

    #[test]
    fn zero_timeout_fails_without_installing() {
        let store = Arc::new(InMemoryIdentityStore::new());
        store.put_reference("alice@example.com", &png(200)).unwrap();
        let cache = RepresentationCache::new(
            store,
            Arc::new(PixelEmbedder::default()),
            CacheOptions {
                artifact_path: None,
                rebuild_timeout: Some(Duration::ZERO),
            },
        );

        std::thread::sleep(Duration::from_millis(2));
        let err = cache.get_or_build().unwrap_err();
        assert!(matches!(err, AppError::Transient { .. }));
        assert!(!cache.is_valid());
    }

    #[test]
    fn artifact_is_written_reused_and_removed() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FilesystemIdentityStore::new(tmp.path()));
        store.put_reference("alice@example.com", &png(200)).unwrap();
        let path = artifact_path(tmp.path(), "pixel");
        let options = CacheOptions {
            artifact_path: Some(path.clone()),
            rebuild_timeout: None,
        };

        let cache = RepresentationCache::new(
            Arc::clone(&store),
            Arc::new(PixelEmbedder::default()),
            options.clone(),
        );
        let built = cache.get_or_build().unwrap();
        assert!(path.exists());

        // A fresh process picks the artifact up instead of re-embedding.
        let embedder = Arc::new(PixelEmbedder::default());
        let reloaded =
            RepresentationCache::new(Arc::clone(&store), Arc::clone(&embedder), options);
        let snapshot = reloaded.get_or_build().unwrap();
        assert_eq!(snapshot.entries, built.entries);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(reloaded.rebuild_count(), 0);

        reloaded.invalidate();
        assert!(!path.exists());
    }

    #[test]
    fn artifact_is_discarded_when_store_changed() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FilesystemIdentityStore::new(tmp.path()));
        store.put_reference("alice@example.com", &png(200)).unwrap();
        store.put_reference("bob@example.com", &png(100)).unwrap();
        let path = artifact_path(tmp.path(), "pixel");
        let options = CacheOptions {
            artifact_path: Some(path.clone()),
            rebuild_timeout: None,
        };
        RepresentationCache::new(
            Arc::clone(&store),
            Arc::new(PixelEmbedder::default()),
            options.clone(),
        )
        .get_or_build()
        .unwrap();
        assert_eq!(read_artifact(&path).unwrap().unwrap().sources.len(), 2);

        // Changed behind the cache's back: one overwrite, one removal.
        store.put_reference("alice@example.com", &png(90)).unwrap();
        fs::remove_dir_all(tmp.path().join("bob@example.com")).unwrap();

        let reloaded =
            RepresentationCache::new(Arc::clone(&store), Arc::new(PixelEmbedder::default()), options);
        let snapshot = reloaded.get_or_build().unwrap();
        assert_eq!(reloaded.rebuild_count(), 1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.embedding_for("alice@example.com", "face.png"),
            Some(&[90.0, 10.0, 20.0][..])
        );
        assert_eq!(read_artifact(&path).unwrap().unwrap().sources, snapshot.sources);
    }

    #[test]
    fn corrupt_artifact_triggers_rebuild() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FilesystemIdentityStore::new(tmp.path()));
        store.put_reference("alice@example.com", &png(200)).unwrap();
        let path = artifact_path(tmp.path(), "pixel");
        fs::write(&path, "{ not json").unwrap();

        let cache = RepresentationCache::new(
            store,
            Arc::new(PixelEmbedder::default()),
            CacheOptions {
                artifact_path: Some(path.clone()),
                rebuild_timeout: None,
            },
        );
        let snapshot = cache.get_or_build().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(cache.rebuild_count(), 1);
        assert!(read_artifact(&path).unwrap().is_some());
    }

    #[test]
    fn artifact_from_other_embedder_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("representations.json");
        let foreign = CacheSnapshot::from_entries(
            "other-model",
            vec![CacheEntry {
                identity: "mallory@example.com".into(),
                image_id: "face.png".into(),
                embedding: vec![1.0, 2.0, 3.0],
            }],
        );
        write_artifact(&path, &foreign).unwrap();

        let cache = RepresentationCache::new(
            Arc::new(InMemoryIdentityStore::new()),
            Arc::new(PixelEmbedder::default()),
            CacheOptions {
                artifact_path: Some(path),
                rebuild_timeout: None,
            },
        );
        assert!(cache.get_or_build().unwrap().is_empty());
    }

    /// Sleeps inside every embed so a rebuild can be interrupted.
    struct SlowEmbedder {
        started: AtomicUsize,
        delay: Duration,
    }

    impl FaceEmbedder for SlowEmbedder {
        fn name(&self) -> String {
            "slow".into()
        }

        fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(vec![f64::from(image.get_pixel(0, 0)[0]), 1.0])
        }
    }

    #[test]
    fn invalidation_during_rebuild_discards_it() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FilesystemIdentityStore::new(tmp.path()));
        store.put_reference("alice@example.com", &png(200)).unwrap();
        let path = artifact_path(tmp.path(), "slow");
        let embedder = Arc::new(SlowEmbedder {
            started: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let cache = Arc::new(RepresentationCache::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            CacheOptions {
                artifact_path: Some(path.clone()),
                rebuild_timeout: None,
            },
        ));

        let builder = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get_or_build().unwrap())
        };
        while embedder.started.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        // The running rebuild has already listed the store.
        store.put_reference("bob@example.com", &png(100)).unwrap();
        cache.invalidate();

        let built = builder.join().unwrap();
        assert_eq!(built.len(), 2);
        assert!(built.embedding_for("bob@example.com", "face.png").is_some());
        assert_eq!(cache.rebuild_count(), 2);
        assert!(Arc::ptr_eq(&built, &cache.get_or_build().unwrap()));
        assert_eq!(read_artifact(&path).unwrap().unwrap().sources, built.sources);
    }

    #[test]
    fn concurrent_misses_share_one_rebuild() {
        let (store, embedder, cache) = in_memory_cache();
        store.put_reference("alice@example.com", &png(200)).unwrap();
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_or_build().unwrap().len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(cache.rebuild_count(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }
}
