//! The size-bounded on-disk symcache store.
//!
//! Entries live under `<root>/<shard>/<debug_file>/<debug_id>/<version>/`,
//! where `<shard>` is derived from the key fingerprint to cap directory
//! fan-out. A positive entry is a `symcache` blob; a negative entry is an
//! empty `missing` sentinel recording that the upstream has no symbols.
//!
//! Publication is write-fsync-rename, so a reader can never observe a
//! partial blob. Builds are coordinated through a single-flight registry:
//! at most one build per key runs in the process, concurrent callers await
//! the same result, and an abandoned build (a caller hitting its request
//! deadline) still runs to completion and publishes its result.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

use symserver_common::ModuleKey;

use crate::metric;

/// File name of a positive cache entry.
const POSITIVE_FILE: &str = "symcache";
/// File name of a negative (known missing upstream) sentinel.
const NEGATIVE_FILE: &str = "missing";
/// Directory for in-progress writes, inside the cache root.
const TMP_DIR: &str = "tmp";

/// An error from the cache itself (not from a build).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem trouble while setting up or writing the cache.
    #[error("cache i/o failed")]
    Io(#[from] io::Error),
}

/// An error produced by a module build.
///
/// Build errors are shared across all single-flight waiters and are never
/// cached: the next request for the key retries the build.
#[derive(Clone, Debug, Error)]
pub enum BuildError {
    /// Downloading the symbol file failed after all retries.
    #[error("download failed: {0}")]
    Download(String),

    /// The symbol file could not be parsed.
    #[error("symbol file is malformed: {0}")]
    Malformed(String),

    /// The build task died before producing a result.
    #[error("build was canceled")]
    Canceled,

    /// The finished blob could not be written to the cache.
    #[error("cache write failed: {0}")]
    Io(String),
}

/// What a module build produced.
#[derive(Debug)]
pub enum BuildOutcome {
    /// A finished symcache blob to publish.
    Symcache(Vec<u8>),
    /// The upstream is known not to have the module; a negative sentinel is
    /// published.
    Missing,
}

/// The result type of a module build future.
pub type BuildResult = Result<BuildOutcome, BuildError>;

/// A positive cache entry held by a request.
///
/// The entry keeps a reader reference on the underlying file for as long as
/// any clone is alive, which protects it from eviction.
#[derive(Clone, Debug)]
pub struct CachedBlob {
    data: Arc<Vec<u8>>,
    _guard: Arc<ReaderGuard>,
}

impl CachedBlob {
    /// The symcache bytes.
    pub fn data(&self) -> &Arc<Vec<u8>> {
        &self.data
    }
}

/// The result of a cache fetch, after any necessary build.
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    /// The symcache for the module.
    Positive(CachedBlob),
    /// The upstream has no symbols for the module.
    Negative,
}

/// The result of a plain cache read.
enum GetResult {
    Hit(CachedBlob),
    Negative,
    Miss,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    Positive,
    Negative { written: SystemTime },
}

#[derive(Debug)]
struct EntryMeta {
    kind: EntryKind,
    size: u64,
    last_access: u64,
    readers: u32,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, EntryMeta>,
    total_bytes: u64,
    access_clock: u64,
}

impl Index {
    fn touch(&mut self, fingerprint: &str) {
        self.access_clock += 1;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.last_access = self.access_clock;
        }
    }

    fn remove(&mut self, fingerprint: &str) -> Option<EntryMeta> {
        let removed = self.entries.remove(fingerprint)?;
        self.total_bytes = self.total_bytes.saturating_sub(removed.size);
        Some(removed)
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<BuildPublication, BuildError>>>;

/// What the single-flight build broadcast carries to its waiters.
#[derive(Clone, Debug)]
enum BuildPublication {
    Positive(Arc<Vec<u8>>),
    Negative,
}

struct Inflight {
    id: u64,
    future: SharedBuild,
}

/// The shared state behind [`DiskCache`] handles.
struct CacheInner {
    root: PathBuf,
    tmp: PathBuf,
    format_version: u32,
    max_bytes: u64,
    low_water_bytes: u64,
    negative_ttl: Duration,
    index: Mutex<Index>,
    inflight: Mutex<HashMap<String, Inflight>>,
    build_ids: AtomicU64,
}

/// The size-bounded on-disk symcache store with single-flight builds.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<CacheInner>,
}

/// Decrements the reader count of its entry on drop.
struct ReaderGuard {
    inner: Arc<CacheInner>,
    fingerprint: String,
}

impl std::fmt::Debug for ReaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderGuard")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut index = self.inner.index.lock();
        if let Some(entry) = index.entries.get_mut(&self.fingerprint) {
            entry.readers = entry.readers.saturating_sub(1);
        }
    }
}

impl DiskCache {
    /// Opens the cache, rebuilding the in-memory index from the directory
    /// tree.
    ///
    /// Stale `tmp` files from interrupted writes and entries of older
    /// symcache format versions are removed. Emits the `diskcache.usage`
    /// gauge once the scan completes.
    pub fn open(
        root: impl Into<PathBuf>,
        format_version: u32,
        max_bytes: u64,
        low_water_bytes: u64,
        negative_ttl: Duration,
    ) -> Result<Self, CacheError> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;

        let inner = Arc::new(CacheInner {
            root,
            tmp,
            format_version,
            max_bytes,
            low_water_bytes,
            negative_ttl,
            index: Mutex::new(Index::default()),
            inflight: Mutex::new(HashMap::new()),
            build_ids: AtomicU64::new(0),
        });

        inner.clear_tmp()?;
        inner.warm_scan()?;

        metric!(gauge("diskcache.usage") = inner.index.lock().total_bytes);

        Ok(DiskCache { inner })
    }

    /// The current total size of all indexed entries, in bytes.
    pub fn usage_bytes(&self) -> u64 {
        self.inner.index.lock().total_bytes
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Fetches the entry for `key`, running `build` on a cache miss.
    ///
    /// At most one build per key runs in the process at any time; callers
    /// arriving during a build await its result. A successful build is
    /// published to disk before waiters resume; a failed build is shared
    /// with all current waiters but not cached, so the next caller retries.
    pub async fn get_or_build<F>(&self, key: &ModuleKey, build: F) -> Result<FetchOutcome, BuildError>
    where
        F: std::future::Future<Output = BuildResult> + Send + 'static,
    {
        let fingerprint = key.fingerprint(self.inner.format_version);

        match self.get(key, &fingerprint).await {
            GetResult::Hit(blob) => return Ok(FetchOutcome::Positive(blob)),
            GetResult::Negative => return Ok(FetchOutcome::Negative),
            GetResult::Miss => {}
        }

        let shared = self.spawn_or_join_build(key, &fingerprint, build);

        match shared.await? {
            BuildPublication::Positive(data) => {
                let guard = self.inner.acquire_reader(&fingerprint);
                Ok(FetchOutcome::Positive(CachedBlob {
                    data,
                    _guard: Arc::new(guard),
                }))
            }
            BuildPublication::Negative => Ok(FetchOutcome::Negative),
        }
    }

    /// Joins the in-flight build for the key, or registers and spawns a new
    /// one.
    ///
    /// The build runs as a detached task: callers that stop waiting (for
    /// example on a request deadline) do not cancel it, and its publication
    /// to disk still happens.
    fn spawn_or_join_build<F>(&self, key: &ModuleKey, fingerprint: &str, build: F) -> SharedBuild
    where
        F: std::future::Future<Output = BuildResult> + Send + 'static,
    {
        let mut inflight = self.inner.inflight.lock();
        if let Some(entry) = inflight.get(fingerprint) {
            return entry.future.clone();
        }

        let id = self.inner.build_ids.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = tokio::sync::oneshot::channel();

        let shared: SharedBuild = async move {
            receiver.await.map_err(|_| BuildError::Canceled)?
        }
        .boxed()
        .shared();

        inflight.insert(
            fingerprint.to_owned(),
            Inflight {
                id,
                future: shared.clone(),
            },
        );

        let inner = self.inner.clone();
        let key = key.clone();
        let fingerprint = fingerprint.to_owned();
        tokio::spawn(async move {
            let result = inner.run_build(&key, &fingerprint, build).await;

            let mut inflight = inner.inflight.lock();
            if inflight.get(&fingerprint).map_or(false, |entry| entry.id == id) {
                inflight.remove(&fingerprint);
            }
            drop(inflight);

            let _ = sender.send(result);
        });

        shared
    }

    /// Reads the entry for `key` if it is present and valid.
    async fn get(&self, key: &ModuleKey, fingerprint: &str) -> GetResult {
        let started = Instant::now();
        let (result, tag) = self.get_inner(key, fingerprint).await;
        metric!(timer("diskcache.get") = started.elapsed(), "result" => tag);
        result
    }

    async fn get_inner(&self, key: &ModuleKey, fingerprint: &str) -> (GetResult, &'static str) {
        let path = {
            let mut index = self.inner.index.lock();
            let entry = match index.entries.get(fingerprint) {
                Some(entry) => entry,
                None => return (GetResult::Miss, "miss"),
            };

            match entry.kind {
                EntryKind::Negative { written } => {
                    if negative_expired(written, SystemTime::now(), self.inner.negative_ttl) {
                        let removed = index.remove(fingerprint);
                        drop(index);
                        if let Some(removed) = removed {
                            self.inner.unlink_later(removed.path);
                        }
                        return (GetResult::Miss, "miss");
                    }
                    index.touch(fingerprint);
                    return (GetResult::Negative, "hit");
                }
                EntryKind::Positive => {
                    index.access_clock += 1;
                    let last_access = index.access_clock;
                    match index.entries.get_mut(fingerprint) {
                        Some(entry) => {
                            entry.last_access = last_access;
                            entry.readers += 1;
                            entry.path.clone()
                        }
                        None => return (GetResult::Miss, "miss"),
                    }
                }
            }
        };

        let read = tokio::task::spawn_blocking(move || fs::read(&path)).await;
        match read {
            Ok(Ok(data)) => {
                let guard = ReaderGuard {
                    inner: self.inner.clone(),
                    fingerprint: fingerprint.to_owned(),
                };
                (
                    GetResult::Hit(CachedBlob {
                        data: Arc::new(data),
                        _guard: Arc::new(guard),
                    }),
                    "hit",
                )
            }
            Ok(Err(error)) => {
                // The file vanished or cannot be read: treat the key as a
                // miss and drop it from the index.
                tracing::warn!(module = %key, %error, "cache entry unreadable");
                let mut index = self.inner.index.lock();
                if let Some(entry) = index.entries.get_mut(fingerprint) {
                    entry.readers = entry.readers.saturating_sub(1);
                }
                index.remove(fingerprint);
                (GetResult::Miss, "error")
            }
            Err(_) => (GetResult::Miss, "error"),
        }
    }
}

impl CacheInner {
    /// Runs a build future and publishes its result.
    async fn run_build<F>(
        self: &Arc<Self>,
        key: &ModuleKey,
        fingerprint: &str,
        build: F,
    ) -> Result<BuildPublication, BuildError>
    where
        F: std::future::Future<Output = BuildResult> + Send + 'static,
    {
        match build.await {
            Ok(BuildOutcome::Symcache(bytes)) => {
                let bytes = Arc::new(bytes);
                self.publish(key, fingerprint, Some(bytes.clone()))
                    .await
                    .map_err(|error| BuildError::Io(error.to_string()))?;
                Ok(BuildPublication::Positive(bytes))
            }
            Ok(BuildOutcome::Missing) => {
                // A failed sentinel write only costs a re-download later.
                if let Err(error) = self.publish(key, fingerprint, None).await {
                    tracing::warn!(module = %key, %error, "failed to write negative cache entry");
                }
                Ok(BuildPublication::Negative)
            }
            Err(error) => Err(error),
        }
    }

    /// Atomically publishes a positive blob or a negative sentinel.
    async fn publish(
        self: &Arc<Self>,
        key: &ModuleKey,
        fingerprint: &str,
        bytes: Option<Arc<Vec<u8>>>,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        let final_path = self.entry_path(key, fingerprint, bytes.is_some());
        let tmp_path = self.tmp.join(Uuid::new_v4().to_string());

        let write_bytes = bytes.clone();
        let write_tmp = tmp_path.clone();
        let write_final = final_path.clone();
        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            {
                let mut file = fs::File::create(&write_tmp)?;
                if let Some(ref data) = write_bytes {
                    io::Write::write_all(&mut file, data)?;
                }
                file.sync_all()?;
            }
            if let Some(parent) = write_final.parent() {
                fs::create_dir_all(parent)?;
            }
            // Concurrent writers of the same key race on this rename; the
            // contents are identical, so a replace is as good as a win.
            if let Err(error) = fs::rename(&write_tmp, &write_final) {
                let _ = fs::remove_file(&write_tmp);
                return Err(error);
            }
            Ok(())
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "write task died"))
        .and_then(|result| result);

        let tag = if result.is_ok() { "success" } else { "fail" };
        metric!(timer("diskcache.set") = started.elapsed(), "result" => tag);
        result?;

        let size = bytes.as_ref().map_or(0, |data| data.len() as u64);
        let kind = match bytes {
            Some(_) => EntryKind::Positive,
            None => EntryKind::Negative {
                written: SystemTime::now(),
            },
        };

        let total = {
            let mut index = self.index.lock();
            index.remove(fingerprint);
            index.access_clock += 1;
            let last_access = index.access_clock;
            index.entries.insert(
                fingerprint.to_owned(),
                EntryMeta {
                    kind,
                    size,
                    last_access,
                    readers: 0,
                    path: final_path,
                },
            );
            index.total_bytes += size;
            index.total_bytes
        };

        metric!(gauge("diskcache.usage") = total);

        if total > self.max_bytes {
            self.evict().await;
        }

        Ok(())
    }

    /// Evicts least-recently-used entries until the total size is at or
    /// below the low-water mark.
    ///
    /// Entries with active readers are skipped; they become candidates
    /// again once their readers finish. Index removal happens before the
    /// files are unlinked, so concurrent reads observe a plain miss.
    async fn evict(self: &Arc<Self>) {
        let victims = {
            let mut index = self.index.lock();
            if index.total_bytes <= self.max_bytes {
                return;
            }

            let mut candidates: Vec<(u64, String)> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.readers == 0)
                .map(|(fingerprint, entry)| (entry.last_access, fingerprint.clone()))
                .collect();
            candidates.sort_unstable();

            let mut victims = Vec::new();
            for (_, fingerprint) in candidates {
                if index.total_bytes <= self.low_water_bytes {
                    break;
                }
                if let Some(removed) = index.remove(&fingerprint) {
                    victims.push(removed.path);
                }
            }
            victims
        };

        if victims.is_empty() {
            return;
        }

        metric!(counter("diskcache.evict") += victims.len() as i64);
        metric!(gauge("diskcache.usage") = self.index.lock().total_bytes);

        let _ = tokio::task::spawn_blocking(move || {
            for path in victims {
                remove_entry_file(&path);
            }
        })
        .await;
    }

    fn acquire_reader(self: &Arc<Self>, fingerprint: &str) -> ReaderGuard {
        {
            let mut index = self.index.lock();
            if let Some(entry) = index.entries.get_mut(fingerprint) {
                entry.readers += 1;
            }
        }
        ReaderGuard {
            inner: self.clone(),
            fingerprint: fingerprint.to_owned(),
        }
    }

    /// `<root>/<shard>/<debug_file>/<debug_id>/<version>/<artifact>`
    fn entry_path(&self, key: &ModuleKey, fingerprint: &str, positive: bool) -> PathBuf {
        let artifact = if positive { POSITIVE_FILE } else { NEGATIVE_FILE };
        self.root
            .join(&fingerprint[..2])
            .join(key.debug_file())
            .join(key.debug_id().as_str())
            .join(self.format_version.to_string())
            .join(artifact)
    }

    fn unlink_later(self: &Arc<Self>, path: PathBuf) {
        tokio::task::spawn_blocking(move || remove_entry_file(&path));
    }

    fn clear_tmp(&self) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.tmp)? {
            let entry = entry?;
            if let Err(error) = fs::remove_file(entry.path()) {
                tracing::warn!(path = %entry.path().display(), %error, "could not remove tmp file");
            }
        }
        Ok(())
    }

    /// Rebuilds the in-memory index from the directory tree.
    ///
    /// Entries of other format versions are deleted; their keys can never
    /// be requested again under this version's fingerprints.
    fn warm_scan(&self) -> Result<(), CacheError> {
        let mut found: Vec<(SystemTime, String, EntryMeta)> = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(5).max_depth(5) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(%error, "cache scan error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let file_name = entry.file_name().to_string_lossy();
            let positive = match file_name.as_ref() {
                POSITIVE_FILE => true,
                NEGATIVE_FILE => false,
                _ => continue,
            };

            let Some((key, version)) = parse_entry_path(&self.root, entry.path()) else {
                continue;
            };

            if version != self.format_version {
                if let Some(version_dir) = entry.path().parent() {
                    tracing::info!(path = %version_dir.display(), "removing stale format version");
                    let _ = fs::remove_dir_all(version_dir);
                }
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            let kind = if positive {
                EntryKind::Positive
            } else {
                EntryKind::Negative { written: mtime }
            };

            found.push((
                mtime,
                key.fingerprint(self.format_version),
                EntryMeta {
                    kind,
                    size: metadata.len(),
                    last_access: 0,
                    readers: 0,
                    path: entry.path().to_owned(),
                },
            ));
        }

        // Oldest first, so the access clock reproduces the on-disk age
        // ordering.
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut index = self.index.lock();
        for (_, fingerprint, mut meta) in found {
            index.access_clock += 1;
            meta.last_access = index.access_clock;
            index.total_bytes += meta.size;
            index.entries.insert(fingerprint, meta);
        }

        Ok(())
    }
}

/// Extracts `(module key, format version)` from an entry path.
fn parse_entry_path(root: &Path, path: &Path) -> Option<(ModuleKey, u32)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components().map(|c| c.as_os_str().to_str());
    let _shard = components.next()??;
    let debug_file = components.next()??;
    let debug_id = components.next()??;
    let version: u32 = components.next()??.parse().ok()?;

    let key = ModuleKey::new(debug_file, debug_id).ok()?;
    Some((key, version))
}

/// Removes an entry file, pruning now-empty parent directories.
fn remove_entry_file(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), %error, "could not remove cache entry");
        return;
    }
    // prune <version> and <debug_id> dirs when they become empty
    let mut dir = path.parent();
    for _ in 0..2 {
        match dir {
            Some(parent) if fs::remove_dir(parent).is_ok() => dir = parent.parent(),
            _ => break,
        }
    }
}

/// Whether a negative sentinel written at `written` has expired at `now`.
fn negative_expired(written: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    match now.duration_since(written) {
        Ok(age) => age > ttl,
        // A sentinel from the future is a clock anomaly; keep it.
        Err(_) => false,
    }
}
