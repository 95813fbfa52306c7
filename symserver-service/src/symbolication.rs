//! Request-scoped symbolication orchestration.
//!
//! A request carries one or more [`Job`]s. For each job the symbolicator
//! collapses the memory map into distinct module keys, fetches their
//! symcaches concurrently through the disk cache (which dedups builds
//! across concurrent requests), and then resolves every frame in input
//! order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;

use symserver_common::ModuleKey;
use symserver_symcache::{SymCache, SymCacheConverter};
use symserver_symfile::SymFile;

use crate::diskcache::{
    BuildError, BuildOutcome, BuildResult, CachedBlob, DiskCache, FetchOutcome,
};
use crate::downloader::{DownloadError, ObjectDownloader};
use crate::metric;

/// One frame of an incoming stack: a module index into the memory map (or
/// `None` for the "no module" sentinel) and an offset into that module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRequest {
    /// Index into the job's memory map, already bounds-checked.
    pub module_index: Option<usize>,
    /// Address offset relative to the module's load base.
    pub offset: u64,
}

/// One symbolication job: a memory map and the stacks referencing it.
#[derive(Clone, Debug, Default)]
pub struct Job {
    /// The modules loaded at capture time, in request order.
    pub memory_map: Vec<ModuleKey>,
    /// The stacks to symbolicate, in request order.
    pub stacks: Vec<Vec<FrameRequest>>,
}

/// A failure that cannot be attributed to a single module and fails the
/// whole request.
///
/// Module-level trouble (missing symbols, transient downloads, malformed
/// files) degrades to unresolved frames instead; only an unrecoverable
/// fault of the service itself ends up here.
#[derive(Clone, Debug, Error)]
pub enum SymbolicationError {
    /// A finished symcache could not be persisted to the disk cache.
    #[error("symcache store write failed: {0}")]
    CacheWrite(String),
}

/// Why a module has no symcache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    /// A symcache is available.
    Found,
    /// The upstream stores have no symbols for this module.
    Missing,
    /// The symbol file exists but cannot be used.
    Malformed,
    /// Fetching failed after retries, or the request deadline cut it off.
    Failed,
    /// No frame references this module; it was never looked up.
    Unused,
}

impl ModuleState {
    /// Whether this module's symbols were found upstream.
    pub fn found(&self) -> bool {
        matches!(self, ModuleState::Found)
    }
}

/// An inline caller expansion inside a [`SymbolicatedFrame`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineFrame {
    /// Name of the inlined function.
    pub function: String,
    /// Source file of the instruction inside the inlined function.
    pub file: Option<String>,
    /// Source line of the instruction inside the inlined function.
    pub line: Option<u32>,
}

/// One symbolicated output frame, mirroring an input frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolicatedFrame {
    /// The input module index, if any.
    pub module_index: Option<usize>,
    /// The input address offset.
    pub offset: u64,
    /// The containing function, when the lookup succeeded.
    pub function: Option<String>,
    /// Offset of the address into the containing function.
    pub function_offset: Option<u64>,
    /// Source file of the address in the containing function.
    pub file: Option<String>,
    /// Source line of the address in the containing function.
    pub line: Option<u32>,
    /// Inlined calls at this address, innermost first.
    pub inlines: Vec<InlineFrame>,
}

/// The result of one job, frame order preserved.
#[derive(Clone, Debug, Default)]
pub struct JobResult {
    /// Per memory-map entry module state, in request order.
    pub modules: Vec<(ModuleKey, ModuleState)>,
    /// Symbolicated stacks, in request order.
    pub stacks: Vec<Vec<SymbolicatedFrame>>,
}

/// The request-scoped symbolication service.
#[derive(Clone)]
pub struct Symbolicator {
    cache: DiskCache,
    downloader: Arc<dyn ObjectDownloader>,
    fetch_concurrency: usize,
    request_deadline: Duration,
}

impl Symbolicator {
    /// Creates a symbolicator on top of a disk cache and a downloader.
    pub fn new(
        cache: DiskCache,
        downloader: Arc<dyn ObjectDownloader>,
        fetch_concurrency: usize,
        request_deadline: Duration,
    ) -> Self {
        Symbolicator {
            cache,
            downloader,
            fetch_concurrency: fetch_concurrency.max(1),
            request_deadline,
        }
    }

    /// Symbolicates all jobs of one request.
    ///
    /// Jobs, stacks and frames come back in exactly the input order. Module
    /// failures never fail the request; the affected frames stay
    /// unresolved. Only an unrecoverable service fault, such as a cache
    /// write failure, is returned as a [`SymbolicationError`].
    pub async fn symbolicate(&self, jobs: Vec<Job>) -> Result<Vec<JobResult>, SymbolicationError> {
        metric!(histogram("symbolicate.jobs_count") = jobs.len() as u64);

        let deadline = tokio::time::Instant::now() + self.request_deadline;

        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            results.push(self.process_job(job, deadline).await?);
        }
        Ok(results)
    }

    #[tracing::instrument(skip_all, fields(modules = job.memory_map.len(), stacks = job.stacks.len()))]
    async fn process_job(
        &self,
        job: Job,
        deadline: tokio::time::Instant,
    ) -> Result<JobResult, SymbolicationError> {
        metric!(histogram("symbolicate.stacks_count") = job.stacks.len() as u64);
        for stack in &job.stacks {
            metric!(histogram("symbolicate.frames_count") = stack.len() as u64);
        }

        // Distinct modules that at least one frame references; duplicate
        // memory-map entries collapse onto one fetch.
        let mut referenced: Vec<bool> = vec![false; job.memory_map.len()];
        for stack in &job.stacks {
            for frame in stack {
                if let Some(index) = frame.module_index {
                    referenced[index] = true;
                }
            }
        }

        let mut distinct: HashMap<ModuleKey, Vec<usize>> = HashMap::new();
        for (index, key) in job.memory_map.iter().enumerate() {
            if referenced[index] {
                distinct.entry(key.clone()).or_default().push(index);
            }
        }

        let fetches = distinct.into_iter().map(|(key, indices)| {
            let fetch = self.fetch_module(key, deadline);
            async move { (indices, fetch.await) }
        });
        let fetched: Vec<(Vec<usize>, Result<(ModuleState, Option<CachedBlob>), SymbolicationError>)> =
            stream::iter(fetches)
                .buffer_unordered(self.fetch_concurrency)
                .collect()
                .await;

        let mut states: Vec<ModuleState> = vec![ModuleState::Unused; job.memory_map.len()];
        let mut blobs: Vec<Option<CachedBlob>> = vec![None; job.memory_map.len()];
        for (indices, result) in fetched {
            let (state, blob) = result?;
            for index in indices {
                states[index] = state;
                blobs[index] = blob.clone();
            }
        }

        // Parse each fetched blob once per job. Parse failures downgrade
        // the module; they cannot normally happen since only verified
        // blobs are published.
        let caches: Vec<Option<SymCache<'_>>> = blobs
            .iter()
            .map(|blob| {
                blob.as_ref()
                    .and_then(|blob| match SymCache::parse(blob.data()) {
                        Ok(cache) => Some(cache),
                        Err(error) => {
                            tracing::warn!(%error, "published symcache does not parse");
                            None
                        }
                    })
            })
            .collect();
        for (index, blob) in blobs.iter().enumerate() {
            if blob.is_some() && caches[index].is_none() {
                states[index] = ModuleState::Malformed;
            }
        }

        let stacks = job
            .stacks
            .iter()
            .map(|stack| {
                stack
                    .iter()
                    .map(|frame| symbolicate_frame(frame, &caches))
                    .collect()
            })
            .collect();

        Ok(JobResult {
            modules: job.memory_map.into_iter().zip(states).collect(),
            stacks,
        })
    }

    /// Fetches one module's symcache, bounded by the request deadline.
    ///
    /// A deadline expiry only abandons the wait: the underlying build keeps
    /// running detached and publishes its result for later requests. A
    /// failure to persist a finished symcache means the store itself is
    /// broken and is escalated instead of being folded into the module
    /// state.
    async fn fetch_module(
        &self,
        key: ModuleKey,
        deadline: tokio::time::Instant,
    ) -> Result<(ModuleState, Option<CachedBlob>), SymbolicationError> {
        let build = build_module(self.downloader.clone(), key.clone());
        let fetch = self.cache.get_or_build(&key, build);

        match tokio::time::timeout_at(deadline, fetch).await {
            Ok(Ok(FetchOutcome::Positive(blob))) => Ok((ModuleState::Found, Some(blob))),
            Ok(Ok(FetchOutcome::Negative)) => Ok((ModuleState::Missing, None)),
            Ok(Err(BuildError::Malformed(error))) => {
                tracing::debug!(module = %key, %error, "module symbols are malformed");
                Ok((ModuleState::Malformed, None))
            }
            Ok(Err(BuildError::Io(error))) => {
                tracing::error!(module = %key, %error, "could not persist symcache");
                Err(SymbolicationError::CacheWrite(error))
            }
            Ok(Err(error)) => {
                tracing::debug!(module = %key, %error, "module fetch failed");
                Ok((ModuleState::Failed, None))
            }
            Err(_) => {
                tracing::debug!(module = %key, "module fetch hit the request deadline");
                Ok((ModuleState::Failed, None))
            }
        }
    }
}

/// Downloads, parses and compiles one module's symcache.
///
/// This is the `build_fn` handed to the disk cache; it owns everything it
/// needs so the cache can run it detached from the requesting task. The
/// CPU-heavy parse and compile phases run on a blocking thread.
async fn build_module(downloader: Arc<dyn ObjectDownloader>, key: ModuleKey) -> BuildResult {
    let bytes = match downloader.download(&key).await {
        Ok(bytes) => bytes,
        Err(DownloadError::NotFound) => return Ok(BuildOutcome::Missing),
        Err(DownloadError::Transient(error)) => return Err(BuildError::Download(error)),
    };

    let task = tokio::task::spawn_blocking(move || {
        let started = std::time::Instant::now();
        let parsed = SymFile::parse(key.debug_id(), &bytes);
        metric!(timer("symbolicate.parse_sym_file.parse") = started.elapsed());

        let sym = match parsed {
            Ok(sym) => sym,
            Err(error) => {
                metric!(
                    counter("symbolicate.parse_sym_file.error") += 1,
                    "reason" => error.kind().reason()
                );
                // A mismatched debug id will never parse differently, so it
                // is recorded like an upstream miss. Other parse errors are
                // not cached at all.
                return if error.kind().is_permanent() {
                    tracing::warn!(module = %key, %error, "permanently unusable symbol file");
                    Ok(BuildOutcome::Missing)
                } else {
                    Err(BuildError::Malformed(error.to_string()))
                };
            }
        };

        let mut converter = SymCacheConverter::new();
        converter.process_symfile(&sym);

        let mut buffer = Vec::new();
        converter
            .serialize(&mut buffer)
            .map_err(|error| BuildError::Io(error.to_string()))?;
        Ok(BuildOutcome::Symcache(buffer))
    });

    task.await.unwrap_or(Err(BuildError::Canceled))
}

/// Resolves one frame against the fetched symcaches.
fn symbolicate_frame(frame: &FrameRequest, caches: &[Option<SymCache<'_>>]) -> SymbolicatedFrame {
    let mut resolved = SymbolicatedFrame {
        module_index: frame.module_index,
        offset: frame.offset,
        ..Default::default()
    };

    let cache = match frame.module_index.and_then(|index| caches.get(index)) {
        Some(Some(cache)) => cache,
        _ => return resolved,
    };

    let locations: Vec<_> = cache.lookup(frame.offset).collect();
    let Some(outermost) = locations.last() else {
        // Offset outside all known ranges: keep the raw module + offset.
        return resolved;
    };

    resolved.function = outermost.function_name().map(str::to_owned);
    resolved.function_offset = outermost
        .function_entry()
        .and_then(|entry| frame.offset.checked_sub(entry as u64));
    resolved.file = outermost.file().map(str::to_owned);
    resolved.line = outermost.line();
    resolved.inlines = locations[..locations.len() - 1]
        .iter()
        .map(|location| InlineFrame {
            function: location.function_name().unwrap_or("<unknown>").to_owned(),
            file: location.file().map(str::to_owned),
            line: location.line(),
        })
        .collect();

    resolved
}
