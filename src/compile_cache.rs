//! Shared, add-only store of compiled kernels.
//!
//! [`CompileCache::get_or_compile`] returns the compiled artifact for a kernel,
//! compiling it at most once. Two levels cooperate:
//!
//! - **In process**: one slot per signature. The first caller compiles while holding
//!   the slot; concurrent callers wait on it and receive the same [`Arc`].
//! - **On disk** (when a location is configured): a content-addressed directory shared
//!   by independently started workers. Workers never take a lock; they coordinate by
//!   an existence check followed by compile-or-wait:
//!   1. `<hash>.artifact` exists: load it (its checksum is verified)
//!   2. `<hash>.failed` exists: the kernel does not compile; fail fast
//!   3. otherwise claim `<hash>.pending` with create-new semantics; the claimant
//!      compiles, writes a temp file and renames it into place, then drops the claim
//!   4. a claim older than the stale timeout is taken over (its owner died): it is
//!      renamed to a unique tombstone, so only one worker gets to re-claim it
//!
//! A claimant touches its claim every quarter of the stale timeout while compiling,
//! so a slow compile is not mistaken for a dead one.
//!
//! Entries are write-once and never invalidated.

use crate::error::{EngineError, Result};
use crate::kernel::{CompiledKernel, KernelCompiler, KernelSource, hex};
use crate::merge::panic_message;
use crossbeam::channel::{Receiver, RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{OpenOptions, create_dir_all, hard_link, read, read_to_string, remove_file, rename};
use std::io::{ErrorKind, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{scope, sleep};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Timing knobs of the on-disk protocol.
#[derive(Clone, Copy, Debug)]
pub struct CacheTimeouts {
    /// Interval between existence checks while another worker compiles.
    pub poll_interval: Duration,
    /// Age after which a pending claim is presumed abandoned.
    pub stale_after: Duration,
    /// Give up waiting for another worker's compile after this long.
    pub wait_limit: Duration,
}

impl Default for CacheTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            stale_after: Duration::from_secs(120),
            wait_limit: Duration::from_secs(600),
        }
    }
}

/// Hit/miss counters of one cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from the in-process slot.
    pub hits: u64,
    /// Resolved from disk or by compiling.
    pub misses: u64,
    /// Compilations performed by this instance.
    pub compilations: u64,
    /// Artifacts loaded from disk that another worker published.
    pub disk_loads: u64,
}

#[derive(Clone)]
enum SlotState {
    Ready(Arc<CompiledKernel>),
    Failed(String),
}

type Slot = Arc<Mutex<Option<SlotState>>>;

/// On-disk artifact format.
#[derive(Serialize, Deserialize)]
struct ArtifactRecord {
    signature: String,
    created_ms: u64,
    /// SHA-256 of `payload`, hex.
    checksum: String,
    /// Postcard-encoded [`CompiledKernel`].
    payload: Vec<u8>,
}

/// The compile cache. Share it across threads with an [`Arc`].
pub struct CompileCache {
    compiler: Arc<dyn KernelCompiler>,
    location: Option<PathBuf>,
    timeouts: CacheTimeouts,
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    disk_loads: AtomicU64,
}

impl CompileCache {
    /// A process-local cache.
    #[must_use]
    pub fn new(compiler: Arc<dyn KernelCompiler>) -> Self {
        Self {
            compiler,
            location: None,
            timeouts: CacheTimeouts::default(),
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            disk_loads: AtomicU64::new(0),
        }
    }

    /// A cache backed by the shared directory `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn with_location(compiler: Arc<dyn KernelCompiler>, location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        create_dir_all(&location)?;
        Ok(Self {
            location: Some(location),
            ..Self::new(compiler)
        })
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: CacheTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            disk_loads: self.disk_loads.load(Ordering::Relaxed),
        }
    }

    /// Signature under which `source` is stored.
    #[must_use]
    pub fn signature(&self, source: &KernelSource) -> String {
        source.signature(self.compiler.id())
    }

    /// The compiled artifact for `source`, compiling it if no worker has yet.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Compile`] if the kernel does not compile (cached; every later
    ///   caller gets the same error without recompiling)
    /// - [`EngineError::Io`] / [`EngineError::Serialization`] if the shared store is
    ///   unreadable or holds a corrupt artifact
    /// - [`EngineError::Worker`] if another worker's compile did not finish in time
    pub fn get_or_compile(&self, source: &KernelSource) -> Result<Arc<CompiledKernel>> {
        let signature = self.signature(source);
        let slot = self.slot(&signature);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ready) = state.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(kernel = %source.name, %signature, "compile cache hit");
            return resolve(ready, source, &signature);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let resolved = match &self.location {
            None => self.compile(source, &signature),
            Some(dir) => self.resolve_shared(dir, source, &signature)?,
        };
        let out = resolve(&resolved, source, &signature);
        *state = Some(resolved);
        out
    }

    fn slot(&self, signature: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(signature.to_string()).or_default())
    }

    fn compile(&self, source: &KernelSource, signature: &str) -> SlotState {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let compiled = catch_unwind(AssertUnwindSafe(|| self.compiler.compile(source)))
            .unwrap_or_else(|panic| Err(format!("compiler panicked: {}", panic_message(&*panic))));
        match compiled {
            Ok(program) => {
                info!(
                    kernel = %source.name,
                    %signature,
                    elapsed_ms = started.elapsed().as_millis(),
                    "compiled kernel"
                );
                SlotState::Ready(Arc::new(CompiledKernel {
                    name: source.name.clone(),
                    signature: signature.to_string(),
                    program,
                }))
            }
            Err(message) => {
                warn!(kernel = %source.name, %signature, %message, "kernel failed to compile");
                SlotState::Failed(message)
            }
        }
    }

    fn resolve_shared(&self, dir: &Path, source: &KernelSource, signature: &str) -> Result<SlotState> {
        let artifact = dir.join(format!("{signature}.artifact"));
        let failed = dir.join(format!("{signature}.failed"));
        let pending = dir.join(format!("{signature}.pending"));
        let deadline = Instant::now() + self.timeouts.wait_limit;

        loop {
            if artifact.exists() {
                self.disk_loads.fetch_add(1, Ordering::Relaxed);
                return load_artifact(&artifact, signature).map(|k| SlotState::Ready(Arc::new(k)));
            }
            if failed.exists() {
                return Ok(SlotState::Failed(read_to_string(&failed)?));
            }
            match OpenOptions::new().write(true).create_new(true).open(&pending) {
                Ok(mut claim) => {
                    writeln!(claim, "pid={} at={}", std::process::id(), current_timestamp_ms())?;
                    drop(claim);
                    let renew_every = (self.timeouts.stale_after / 4).max(Duration::from_millis(1));
                    let outcome = scope(|scope| {
                        let (stop, stopped) = bounded::<()>(0);
                        let claim = pending.as_path();
                        scope.spawn(move || renew_claim(claim, renew_every, &stopped));
                        let outcome = self.compile_and_publish(dir, &artifact, &failed, source, signature);
                        drop(stop);
                        outcome
                    });
                    remove_file(&pending).ok();
                    return outcome;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if claim_is_stale(&pending, self.timeouts.stale_after) {
                        take_over_stale_claim(dir, &pending, self.timeouts.stale_after, signature)?;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(EngineError::Worker(format!(
                            "timed out waiting for another worker to compile '{}'",
                            source.name
                        )));
                    }
                    sleep(self.timeouts.poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn compile_and_publish(
        &self,
        dir: &Path,
        artifact: &Path,
        failed: &Path,
        source: &KernelSource,
        signature: &str,
    ) -> Result<SlotState> {
        // Another worker may have published between our existence check and the claim.
        if artifact.exists() {
            self.disk_loads.fetch_add(1, Ordering::Relaxed);
            return load_artifact(artifact, signature).map(|k| SlotState::Ready(Arc::new(k)));
        }
        let state = self.compile(source, signature);
        match &state {
            SlotState::Ready(kernel) => {
                let payload = postcard::to_allocvec(kernel.as_ref())?;
                let record = ArtifactRecord {
                    signature: signature.to_string(),
                    created_ms: current_timestamp_ms(),
                    checksum: compute_checksum(&payload),
                    payload,
                };
                publish(dir, artifact, &postcard::to_allocvec(&record)?)?;
            }
            SlotState::Failed(message) => publish(dir, failed, message.as_bytes())?,
        }
        Ok(state)
    }
}

fn resolve(state: &SlotState, source: &KernelSource, signature: &str) -> Result<Arc<CompiledKernel>> {
    match state {
        SlotState::Ready(kernel) => Ok(Arc::clone(kernel)),
        SlotState::Failed(message) => Err(EngineError::Compile {
            kernel: source.name.clone(),
            signature: signature.to_string(),
            message: message.clone(),
        }),
    }
}

/// Write `bytes` to a temp file in `dir` and rename it to `target`.
fn publish(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

fn load_artifact(path: &Path, signature: &str) -> Result<CompiledKernel> {
    let bytes = read(path)?;
    let record: ArtifactRecord = postcard::from_bytes(&bytes)?;
    if record.signature != signature || compute_checksum(&record.payload) != record.checksum {
        return Err(EngineError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("compile cache artifact {} failed its integrity check", path.display()),
        )));
    }
    Ok(postcard::from_bytes(&record.payload)?)
}

/// Move a stale claim out of the way so that one worker can re-claim it.
///
/// Only one of several racing workers can rename the claim. A worker that judged the
/// claim stale just before someone else re-claimed it may rename the new, live claim;
/// it notices the fresh timestamp and puts the claim back.
fn take_over_stale_claim(dir: &Path, pending: &Path, stale_after: Duration, signature: &str) -> Result<()> {
    // Removed again when dropped.
    let tombstone = NamedTempFile::new_in(dir)?.into_temp_path();
    match rename(pending, &tombstone) {
        Ok(()) if claim_is_stale(&tombstone, stale_after) => {
            warn!(%signature, "took over stale compile claim");
        }
        Ok(()) => {
            debug!(%signature, "compile claim was renewed meanwhile; restoring it");
            hard_link(&tombstone, pending).ok();
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Touch `claim` every `interval` until the sending side of `stop` is dropped.
fn renew_claim(claim: &Path, interval: Duration, stop: &Receiver<()>) {
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        let touched = OpenOptions::new()
            .write(true)
            .open(claim)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            debug!(claim = %claim.display(), error = %e, "cannot renew compile claim");
        }
    }
}

fn claim_is_stale(pending: &Path, stale_after: Duration) -> bool {
    pending
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// SHA-256 of `data`, hex.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// Current time in milliseconds since the epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
