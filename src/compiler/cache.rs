//! Artifact cache keyed by (source hash, compiler setting).
//!
//! Two tiers: an in-memory map shared by every compile step of the process,
//! and an optional durable store on disk shared across runs and processes.
//! A key is compiled at most once per process; concurrent requests for a key
//! that is already being compiled wait for that compilation instead of
//! starting their own.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::compiler::CompilationArtifact;
use crate::core::Hash32;
use crate::error::CompileError;

/// Bumped whenever the encoding of [`CacheFile`] changes.
const FORMAT: u32 = 1;

pub(crate) type Artifacts = Arc<[CompilationArtifact]>;

/// Where a cache lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The external compiler was invoked.
    Compiled,
    /// Found in memory.
    Memory,
    /// Loaded from the durable store.
    Disk,
    /// Another caller was compiling the same key; its result was reused.
    Shared,
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        self != CacheStatus::Compiled
    }
}

enum Flight {
    Running,
    Done(Result<Artifacts, CompileError>),
    /// The leader panicked. Waiters start over.
    Abandoned,
}

struct InFlight {
    state: Mutex<Flight>,
    ready: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            state: Mutex::new(Flight::Running),
            ready: Condvar::new(),
        }
    }

    fn finish(&self, flight: Flight) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = flight;
        self.ready.notify_all();
    }

    /// Blocks until the leader is done. `None` means it gave up.
    fn wait(&self) -> Option<Result<Artifacts, CompileError>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                Flight::Running => state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Flight::Done(result) => return Some(result.clone()),
                Flight::Abandoned => return None,
            }
        }
    }
}

enum Slot {
    Ready(Artifacts),
    Pending(Arc<InFlight>),
}

enum Role {
    Leader(Arc<InFlight>),
    Follower(Arc<InFlight>),
}

/// Completes a flight when the leader returns or unwinds.
struct LeaderGuard<'a> {
    cache: &'a ArtifactCache,
    key: Hash32,
    flight: Arc<InFlight>,
    done: bool,
}

impl LeaderGuard<'_> {
    fn complete(mut self, result: &Result<Artifacts, CompileError>) {
        {
            let mut slots = self.cache.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok(artifacts) => {
                    slots.insert(self.key, Slot::Ready(artifacts.clone()));
                }
                // Failures are not cached, the next request tries again.
                Err(_) => {
                    slots.remove(&self.key);
                }
            }
        }

        self.flight.finish(Flight::Done(result.clone()));
        self.done = true;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.cache
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.key);
            self.flight.finish(Flight::Abandoned);
        }
    }
}

pub struct ArtifactCache {
    slots: Mutex<HashMap<Hash32, Slot>>,
    disk: Option<DiskStore>,
}

impl ArtifactCache {
    /// A cache that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            disk: None,
        }
    }

    /// A cache backed by `<dir>/artifacts`.
    pub fn durable(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            disk: Some(DiskStore::new(dir.as_ref().join("artifacts"))),
        }
    }

    pub fn disk(&self) -> Option<&DiskStore> {
        self.disk.as_ref()
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the artifacts for `key`, running `compile` only if no tier
    /// has them and nobody else is compiling them right now.
    pub(crate) fn get_or_compile<F>(
        &self,
        key: Hash32,
        compile: F,
    ) -> Result<(Artifacts, CacheStatus), CompileError>
    where
        F: FnOnce() -> Result<Vec<CompilationArtifact>, CompileError>,
    {
        let mut compile = Some(compile);

        loop {
            let role = {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                match slots.get(&key) {
                    Some(Slot::Ready(artifacts)) => {
                        return Ok((artifacts.clone(), CacheStatus::Memory));
                    }
                    Some(Slot::Pending(flight)) => Role::Follower(flight.clone()),
                    None => {
                        let flight = Arc::new(InFlight::new());
                        slots.insert(key, Slot::Pending(flight.clone()));
                        Role::Leader(flight)
                    }
                }
            };

            match role {
                Role::Follower(flight) => match flight.wait() {
                    Some(result) => return result.map(|a| (a, CacheStatus::Shared)),
                    None => continue,
                },
                Role::Leader(flight) => {
                    let guard = LeaderGuard {
                        cache: self,
                        key,
                        flight,
                        done: false,
                    };

                    // A leader runs at most once per call, so the closure is
                    // still present.
                    let Some(compile) = compile.take() else {
                        unreachable!("leader elected twice for one request")
                    };

                    let result = self.fill(key, compile);
                    guard.complete(&result.as_ref().map(|(a, _)| a.clone()).map_err(Clone::clone));
                    return result;
                }
            }
        }
    }

    fn fill<F>(&self, key: Hash32, compile: F) -> Result<(Artifacts, CacheStatus), CompileError>
    where
        F: FnOnce() -> Result<Vec<CompilationArtifact>, CompileError>,
    {
        if let Some(artifacts) = self.disk.as_ref().and_then(|disk| disk.load(key)) {
            tracing::debug!(%key, "artifact cache hit on disk");
            return Ok((artifacts, CacheStatus::Disk));
        }

        let artifacts: Artifacts = compile()?.into();

        if let Some(disk) = &self.disk
            && let Err(e) = disk.store(key, &artifacts)
        {
            tracing::warn!(%key, error = %e, "couldn't persist artifacts");
        }

        Ok((artifacts, CacheStatus::Compiled))
    }
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    format: u32,
    key: Hash32,
    artifacts: &'a [CompilationArtifact],
}

#[derive(Deserialize)]
struct CacheFile {
    format: u32,
    key: Hash32,
    artifacts: Vec<CompilationArtifact>,
}

/// Durable key to artifacts store, one CBOR file per key.
///
/// Entries are written to a temporary file in the same directory and then
/// renamed into place, so readers in this or another process only ever see
/// complete entries.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: Utf8PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, key: Hash32) -> Utf8PathBuf {
        self.dir.join(key.to_hex()).with_extension("cbor")
    }

    /// Reads an entry. Missing, unreadable, or foreign-format entries are
    /// misses.
    pub(crate) fn load(&self, key: Hash32) -> Option<Artifacts> {
        let path = self.path(key);
        let file = File::open(&path).ok()?;

        match ciborium::from_reader::<CacheFile, _>(BufReader::new(file)) {
            Ok(entry) if entry.format == FORMAT && entry.key == key => Some(entry.artifacts.into()),
            Ok(_) => {
                tracing::debug!(%path, "ignoring cache entry with foreign format");
                None
            }
            Err(e) => {
                tracing::debug!(%path, error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    pub(crate) fn store(&self, key: Hash32, artifacts: &[CompilationArtifact]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let entry = CacheFileRef {
            format: FORMAT,
            key,
            artifacts,
        };

        let temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            ciborium::into_writer(&entry, &mut writer).map_err(std::io::Error::other)?;
            std::io::Write::flush(&mut writer)?;
        }

        temp.persist(self.path(key)).map_err(|e| e.error)?;
        Ok(())
    }
}
