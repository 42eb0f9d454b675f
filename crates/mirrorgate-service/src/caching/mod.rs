//! # The mirrorgate file cache
//!
//! Files served by this server are held in memory by the [`FileCache`]. The cache never blocks
//! a request on file system access. Instead, a lookup of a file that is unknown, or that is due
//! for a revalidation, returns [`CacheLookup::Pending`] and queues a [`LoadRequest`] for the
//! background worker. The caller is expected to ask again once the worker is done, which it can
//! wait for using [`FileCache::notified`].
//!
//! ## Entries
//!
//! Every looked up path gets an entry, which remembers the file contents, its modification time
//! and when it was last checked and looked up. An entry is marked as *in flight* while a load
//! for it is queued or running. Only one load per entry can be in flight, and in-flight entries
//! are neither evicted nor expired.
//!
//! The background worker distinguishes these outcomes of a load:
//!
//! - The file is missing or unreadable: the entry resolves to "no content", which is not an
//!   error and turns into a 404.
//! - The file exceeds `max_file_size`: the entry records [`CacheError::FileTooLarge`].
//! - The file is unchanged (same modification time and size): only the check time is updated.
//! - The file changed: the cache is [trimmed](FileCache::trim) to make room for it, and the
//!   file is read. If no room can be made, the entry records [`CacheError::CacheFull`].
//!
//! Errors are reported to callers until the entry is due for its next check, so an entry heals
//! itself once the underlying problem goes away.
//!
//! ## Eviction
//!
//! Entries that have not been looked up for `max_ttl` are removed by the worker, which checks
//! for those at least once a second. Entries are also evicted in least recently used order
//! when a new file would not fit into `max_total_size`, but never within `min_ttl` of their
//! last lookup.
//!
//! ## Metrics
//!
//! - `cache.lookup`: All lookups, tagged with `result`.
//! - `cache.load`: Completed background loads, tagged with `outcome`.
//! - `cache.evicted`: Entries evicted to make room for another file.
//! - `cache.expired`: Entries removed because they were unused for `max_ttl`.
//! - `cache.size`: A gauge of the cached bytes, sent after each load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::futures::Notified;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FileCacheConfig;

mod cache_error;
mod entry;
mod worker;


pub use cache_error::CacheError;
pub use entry::{CacheLookup, EntryState};

use entry::{CacheEntry, LoadOutcome, LoadRequest};

/// The map of entries and its generation.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    /// Incremented by every [`FileCache::clear`].
    epoch: u64,
}

impl CacheState {
    fn total_size(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

/// The state shared between the [`FileCache`] handle and its background worker.
#[derive(Debug)]
struct Shared {
    state: Mutex<CacheState>,
    settings: Mutex<FileCacheConfig>,
    queue: mpsc::UnboundedSender<LoadRequest>,
    /// Woken after every completed load and after the cache was cleared.
    loaded: Notify,
}

impl Shared {
    fn settings(&self) -> FileCacheConfig {
        *self.settings.lock().unwrap()
    }

    fn enqueue(&self, path: &Path, epoch: u64) {
        let request = LoadRequest {
            path: path.to_owned(),
            epoch,
        };
        if self.queue.send(request).is_err() {
            tracing::error!(path = %path.display(), "File cache worker is not running");
        }
    }

    fn get(&self, path: &Path, now: Instant) -> CacheLookup {
        let check_interval = self.settings().check_interval;
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(path) else {
            state
                .entries
                .insert(path.to_owned(), CacheEntry::loading(now));
            self.enqueue(path, state.epoch);
            metric!(counter("cache.lookup") += 1, "result" => "new");
            return CacheLookup::Pending;
        };

        entry.last_access = now;

        if entry.in_flight {
            metric!(counter("cache.lookup") += 1, "result" => "pending");
            return CacheLookup::Pending;
        }

        if entry.is_due(now, check_interval) {
            entry.in_flight = true;
            self.enqueue(path, state.epoch);
            metric!(counter("cache.lookup") += 1, "result" => "recheck");
            return CacheLookup::Pending;
        }

        if let Some(ref error) = entry.error {
            metric!(counter("cache.lookup") += 1, "result" => "error");
            return CacheLookup::Failed(error.clone());
        }

        metric!(counter("cache.lookup") += 1, "result" => "hit");
        CacheLookup::Ready(entry.data.clone())
    }

    fn trim(&self, padding: u64, budget: u64, exclude: &[&Path], now: Instant) -> bool {
        let min_ttl = self.settings().min_ttl;
        let mut state = self.state.lock().unwrap();

        // Most recently used first, so that the least recently used entries overflow.
        let mut candidates: Vec<_> = state
            .entries
            .iter()
            .filter(|(path, _)| !exclude.contains(&path.as_path()))
            .collect();
        candidates.sort_by(|(_, a), (_, b)| b.last_access.cmp(&a.last_access));

        let mut total = padding;
        let mut evicted = Vec::new();
        for (path, entry) in candidates {
            let size = entry.size();
            total += size;

            if entry.in_flight || entry.idle(now) <= min_ttl {
                continue;
            }

            if size > 0 && total > budget {
                total -= size;
                evicted.push(path.clone());
            }
        }

        for path in &evicted {
            tracing::debug!(path = %path.display(), "Evicting cached file");
            state.entries.remove(path);
        }
        if !evicted.is_empty() {
            metric!(counter("cache.evicted") += evicted.len() as i64);
        }

        total <= budget
    }

    fn expire(&self, now: Instant) -> usize {
        let max_ttl = self.settings().max_ttl;
        let mut state = self.state.lock().unwrap();

        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.in_flight || entry.idle(now) < max_ttl);
        let expired = before - state.entries.len();

        if expired > 0 {
            tracing::debug!(expired, "Expired unused cache entries");
            metric!(counter("cache.expired") += expired as i64);
        }
        expired
    }

    /// Stores the result of a background load.
    ///
    /// This is a no-op if the entry was removed in the meantime, e.g. by [`FileCache::clear`].
    fn finish(&self, request: &LoadRequest, outcome: LoadOutcome, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.epoch != request.epoch {
            return;
        }

        metric!(counter("cache.load") += 1, "outcome" => outcome.name());
        if let Some(entry) = state.entries.get_mut(&request.path) {
            outcome.apply(entry, now);
        }
        metric!(gauge("cache.size") = state.total_size());
    }
}

/// Handle to the background worker of a [`FileCache`].
#[derive(Debug)]
struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An in-memory cache of files, populated by a background worker.
///
/// See the [module level documentation](self) for details.
#[derive(Debug)]
pub struct FileCache {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl FileCache {
    fn with_queue(config: FileCacheConfig) -> (Self, mpsc::UnboundedReceiver<LoadRequest>) {
        let (queue, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::default(),
            settings: Mutex::new(config),
            queue,
            loaded: Notify::new(),
        });

        let cache = Self {
            shared,
            worker: Mutex::new(None),
        };
        (cache, requests)
    }

    /// Creates the cache and spawns its background worker on `runtime`.
    pub fn start(config: FileCacheConfig, runtime: &tokio::runtime::Handle) -> Self {
        let (cache, requests) = Self::with_queue(config);

        let cancel = CancellationToken::new();
        let task = runtime.spawn(worker::run(
            Arc::clone(&cache.shared),
            requests,
            cancel.clone(),
        ));
        *cache.worker.lock().unwrap() = Some(WorkerHandle { cancel, task });

        cache
    }

    /// Creates the cache without a worker, handing out the queue of load requests instead.
    #[cfg(test)]
    fn unstarted(config: FileCacheConfig) -> (Self, mpsc::UnboundedReceiver<LoadRequest>) {
        Self::with_queue(config)
    }

    /// Looks up the file at `path`.
    ///
    /// This never touches the file system. Unknown files, and files that are due for a check,
    /// are queued for the background worker and return [`CacheLookup::Pending`].
    pub fn get(&self, path: &Path) -> CacheLookup {
        self.shared.get(path, Instant::now())
    }

    /// Waits for the next completed load, or for the cache to be cleared.
    ///
    /// The returned future receives wakeups from the moment it is created, so create it before
    /// calling [`get`](Self::get) to not miss a load that finishes in between.
    pub fn notified(&self) -> Notified<'_> {
        self.shared.loaded.notified()
    }

    /// Evicts entries until `padding` more bytes fit into `budget`.
    ///
    /// Entries in `exclude`, in-flight entries, and entries looked up within `min_ttl` are never
    /// evicted. Returns whether the cache, plus `padding`, fits into `budget` afterwards.
    pub fn trim(&self, padding: u64, budget: u64, exclude: &[&Path]) -> bool {
        self.shared.trim(padding, budget, exclude, Instant::now())
    }

    /// Removes all entries, including in-flight ones.
    pub fn clear(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.entries = HashMap::new();
            state.epoch += 1;
        }
        tracing::info!("File cache cleared");
        self.shared.loaded.notify_waiters();
    }

    /// Replaces the cache settings. They apply to the next lookup or load.
    pub fn configure(&self, config: FileCacheConfig) {
        *self.shared.settings.lock().unwrap() = config;
    }

    pub fn settings(&self) -> FileCacheConfig {
        self.shared.settings()
    }

    /// The lifecycle state of the entry for `path`, if there is one.
    pub fn state(&self, path: &Path) -> Option<EntryState> {
        let check_interval = self.shared.settings().check_interval;
        let state = self.shared.state.lock().unwrap();
        state
            .entries
            .get(path)
            .map(|entry| entry.state(Instant::now(), check_interval))
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of cached bytes.
    pub fn total_size(&self) -> u64 {
        self.shared.state.lock().unwrap().total_size()
    }

    /// Stops the background worker and waits for it to exit.
    ///
    /// A load that is running completes first, queued loads are dropped.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(WorkerHandle { cancel, task }) = worker {
            cancel.cancel();
            if let Err(error) = task.await {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, "File cache worker failed");
            }
        }
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        if let Ok(worker) = self.worker.get_mut() {
            if let Some(worker) = worker.as_ref() {
                worker.cancel.cancel();
            }
        }
    }
}
