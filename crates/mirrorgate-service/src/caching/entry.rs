use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;

use super::CacheError;

/// The result of a [`FileCache::get`](super::FileCache::get).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The file contents, or `None` if the file does not exist or cannot be read.
    Ready(Option<Bytes>),
    /// A background load is responsible for this file. Ask again later.
    Pending,
    /// The file cannot be served from the cache.
    Failed(CacheError),
}

/// A lifecycle summary of a [`CacheEntry`], mostly useful for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Created, but the first load has not completed yet.
    Loading,
    /// Loaded before, and currently being revalidated.
    Revalidating,
    /// The file contents are cached and within the check interval.
    Fresh,
    /// The check interval elapsed; the next lookup schedules a revalidation.
    Stale,
    /// The file did not exist when it was last checked.
    NotFound,
    /// The file could not be cached.
    Error,
}

/// Everything the cache knows about one file.
#[derive(Debug, Clone)]
pub(super) struct CacheEntry {
    /// The cached contents. `None` if the file is missing or not loaded.
    pub data: Option<Bytes>,
    /// When the file was last compared against the file system.
    pub last_check: Option<Instant>,
    /// When the entry was last looked up.
    pub last_access: Instant,
    /// The modification time of the file when it was read.
    pub modified: Option<SystemTime>,
    pub error: Option<CacheError>,
    /// Whether a background load owns this entry. Such entries are never evicted.
    pub in_flight: bool,
}

impl CacheEntry {
    /// A new entry, already owned by a background load.
    pub fn loading(now: Instant) -> Self {
        Self {
            data: None,
            last_check: None,
            last_access: now,
            modified: None,
            error: None,
            in_flight: true,
        }
    }

    /// The number of cached bytes.
    pub fn size(&self) -> u64 {
        self.data.as_ref().map_or(0, |data| data.len() as u64)
    }

    /// Whether the entry needs to be compared against the file system again.
    pub fn is_due(&self, now: Instant, check_interval: Duration) -> bool {
        match self.last_check {
            Some(checked) => now.saturating_duration_since(checked) >= check_interval,
            None => true,
        }
    }

    /// Time since the entry was last looked up.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }

    /// Whether the cached contents still correspond to a file with this metadata.
    pub fn is_current(&self, modified: Option<SystemTime>, size: u64) -> bool {
        match &self.data {
            Some(data) => self.modified == modified && data.len() as u64 == size,
            None => false,
        }
    }

    pub fn state(&self, now: Instant, check_interval: Duration) -> EntryState {
        if self.in_flight {
            return match self.last_check {
                None => EntryState::Loading,
                Some(_) => EntryState::Revalidating,
            };
        }
        if self.is_due(now, check_interval) {
            EntryState::Stale
        } else if self.error.is_some() {
            EntryState::Error
        } else if self.data.is_none() {
            EntryState::NotFound
        } else {
            EntryState::Fresh
        }
    }
}

/// A request for the background worker to (re)load a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadRequest {
    pub path: PathBuf,
    /// The cache generation the entry was created in. A cleared cache starts a new one.
    pub epoch: u64,
}

/// What a background load found out about a file.
#[derive(Debug)]
pub(super) enum LoadOutcome {
    /// The file does not exist or cannot be read.
    Missing,
    /// The file is unchanged since it was last read.
    Unchanged,
    /// The file was (re)read.
    Loaded {
        data: Bytes,
        modified: Option<SystemTime>,
    },
    /// The file cannot be cached.
    Failed(CacheError),
}

impl LoadOutcome {
    /// Applies this outcome to the entry and releases it.
    pub fn apply(self, entry: &mut CacheEntry, now: Instant) {
        entry.last_check = Some(now);
        entry.in_flight = false;

        match self {
            LoadOutcome::Missing => {
                entry.data = None;
                entry.modified = None;
                entry.error = None;
            }
            LoadOutcome::Unchanged => {
                entry.error = None;
            }
            LoadOutcome::Loaded { data, modified } => {
                entry.data = Some(data);
                entry.modified = modified;
                entry.error = None;
            }
            LoadOutcome::Failed(error) => {
                entry.data = None;
                entry.modified = None;
                entry.error = Some(error);
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoadOutcome::Missing => "missing",
            LoadOutcome::Unchanged => "unchanged",
            LoadOutcome::Loaded { .. } => "loaded",
            LoadOutcome::Failed(_) => "failed",
        }
    }
}
