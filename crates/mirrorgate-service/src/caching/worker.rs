use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CacheError, LoadOutcome, LoadRequest, Shared};

/// How often unused entries are expired.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Processes load requests one at a time until `cancel` fires or the cache is dropped.
pub(super) async fn run(
    shared: Arc<Shared>,
    mut requests: mpsc::UnboundedReceiver<LoadRequest>,
    cancel: CancellationToken,
) {
    tracing::debug!("File cache worker started");
    let mut next_sweep = tokio::time::Instant::now() + SWEEP_INTERVAL;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(next_sweep) => {}
            request = requests.recv() => match request {
                Some(request) => load(&shared, request).await,
                None => break,
            },
        }

        let now = tokio::time::Instant::now();
        if now >= next_sweep {
            shared.expire(Instant::now());
            next_sweep = now + SWEEP_INTERVAL;
        }
    }

    tracing::debug!("File cache worker stopped");
}

/// Loads a single file and stores the outcome in its entry.
///
/// Requests queued before the cache was cleared are dropped without touching the new entries.
pub(super) async fn load(shared: &Shared, request: LoadRequest) {
    let Some(outcome) = fetch(shared, &request).await else {
        tracing::trace!(path = %request.path.display(), "Dropped load queued before clear");
        return;
    };
    tracing::trace!(
        path = %request.path.display(),
        outcome = outcome.name(),
        "Finished file load",
    );

    shared.finish(&request, outcome, Instant::now());
    shared.loaded.notify_waiters();
}

/// Returns `None` if the cache was cleared since the request was queued.
async fn fetch(shared: &Shared, request: &LoadRequest) -> Option<LoadOutcome> {
    if is_stale(shared, request) {
        return None;
    }

    let path = request.path.as_path();
    let settings = shared.settings();

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Some(LoadOutcome::Missing),
        Err(error) => {
            tracing::trace!(path = %path.display(), %error, "File not accessible");
            return Some(LoadOutcome::Missing);
        }
    };

    let size = metadata.len();
    let modified = metadata.modified().ok();

    if size > settings.max_file_size {
        return Some(LoadOutcome::Failed(CacheError::FileTooLarge(size)));
    }

    if is_current(shared, request, modified, size) {
        return Some(LoadOutcome::Unchanged);
    }

    // The stat above may have raced with a clear.
    if is_stale(shared, request) {
        return None;
    }

    if !shared.trim(size, settings.max_total_size, &[path], Instant::now()) {
        tracing::debug!(path = %path.display(), size, "No room in file cache");
        return Some(LoadOutcome::Failed(CacheError::CacheFull));
    }

    let outcome = match read(path).await {
        Some(data) => LoadOutcome::Loaded { data, modified },
        None => LoadOutcome::Missing,
    };
    Some(outcome)
}

fn is_stale(shared: &Shared, request: &LoadRequest) -> bool {
    shared.state.lock().unwrap().epoch != request.epoch
}

fn is_current(
    shared: &Shared,
    request: &LoadRequest,
    modified: Option<std::time::SystemTime>,
    size: u64,
) -> bool {
    let state = shared.state.lock().unwrap();
    state.epoch == request.epoch
        && state
            .entries
            .get(&request.path)
            .is_some_and(|entry| entry.is_current(modified, size))
}

async fn read(path: &Path) -> Option<Bytes> {
    match tokio::fs::read(path).await {
        Ok(data) => Some(Bytes::from(data)),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "Failed to read file");
            None
        }
    }
}
