//! Decides how to answer a file request.
//!
//! A request is either served from the [`FileCache`], or redirected to a mirror picked by the
//! [`RedirectTable`]. If the cache cannot hold the file, the request is resolved again with the
//! local target excluded, so that it ends up at a mirror instead.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::caching::{CacheError, CacheLookup, FileCache};
use crate::config::Config;
use crate::redirect::{Destination, RedirectTable};

/// How long a request waits for a pending load before it looks again.
const PENDING_RETRY: Duration = Duration::from_millis(100);

/// Whether `path` is safe to resolve, which means it does not traverse to a parent directory.
///
/// Both the raw path and its percent-decoded form are checked.
pub fn path_check(path: &str) -> bool {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    [path, decoded.as_ref()]
        .iter()
        .all(|path| !path.contains("../") && !path.contains("..\\"))
}

/// The final decision for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Respond with `404 Not Found`.
    NotFound,
    /// No redirect rule had a destination for the path.
    NoDestination,
    /// Redirect the client to the given URL.
    Redirect(String),
    /// Send the file contents as a download.
    File { name: String, data: Bytes },
}

/// An [`Outcome`] together with the notes collected while resolving it.
///
/// The notes end up in the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub outcome: Outcome,
    pub annotations: Vec<String>,
}

/// Resolves the request for `path` against the redirect table and the cache.
///
/// `path` is the raw request path. Rules match against it and redirects append it unchanged.
pub async fn serve(config: &Config, table: &RedirectTable, cache: &FileCache, path: &str) -> Served {
    let mut annotations = Vec::new();

    if !path_check(path) {
        tracing::debug!(path, "Rejected path");
        return Served {
            outcome: Outcome::NotFound,
            annotations,
        };
    }

    let mut disable_self_host = false;
    let outcome = loop {
        match table.resolve(path, disable_self_host) {
            None => {
                tracing::error!(path, "No redirect destination");
                annotations.push(format!("[ERROR] no redirect destination ({path})"));
                break Outcome::NoDestination;
            }
            Some(Destination::Remote(base_url)) => {
                let url = format!("{}{path}", base_url.trim_end_matches('/'));
                annotations.push(format!("[INFO] redirect to: {url}"));
                break Outcome::Redirect(url);
            }
            Some(Destination::Local) => {}
        }

        match load(cache, &config.local_path(path)).await {
            Ok(Some(data)) => {
                break Outcome::File {
                    name: file_name(path),
                    data,
                };
            }
            Ok(None) => break Outcome::NotFound,
            Err(error) => {
                tracing::debug!(path, %error, "Cannot serve file locally");
                metric!(counter("serving.cache_error") += 1, "kind" => error.kind());
                annotations.push(format!("[WARN] cache error [{error}] ({path})"));
                // The second resolution can only pick a mirror, so this loops at most twice.
                disable_self_host = true;
            }
        }
    };

    Served {
        outcome,
        annotations,
    }
}

/// Looks up a file in the cache, waiting for the background worker as long as it is pending.
///
/// If the calling future is dropped, the wait is abandoned. The load itself still completes.
async fn load(cache: &FileCache, path: &Path) -> Result<Option<Bytes>, CacheError> {
    loop {
        let loaded = cache.notified();
        match cache.get(path) {
            CacheLookup::Ready(data) => return Ok(data),
            CacheLookup::Failed(error) => return Err(error),
            CacheLookup::Pending => {
                let _ = tokio::time::timeout(PENDING_RETRY, loaded).await;
            }
        }
    }
}

/// The decoded last segment of a request path.
fn file_name(path: &str) -> String {
    let path = percent_decode_str(path).decode_utf8_lossy();
    path.rsplit(['/', '\\']).next().unwrap_or_default().to_owned()
}
