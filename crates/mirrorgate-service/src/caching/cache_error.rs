use thiserror::Error;

/// Why a file cannot be served from the cache.
///
/// Both variants are recoverable by redirecting the request to a mirror. A file that does not
/// exist is not an error, see [`CacheLookup::Ready`](super::CacheLookup::Ready).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source file exceeds the maximum cacheable file size.
    #[error("file size too large ({0} bytes)")]
    FileTooLarge(u64),
    /// No room could be made for the file without evicting protected entries.
    #[error("cache full")]
    CacheFull,
}

impl CacheError {
    /// A short, stable name used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileTooLarge(_) => "too_large",
            Self::CacheFull => "full",
        }
    }
}
