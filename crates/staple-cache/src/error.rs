//! Error types for the cache engine
//!
//! One enum covers the whole refresh pipeline. The variants matter to
//! callers: fetch and verify failures are logged and leave the previous
//! response in place, disk failures keep the in-memory state, and
//! configuration failures are fatal for the entry that carries them.

/// Errors produced by cache, entry, fetch, and verification operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid or incomplete entry configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Cache removal of a name that is not present
    #[error("entry '{0}' is not in the cache")]
    NotFound(String),

    /// Request fingerprint computation failed
    #[error("digest computation failed: {0}")]
    Hash(String),

    /// Upstream responder fetch failed (HTTP error, timeout, decode)
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Response failed verification against the issuer
    #[error("response verification failed: {0}")]
    Verify(String),

    /// Reading or writing the on-disk response snapshot failed
    #[error("disk i/o failed: {0}")]
    Disk(#[from] std::io::Error),
}
