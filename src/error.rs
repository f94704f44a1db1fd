//! Defines the errors which can be reported by cache operations.
//!
//! Errors of the local store are propagated unchanged. Errors of the fingerprint channel are
//! only ever reported by the synchronous [InvalidationCache](crate::invalidation::InvalidationCache),
//! the asynchronous variant logs them, as the local write has already succeeded by then. Listener
//! failures are never reported to the caller at all, they are wrapped into
//! [CacheError::ListenerFailure] purely for logging.
use thiserror::Error;

/// Enumerates the failures of cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The given key is not acceptable (e.g. an empty string).
    ///
    /// This is always reported before any mutation took place.
    #[error("No valid cache key given: {0}")]
    InvalidKey(String),

    /// The given value is not acceptable.
    ///
    /// This is the case for values which fingerprint to the tombstone digest, as peers could not
    /// tell them apart from an invalidation.
    #[error("Cannot cache the value for {key}: {reason}")]
    InvalidValue {
        /// Contains the debug representation of the affected key.
        key: String,
        /// Describes why the value was rejected.
        reason: String,
    },

    /// The fingerprint channel couldn't be reached or rejected the operation.
    #[error("The fingerprint channel is unavailable: {0}")]
    ChannelUnavailable(#[source] anyhow::Error),

    /// The local store failed to perform the operation.
    #[error("The local store failed: {0}")]
    Store(#[source] anyhow::Error),

    /// A [CachedObjectSelector](crate::cache::CachedObjectSelector) failed to handle an entry.
    #[error("The selector failed: {0}")]
    Selection(#[source] anyhow::Error),

    /// A cache listener failed to handle an event.
    #[error("Cannot execute the cache listener for {event} properly: {source}")]
    ListenerFailure {
        /// Contains the name of the event being dispatched.
        event: &'static str,
        /// Contains the error reported by (or the panic of) the listener.
        #[source]
        source: anyhow::Error,
    },
}

/// Represents the result of a cache operation.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
