//! Provides the local stores which keep the actual values of a cache.
//!
//! A local store is a plain concurrent map with its own eviction policy (max number of entries
//! and time to live). It knows nothing about the cluster. The invalidation caches use it to keep
//! the [Fingerprint](crate::fingerprint::Fingerprint) of each entry along with its value, so that
//! an incoming digest can be compared without re-hashing the local value.
//!
//! The provided implementation is the [LruStore](LruStore).
use std::time::Duration;

mod lru_store;

pub use lru_store::LruStore;

/// Represents the outcome of a lookup in a [LocalStore](LocalStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// A live entry was found.
    Hit(V),
    /// An entry was found but its live time had already elapsed. It has been removed by the
    /// lookup, the value is reported so that the caller can notify its observers.
    Expired(V),
    /// No entry is present.
    Miss,
}

impl<V> Lookup<V> {
    /// Returns the value of a live entry.
    pub fn hit(self) -> Option<V> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

/// Summarizes the usage of a local store since it was created or last cleared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreMetrics {
    /// Contains the number of lookups.
    pub reads: usize,
    /// Contains the number of stored entries.
    pub writes: usize,
    /// Contains the share of lookups which found a live entry in percent.
    pub hit_rate: f32,
    /// Contains the number of entries relative to the max size in percent.
    pub utilization: f32,
    /// Contains the number of independently locked segments.
    pub segments: usize,
}

/// Describes a concurrent key value store which lives in local memory.
///
/// All single-key operations have to be linearizable. No guarantees are required across
/// several keys.
pub trait LocalStore<K, V>: Send + Sync {
    /// Performs a lookup for the given key.
    fn get(&self, key: &K) -> Lookup<V>;

    /// Stores the given value and returns all entries which had to be evicted to make room.
    ///
    /// # Errors
    /// Errors are propagated to the caller of the cache operation unchanged.
    fn put(&self, key: K, value: V) -> anyhow::Result<Vec<(K, V)>>;

    /// Removes the entry for the given key and returns its value.
    fn remove(&self, key: &K) -> Option<V>;

    /// Removes the entry for the given key if the predicate accepts its current value.
    ///
    /// Checking and removing is atomic with respect to all other operations on the same key.
    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V>;

    /// Removes all entries.
    fn clear(&self);

    /// Returns a copy of all live entries.
    fn snapshot(&self) -> Vec<(K, V)>;

    /// Removes all entries whose live time has elapsed and returns them.
    fn purge_expired(&self) -> Vec<(K, V)>;

    /// Returns the number of entries.
    fn size(&self) -> usize;

    /// Returns the max number of entries.
    fn max_size(&self) -> usize;

    /// Changes the max number of entries and returns all entries evicted by shrinking the store.
    fn set_max_size(&self, max_size: usize) -> Vec<(K, V)>;

    /// Returns the live time of new entries (**None** if entries never expire).
    fn live_time(&self) -> Option<Duration>;

    /// Changes the live time of entries written from now on.
    fn set_live_time(&self, live_time: Option<Duration>);
}
