//! Defines the public contract shared by all cache implementations.
//!
//! The [Cache](Cache) trait is object safe so that a [CacheService](crate::service::CacheService)
//! can hand out synchronous and asynchronous invalidation caches alike.
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::CacheResult;
use crate::fingerprint::Digestible;
use crate::listeners::CacheListener;
use crate::store::StoreMetrics;

/// Describes types which can be used as cache keys.
///
/// Keys are compared and hashed locally and are sent (as is) to the fingerprint channel.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Determines if the key is acceptable for a cache operation.
    ///
    /// Invalid keys are rejected with [CacheError::InvalidKey](crate::error::CacheError::InvalidKey)
    /// before any mutation takes place.
    fn is_valid_key(&self) -> bool {
        true
    }
}

impl CacheKey for String {
    fn is_valid_key(&self) -> bool {
        !self.is_empty()
    }
}

impl CacheKey for &'static str {
    fn is_valid_key(&self) -> bool {
        !self.is_empty()
    }
}

impl CacheKey for u32 {}
impl CacheKey for u64 {}
impl CacheKey for i32 {}
impl CacheKey for i64 {}
impl CacheKey for usize {}

/// Describes types which can be stored as cache values.
///
/// Values remain in local memory and are only represented by their digest on the cluster. Large
/// values should be wrapped in an **Arc** so that handing out copies stays cheap.
pub trait CacheValue: Digestible + Clone + Send + Sync + 'static {}

impl<T: Digestible + Clone + Send + Sync + 'static> CacheValue for T {}

/// Provides the metadata of a cache to listeners and selectors.
pub trait CacheInfo {
    /// Returns the name of the cache.
    fn name(&self) -> &str;

    /// Returns the number of entries currently held in local memory.
    fn size(&self) -> usize;

    /// Returns the max number of entries to keep in local memory.
    fn max_size(&self) -> usize;

    /// Returns the time after which an entry expires or **None** if entries never expire.
    fn live_time(&self) -> Option<Duration>;
}

/// Provides the value of an entry visited by [Cache::select](Cache::select).
pub struct ObjectCacheInfo<V> {
    value: V,
}

impl<V> ObjectCacheInfo<V> {
    /// Wraps the given value.
    pub fn new(value: V) -> Self {
        ObjectCacheInfo { value }
    }

    /// Returns the cached value.
    pub fn get(&self) -> &V {
        &self.value
    }

    /// Returns the expiration timestamp of the entry.
    ///
    /// This is always **None** (unknown), as the expiration is managed by the local store and
    /// not by the cache itself.
    pub fn expire_time(&self) -> Option<SystemTime> {
        None
    }
}

/// Visits the entries of a cache.
///
/// Note that only entries which are physically present in the local memory of this node are
/// visited. Entries known to other nodes are invisible here.
pub trait CachedObjectSelector<K, V> {
    /// Determines if the given entry is selected.
    fn select(&mut self, key: &K, info: &ObjectCacheInfo<V>) -> bool;

    /// Invoked for each entry for which [select](CachedObjectSelector::select) returned **true**.
    fn on_select(
        &mut self,
        cache: &dyn CacheInfo,
        key: &K,
        info: &ObjectCacheInfo<V>,
    ) -> anyhow::Result<()>;
}

/// Describes a cache which keeps its values in local memory.
pub trait Cache<K: CacheKey, V: CacheValue>: CacheInfo + Send + Sync {
    /// Returns the human readable label of the cache.
    fn label(&self) -> &str;

    /// Returns the value stored for the given key or **None** if no (valid) value is present.
    fn get(&self, key: &K) -> CacheResult<Option<V>>;

    /// Stores the given value for the given key.
    fn put(&self, key: K, value: V) -> CacheResult<()>;

    /// Stores all given entries.
    ///
    /// All keys and values are validated before the first entry is written.
    fn put_map(&self, entries: Vec<(K, V)>) -> CacheResult<()>;

    /// Removes the entry for the given key and returns its previous value.
    fn remove(&self, key: &K) -> CacheResult<Option<V>>;

    /// Removes all entries of this cache (on all nodes).
    fn clear_cache(&self) -> CacheResult<()>;

    /// Visits a snapshot of all locally present entries.
    fn select(&self, selector: &mut dyn CachedObjectSelector<K, V>) -> CacheResult<()>;

    /// Changes the max number of entries to keep in local memory.
    fn set_max_size(&self, max_size: usize);

    /// Changes the live time of entries written from now on.
    fn set_live_time(&self, live_time: Option<Duration>);

    /// Returns the number of successful lookups.
    fn cache_hit(&self) -> usize;

    /// Returns the number of lookups which didn't yield a value.
    fn cache_miss(&self) -> usize;

    /// Returns the usage metrics of the local store.
    fn store_metrics(&self) -> StoreMetrics;

    /// Returns a copy of all locally present values.
    fn cached_objects(&self) -> Vec<V>;

    /// Returns a copy of all locally present values and clears the cache afterwards.
    fn remove_cached_objects(&self) -> CacheResult<Vec<V>> {
        let values = self.cached_objects();
        self.clear_cache()?;
        Ok(values)
    }

    /// Registers a listener which is notified about all changes of this cache.
    fn add_cache_listener(&self, listener: Arc<dyn CacheListener<K, V>>);

    /// Determines if logging of cache operations is enabled.
    fn is_log_enabled(&self) -> bool;
}
