use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheInfo, CacheKey, CacheValue, CachedObjectSelector};
use crate::channel::FingerprintChannel;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::Fingerprint;
use crate::invalidation::Core;
use crate::listeners::CacheListener;
use crate::store::{LocalStore, Lookup, StoreMetrics};

/// Provides a cache which publishes the fingerprint of each write before returning.
///
/// Each write is applied to the local store first and then published via the fingerprint
/// channel. If the channel cannot be reached, the operation fails with
/// [CacheError::ChannelUnavailable](CacheError::ChannelUnavailable) (the local store has already
/// been updated by then).
///
/// Lookups are double checked against the channel: if it no longer knows the key, or knows a
/// different digest, the local copy is considered stale and the lookup is a miss.
///
/// # Examples
/// ```
/// # use invalidation_cache::cache::Cache;
/// # use invalidation_cache::channel::{ChannelFactory, MemoryCluster};
/// # use invalidation_cache::config::CacheConfig;
/// # use invalidation_cache::invalidation::InvalidationCache;
/// let cluster = MemoryCluster::new();
/// let config = CacheConfig::new("users", 128);
/// let node_a = InvalidationCache::<String, String>::new(&config, cluster.join().open("users").unwrap());
/// let node_b = InvalidationCache::<String, String>::new(&config, cluster.join().open("users").unwrap());
///
/// node_a.put("x".to_owned(), "v1".to_owned()).unwrap();
/// node_b.put("x".to_owned(), "v1".to_owned()).unwrap();
///
/// // Both nodes wrote the same value, so both keep their local copy...
/// assert_eq!(node_a.get(&"x".to_owned()).unwrap(), Some("v1".to_owned()));
/// assert_eq!(node_b.get(&"x".to_owned()).unwrap(), Some("v1".to_owned()));
///
/// // ...but a different value invalidates the copy of the peer.
/// node_b.put("x".to_owned(), "v2".to_owned()).unwrap();
/// assert_eq!(node_a.get(&"x".to_owned()).unwrap(), None);
/// ```
pub struct InvalidationCache<K, V> {
    core: Arc<Core<K, V>>,
}

impl<K: CacheKey, V: CacheValue> InvalidationCache<K, V> {
    /// Creates a new cache which uses the given channel to talk to its peers.
    pub fn new(config: &CacheConfig, channel: Arc<dyn FingerprintChannel<K>>) -> Self {
        InvalidationCache {
            core: Core::start(config, channel, None),
        }
    }

    fn publish<T>(&self, result: anyhow::Result<T>) -> CacheResult<T> {
        result.map_err(|error| {
            log::warn!(
                "{}: Failed to publish to the fingerprint channel: {}",
                self.core.name,
                error
            );
            CacheError::ChannelUnavailable(error)
        })
    }
}

impl<K: CacheKey, V: CacheValue> CacheInfo for InvalidationCache<K, V> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn size(&self) -> usize {
        self.core.size()
    }

    fn max_size(&self) -> usize {
        self.core.max_size()
    }

    fn live_time(&self) -> Option<Duration> {
        self.core.live_time()
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for InvalidationCache<K, V> {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.core.check_key(key)?;

        let value = match self.core.store.get(key) {
            Lookup::Hit(local) => {
                let digest = local.digest();
                match self.publish(self.core.channel.get(key))? {
                    Some(known) if known == digest => local.into_value(),
                    Some(_) => {
                        // The invalidation is still in flight, drop the local copy unless it has
                        // been replaced in the meantime...
                        let _ = self
                            .core
                            .store
                            .remove_if(key, &|current: &Fingerprint<V>| current.digest() == digest);
                        None
                    }
                    None => None,
                }
            }
            Lookup::Expired(local) => {
                self.core.expired(key, &local);
                None
            }
            Lookup::Miss => None,
        };

        self.core.record_lookup(key, value.as_ref());

        Ok(value)
    }

    fn put(&self, key: K, value: V) -> CacheResult<()> {
        let fingerprint = self.core.fingerprint(&key, value)?;
        let digest = fingerprint.digest();
        if self.core.log_enabled {
            log::debug!("{}: PUT {:?} ({})", self.core.name, key, digest);
        }

        self.core.store_local(key.clone(), fingerprint.clone())?;
        self.publish(self.core.channel.put(key.clone(), digest))?;
        self.core.listeners.put(self.core.as_ref(), &key, fingerprint.value());

        Ok(())
    }

    fn put_map(&self, entries: Vec<(K, V)>) -> CacheResult<()> {
        let entries = self.core.fingerprint_all(entries)?;
        if entries.is_empty() {
            return Ok(());
        }

        for (key, fingerprint) in &entries {
            self.core.store_local(key.clone(), fingerprint.clone())?;
        }

        self.publish(
            self.core.channel.put_batch(
                entries
                    .iter()
                    .map(|(key, fingerprint)| (key.clone(), fingerprint.digest()))
                    .collect(),
            ),
        )?;

        for (key, fingerprint) in &entries {
            self.core
                .listeners
                .put(self.core.as_ref(), key, fingerprint.value());
        }

        Ok(())
    }

    fn remove(&self, key: &K) -> CacheResult<Option<V>> {
        self.core.check_key(key)?;
        if self.core.log_enabled {
            log::debug!("{}: REMOVE {:?}", self.core.name, key);
        }

        let previous = self.core.store.remove(key);
        self.publish(self.core.channel.remove(key))?;
        self.core.listeners.remove(
            self.core.as_ref(),
            key,
            previous.as_ref().and_then(Fingerprint::value),
        );

        Ok(previous.and_then(Fingerprint::into_value))
    }

    fn clear_cache(&self) -> CacheResult<()> {
        if self.core.log_enabled {
            log::debug!("{}: CLEAR", self.core.name);
        }

        self.core.store.clear();
        self.publish(self.core.channel.clear())?;
        self.core.listeners.clear_cache(self.core.as_ref());

        Ok(())
    }

    fn select(&self, selector: &mut dyn CachedObjectSelector<K, V>) -> CacheResult<()> {
        self.core.select(selector)
    }

    fn set_max_size(&self, max_size: usize) {
        self.core.set_max_size(max_size);
    }

    fn set_live_time(&self, live_time: Option<Duration>) {
        self.core.set_live_time(live_time);
    }

    fn cache_hit(&self) -> usize {
        self.core.cache_hit()
    }

    fn cache_miss(&self) -> usize {
        self.core.cache_miss()
    }

    fn store_metrics(&self) -> StoreMetrics {
        self.core.store.metrics()
    }

    fn cached_objects(&self) -> Vec<V> {
        self.core.cached_objects()
    }

    fn add_cache_listener(&self, listener: Arc<dyn CacheListener<K, V>>) {
        self.core.listeners.register(listener);
    }

    fn is_log_enabled(&self) -> bool {
        self.core.log_enabled
    }
}
