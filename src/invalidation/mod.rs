//! Provides the caches which keep values locally and invalidate them via fingerprints.
//!
//! Each node keeps its values in a local [LruStore](crate::store::LruStore). Whenever a value is
//! written, its [Digest](crate::fingerprint::Digest) is published via the
//! [FingerprintChannel](crate::channel::FingerprintChannel) of the cache. Every peer which
//! receives such a digest compares it to the one of its own copy:
//!
//! | incoming digest              | local entry          | outcome                                  |
//! |------------------------------|----------------------|------------------------------------------|
//! | tombstone                    | any                  | evict (**on_remove** if present)         |
//! | equal to the local digest    | present              | keep (**on_put** with the current value) |
//! | different                    | present or absent    | evict (**on_put** with **None**)         |
//!
//! Keeping an entry with an equal digest is what prevents invalidation storms: without it, two
//! nodes writing the same value would invalidate each other on every echo, reload, write again
//! and so on. The comparison and the removal are performed atomically per key.
//!
//! Note that equality of values is decided by their SHA-256 digests. Two different values which
//! collide would be treated as equal and never be reconciled. For a cryptographic digest this is
//! accepted as practically impossible.
//!
//! There are two flavors:
//! * [InvalidationCache](InvalidationCache) publishes synchronously and reports failures of the
//!   channel to the caller.
//! * [AsyncInvalidationCache](AsyncInvalidationCache) writes locally and publishes in the
//!   background. Failures of the channel are only logged.
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::cache::{CacheInfo, CacheKey, CacheValue, CachedObjectSelector, ObjectCacheInfo};
use crate::channel::{ChannelEvent, FingerprintChannel, Origin, Subscription};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::{Digest, Fingerprint};
use crate::listeners::ListenerRegistry;
use crate::store::{LocalStore, LruStore};

mod async_cache;
mod sync_cache;

pub use async_cache::AsyncInvalidationCache;
pub use sync_cache::InvalidationCache;

use async_cache::{Publication, Publisher};

/// Enumerates the outcomes of comparing an incoming digest with the local entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The tombstone was received, the local entry has to be removed.
    Evict,
    /// The local entry has the same digest and remains untouched.
    Keep,
    /// The local entry is outdated (or unknown) and has to be invalidated.
    Invalidate,
}

/// Decides what to do with the local entry once a digest for its key is received.
///
/// # Examples
/// ```
/// # use invalidation_cache::fingerprint::Digest;
/// # use invalidation_cache::invalidation::{decide, Decision};
/// let local = Digest::of("v1");
///
/// assert_eq!(decide(Digest::of("v1"), Some(local)), Decision::Keep);
/// assert_eq!(decide(Digest::of("v2"), Some(local)), Decision::Invalidate);
/// assert_eq!(decide(Digest::of("v2"), None), Decision::Invalidate);
/// assert_eq!(decide(Digest::tombstone(), Some(local)), Decision::Evict);
/// ```
pub fn decide(incoming: Digest, local: Option<Digest>) -> Decision {
    if incoming.is_tombstone() {
        Decision::Evict
    } else if local == Some(incoming) {
        Decision::Keep
    } else {
        Decision::Invalidate
    }
}

/// Contains the state shared by both cache flavors.
///
/// The channel only ever sees a closure holding a weak reference to this, so that the ownership
/// remains acyclic. Dropping the cache drops the core along with its subscription, which removes
/// the handler from the channel.
pub(crate) struct Core<K, V> {
    name: String,
    label: String,
    log_enabled: bool,
    store: LruStore<K, Fingerprint<V>>,
    channel: Arc<dyn FingerprintChannel<K>>,
    _subscription: Subscription,
    listeners: ListenerRegistry<K, V>,
    publisher: Option<Publisher<K>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<K: CacheKey, V: CacheValue> Core<K, V> {
    /// Creates the core and subscribes it to the given channel.
    fn start(
        config: &CacheConfig,
        channel: Arc<dyn FingerprintChannel<K>>,
        publisher: Option<Publisher<K>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_core: &Weak<Core<K, V>>| {
            let weak_core = weak_core.clone();
            let subscription = channel.subscribe(Arc::new(move |event, origin| {
                if let Some(core) = weak_core.upgrade() {
                    core.handle_remote_change(event, origin);
                }
            }));

            Core {
                name: config.name.clone(),
                label: config.label.clone(),
                log_enabled: config.log_enabled,
                store: LruStore::new(
                    config.max_size,
                    config.live_time,
                    config.concurrency_level,
                ),
                channel,
                _subscription: subscription,
                listeners: ListenerRegistry::new(),
                publisher,
                hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
            }
        })
    }

    fn check_key(&self, key: &K) -> CacheResult<()> {
        if key.is_valid_key() {
            Ok(())
        } else {
            Err(CacheError::InvalidKey(format!("{:?}", key)))
        }
    }

    /// Validates the given entry and computes its fingerprint.
    fn fingerprint(&self, key: &K, value: V) -> CacheResult<Fingerprint<V>> {
        self.check_key(key)?;

        let fingerprint = Fingerprint::of(value);
        if fingerprint.digest().is_tombstone() {
            return Err(CacheError::InvalidValue {
                key: format!("{:?}", key),
                reason: "The value cannot be told apart from an invalidation.".to_owned(),
            });
        }

        Ok(fingerprint)
    }

    /// Validates all given entries before any of them is written.
    fn fingerprint_all(&self, entries: Vec<(K, V)>) -> CacheResult<Vec<(K, Fingerprint<V>)>> {
        entries
            .into_iter()
            .map(|(key, value)| {
                let fingerprint = self.fingerprint(&key, value)?;
                Ok::<_, CacheError>((key, fingerprint))
            })
            .collect()
    }

    /// Writes the entry into the local store and notifies about all entries evicted to make room.
    fn store_local(&self, key: K, fingerprint: Fingerprint<V>) -> CacheResult<()> {
        let evicted = self
            .store
            .put(key, fingerprint)
            .map_err(CacheError::Store)?;

        for (key, fingerprint) in evicted {
            self.expired(&key, &fingerprint);
        }

        Ok(())
    }

    /// Handles an entry which was dropped by the local store on its own.
    fn expired(&self, key: &K, fingerprint: &Fingerprint<V>) {
        if self.log_enabled {
            log::debug!("{}: Entry {:?} expired.", self.name, key);
        }

        self.listeners.expire(self, key, fingerprint.value());
        if let Some(publisher) = &self.publisher {
            let _ = publisher.send(Publication::EvictLocal(key.clone()));
        }
    }

    fn record_lookup(&self, key: &K, value: Option<&V>) {
        if value.is_some() {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.misses.fetch_add(1, Ordering::Relaxed);
        }

        if self.log_enabled {
            log::debug!(
                "{}: GET {:?} -> {}",
                self.name,
                key,
                if value.is_some() { "hit" } else { "miss" }
            );
        }

        self.listeners.get(self, key, value);
    }

    fn handle_remote_change(&self, event: ChannelEvent<K>, origin: Origin) {
        match (event, origin) {
            (ChannelEvent::Expire { key }, _) => {
                // Entries written via put_local are unknown to the channel, therefore the
                // asynchronous flavor keeps its entries, no matter what the channel evicts...
                if self.publisher.is_none() {
                    if let Some(fingerprint) = self.store.remove(&key) {
                        self.listeners.expire(self, &key, fingerprint.value());
                    }
                }
            }
            // Our own changes have already been applied...
            (_, Origin::Local) => (),
            (ChannelEvent::Put { key, digest }, Origin::Remote) => {
                let _ = self.apply_remote_put(&key, digest);
            }
            (ChannelEvent::Remove { key }, Origin::Remote) => {
                if let Some(fingerprint) = self.store.remove(&key) {
                    if self.log_enabled {
                        log::debug!("{}: Entry {:?} was removed by a peer.", self.name, key);
                    }
                    self.listeners.remove(self, &key, fingerprint.value());
                }
            }
            (ChannelEvent::Clear, Origin::Remote) => {
                if self.log_enabled {
                    log::debug!("{}: Cache was cleared by a peer.", self.name);
                }
                self.store.clear();
                self.listeners.clear_cache(self);
            }
        }
    }

    /// Compares the digest published by a peer with the local entry and applies the outcome.
    fn apply_remote_put(&self, key: &K, incoming: Digest) -> Decision {
        let kept = RefCell::new(None);
        let removed = self.store.remove_if(key, &|local: &Fingerprint<V>| {
            if decide(incoming, Some(local.digest())) == Decision::Keep {
                *kept.borrow_mut() = Some(local.clone());
                false
            } else {
                true
            }
        });

        if let Some(current) = kept.into_inner() {
            if self.log_enabled {
                log::debug!("{}: Digest of {:?} is unchanged ({}).", self.name, key, incoming);
            }
            self.listeners.put(self, key, current.value());
            return Decision::Keep;
        }

        let decision = decide(incoming, removed.as_ref().map(Fingerprint::digest));
        match decision {
            Decision::Evict => {
                if let Some(removed) = &removed {
                    if self.log_enabled {
                        log::debug!("{}: Entry {:?} was evicted by a peer.", self.name, key);
                    }
                    self.listeners.remove(self, key, removed.value());
                }
            }
            Decision::Invalidate => {
                if self.log_enabled {
                    log::debug!("{}: Entry {:?} was invalidated by a peer.", self.name, key);
                }
                self.listeners.put(self, key, None);
            }
            Decision::Keep => (),
        }

        decision
    }

    fn select(&self, selector: &mut dyn CachedObjectSelector<K, V>) -> CacheResult<()> {
        for (key, fingerprint) in self.snapshot() {
            if let Some(value) = fingerprint.into_value() {
                let info = ObjectCacheInfo::new(value);
                if selector.select(&key, &info) {
                    selector
                        .on_select(self, &key, &info)
                        .map_err(CacheError::Selection)?;
                }
            }
        }

        Ok(())
    }

    /// Drops all expired entries and returns a copy of the remaining ones.
    fn snapshot(&self) -> Vec<(K, Fingerprint<V>)> {
        for (key, fingerprint) in self.store.purge_expired() {
            self.expired(&key, &fingerprint);
        }

        self.store.snapshot()
    }

    fn cached_objects(&self) -> Vec<V> {
        self.snapshot()
            .into_iter()
            .filter_map(|(_, fingerprint)| fingerprint.into_value())
            .collect()
    }

    fn set_max_size(&self, max_size: usize) {
        for (key, fingerprint) in self.store.set_max_size(max_size) {
            self.expired(&key, &fingerprint);
        }
    }

    fn set_live_time(&self, live_time: Option<Duration>) {
        self.store.set_live_time(live_time);
    }

    fn cache_hit(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    fn cache_miss(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<K: CacheKey, V: CacheValue> CacheInfo for Core<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.store.size()
    }

    fn max_size(&self) -> usize {
        self.store.max_size()
    }

    fn live_time(&self) -> Option<Duration> {
        self.store.live_time()
    }
}
