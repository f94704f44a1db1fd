use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::cache::{Cache, CacheInfo, CacheKey, CacheValue, CachedObjectSelector};
use crate::channel::FingerprintChannel;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::{Digest, Fingerprint};
use crate::invalidation::Core;
use crate::listeners::CacheListener;
use crate::store::{LocalStore, Lookup, StoreMetrics};

/// Enumerates the work items processed by the publisher of an async cache.
pub(crate) enum Publication<K> {
    Put(K, Digest),
    Batch(Vec<(K, Digest)>),
    Remove { key: K, existed: bool },
    Clear,
    EvictLocal(K),
    Barrier(oneshot::Sender<()>),
}

/// Hands publications over to a background task which talks to the channel.
///
/// A single task drains the queue and awaits each publication before taking the next one,
/// therefore all publications of a node reach the channel in the order in which they were
/// issued. As channels are synchronous, each call is performed via a short-lived blocking task,
/// so that an idle publisher never occupies a thread of the blocking pool.
pub(crate) struct Publisher<K> {
    name: String,
    queue: mpsc::UnboundedSender<Publication<K>>,
}

impl<K: CacheKey> Publisher<K> {
    fn start(name: &str, channel: Arc<dyn FingerprintChannel<K>>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            anyhow::anyhow!(
                "Cannot start the publisher of {} outside of a tokio runtime: {}",
                name,
                error
            )
        })?;

        let (queue, mut receiver) = mpsc::unbounded_channel();
        let task_name = name.to_owned();
        std::mem::drop(runtime.spawn(async move {
            while let Some(publication) = receiver.recv().await {
                // A barrier only has to wait for its predecessors, which is already the case...
                if let Publication::Barrier(completed) = publication {
                    let _ = completed.send(());
                    continue;
                }

                let name = task_name.clone();
                let channel = channel.clone();
                if let Err(error) =
                    tokio::task::spawn_blocking(move || publish(&name, channel.as_ref(), publication))
                        .await
                {
                    log::warn!("{}: Failed to hand a change to the channel: {}", task_name, error);
                }
            }
            log::debug!("{}: Publisher has stopped.", task_name);
        }));

        Ok(Publisher {
            name: name.to_owned(),
            queue,
        })
    }

    /// Enqueues the given publication and reports whether the publisher is still running.
    pub(crate) fn send(&self, publication: Publication<K>) -> bool {
        if self.queue.send(publication).is_err() {
            log::warn!(
                "{}: The publisher has stopped, a change will not reach the other nodes.",
                self.name
            );
            false
        } else {
            true
        }
    }
}

fn publish<K: CacheKey>(name: &str, channel: &dyn FingerprintChannel<K>, publication: Publication<K>) {
    let result = match publication {
        Publication::Put(key, digest) => channel.put(key, digest),
        Publication::Batch(entries) => channel.put_batch_async(entries),
        Publication::Remove { key, existed } => match channel.get(&key) {
            // The entry only existed locally, so peers might know an outdated copy which they
            // never announced. A plain removal of an unknown key wouldn't reach them...
            Ok(None) if existed => channel.put(key, Digest::tombstone()),
            Ok(_) => channel.remove(&key),
            Err(error) => Err(error),
        },
        Publication::Clear => channel.clear(),
        Publication::EvictLocal(key) => channel.evict_local(&key),
        Publication::Barrier(completed) => {
            let _ = completed.send(());
            Ok(())
        }
    };

    if let Err(error) = result {
        log::warn!("{}: {}", name, CacheError::ChannelUnavailable(error));
    }
}

/// Provides a cache which publishes fingerprints in the background.
///
/// All writes are applied to the local store and are immediately visible to local lookups. The
/// resulting fingerprints are handed to a background publisher, so that callers never wait for
/// the channel. Failures of the channel are logged and otherwise ignored, as the local write has
/// already succeeded. Use [flush](AsyncInvalidationCache::flush) to wait until all changes issued
/// so far have been handed to the channel.
///
/// In contrast to the synchronous [InvalidationCache](crate::invalidation::InvalidationCache),
/// lookups are served from the local store only. Additionally, entries can be written or removed
/// locally without telling the other nodes.
///
/// Note that the cache has to be created within a tokio runtime, as the publisher runs as a
/// task of it.
pub struct AsyncInvalidationCache<K, V> {
    core: Arc<Core<K, V>>,
}

impl<K: CacheKey, V: CacheValue> AsyncInvalidationCache<K, V> {
    /// Creates a new cache which uses the given channel to talk to its peers.
    ///
    /// # Errors
    /// Fails if no tokio runtime is available to run the publisher.
    pub fn new(config: &CacheConfig, channel: Arc<dyn FingerprintChannel<K>>) -> anyhow::Result<Self> {
        let publisher = Publisher::start(&config.name, channel.clone())?;

        Ok(AsyncInvalidationCache {
            core: Core::start(config, channel, Some(publisher)),
        })
    }

    fn publisher(&self) -> &Publisher<K> {
        // Async cores are always created with a publisher...
        match &self.core.publisher {
            Some(publisher) => publisher,
            None => unreachable!("An async cache without a publisher!"),
        }
    }

    /// Stores the given value without notifying the other nodes.
    pub fn put_local(&self, key: K, value: V) -> CacheResult<()> {
        let fingerprint = self.core.fingerprint(&key, value)?;
        if self.core.log_enabled {
            log::debug!("{}: PUT LOCAL {:?}", self.core.name, key);
        }

        self.core.store_local(key.clone(), fingerprint.clone())?;
        self.core
            .listeners
            .put_local(self.core.as_ref(), &key, fingerprint.value());

        Ok(())
    }

    /// Removes the entry for the given key without notifying the other nodes.
    pub fn remove_local(&self, key: &K) -> CacheResult<Option<V>> {
        self.core.check_key(key)?;
        if self.core.log_enabled {
            log::debug!("{}: REMOVE LOCAL {:?}", self.core.name, key);
        }

        let previous = self.core.store.remove(key);
        self.core.listeners.remove(
            self.core.as_ref(),
            key,
            previous.as_ref().and_then(Fingerprint::value),
        );

        Ok(previous.and_then(Fingerprint::into_value))
    }

    /// Waits until all changes issued so far have been handed to the channel.
    pub async fn flush(&self) {
        let (completed, on_completed) = oneshot::channel();
        if self.publisher().send(Publication::Barrier(completed)) {
            let _ = on_completed.await;
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheInfo for AsyncInvalidationCache<K, V> {
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

impl<K: CacheKey, V: CacheValue> Cache<K, V> for AsyncInvalidationCache<K, V> {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.core.check_key(key)?;

        let value = match self.core.store.get(key) {
            Lookup::Hit(local) => local.into_value(),
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
        let _ = self.publisher().send(Publication::Put(key.clone(), digest));
        self.core
            .listeners
            .put(self.core.as_ref(), &key, fingerprint.value());

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

        let _ = self.publisher().send(Publication::Batch(
            entries
                .iter()
                .map(|(key, fingerprint)| (key.clone(), fingerprint.digest()))
                .collect(),
        ));

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
        let _ = self.publisher().send(Publication::Remove {
            key: key.clone(),
            existed: previous.is_some(),
        });
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
        let _ = self.publisher().send(Publication::Clear);
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

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheInfo};
    use crate::channel::{ChannelFactory, MemoryCluster, Operation};
    use crate::config::CacheConfig;
    use crate::fingerprint::Digest;
    use crate::invalidation::AsyncInvalidationCache;
    use crate::listeners::CacheListener;
    use crate::testing::test_async;
    use mock_instant::thread_local::MockClock;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl CacheListener<String, String> for Recorder {
        fn on_expire(&self, _: &dyn CacheInfo, key: &String, value: Option<&String>) -> anyhow::Result<()> {
            self.record(format!("expire {} {:?}", key, value))
        }

        fn on_remove(&self, _: &dyn CacheInfo, key: &String, value: Option<&String>) -> anyhow::Result<()> {
            self.record(format!("remove {} {:?}", key, value))
        }

        fn on_put(&self, _: &dyn CacheInfo, key: &String, value: Option<&String>) -> anyhow::Result<()> {
            self.record(format!("put {} {:?}", key, value))
        }

        fn on_put_local(&self, _: &dyn CacheInfo, key: &String, value: Option<&String>) -> anyhow::Result<()> {
            self.record(format!("put_local {} {:?}", key, value))
        }

        fn on_clear_cache(&self, _: &dyn CacheInfo) -> anyhow::Result<()> {
            self.record("clear".to_owned())
        }
    }

    fn key(name: &str) -> String {
        name.to_owned()
    }

    fn value(name: &str) -> String {
        name.to_owned()
    }

    fn node(cluster: &MemoryCluster<String>) -> AsyncInvalidationCache<String, String> {
        AsyncInvalidationCache::new(
            &CacheConfig::new("test", 128),
            cluster.join().open("test").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn caches_require_a_runtime() {
        let cluster = MemoryCluster::<String>::new();
        let result = AsyncInvalidationCache::<String, String>::new(
            &CacheConfig::new("test", 128),
            cluster.join().open("test").unwrap(),
        );
        assert_eq!(result.is_err(), true);
    }

    #[test]
    fn writes_are_visible_before_they_are_published() {
        test_async(async {
            let cluster = MemoryCluster::with_manual_delivery();
            let a = node(&cluster);
            let b = node(&cluster);

            a.put(key("x"), value("v1")).unwrap();
            b.put(key("x"), value("v2")).unwrap();
            a.flush().await;
            b.flush().await;
            assert_eq!(a.get(&key("x")).unwrap(), Some(value("v1")));
            assert_eq!(b.get(&key("x")).unwrap(), Some(value("v2")));

            // Once the peers learn about each other's digests, both copies are invalidated...
            assert_eq!(cluster.deliver(), 2);
            assert_eq!(a.get(&key("x")).unwrap(), None);
            assert_eq!(b.get(&key("x")).unwrap(), None);
            assert_eq!(cluster.count(Operation::Put), 2);
        });
    }

    #[test]
    fn equal_values_never_invalidate_each_other() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);

            a.put(key("x"), value("v1")).unwrap();
            b.put(key("x"), value("v1")).unwrap();
            a.flush().await;
            b.flush().await;

            assert_eq!(a.get(&key("x")).unwrap(), Some(value("v1")));
            assert_eq!(b.get(&key("x")).unwrap(), Some(value("v1")));
            assert_eq!(cluster.published().len(), 2);
        });
    }

    #[test]
    fn tombstones_for_unknown_keys_are_ignored() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);
            let recorder = Arc::new(Recorder::default());
            b.add_cache_listener(recorder.clone());

            // "x" is only known to "a", so its removal is announced as tombstone...
            a.put_local(key("x"), value("v1")).unwrap();
            assert_eq!(a.remove(&key("x")).unwrap(), Some(value("v1")));
            a.flush().await;

            let published = cluster.published();
            assert_eq!(published.len(), 1);
            assert_eq!(&published[0].frame[..], &Digest::tombstone().as_bytes()[..]);

            // ...which "b" never knew about, so it has nothing to do.
            assert_eq!(b.get(&key("x")).unwrap(), None);
            assert_eq!(b.size(), 0);
            assert_eq!(recorder.events().is_empty(), true);
        });
    }

    #[test]
    fn removing_keys_unknown_to_peers_is_harmless() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);

            a.put(key("x"), value("v1")).unwrap();
            assert_eq!(a.remove(&key("x")).unwrap(), Some(value("v1")));
            a.flush().await;

            assert_eq!(b.get(&key("x")).unwrap(), None);
            assert_eq!(b.size(), 0);
            assert_eq!(cluster.count(Operation::Remove), 1);
        });
    }

    #[test]
    fn tombstones_evict_local_only_copies() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);
            let recorder = Arc::new(Recorder::default());
            b.add_cache_listener(recorder.clone());

            a.put_local(key("x"), value("v1")).unwrap();
            b.put_local(key("x"), value("v1")).unwrap();
            let _ = a.remove(&key("x")).unwrap();
            a.flush().await;

            assert_eq!(b.size(), 0);
            assert_eq!(
                recorder.events(),
                vec![
                    "put_local x Some(\"v1\")".to_owned(),
                    "remove x Some(\"v1\")".to_owned()
                ]
            );
        });
    }

    #[test]
    fn known_keys_are_removed_plainly() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);

            a.put(key("x"), value("v1")).unwrap();
            a.flush().await;
            b.put_local(key("x"), value("v1")).unwrap();

            let _ = a.remove(&key("x")).unwrap();
            a.flush().await;

            assert_eq!(cluster.count(Operation::Remove), 1);
            assert_eq!(b.size(), 0);
        });
    }

    #[test]
    fn local_operations_are_never_published() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);
            b.put_local(key("x"), value("v2")).unwrap();

            a.put_local(key("x"), value("v1")).unwrap();
            assert_eq!(a.remove_local(&key("x")).unwrap(), Some(value("v1")));
            a.flush().await;

            assert_eq!(cluster.published().is_empty(), true);
            assert_eq!(b.get(&key("x")).unwrap(), Some(value("v2")));
        });
    }

    #[test]
    fn unavailable_channels_are_tolerated() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);

            cluster.set_available(false);
            a.put(key("x"), value("v1")).unwrap();
            a.put_map(vec![(key("y"), value("v2"))]).unwrap();
            let _ = a.remove(&key("y")).unwrap();
            a.clear_cache().unwrap();
            a.put(key("z"), value("v3")).unwrap();
            a.flush().await;

            assert_eq!(a.get(&key("z")).unwrap(), Some(value("v3")));
            assert_eq!(cluster.published().is_empty(), true);
            assert_eq!(b.size(), 0);
        });
    }

    #[test]
    fn remote_clears_clear_the_local_store() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);
            let b = node(&cluster);
            let recorder = Arc::new(Recorder::default());
            b.add_cache_listener(recorder.clone());

            b.put_local(key("x"), value("v1")).unwrap();
            a.clear_cache().unwrap();
            a.clear_cache().unwrap();
            a.flush().await;

            assert_eq!(b.size(), 0);
            assert_eq!(
                recorder.events(),
                vec![
                    "put_local x Some(\"v1\")".to_owned(),
                    "clear".to_owned(),
                    "clear".to_owned()
                ]
            );
        });
    }

    #[test]
    fn expired_entries_are_evicted_from_the_channel() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = AsyncInvalidationCache::<String, String>::new(
                &CacheConfig::new("test", 128).with_live_time(Some(Duration::from_secs(60))),
                cluster.join().open("test").unwrap(),
            )
            .unwrap();
            let recorder = Arc::new(Recorder::default());
            a.add_cache_listener(recorder.clone());

            a.put(key("x"), value("v1")).unwrap();
            MockClock::advance(Duration::from_secs(61));
            assert_eq!(a.get(&key("x")).unwrap(), None);
            a.flush().await;

            assert_eq!(cluster.count(Operation::Evict), 1);
            assert_eq!(recorder.events()[1], "expire x Some(\"v1\")".to_owned());
            assert_eq!(a.cache_miss(), 1);
        });
    }

    #[test]
    fn channel_side_expiry_keeps_local_entries() {
        test_async(async {
            let cluster = MemoryCluster::new();
            let a = node(&cluster);

            a.put(key("x"), value("v1")).unwrap();
            a.flush().await;
            cluster.expire("test", &key("x"));

            assert_eq!(a.get(&key("x")).unwrap(), Some(value("v1")));
        });
    }

    #[test]
    fn idle_publishers_leave_the_blocking_pool_alone() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let cluster = MemoryCluster::new();
            let caches: Vec<AsyncInvalidationCache<String, String>> =
                (0..3).map(|_| node(&cluster)).collect();

            caches[2].put(key("x"), value("v1")).unwrap();
            let flushed = tokio::time::timeout(Duration::from_secs(5), caches[2].flush()).await;

            assert_eq!(flushed.is_ok(), true);
            assert_eq!(cluster.count(Operation::Put), 1);
            assert_eq!(caches[0].get(&key("x")).unwrap(), None);
        });
    }
}
