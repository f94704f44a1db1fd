//! Provides the observers of cache lifecycle events and their dispatcher.
//!
//! A [CacheListener](CacheListener) is notified about puts, removals, expirations, lookups and
//! cache clears. All callbacks have a default implementation, so that a listener only implements
//! the events it is interested in.
//!
//! The [ListenerRegistry](ListenerRegistry) is owned by each cache. Listeners are only ever
//! appended and the list is swapped atomically, so that events can be dispatched from any thread
//! without taking a lock. A listener which is registered while an event is being dispatched might
//! miss this event.
//!
//! A failing listener never affects the cache operation which triggered the event: its error (or
//! panic) is logged and dispatching continues with the next listener.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cache::CacheInfo;
use crate::error::CacheError;

/// Observes the lifecycle events of a cache.
///
/// Values are passed as **Option** as some events can only report the key. Most notably,
/// an **on_put** with a **None** value signals that the entry was invalidated by another node
/// and has not been reloaded yet.
///
/// Implementations are invoked from whichever thread triggered the event (including the threads
/// delivering notifications of the fingerprint channel), therefore they have to be fast.
pub trait CacheListener<K, V>: Send + Sync {
    /// Invoked once an entry has been evicted by the local store (or the fingerprint channel).
    fn on_expire(&self, _cache: &dyn CacheInfo, _key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked once an entry has been removed.
    fn on_remove(&self, _cache: &dyn CacheInfo, _key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked once an entry has been stored or invalidated by another node.
    fn on_put(&self, _cache: &dyn CacheInfo, _key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked once an entry has been stored on this node only.
    ///
    /// By default, this is treated like any other put.
    fn on_put_local(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) -> anyhow::Result<()> {
        self.on_put(cache, key, value)
    }

    /// Invoked for each lookup.
    fn on_get(&self, _cache: &dyn CacheInfo, _key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked once the whole cache has been cleared.
    fn on_clear_cache(&self, _cache: &dyn CacheInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps the listeners of a cache and dispatches events to them.
pub struct ListenerRegistry<K, V> {
    listeners: ArcSwap<Vec<Arc<dyn CacheListener<K, V>>>>,
}

impl<K, V> Default for ListenerRegistry<K, V> {
    fn default() -> Self {
        ListenerRegistry::new()
    }
}

impl<K, V> ListenerRegistry<K, V> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ListenerRegistry {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Appends the given listener.
    pub fn register(&self, listener: Arc<dyn CacheListener<K, V>>) {
        let _ = self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    /// Determines if no listener is registered at all.
    pub fn is_empty(&self) -> bool {
        self.listeners.load().is_empty()
    }

    /// Dispatches an event to all listeners which are registered right now.
    ///
    /// Errors and panics of a listener are logged and otherwise ignored.
    pub fn dispatch<F>(&self, event: &'static str, mut callback: F)
    where
        F: FnMut(&dyn CacheListener<K, V>) -> anyhow::Result<()>,
    {
        let listeners = self.listeners.load();
        if listeners.is_empty() {
            return;
        }

        for listener in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref())));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(panic) => anyhow::anyhow!("The listener panicked: {}", panic_message(panic.as_ref())),
            };

            log::warn!(
                "{}",
                CacheError::ListenerFailure {
                    event,
                    source: error
                }
            );
        }
    }

    /// Dispatches **on_put**.
    pub fn put(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) {
        self.dispatch("on_put", |listener| listener.on_put(cache, key, value));
    }

    /// Dispatches **on_put_local**.
    pub fn put_local(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) {
        self.dispatch("on_put_local", |listener| {
            listener.on_put_local(cache, key, value)
        });
    }

    /// Dispatches **on_remove**.
    pub fn remove(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) {
        self.dispatch("on_remove", |listener| listener.on_remove(cache, key, value));
    }

    /// Dispatches **on_expire**.
    pub fn expire(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) {
        self.dispatch("on_expire", |listener| listener.on_expire(cache, key, value));
    }

    /// Dispatches **on_get**.
    pub fn get(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) {
        self.dispatch("on_get", |listener| listener.on_get(cache, key, value));
    }

    /// Dispatches **on_clear_cache**.
    pub fn clear_cache(&self, cache: &dyn CacheInfo) {
        self.dispatch("on_clear_cache", |listener| listener.on_clear_cache(cache));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "(no message)".to_owned()
    }
}

/// Logs all events of the caches it is attached to.
///
/// Also warns once a cache is filled up to 95% of its max size, as this indicates that its
/// **max_size** should be increased.
#[derive(Default)]
pub struct LoggingCacheListener;

impl LoggingCacheListener {
    fn check_utilization(cache: &dyn CacheInfo) {
        let max_size = cache.max_size();
        if max_size > 0 && cache.size() as f64 >= max_size as f64 * 0.95 {
            log::warn!(
                "Cache {} is 95% full, consider extending its max_size ({}).",
                cache.name(),
                max_size
            );
        }
    }
}

impl<K: std::fmt::Debug, V> CacheListener<K, V> for LoggingCacheListener {
    fn on_expire(&self, cache: &dyn CacheInfo, key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        log::debug!("Expired entry {:?} of {}", key, cache.name());
        Ok(())
    }

    fn on_remove(&self, cache: &dyn CacheInfo, key: &K, _value: Option<&V>) -> anyhow::Result<()> {
        log::debug!("Removed entry {:?} of {}", key, cache.name());
        Ok(())
    }

    fn on_put(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) -> anyhow::Result<()> {
        if value.is_some() {
            log::debug!("Put entry {:?} into {}", key, cache.name());
        } else {
            log::debug!("Invalidated entry {:?} of {}", key, cache.name());
        }
        Self::check_utilization(cache);
        Ok(())
    }

    fn on_get(&self, cache: &dyn CacheInfo, key: &K, value: Option<&V>) -> anyhow::Result<()> {
        log::debug!(
            "Get entry {:?} of {} ({})",
            key,
            cache.name(),
            if value.is_some() { "hit" } else { "miss" }
        );
        Ok(())
    }

    fn on_clear_cache(&self, cache: &dyn CacheInfo) -> anyhow::Result<()> {
        log::debug!("Cleared {}", cache.name());
        Ok(())
    }
}
