//! Defines the cluster wide fingerprint channel used to invalidate stale copies on peer nodes.
//!
//! A [FingerprintChannel](FingerprintChannel) is a replicated key value store which only ever
//! keeps the [Digest](crate::fingerprint::Digest) of a value per key. Its API is typed on digests
//! so that a value can never be handed to the transport by accident. Transport, encoding and
//! cluster membership are up to the implementation.
//!
//! Changes are pushed to subscribers via a [RemoteChangeHandler](RemoteChangeHandler). Each
//! coordinator subscribes exactly once, when it is created, and keeps the returned
//! [Subscription](Subscription) until it is dropped itself. The handler is invoked for local and
//! remote changes alike, the [Origin](Origin) tells them apart. Implementations may invoke it from
//! any thread, but must never hold an internal lock while doing so, as the handler will most
//! probably call back into the channel.
//!
//! [MemoryCluster](MemoryCluster) provides an in-process implementation which replicates between
//! all nodes which joined it.
use std::sync::Arc;

use crate::fingerprint::Digest;

mod memory;

pub use memory::{MemoryCluster, MemoryNode, Operation, PublishedFrame};

/// Describes where a change to the channel originated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The change was performed via this node (via the channel which delivers the event).
    Local,
    /// The change was performed by another node.
    Remote,
}

/// Enumerates the changes reported by a fingerprint channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent<K> {
    /// A digest was stored for the given key.
    Put {
        /// The affected key.
        key: K,
        /// The newly stored digest.
        digest: Digest,
    },
    /// The digest for the given key was removed.
    Remove {
        /// The affected key.
        key: K,
    },
    /// The digest for the given key was dropped by the eviction policy of the channel.
    Expire {
        /// The affected key.
        key: K,
    },
    /// All digests of the namespace were removed.
    Clear,
}

/// Represents the callback which is notified about all changes of a channel.
pub type RemoteChangeHandler<K> = Arc<dyn Fn(ChannelEvent<K>, Origin) + Send + Sync>;

/// Keeps a [RemoteChangeHandler](RemoteChangeHandler) registered with its channel.
///
/// Dropping the subscription removes the handler. Therefore it is kept by whoever owns the state
/// the handler operates on.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription which invokes the given closure once it is dropped.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a subscription which doesn't need to be cancelled, e.g. for channels which never
    /// outlive their only subscriber.
    pub fn detached() -> Self {
        Subscription { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Describes a replicated store of fingerprints, bound to a single namespace (cache).
///
/// # Errors
/// All operations which talk to the cluster report an error if it cannot be reached. These are
/// turned into [CacheError::ChannelUnavailable](crate::error::CacheError::ChannelUnavailable)
/// by the caches.
pub trait FingerprintChannel<K>: Send + Sync {
    /// Returns the namespace this channel is bound to.
    fn namespace(&self) -> &str;

    /// Returns the digest currently known for the given key.
    fn get(&self, key: &K) -> anyhow::Result<Option<Digest>>;

    /// Stores the digest for the given key on all nodes.
    fn put(&self, key: K, digest: Digest) -> anyhow::Result<()>;

    /// Stores all given digests on all nodes.
    fn put_batch(&self, entries: Vec<(K, Digest)>) -> anyhow::Result<()> {
        for (key, digest) in entries {
            self.put(key, digest)?;
        }

        Ok(())
    }

    /// Stores all given digests without waiting for the replication to complete.
    ///
    /// By default, this simply delegates to [put_batch](FingerprintChannel::put_batch).
    fn put_batch_async(&self, entries: Vec<(K, Digest)>) -> anyhow::Result<()> {
        self.put_batch(entries)
    }

    /// Removes the digest for the given key on all nodes.
    fn remove(&self, key: &K) -> anyhow::Result<()>;

    /// Removes all digests of the namespace on all nodes.
    fn clear(&self) -> anyhow::Result<()>;

    /// Drops the digest for the given key on this node only.
    fn evict_local(&self, _key: &K) -> anyhow::Result<()> {
        Ok(())
    }

    /// Registers the handler which is notified about all changes.
    ///
    /// The handler remains registered until the returned subscription is dropped.
    #[must_use]
    fn subscribe(&self, handler: RemoteChangeHandler<K>) -> Subscription;
}

/// Opens fingerprint channels per namespace.
pub trait ChannelFactory<K>: Send + Sync {
    /// Opens the channel for the given namespace (the name of a cache).
    fn open(&self, namespace: &str) -> anyhow::Result<Arc<dyn FingerprintChannel<K>>>;
}
