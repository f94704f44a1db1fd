//! Provides an in-process cluster which replicates fingerprints between its nodes.
//!
//! Each node which [joins](MemoryCluster::join) the cluster keeps its own replica per namespace.
//! Changes are applied to the replica of the publishing node right away. Peers either receive
//! them immediately (within the publishing call) or once [deliver](MemoryCluster::deliver) is
//! invoked. The latter permits to interleave notifications with local operations in a controlled
//! manner.
//!
//! Everything handed to the cluster is recorded as encoded frame, so that one can verify what
//! would actually have been sent over the wire.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::cache::CacheKey;
use crate::channel::{
    ChannelEvent, ChannelFactory, FingerprintChannel, Origin, RemoteChangeHandler, Subscription,
};
use crate::fingerprint::{Digest, DIGEST_LENGTH};

/// Enumerates the operations recorded by a [MemoryCluster](MemoryCluster).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// A digest was put.
    Put,
    /// A key was removed.
    Remove,
    /// A namespace was cleared.
    Clear,
    /// A key was evicted from the replica of the publishing node only.
    Evict,
}

/// Represents an operation which has been handed to the cluster.
#[derive(Clone, Debug)]
pub struct PublishedFrame<K> {
    /// The namespace of the channel.
    pub namespace: String,
    /// The id of the publishing node.
    pub node: usize,
    /// The kind of operation.
    pub operation: Operation,
    /// The affected key (if any).
    pub key: Option<K>,
    /// The payload as it would be sent over the wire.
    pub frame: Bytes,
}

/// Provides a cluster of nodes which all live in the current process.
///
/// # Examples
/// ```
/// # use invalidation_cache::channel::{ChannelFactory, FingerprintChannel, MemoryCluster};
/// # use invalidation_cache::fingerprint::Digest;
/// let cluster = MemoryCluster::<String>::new();
/// let node_a = cluster.join().open("users").unwrap();
/// let node_b = cluster.join().open("users").unwrap();
///
/// node_a.put("x".to_owned(), Digest::of("v1")).unwrap();
/// assert_eq!(node_b.get(&"x".to_owned()).unwrap(), Some(Digest::of("v1")));
/// ```
pub struct MemoryCluster<K> {
    state: Arc<ClusterState<K>>,
}

impl<K> Clone for MemoryCluster<K> {
    fn clone(&self) -> Self {
        MemoryCluster {
            state: self.state.clone(),
        }
    }
}

struct ClusterState<K> {
    manual_delivery: bool,
    available: AtomicBool,
    next_node: AtomicUsize,
    next_subscription: AtomicUsize,
    namespaces: Mutex<HashMap<String, Namespace<K>>>,
    published: Mutex<Vec<PublishedFrame<K>>>,
    pending: Mutex<VecDeque<Notification<K>>>,
}

struct Namespace<K> {
    replicas: HashMap<usize, HashMap<K, Bytes>>,
    subscribers: Vec<Subscriber<K>>,
}

struct Subscriber<K> {
    id: usize,
    node: usize,
    handler: RemoteChangeHandler<K>,
}

struct Notification<K> {
    namespace: String,
    node: usize,
    origin: Origin,
    event: ChannelEvent<K>,
    frame: Bytes,
}

impl<K: CacheKey> Default for MemoryCluster<K> {
    fn default() -> Self {
        MemoryCluster::new()
    }
}

impl<K: CacheKey> MemoryCluster<K> {
    /// Creates a cluster which delivers all changes to all nodes before a publishing call returns.
    pub fn new() -> Self {
        MemoryCluster::create(false)
    }

    /// Creates a cluster which only delivers changes to peers once [deliver](MemoryCluster::deliver)
    /// is invoked.
    pub fn with_manual_delivery() -> Self {
        MemoryCluster::create(true)
    }

    fn create(manual_delivery: bool) -> Self {
        MemoryCluster {
            state: Arc::new(ClusterState {
                manual_delivery,
                available: AtomicBool::new(true),
                next_node: AtomicUsize::new(1),
                next_subscription: AtomicUsize::new(1),
                namespaces: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Adds a new node to the cluster.
    pub fn join(&self) -> MemoryNode<K> {
        MemoryNode {
            id: self.state.next_node.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
        }
    }

    /// Delivers all pending changes to their nodes and returns the number of notifications.
    pub fn deliver(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.pending.lock().unwrap().pop_front();
            match next {
                Some(notification) => {
                    self.state.apply(notification);
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }

    /// Returns the number of notifications waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.state.pending.lock().unwrap().len()
    }

    /// Returns all operations which have been handed to the cluster so far.
    pub fn published(&self) -> Vec<PublishedFrame<K>> {
        self.state.published.lock().unwrap().clone()
    }

    /// Returns the number of recorded operations of the given kind.
    pub fn count(&self, operation: Operation) -> usize {
        self.state
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.operation == operation)
            .count()
    }

    /// Returns the number of handlers subscribed to the given namespace (on all nodes).
    pub fn subscribers(&self, namespace: &str) -> usize {
        self.state
            .namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .map(|namespace| namespace.subscribers.len())
            .unwrap_or(0)
    }

    /// Makes the cluster (un)reachable for all nodes.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Drops the digest for the given key on all nodes, as the eviction policy of a real
    /// replicated store would do.
    pub fn expire(&self, namespace: &str, key: &K) {
        for node in self.state.nodes(namespace) {
            self.state.apply(Notification {
                namespace: namespace.to_owned(),
                node,
                origin: Origin::Remote,
                event: ChannelEvent::Expire { key: key.clone() },
                frame: Bytes::new(),
            });
        }
    }
}

impl<K: CacheKey> ClusterState<K> {
    fn nodes(&self, namespace: &str) -> Vec<usize> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .map(|namespace| namespace.replicas.keys().copied().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("The cluster is currently not reachable."))
        }
    }

    fn publish(
        &self,
        namespace: &str,
        origin_node: usize,
        operation: Operation,
        event: ChannelEvent<K>,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        self.check_available()?;

        self.published.lock().unwrap().push(PublishedFrame {
            namespace: namespace.to_owned(),
            node: origin_node,
            operation,
            key: match &event {
                ChannelEvent::Put { key, .. }
                | ChannelEvent::Remove { key }
                | ChannelEvent::Expire { key } => Some(key.clone()),
                ChannelEvent::Clear => None,
            },
            frame: frame.clone(),
        });

        for node in self.nodes(namespace) {
            let notification = Notification {
                namespace: namespace.to_owned(),
                node,
                origin: if node == origin_node {
                    Origin::Local
                } else {
                    Origin::Remote
                },
                event: event.clone(),
                frame: frame.clone(),
            };

            if self.manual_delivery && node != origin_node {
                self.pending.lock().unwrap().push_back(notification);
            } else {
                self.apply(notification);
            }
        }

        Ok(())
    }

    fn apply(&self, notification: Notification<K>) {
        let handlers: Vec<RemoteChangeHandler<K>> = {
            let mut namespaces = self.namespaces.lock().unwrap();
            let namespace = match namespaces.get_mut(&notification.namespace) {
                Some(namespace) => namespace,
                None => return,
            };

            let replica = namespace.replicas.entry(notification.node).or_default();
            match &notification.event {
                ChannelEvent::Put { key, .. } => {
                    let _ = replica.insert(key.clone(), notification.frame.clone());
                }
                ChannelEvent::Remove { key } | ChannelEvent::Expire { key } => {
                    let _ = replica.remove(key);
                }
                ChannelEvent::Clear => replica.clear(),
            }

            namespace
                .subscribers
                .iter()
                .filter(|subscriber| subscriber.node == notification.node)
                .map(|subscriber| subscriber.handler.clone())
                .collect()
        };

        // Handlers are invoked without holding any lock, as they will most probably call back
        // into the cluster...
        for handler in handlers {
            handler(notification.event.clone(), notification.origin);
        }
    }
}

/// Represents a member of a [MemoryCluster](MemoryCluster).
pub struct MemoryNode<K> {
    id: usize,
    state: Arc<ClusterState<K>>,
}

impl<K> MemoryNode<K> {
    /// Returns the id of this node within its cluster.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<K: CacheKey> ChannelFactory<K> for MemoryNode<K> {
    fn open(&self, namespace: &str) -> anyhow::Result<Arc<dyn FingerprintChannel<K>>> {
        let _ = self
            .state
            .namespaces
            .lock()
            .unwrap()
            .entry(namespace.to_owned())
            .or_insert_with(|| Namespace {
                replicas: HashMap::new(),
                subscribers: Vec::new(),
            })
            .replicas
            .entry(self.id)
            .or_default();

        Ok(Arc::new(MemoryChannel {
            namespace: namespace.to_owned(),
            node: self.id,
            state: self.state.clone(),
        }))
    }
}

struct MemoryChannel<K> {
    namespace: String,
    node: usize,
    state: Arc<ClusterState<K>>,
}

impl<K: CacheKey> FingerprintChannel<K> for MemoryChannel<K> {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get(&self, key: &K) -> anyhow::Result<Option<Digest>> {
        self.state.check_available()?;

        let frame = self
            .state
            .namespaces
            .lock()
            .unwrap()
            .get(&self.namespace)
            .and_then(|namespace| namespace.replicas.get(&self.node))
            .and_then(|replica| replica.get(key).cloned());

        match frame {
            Some(frame) => Ok(Some(Digest::decode(&frame)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: K, digest: Digest) -> anyhow::Result<()> {
        let mut buffer = BytesMut::with_capacity(DIGEST_LENGTH);
        digest.encode_into(&mut buffer);

        self.state.publish(
            &self.namespace,
            self.node,
            Operation::Put,
            ChannelEvent::Put { key, digest },
            buffer.freeze(),
        )
    }

    fn remove(&self, key: &K) -> anyhow::Result<()> {
        self.state.publish(
            &self.namespace,
            self.node,
            Operation::Remove,
            ChannelEvent::Remove { key: key.clone() },
            Bytes::new(),
        )
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.state.publish(
            &self.namespace,
            self.node,
            Operation::Clear,
            ChannelEvent::Clear,
            Bytes::new(),
        )
    }

    fn evict_local(&self, key: &K) -> anyhow::Result<()> {
        if let Some(replica) = self
            .state
            .namespaces
            .lock()
            .unwrap()
            .get_mut(&self.namespace)
            .and_then(|namespace| namespace.replicas.get_mut(&self.node))
        {
            let _ = replica.remove(key);
        }

        self.state.published.lock().unwrap().push(PublishedFrame {
            namespace: self.namespace.clone(),
            node: self.node,
            operation: Operation::Evict,
            key: Some(key.clone()),
            frame: Bytes::new(),
        });

        Ok(())
    }

    fn subscribe(&self, handler: RemoteChangeHandler<K>) -> Subscription {
        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst);
        match self.state.namespaces.lock().unwrap().get_mut(&self.namespace) {
            Some(namespace) => namespace.subscribers.push(Subscriber {
                id,
                node: self.node,
                handler,
            }),
            None => return Subscription::detached(),
        }

        let state = Arc::downgrade(&self.state);
        let namespace = self.namespace.clone();
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Some(namespace) = state.namespaces.lock().unwrap().get_mut(&namespace) {
                    namespace.subscribers.retain(|subscriber| subscriber.id != id);
                }
            }
        })
    }
}
