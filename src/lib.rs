//! A clustered local cache which keeps its values in process memory and only replicates
//! fingerprints.
//!
//! # Introduction
//! Applications running on several nodes often want to cache values which are either large or
//! cannot be serialized at all (think of compiled templates, parsed master data or handles to
//! native resources). Replicating such values is either expensive or impossible. Still, once a
//! node changes a value, all other nodes have to drop their outdated copies.
//!
//! Therefore each node keeps its values in a local, size constrained LRU store. Whenever a value
//! is written, only its SHA-256 digest is published via a cheap, replicated
//! [FingerprintChannel](channel::FingerprintChannel). Peers compare the received digest with the
//! one of their own copy: equal digests leave the copy untouched, different ones invalidate it.
//! Not invalidating equal values is what keeps two nodes which load the same value from
//! invalidating each other forever. See [invalidation] for the details of this protocol.
//!
//! # Features
//! * **Synchronous and asynchronous publishing**: An [InvalidationCache](invalidation::InvalidationCache)
//!   publishes each change before returning and reports channel failures. An
//!   [AsyncInvalidationCache](invalidation::AsyncInvalidationCache) writes locally and publishes
//!   in the background.
//! * **Listeners** can observe all changes of a cache, including those triggered by peers. A
//!   failing listener never affects the cache operation itself.
//! * **Reload-aware config facility**: A [CacheService](service::CacheService) creates all caches
//!   from the system [Config](config::Config) and applies changes without a restart.
//! * **Pluggable transports**: Any replicated store can serve as channel by implementing
//!   [FingerprintChannel](channel::FingerprintChannel). A [MemoryCluster](channel::MemoryCluster)
//!   is provided for tests and single process setups.
//!
//! # Examples
//! ```
//! # use std::sync::Arc;
//! # use invalidation_cache::cache::Cache;
//! # use invalidation_cache::channel::{ChannelFactory, MemoryCluster};
//! # use invalidation_cache::config::CacheConfig;
//! # use invalidation_cache::invalidation::InvalidationCache;
//! let cluster = MemoryCluster::<String>::new();
//! let config = CacheConfig::new("users", 1024);
//! let node_a = InvalidationCache::<String, String>::new(&config, cluster.join().open("users").unwrap());
//! let node_b = InvalidationCache::<String, String>::new(&config, cluster.join().open("users").unwrap());
//!
//! node_a.put("42".to_owned(), "John".to_owned()).unwrap();
//! node_b.put("42".to_owned(), "John".to_owned()).unwrap();
//!
//! // Both nodes wrote the same value, so both copies remain...
//! assert_eq!(node_a.get(&"42".to_owned()).unwrap(), Some("John".to_owned()));
//!
//! // ...but a different value invalidates the copy of the peer.
//! node_b.put("42".to_owned(), "Jane".to_owned()).unwrap();
//! assert_eq!(node_a.get(&"42".to_owned()).unwrap(), None);
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod fmt;
pub mod invalidation;
pub mod listeners;
pub mod service;
pub mod store;

/// Initializes the logging system.
///
/// This can safely be invoked several times, only the first call has an effect.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests might initialize the logging system several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Executes an async block within `tokio::spawn` and drops the resulting join handle.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate invalidation_cache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
