//! Manages the caches of an application based on the system configuration.
//!
//! A [CacheService](CacheService) creates each cache as described in the **caches** section of
//! the [Config](crate::config::Config) and keeps them up to date once the config changes: the
//! **max_size** and **live_time** of existing caches are updated in place, whereas a changed
//! **mode**, **concurrency_level**, **label** or **log_enabled** setting re-creates the cache
//! (which therefore starts out empty). Caches which are no longer present in the config are
//! dropped, unless a **default** entry is present, which is then used for them.
//!
//! Note that an invalid config entry never damages an active cache. It is logged and the
//! cache keeps its current settings.
//!
//! # Examples
//! ```
//! # use std::sync::Arc;
//! # use invalidation_cache::channel::MemoryCluster;
//! # use invalidation_cache::config::Config;
//! # use invalidation_cache::service::CacheService;
//! let config = Arc::new(Config::new("settings.yml"));
//! config.load_from_string("
//! caches:
//!     users:
//!         max_size: 1024
//! ", None).unwrap();
//!
//! let cluster = MemoryCluster::<String>::new();
//! let service = CacheService::<String, String>::new(config, Arc::new(cluster.join()));
//! service.apply_config();
//!
//! let users = service.get_cache_instance("users").unwrap();
//! users.put("42".to_owned(), "John".to_owned()).unwrap();
//! assert_eq!(users.get(&"42".to_owned()).unwrap(), Some("John".to_owned()));
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use yaml_rust::Yaml;

use crate::cache::{Cache, CacheInfo, CacheKey, CacheValue};
use crate::channel::ChannelFactory;
use crate::config::{CacheConfig, CacheMode, Config};
use crate::fmt::format_live_time;
use crate::invalidation::{AsyncInvalidationCache, InvalidationCache};
use crate::listeners::LoggingCacheListener;

struct ManagedCache<K: CacheKey, V: CacheValue> {
    config: CacheConfig,
    cache: Arc<dyn Cache<K, V>>,
}

/// Provides all caches of an application.
pub struct CacheService<K: CacheKey, V: CacheValue> {
    config: Arc<Config>,
    factory: Arc<dyn ChannelFactory<K>>,
    caches: Mutex<HashMap<String, ManagedCache<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> CacheService<K, V> {
    /// Creates a new service which reads its settings from the given config and uses the given
    /// factory to open a channel per cache.
    ///
    /// Note that no cache is created until either [apply_config](CacheService::apply_config) or
    /// [get_cache_instance](CacheService::get_cache_instance) is invoked.
    pub fn new(config: Arc<Config>, factory: Arc<dyn ChannelFactory<K>>) -> Self {
        CacheService {
            config,
            factory,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Applies the current config and re-applies it whenever the config changes.
    ///
    /// The background task stops once the service is dropped.
    pub fn install(self: &Arc<Self>) {
        self.apply_config();

        let service = Arc::downgrade(self);
        let mut config_changed = self.config.notifier();
        crate::spawn!(async move {
            loop {
                match config_changed.recv().await {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        match service.upgrade() {
                            Some(service) => service.apply_config(),
                            None => return,
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Creates, updates or drops caches so that they match the current config.
    ///
    /// If the config contains no **caches** section at all, all caches are left untouched. This
    /// prevents the system from wiping all caches due to an accidental change.
    pub fn apply_config(&self) {
        let handle = self.config.current();
        let settings = match &handle.config()["caches"] {
            Yaml::Hash(settings) => settings,
            _ => {
                log::info!("Config does not contain a 'caches' object. Skipping config update.");
                return;
            }
        };
        let default = settings.get(&Yaml::String("default".to_owned()));

        let mut caches = self.caches.lock().unwrap();
        let mut result = HashMap::new();

        for (name, config) in settings {
            if let Some(name) = name.as_str().filter(|name| *name != "default") {
                let current = caches.remove(name);
                if let Some(cache) = self.create_or_update(name, current, config) {
                    let _ = result.insert(name.to_owned(), cache);
                }
            }
        }

        for (name, current) in caches.drain() {
            match default {
                Some(default) => {
                    if let Some(cache) = self.create_or_update(&name, Some(current), default) {
                        let _ = result.insert(name, cache);
                    }
                }
                None => log::info!("Dropping stale cache {}...", name),
            }
        }

        *caches = result;
    }

    /// Creates or updates the named cache.
    ///
    /// In case of an invalid config, the current cache (if any) is returned untouched.
    fn create_or_update(
        &self,
        name: &str,
        current: Option<ManagedCache<K, V>>,
        config: &Yaml,
    ) -> Option<ManagedCache<K, V>> {
        let config = match CacheConfig::from_yaml(name, config) {
            Ok(config) => config,
            Err(error) => {
                log::error!("Not going to create or update {}: {}", name, error);
                return current;
            }
        };

        match current {
            Some(current) if can_be_updated(&current.config, &config) => {
                Some(update_cache(current, config))
            }
            current => {
                log::info!("Creating cache {}...", name);
                match self.create(config) {
                    Ok(cache) => Some(cache),
                    Err(error) => {
                        log::error!("Failed to create cache {}: {}", name, error);
                        current
                    }
                }
            }
        }
    }

    fn create(&self, config: CacheConfig) -> anyhow::Result<ManagedCache<K, V>> {
        let channel = self.factory.open(&config.name)?;
        let cache: Arc<dyn Cache<K, V>> = match config.mode {
            CacheMode::Invalidation => Arc::new(InvalidationCache::new(&config, channel)),
            CacheMode::AsyncInvalidation => Arc::new(AsyncInvalidationCache::new(&config, channel)?),
        };

        if config.log_enabled {
            cache.add_cache_listener(Arc::new(LoggingCacheListener));
        }

        Ok(ManagedCache { config, cache })
    }

    /// Returns the cache with the given name.
    ///
    /// Caches which aren't known yet are created on demand, using either their own config
    /// entry or the **default** one.
    ///
    /// # Errors
    /// Fails if there is no config for the cache or if its config is invalid.
    pub fn get_cache_instance(&self, name: &str) -> anyhow::Result<Arc<dyn Cache<K, V>>> {
        let mut caches = self.caches.lock().unwrap();
        if let Some(managed) = caches.get(name) {
            return Ok(managed.cache.clone());
        }

        let config = CacheConfig::lookup(&self.config.current(), name)?.ok_or_else(|| {
            anyhow::anyhow!(
                "Neither 'caches.{}' nor 'caches.default' is present in the config.",
                name
            )
        })?;

        log::info!("Creating cache {}...", name);
        let managed = self.create(config)?;
        let cache = managed.cache.clone();
        let _ = caches.insert(name.to_owned(), managed);

        Ok(cache)
    }

    /// Returns all caches which have been created so far, sorted by name.
    pub fn all_cache_instances(&self) -> Vec<Arc<dyn Cache<K, V>>> {
        let caches = self.caches.lock().unwrap();
        let mut names: Vec<&String> = caches.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| caches.get(name))
            .map(|managed| managed.cache.clone())
            .collect()
    }

    /// Renders a table listing all caches along with their metrics.
    pub fn stats(&self) -> String {
        let mut result = String::new();

        result += format!(
            "{:<30} {:>12} {:>12} {:>12} {:>12} {:>12} {:>16}\n",
            "Name", "Num Entries", "Max Entries", "Hits", "Misses", "Hit Rate", "Live Time"
        )
        .as_str();
        result += SEPARATOR;

        for cache in self.all_cache_instances() {
            result += format!(
                "{:<30} {:>12} {:>12} {:>12} {:>12} {:>10.2} % {:>16}\n",
                cache.label(),
                cache.size(),
                cache.max_size(),
                cache.cache_hit(),
                cache.cache_miss(),
                cache.store_metrics().hit_rate,
                format_live_time(cache.live_time())
            )
            .as_str();
        }
        result += SEPARATOR;

        result
    }

    /// Renders the detailed metrics of the given cache.
    ///
    /// In contrast to [get_cache_instance](CacheService::get_cache_instance) this never creates
    /// a cache but fails for unknown names.
    pub fn cache_stats(&self, name: &str) -> anyhow::Result<String> {
        let cache = self
            .caches
            .lock()
            .unwrap()
            .get(name)
            .map(|managed| managed.cache.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown cache: {}", name))?;
        let metrics = cache.store_metrics();

        let mut result = String::new();

        result += format!("{:<30} {:>20}\n", "Num Entries", cache.size()).as_str();
        result += format!("{:<30} {:>20}\n", "Max Entries", cache.max_size()).as_str();
        result += format!("{:<30} {:>18.2} %\n", "Utilization", metrics.utilization).as_str();
        result += format!("{:<30} {:>20}\n", "Segments", metrics.segments).as_str();
        result += format!(
            "{:<30} {:>20}\n",
            "Live Time",
            format_live_time(cache.live_time())
        )
        .as_str();
        result += format!("{:<30} {:>20}\n", "Reads", metrics.reads).as_str();
        result += format!("{:<30} {:>20}\n", "Writes", metrics.writes).as_str();
        result += format!("{:<30} {:>18.2} %\n", "Hit Rate", metrics.hit_rate).as_str();
        result += format!("{:<30} {:>20}\n", "Hits", cache.cache_hit()).as_str();
        result += format!("{:<30} {:>20}\n", "Misses", cache.cache_miss()).as_str();

        Ok(result)
    }
}

const SEPARATOR: &str =
    "--------------------------------------------------------------------------------------------------------------\n";

/// Determines if the given cache can be re-configured in place.
fn can_be_updated(current: &CacheConfig, config: &CacheConfig) -> bool {
    current.mode == config.mode
        && current.concurrency_level == config.concurrency_level
        && current.label == config.label
        && current.log_enabled == config.log_enabled
}

fn update_cache<K: CacheKey, V: CacheValue>(
    mut managed: ManagedCache<K, V>,
    config: CacheConfig,
) -> ManagedCache<K, V> {
    if managed.config.max_size != config.max_size {
        log::info!(
            "Updating the max_size of {} from {} to {}.",
            config.name,
            managed.config.max_size,
            config.max_size
        );
        managed.cache.set_max_size(config.max_size);
    }

    if managed.config.live_time != config.live_time {
        log::info!(
            "Updating the live_time of {} from {} to {}.",
            config.name,
            format_live_time(managed.config.live_time),
            format_live_time(config.live_time)
        );
        managed.cache.set_live_time(config.live_time);
    }

    managed.config = config;
    managed
}

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheInfo};
    use crate::channel::MemoryCluster;
    use crate::config::Config;
    use crate::service::CacheService;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(data: &str) -> (Arc<Config>, CacheService<String, String>) {
        let config = Arc::new(Config::new("test.yml"));
        config.load_from_string(data, None).unwrap();

        let cluster = MemoryCluster::new();
        let service = CacheService::new(config.clone(), Arc::new(cluster.join()));
        service.apply_config();

        (config, service)
    }

    fn key(name: &str) -> String {
        name.to_owned()
    }

    #[test]
    fn caches_are_created_from_the_config() {
        let (_, service) = service(
            "
caches:
    users:
        max_size: 100
    orders:
        max_size: 10
        live_time: 1h
",
        );

        let caches = service.all_cache_instances();
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].name(), "orders");
        assert_eq!(caches[0].live_time(), Some(Duration::from_secs(60 * 60)));
        assert_eq!(caches[1].name(), "users");
        assert_eq!(caches[1].max_size(), 100);
    }

    #[test]
    fn existing_caches_are_updated_in_place() {
        let (config, service) = service("caches:\n  users:\n    max_size: 100\n");
        let users = service.get_cache_instance("users").unwrap();
        users.put(key("1"), "John".to_owned()).unwrap();

        config
            .load_from_string("caches:\n  users:\n    max_size: 50\n    live_time: 1h\n", None)
            .unwrap();
        service.apply_config();

        let updated = service.get_cache_instance("users").unwrap();
        assert_eq!(Arc::ptr_eq(&users, &updated), true);
        assert_eq!(updated.max_size(), 50);
        assert_eq!(updated.live_time(), Some(Duration::from_secs(60 * 60)));
        assert_eq!(updated.get(&key("1")).unwrap(), Some("John".to_owned()));
    }

    #[test]
    fn structural_changes_recreate_caches() {
        let (config, service) =
            service("caches:\n  users:\n    max_size: 100\n    concurrency_level: 2\n");
        let users = service.get_cache_instance("users").unwrap();
        users.put(key("1"), "John".to_owned()).unwrap();

        config
            .load_from_string("caches:\n  users:\n    max_size: 100\n    concurrency_level: 4\n", None)
            .unwrap();
        service.apply_config();

        let recreated = service.get_cache_instance("users").unwrap();
        assert_eq!(Arc::ptr_eq(&users, &recreated), false);
        assert_eq!(recreated.get(&key("1")).unwrap(), None);
    }

    #[test]
    fn invalid_entries_leave_active_caches_untouched() {
        let (config, service) = service("caches:\n  users:\n    max_size: 100\n");
        let users = service.get_cache_instance("users").unwrap();

        config
            .load_from_string("caches:\n  users:\n    max_size: -1\n", None)
            .unwrap();
        service.apply_config();
        let current = service.get_cache_instance("users").unwrap();
        assert_eq!(Arc::ptr_eq(&users, &current), true);
        assert_eq!(current.max_size(), 100);

        // A config without any "caches" is ignored entirely...
        config.load_from_string("other: 42", None).unwrap();
        service.apply_config();
        assert_eq!(service.all_cache_instances().len(), 1);
    }

    #[test]
    fn removed_caches_are_dropped() {
        let (config, service) =
            service("caches:\n  users:\n    max_size: 100\n  orders:\n    max_size: 100\n");

        config
            .load_from_string("caches:\n  users:\n    max_size: 100\n", None)
            .unwrap();
        service.apply_config();

        let caches = service.all_cache_instances();
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].name(), "users");
    }

    #[test]
    fn unknown_caches_are_created_from_the_default() {
        let (config, service) = service("caches:\n  default:\n    max_size: 8\n");

        let orders = service.get_cache_instance("orders").unwrap();
        assert_eq!(orders.max_size(), 8);
        assert_eq!(Arc::ptr_eq(&orders, &service.get_cache_instance("orders").unwrap()), true);

        // Caches created from the default survive a reload as long as there is a default...
        config
            .load_from_string("caches:\n  default:\n    max_size: 16\n", None)
            .unwrap();
        service.apply_config();
        assert_eq!(service.get_cache_instance("orders").unwrap().max_size(), 16);

        config.load_from_string("caches:\n  users:\n    max_size: 1\n", None).unwrap();
        service.apply_config();
        assert_eq!(service.get_cache_instance("orders").is_err(), true);
    }

    #[test]
    fn stats_list_all_caches() {
        let (_, service) = service(
            "caches:\n  com.example.accounting.invoices.by-customer:\n    max_size: 100\n",
        );
        let cache = service
            .get_cache_instance("com.example.accounting.invoices.by-customer")
            .unwrap();
        let _ = cache.get(&key("1")).unwrap();

        let stats = service.stats();
        assert_eq!(stats.contains("by-customer"), true);
        assert_eq!(stats.contains("unlimited"), true);
    }

    #[test]
    fn recreated_caches_detach_from_their_channel() {
        let config = Arc::new(Config::new("test.yml"));
        config
            .load_from_string("caches:\n  users:\n    max_size: 100\n", None)
            .unwrap();
        let cluster = MemoryCluster::new();
        let service = CacheService::<String, String>::new(config.clone(), Arc::new(cluster.join()));
        service.apply_config();
        assert_eq!(cluster.subscribers("users"), 1);

        for level in 1..5 {
            config
                .load_from_string(
                    &format!(
                        "caches:\n  users:\n    max_size: 100\n    concurrency_level: {}\n",
                        level
                    ),
                    None,
                )
                .unwrap();
            service.apply_config();
        }
        assert_eq!(cluster.subscribers("users"), 1);

        // Dropped caches detach as well...
        config.load_from_string("caches: {}\n", None).unwrap();
        service.apply_config();
        assert_eq!(service.all_cache_instances().len(), 0);
        assert_eq!(cluster.subscribers("users"), 0);
    }

    #[test]
    fn cache_stats_report_the_store_metrics() {
        let (_, service) = service("caches:\n  users:\n    max_size: 4\n    concurrency_level: 2\n");
        let users = service.get_cache_instance("users").unwrap();
        users.put(key("1"), "John".to_owned()).unwrap();
        users.put(key("2"), "Jane".to_owned()).unwrap();
        let _ = users.get(&key("1")).unwrap();
        let _ = users.get(&key("3")).unwrap();

        let metrics = users.store_metrics();
        assert_eq!(metrics.writes, 2);
        assert_eq!(metrics.reads, 2);
        assert_eq!(metrics.hit_rate.round() as i32, 50);
        assert_eq!(metrics.utilization.round() as i32, 50);
        assert_eq!(metrics.segments, 2);

        let stats = service.cache_stats("users").unwrap();
        assert_eq!(stats.contains("Utilization"), true);
        assert_eq!(stats.contains("50.00 %"), true);
        assert_eq!(service.stats().contains("50.00 %"), true);

        // Unknown caches are reported instead of being created...
        assert_eq!(service.cache_stats("unknown").is_err(), true);
        assert_eq!(service.all_cache_instances().len(), 1);
    }

    #[test]
    fn installed_services_follow_config_changes() {
        crate::testing::test_async(async {
            let config = Arc::new(Config::new("test.yml"));
            config
                .load_from_string("caches:\n  users:\n    max_size: 100\n", None)
                .unwrap();
            let cluster = MemoryCluster::new();
            let service = Arc::new(CacheService::<String, String>::new(
                config.clone(),
                Arc::new(cluster.join()),
            ));
            service.install();
            let users = service.get_cache_instance("users").unwrap();

            config
                .load_from_string(
                    "caches:\n  users:\n    max_size: 100\n    mode: async-invalidation\n",
                    None,
                )
                .unwrap();

            // Give the background task a chance to pick up the change...
            let mut attempts = 0;
            while Arc::ptr_eq(&users, &service.get_cache_instance("users").unwrap())
                && attempts < 100
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
                attempts += 1;
            }

            assert_eq!(
                Arc::ptr_eq(&users, &service.get_cache_instance("users").unwrap()),
                false
            );
        });
    }
}
