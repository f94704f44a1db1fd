//! Contains the system configuration and the settings of each cache.
//!
//! The configuration is a YAML file which is observed for changes and re-loaded once its
//! modification date changes. Each user of the config should therefore attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received. A [CacheService](crate::service::CacheService) does exactly this for all of its
//! caches.
//!
//! Note that a [Handle](Handle) obtained via **Config::current()** should not be stored, as it
//! will not be updated once a new config has been loaded.
//!
//! # Cache settings
//! All caches are configured in a map named **caches**:
//!
//! ```yaml
//! caches:
//!     users:
//!         # Specifies the maximal number of entries to keep in local memory.
//!         max_size: 1024
//!         # Specifies how long an entry is kept. Supports common suffixes like ms, s, m, h, d.
//!         # Use "0" to store nothing at all or "-1" (the default) to never expire entries.
//!         live_time: 15m
//!         # Specifies the number of segments used to store the entries (defaults to the number
//!         # of CPUs).
//!         concurrency_level: 4
//!         # Enables logging of all cache operations.
//!         log_enabled: false
//!         # Either "invalidation" (the default) or "async-invalidation".
//!         mode: invalidation
//!     # Used by all caches which have no own entry...
//!     default:
//!         max_size: 128
//! ```
//!
//! # Examples
//!
//! ```
//! # use invalidation_cache::config::{CacheConfig, Config};
//! let config = Config::new("somefile.yml");
//! config.load_from_string("
//! caches:
//!     users:
//!         max_size: 1024
//!         live_time: 15m
//! ", None).unwrap();
//!
//! assert_eq!(config.current().query("caches.users.max_size").as_i64(), Some(1024));
//!
//! let users = CacheConfig::lookup(&config.current(), "users").unwrap().unwrap();
//! assert_eq!(users.max_size, 1024);
//! ```
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::parse_live_time;

/// Provides access to the system configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The message itself carries no
/// information, all that matters is that the config has changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this neither loads the file nor installs a change listener. Use
    /// [install](install) for this.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// Within docker, the file is presented as volume. An unmounted volume shows up as directory,
    /// therefore only files are considered.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// If the file is missing, the current config is left untouched.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if metadata.is_file() => (),
            _ => {
                log::info!(
                    "Config file {} doesn't exist or is an unmounted volume - skipping config load.",
                    &self.filename
                );
                return Ok(());
            }
        }

        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .map_err(|error| {
                anyhow::anyhow!("Cannot load config file {}: {}", &self.filename, error)
            })?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// Invalid YAML is rejected, in which case the previously loaded config remains active.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let doc = match docs.into_iter().next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Hash(Default::default()),
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a path like "caches.users.max_size" against the loaded configuration.
    ///
    /// Yields **Yaml::BadValue** if any part of the path is missing.
    pub fn query(&self, query: impl AsRef<str>) -> &Yaml {
        query
            .as_ref()
            .split('.')
            .filter(|key| !key.is_empty())
            .fold(&self.config.0, |element, key| &element[key])
    }
}

/// Creates a **Config** for the given file, loads it and installs a change listener.
///
/// The listener checks the "last modified" date of the file every two seconds and re-loads it
/// once it changed. It doesn't perform a structural comparison, therefore each config user has
/// to gracefully handle partial changes. The listener stops once the returned config is dropped.
pub async fn install(file: &str) -> Arc<Config> {
    let config = Arc::new(Config::new(file));

    if let Err(error) = config.load().await {
        log::error!("{}", error);
    }

    run_config_change_monitor(Arc::downgrade(&config));

    config
}

#[cfg(test)]
fn run_config_change_monitor(_config: Weak<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(weak_config: Weak<Config>) {
    crate::spawn!(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let config = match weak_config.upgrade() {
                Some(config) => config,
                None => return,
            };

            // Reload if a file is present and newer than the one previously loaded (or if none
            // has been loaded so far)...
            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {}", error),
                }
            }
        }
    });
}

/// Determines how a cache talks to its peers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Publishes each change synchronously and reports channel failures to the caller.
    Invalidation,
    /// Publishes changes in the background and only logs channel failures.
    AsyncInvalidation,
}

impl CacheMode {
    fn parse(value: &Yaml) -> anyhow::Result<Self> {
        match value {
            Yaml::BadValue | Yaml::Null => Ok(CacheMode::Invalidation),
            Yaml::String(mode) if mode == "invalidation" => Ok(CacheMode::Invalidation),
            Yaml::String(mode) if mode == "async-invalidation" => Ok(CacheMode::AsyncInvalidation),
            other => Err(anyhow::anyhow!(
                "Unknown mode {:?}. Use 'invalidation' or 'async-invalidation'.",
                other
            )),
        }
    }
}

/// Labels longer than this are shortened to the last part of the cache name.
const MAX_LABEL_LENGTH: usize = 30;

/// Contains the settings of a single cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// The name of the cache, which is also the namespace of its channel.
    pub name: String,
    /// A short name used in logs and statistics.
    pub label: String,
    /// The maximal number of entries kept in local memory.
    pub max_size: usize,
    /// The maximal age of an entry or **None** if entries never expire.
    pub live_time: Option<Duration>,
    /// The number of segments used by the local store.
    pub concurrency_level: usize,
    /// Determines if all operations are logged.
    pub log_enabled: bool,
    /// Determines whether changes are published synchronously or in the background.
    pub mode: CacheMode,
}

impl CacheConfig {
    /// Creates the settings for a cache with the given name and max size using defaults for
    /// everything else.
    pub fn new(name: &str, max_size: usize) -> Self {
        CacheConfig {
            name: name.to_owned(),
            label: label_of(name),
            max_size,
            live_time: None,
            concurrency_level: num_cpus::get(),
            log_enabled: false,
            mode: CacheMode::Invalidation,
        }
    }

    /// Specifies the number of segments of the local store.
    pub fn with_concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.concurrency_level = concurrency_level;
        self
    }

    /// Specifies the maximal age of an entry.
    pub fn with_live_time(mut self, live_time: Option<Duration>) -> Self {
        self.live_time = live_time;
        self
    }

    /// Enables or disables logging of all operations.
    pub fn with_log_enabled(mut self, log_enabled: bool) -> Self {
        self.log_enabled = log_enabled;
        self
    }

    /// Specifies how changes are published.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses the settings of the named cache from the given config element.
    ///
    /// # Examples
    /// ```
    /// # use std::time::Duration;
    /// # use invalidation_cache::config::{CacheConfig, CacheMode};
    /// # use yaml_rust::YamlLoader;
    /// let yaml = &YamlLoader::load_from_str("
    /// max_size: 100
    /// live_time: 1h
    /// mode: async-invalidation
    /// ").unwrap()[0];
    ///
    /// let config = CacheConfig::from_yaml("users", yaml).unwrap();
    /// assert_eq!(config.max_size, 100);
    /// assert_eq!(config.live_time, Some(Duration::from_secs(60 * 60)));
    /// assert_eq!(config.mode, CacheMode::AsyncInvalidation);
    /// ```
    pub fn from_yaml(name: &str, config: &Yaml) -> anyhow::Result<Self> {
        let max_size = config["max_size"]
            .as_i64()
            .filter(|max_size| *max_size > 0)
            .ok_or_else(|| anyhow::anyhow!("A positive 'max_size' is required for {}.", name))?
            as usize;

        let live_time = match &config["live_time"] {
            Yaml::BadValue | Yaml::Null => Ok(None),
            Yaml::Integer(value) => parse_live_time(value.to_string()),
            Yaml::String(value) => parse_live_time(value),
            other => Err(anyhow::anyhow!("Unexpected value {:?}.", other)),
        }
        .map_err(|error| anyhow::anyhow!("Invalid 'live_time' for {}: {}", name, error))?;

        let concurrency_level = config["concurrency_level"]
            .as_i64()
            .filter(|level| *level > 0)
            .map(|level| level as usize)
            .unwrap_or_else(num_cpus::get);

        let mode = CacheMode::parse(&config["mode"])
            .map_err(|error| anyhow::anyhow!("Invalid 'mode' for {}: {}", name, error))?;

        Ok(CacheConfig {
            name: name.to_owned(),
            label: config["label"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| label_of(name)),
            max_size,
            live_time,
            concurrency_level,
            log_enabled: config["log_enabled"].as_bool().unwrap_or(false),
            mode,
        })
    }

    /// Looks up the settings for the named cache in **caches**, falling back to
    /// **caches.default**.
    ///
    /// Yields **None** if neither is present.
    pub fn lookup(handle: &Handle, name: &str) -> anyhow::Result<Option<Self>> {
        let caches = &handle.config()["caches"];
        match (&caches[name], &caches["default"]) {
            (Yaml::BadValue, Yaml::BadValue) => Ok(None),
            (Yaml::BadValue, default) => CacheConfig::from_yaml(name, default).map(Some),
            (config, _) => CacheConfig::from_yaml(name, config).map(Some),
        }
    }
}

fn label_of(name: &str) -> String {
    if name.len() > MAX_LABEL_LENGTH {
        match name.rfind('.') {
            Some(index) => name[index + 1..].to_owned(),
            None => name.to_owned(),
        }
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CacheConfig, CacheMode, Config};
    use std::time::{Duration, SystemTime};
    use yaml_rust::Yaml;

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let config = Config::new("test.yml");
            config
                .load_from_string("test: 42", Some(SystemTime::now()))
                .unwrap();

            // Setup a task which notifies our oneshot channel once the config changes...
            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            crate::spawn!(async move {
                if change_notifier.recv().await.is_ok() {
                    tx.send(()).unwrap();
                }
            });

            // Ensure that a malformed config is simply ignored...
            assert_eq!(
                config
                    .load_from_string("test: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(config.current().query("test").as_i64(), Some(42));

            config
                .load_from_string("test: 4242", Some(SystemTime::now()))
                .unwrap();
            rx.await.unwrap();

            assert_eq!(config.current().query("test").as_i64(), Some(4242));
        });
    }

    #[test]
    fn missing_files_keep_the_current_config() {
        crate::testing::test_async(async {
            let config = Config::new("does-not-exist.yml");
            config.load_from_string("test: 42", None).unwrap();

            assert_eq!(config.load().await.is_ok(), true);
            assert_eq!(config.current().query("test").as_i64(), Some(42));
        });
    }

    #[test]
    fn queries_resolve_nested_paths() {
        let config = Config::new("test.yml");
        config
            .load_from_string("a:\n  b:\n    c: hello", None)
            .unwrap();

        assert_eq!(config.current().query("a.b.c").as_str(), Some("hello"));
        assert_eq!(config.current().query("a.x.c"), &Yaml::BadValue);
    }

    #[test]
    fn cache_configs_are_parsed_with_defaults() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
caches:
    users:
        max_size: 100
        live_time: -1
        log_enabled: true
    expiring:
        max_size: 10
        live_time: 30
        concurrency_level: 3
    dropping:
        max_size: 10
        live_time: 0
",
                None,
            )
            .unwrap();
        let handle = config.current();

        let users = CacheConfig::lookup(&handle, "users").unwrap().unwrap();
        assert_eq!(users.label, "users");
        assert_eq!(users.live_time, None);
        assert_eq!(users.concurrency_level, num_cpus::get());
        assert_eq!(users.log_enabled, true);
        assert_eq!(users.mode, CacheMode::Invalidation);

        let expiring = CacheConfig::lookup(&handle, "expiring").unwrap().unwrap();
        assert_eq!(expiring.live_time, Some(Duration::from_secs(30)));
        assert_eq!(expiring.concurrency_level, 3);

        let dropping = CacheConfig::lookup(&handle, "dropping").unwrap().unwrap();
        assert_eq!(dropping.live_time, Some(Duration::ZERO));

        assert_eq!(CacheConfig::lookup(&handle, "unknown").unwrap(), None);
    }

    #[test]
    fn unknown_caches_fall_back_to_the_default() {
        let config = Config::new("test.yml");
        config
            .load_from_string("caches:\n  default:\n    max_size: 16\n", None)
            .unwrap();

        let fallback = CacheConfig::lookup(&config.current(), "orders").unwrap().unwrap();
        assert_eq!(fallback.name, "orders");
        assert_eq!(fallback.max_size, 16);
    }

    #[test]
    fn invalid_cache_configs_are_rejected() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
caches:
    no_size:
        live_time: 1h
    negative:
        max_size: -5
    bad_ttl:
        max_size: 5
        live_time: 3 years
    bad_mode:
        max_size: 5
        mode: eventual
",
                None,
            )
            .unwrap();
        let handle = config.current();

        for name in ["no_size", "negative", "bad_ttl", "bad_mode"] {
            assert_eq!(CacheConfig::lookup(&handle, name).is_err(), true, "{}", name);
        }
    }

    #[test]
    fn long_names_are_shortened_for_labels() {
        assert_eq!(
            CacheConfig::new("com.example.accounting.invoices.by-customer", 1).label,
            "by-customer"
        );
        assert_eq!(CacheConfig::new("short.name", 1).label, "short.name");
        assert_eq!(
            CacheConfig::new("a-rather-long-name-without-any-dots", 1).label,
            "a-rather-long-name-without-any-dots"
        );
    }
}
