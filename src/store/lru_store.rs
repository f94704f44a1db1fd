#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fnv::FnvHasher;
use linked_hash_map::LinkedHashMap;

use crate::store::{LocalStore, Lookup, StoreMetrics};

/// Provides a size constrained and thread safe LRU store.
///
/// A store behaves just like a **Map** as long as there is no shortage in storage. Once the max
/// number of entries is reached, old (least recently used) entries are evicted - hence the name.
///
/// To permit concurrent access without a global lock, the entries are split into segments, each
/// guarded by its own mutex. A key is mapped to its segment using its FNV hash. The max size is
/// distributed among the segments so that their capacities add up to exactly **max_size**. Note
/// that this makes eviction an approximation of a global LRU, as each segment evicts its own least
/// recently used entry.
///
/// Each entry can also be assigned a time to live. Once this has elapsed, the entry is reported
/// as expired (once) and removed.
///
/// # Examples
/// ```
/// # use invalidation_cache::store::{LocalStore, Lookup, LruStore};
/// # use std::time::Duration;
/// // Specifies a store which keeps up to 128 entries for up to one hour using 4 segments...
/// let lru = LruStore::new(128, Some(Duration::from_secs(60 * 60)), 4);
///
/// let _ = lru.put("Foo".to_owned(), "Bar".to_owned()).unwrap();
/// assert_eq!(lru.get(&"Foo".to_owned()), Lookup::Hit("Bar".to_owned()));
///
/// // Once removed, the entry is gone...
/// assert_eq!(lru.remove(&"Foo".to_owned()), Some("Bar".to_owned()));
/// assert_eq!(lru.get(&"Foo".to_owned()), Lookup::Miss);
/// ```
pub struct LruStore<K, V> {
    segments: Vec<Mutex<Segment<K, V>>>,
    max_size: AtomicUsize,
    live_time: Mutex<Option<Duration>>,
    reads: AtomicUsize,
    hits: AtomicUsize,
    writes: AtomicUsize,
}

struct Segment<K, V> {
    capacity: usize,
    map: LinkedHashMap<K, Entry<V>>,
}

struct Entry<V> {
    ttl: Option<Instant>,
    value: V,
}

impl<V> Entry<V> {
    fn is_alive(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => ttl > now,
            None => true,
        }
    }
}

impl<K: Hash + Eq, V> Segment<K, V> {
    fn enforce_constraints(&mut self, evicted: &mut Vec<(K, V)>) {
        while self.map.len() > self.capacity {
            match self.map.pop_front() {
                Some((key, entry)) => evicted.push((key, entry.value)),
                None => unreachable!("Failed to enforce constraints of a LRU segment!"),
            }
        }
    }
}

/// Distributes the given max size so that the capacities of all segments add up to it.
fn segment_capacities(max_size: usize, num_segments: usize) -> impl Iterator<Item = usize> {
    let base = max_size / num_segments;
    let remainder = max_size % num_segments;

    (0..num_segments).map(move |index| if index < remainder { base + 1 } else { base })
}

impl<K: Hash + Eq + Clone + Send, V: Clone + Send> LruStore<K, V> {
    /// Creates a new store which keeps up to **max_size** entries for **live_time**.
    ///
    /// A live time of **None** keeps entries until they are evicted due to size constraints, a
    /// live time of zero doesn't store any entries at all. The **concurrency_level** determines
    /// the number of segments (but there are never more segments than entries).
    pub fn new(max_size: usize, live_time: Option<Duration>, concurrency_level: usize) -> Self {
        let num_segments = concurrency_level.min(max_size).max(1);
        let segments = segment_capacities(max_size, num_segments)
            .map(|capacity| {
                Mutex::new(Segment {
                    capacity,
                    map: LinkedHashMap::with_capacity(capacity),
                })
            })
            .collect();

        LruStore {
            segments,
            max_size: AtomicUsize::new(max_size),
            live_time: Mutex::new(live_time),
            reads: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    fn segment(&self, key: &K) -> &Mutex<Segment<K, V>> {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        &self.segments[hasher.finish() as usize % self.segments.len()]
    }

    /// Returns the number of segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Returns the store utilization in percent.
    pub fn utilization(&self) -> f32 {
        match self.max_size() {
            0 => 100.,
            max_size => self.size() as f32 / max_size as f32 * 100.,
        }
    }

    /// Returns the hit rate in percent.
    ///
    /// Note that all metrics are reset when the store is cleared.
    pub fn hit_rate(&self) -> f32 {
        match self.reads() {
            0 => 0.,
            n => self.hits.load(Ordering::Relaxed) as f32 / n as f32 * 100.,
        }
    }

    /// Returns the total number of reads since the last clear.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the total number of writes since the last clear.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Collects all metrics of this store.
    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            reads: self.reads(),
            writes: self.writes(),
            hit_rate: self.hit_rate(),
            utilization: self.utilization(),
            segments: self.num_segments(),
        }
    }
}

impl<K: Hash + Eq + Clone + Send, V: Clone + Send> LocalStore<K, V> for LruStore<K, V> {
    fn get(&self, key: &K) -> Lookup<V> {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut segment = self.segment(key).lock().unwrap();
        let expired = match segment.map.get_refresh(key) {
            Some(entry) if entry.is_alive(now) => {
                let _ = self.hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(entry) = segment.map.remove(key) {
                return Lookup::Expired(entry.value);
            }
        }

        Lookup::Miss
    }

    fn put(&self, key: K, value: V) -> anyhow::Result<Vec<(K, V)>> {
        let live_time = *self.live_time.lock().unwrap();
        let mut segment = self.segment(&key).lock().unwrap();
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);

        if live_time == Some(Duration::ZERO) {
            // Nothing is ever kept, but we must not serve an outdated value either...
            let _ = segment.map.remove(&key);
            return Ok(Vec::new());
        }

        // A live time beyond what the clock can represent never expires...
        let entry = Entry {
            ttl: live_time.and_then(|live_time| Instant::now().checked_add(live_time)),
            value,
        };
        let _ = segment.map.insert(key, entry);

        let mut evicted = Vec::new();
        segment.enforce_constraints(&mut evicted);

        Ok(evicted)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
        self.segment(key)
            .lock()
            .unwrap()
            .map
            .remove(key)
            .map(|entry| entry.value)
    }

    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V> {
        let mut segment = self.segment(key).lock().unwrap();
        let matches = segment
            .map
            .get(key)
            .map(|entry| predicate(&entry.value))
            .unwrap_or(false);

        if matches {
            let _ = self.writes.fetch_add(1, Ordering::Relaxed);
            segment.map.remove(key).map(|entry| entry.value)
        } else {
            None
        }
    }

    fn clear(&self) {
        for segment in &self.segments {
            segment.lock().unwrap().map.clear();
        }

        self.reads.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut result = Vec::new();
        for segment in &self.segments {
            let segment = segment.lock().unwrap();
            result.extend(
                segment
                    .map
                    .iter()
                    .filter(|(_, entry)| entry.is_alive(now))
                    .map(|(key, entry)| (key.clone(), entry.value.clone())),
            );
        }

        result
    }

    fn purge_expired(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut purged = Vec::new();
        for segment in &self.segments {
            let mut segment = segment.lock().unwrap();
            let expired_keys: Vec<K> = segment
                .map
                .iter()
                .filter(|(_, entry)| !entry.is_alive(now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired_keys {
                if let Some(entry) = segment.map.remove(&key) {
                    purged.push((key, entry.value));
                }
            }
        }

        purged
    }

    fn size(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.lock().unwrap().map.len())
            .sum()
    }

    fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    fn set_max_size(&self, max_size: usize) -> Vec<(K, V)> {
        self.max_size.store(max_size, Ordering::Relaxed);

        let mut evicted = Vec::new();
        for (segment, capacity) in self
            .segments
            .iter()
            .zip(segment_capacities(max_size, self.segments.len()))
        {
            let mut segment = segment.lock().unwrap();
            segment.capacity = capacity;
            segment.enforce_constraints(&mut evicted);
        }

        evicted
    }

    fn live_time(&self) -> Option<Duration> {
        *self.live_time.lock().unwrap()
    }

    fn set_live_time(&self, live_time: Option<Duration>) {
        *self.live_time.lock().unwrap() = live_time;
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{LocalStore, Lookup, LruStore};
    use mock_instant::thread_local::MockClock;
    use std::time::Duration;

    fn key(name: &str) -> String {
        name.to_owned()
    }

    #[test]
    fn capacity_is_enforced() {
        // A single segment behaves like a plain LRU map which permits four entries...
        let lru = LruStore::new(4, None, 1);

        let _ = lru.put(key("Hello"), "World".to_owned()).unwrap();
        let _ = lru.put(key("Hello1"), "World1".to_owned()).unwrap();
        let _ = lru.put(key("Hello2"), "World2".to_owned()).unwrap();
        let _ = lru.put(key("Hello3"), "World3".to_owned()).unwrap();
        assert_eq!(lru.size(), 4);
        assert_eq!(lru.get(&key("Hello")).hit().unwrap(), "World");

        // As "Hello" was just used, "Hello1" is the least recently used entry...
        let evicted = lru.put(key("Hello4"), "World4".to_owned()).unwrap();
        assert_eq!(evicted, vec![(key("Hello1"), "World1".to_owned())]);
        assert_eq!(lru.get(&key("Hello1")), Lookup::Miss);
        assert_eq!(lru.get(&key("Hello")).hit().unwrap(), "World");
        assert_eq!(lru.get(&key("Hello4")).hit().unwrap(), "World4");

        // Removing an entry makes room without evicting another one...
        assert_eq!(lru.remove(&key("Hello4")), Some("World4".to_owned()));
        assert_eq!(lru.size(), 3);
        assert_eq!(lru.put(key("Hello5"), "World5".to_owned()).unwrap().is_empty(), true);
        assert_eq!(lru.size(), 4);
    }

    #[test]
    fn segments_add_up_to_max_size() {
        let lru = LruStore::<String, String>::new(10, None, 4);
        assert_eq!(lru.num_segments(), 4);

        for i in 0..100 {
            let _ = lru.put(format!("Key-{}", i), "Value".to_owned()).unwrap();
        }
        assert_eq!(lru.size() <= 10, true);

        // There are never more segments than entries...
        let tiny = LruStore::<String, String>::new(2, None, 16);
        assert_eq!(tiny.num_segments(), 2);
    }

    #[test]
    fn shrinking_evicts_entries() {
        let lru = LruStore::new(8, None, 1);
        for i in 0..8 {
            let _ = lru.put(format!("Key-{}", i), i).unwrap();
        }

        let evicted = lru.set_max_size(5);
        assert_eq!(evicted.len(), 3);
        assert_eq!(evicted[0], ("Key-0".to_owned(), 0));
        assert_eq!(lru.size(), 5);
        assert_eq!(lru.max_size(), 5);
    }

    #[test]
    fn ttls_are_properly_enforced() {
        let lru = LruStore::new(1024, Some(Duration::from_secs(15 * 60)), 2);

        let _ = lru.put(key("Foo"), "Bar".to_owned()).unwrap();
        assert_eq!(lru.get(&key("Foo")).hit().unwrap(), "Bar");

        MockClock::advance(Duration::from_secs(16 * 60));
        assert_eq!(lru.snapshot().is_empty(), true);

        // An expired entry is reported exactly once...
        assert_eq!(lru.get(&key("Foo")), Lookup::Expired("Bar".to_owned()));
        assert_eq!(lru.get(&key("Foo")), Lookup::Miss);
        assert_eq!(lru.size(), 0);
    }

    #[test]
    fn ttls_are_discarded_on_put() {
        let lru = LruStore::new(1024, Some(Duration::from_secs(15 * 60)), 2);

        let _ = lru.put(key("Foo"), "Bar".to_owned()).unwrap();
        MockClock::advance(Duration::from_secs(16 * 60));
        let _ = lru.put(key("Foo"), "Bar1".to_owned()).unwrap();
        assert_eq!(lru.get(&key("Foo")).hit().unwrap(), "Bar1");
    }

    #[test]
    fn huge_live_times_never_expire() {
        let lru = LruStore::new(4, Some(Duration::MAX), 1);
        let _ = lru.put(key("A"), 1).unwrap();

        MockClock::advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(lru.get(&key("A")).hit(), Some(1));
        assert_eq!(lru.purge_expired().is_empty(), true);
    }

    #[test]
    fn expired_entries_can_be_purged() {
        let lru = LruStore::new(1024, Some(Duration::from_secs(60)), 2);
        let _ = lru.put(key("A"), 1).unwrap();
        let _ = lru.put(key("B"), 2).unwrap();

        MockClock::advance(Duration::from_secs(61));
        let _ = lru.put(key("C"), 3).unwrap();

        let mut purged = lru.purge_expired();
        purged.sort();
        assert_eq!(purged, vec![(key("A"), 1), (key("B"), 2)]);
        assert_eq!(lru.snapshot(), vec![(key("C"), 3)]);
    }

    #[test]
    fn zero_live_time_keeps_nothing() {
        let lru = LruStore::new(16, None, 1);
        let _ = lru.put(key("A"), 1).unwrap();

        lru.set_live_time(Some(Duration::ZERO));
        let _ = lru.put(key("A"), 2).unwrap();
        assert_eq!(lru.get(&key("A")), Lookup::Miss);
        assert_eq!(lru.size(), 0);
    }

    #[test]
    fn remove_if_only_removes_matching_values() {
        let lru = LruStore::new(16, None, 1);
        let _ = lru.put(key("A"), 1).unwrap();

        assert_eq!(lru.remove_if(&key("A"), &|value| *value == 2), None);
        assert_eq!(lru.get(&key("A")).hit(), Some(1));
        assert_eq!(lru.remove_if(&key("A"), &|value| *value == 1), Some(1));
        assert_eq!(lru.get(&key("A")), Lookup::Miss);
        assert_eq!(lru.remove_if(&key("B"), &|_| true), None);
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let lru = LruStore::new(4, None, 1);

        let _ = lru.put(key("A"), "A".to_owned()).unwrap();
        let _ = lru.put(key("B"), "B".to_owned()).unwrap();
        let _ = lru.put(key("C"), "C".to_owned()).unwrap();

        // Perform 4 reads, of which 3 hit an entry...
        assert_eq!(lru.get(&key("A")).hit().is_some(), true);
        assert_eq!(lru.get(&key("B")).hit().is_some(), true);
        assert_eq!(lru.get(&key("C")).hit().is_some(), true);
        assert_eq!(lru.get(&key("D")), Lookup::Miss);

        assert_eq!(lru.writes(), 3);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hit_rate().round() as i32, 75);
        assert_eq!(lru.utilization().round() as i32, 75);
        assert_eq!(lru.metrics().reads, 4);
        assert_eq!(lru.metrics().segments, 1);

        // Clearing also resets all metrics...
        lru.clear();
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.reads(), 0);
        assert_eq!(lru.hit_rate().round() as i32, 0);
    }
}
