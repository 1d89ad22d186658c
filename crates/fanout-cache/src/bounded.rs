use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::time::Instant;
use crate::RequestFingerprint;

/// The priority of a cache entry.
///
/// When the cache runs out of room, entries with a lower priority are evicted first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    /// Evicted before anything else.
    Lowest,
    /// Evicted before `Medium`.
    Low,
    /// The default priority.
    #[default]
    Medium,
    /// Evicted after `Medium`.
    High,
    /// Evicted last.
    Highest,
}

/// A payload stored in the [`BoundedCache`].
///
/// Entries are immutable, a new write for the same key replaces the entry as a whole.
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Bytes,
    /// `None` if the TTL is too large to be represented, meaning the entry never expires.
    expires_at: Option<Instant>,
    priority: CachePriority,
    /// Insertion sequence number, the final tie-breaker of the eviction order.
    seq: u64,
}

impl CacheEntry {
    fn size(&self) -> usize {
        self.payload.len()
    }

    /// An entry is valid strictly before its expiration time.
    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    /// Orders entries by the sequence in which they are evicted.
    ///
    /// Lowest priority goes first. Among equal priorities, the entry that expires soonest goes
    /// first, and entries that never expire go last.
    fn eviction_order(&self, other: &Self) -> Ordering {
        let expiration = match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        self.priority
            .cmp(&other.priority)
            .then(expiration)
            .then(self.seq.cmp(&other.seq))
    }
}

/// The result of a [`BoundedCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was stored, after evicting the given number of other entries.
    Inserted {
        /// Number of entries evicted to make room.
        evicted: usize,
    },
    /// The payload is larger than the whole cache, nothing was changed.
    Rejected,
    /// The TTL was zero, so the entry would have been expired right away.
    ///
    /// Any previous entry for the key was removed.
    Expired,
}

#[derive(Debug)]
struct CacheState<K> {
    entries: HashMap<K, CacheEntry>,
    usage: usize,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> CacheState<K> {
    fn remove(&mut self, key: &K) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.usage -= entry.size();
        Some(entry)
    }

    /// Removes all the entries that are expired at `now`.
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let valid = entry.is_valid(now);
            if !valid {
                freed += entry.size();
            }
            valid
        });
        self.usage -= freed;
        before - self.entries.len()
    }

    /// Evicts entries until `needed` more bytes fit within `capacity`.
    ///
    /// Returns the number of evicted entries.
    fn make_room(&mut self, needed: usize, capacity: usize) -> usize {
        if self.usage + needed <= capacity {
            return 0;
        }

        let mut candidates: Vec<_> = self.entries.iter().collect();
        candidates.sort_by(|(_, a), (_, b)| a.eviction_order(b));

        let mut victims = Vec::new();
        let mut usage = self.usage;
        for (key, entry) in candidates {
            if usage + needed <= capacity {
                break;
            }
            usage -= entry.size();
            victims.push(key.clone());
        }

        for key in &victims {
            self.remove(key);
        }

        tracing::debug!(
            evicted = victims.len(),
            usage = self.usage,
            needed,
            capacity,
            "Evicted cache entries to make room"
        );
        victims.len()
    }
}

/// An in-memory cache of response payloads, bounded by the total size of all payloads.
///
/// Every entry carries a time-to-live and a [`CachePriority`]. Expired entries are swept lazily
/// on every access. When a write does not fit, entries are evicted lowest priority first, and
/// among equal priorities soonest expiration first, until it does.
///
/// The sum of all payload sizes never exceeds the capacity once a method returns. All the
/// operations are atomic with respect to each other.
#[derive(Debug)]
pub struct BoundedCache<K = RequestFingerprint> {
    capacity: usize,
    state: Mutex<CacheState<K>>,
}

impl<K: Eq + Hash + Clone> BoundedCache<K> {
    /// Creates a new cache holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                usage: 0,
                next_seq: 0,
            }),
        }
    }

    /// Returns the payload stored for `key`, if it is present and not expired.
    pub fn get(&self, key: &K) -> Option<Bytes> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.sweep(now);

        let entry = state.entries.get(key)?;
        entry.is_valid(now).then(|| entry.payload.clone())
    }

    /// Stores `payload` under `key` for `ttl` with the given `priority`.
    ///
    /// A payload larger than the whole capacity is rejected and leaves the cache untouched.
    /// Otherwise, an existing entry for the same key is replaced, and other entries are evicted
    /// as needed.
    pub fn put(
        &self,
        key: K,
        payload: Bytes,
        ttl: Duration,
        priority: CachePriority,
    ) -> PutOutcome {
        let size = payload.len();
        if size > self.capacity {
            tracing::warn!(
                size,
                capacity = self.capacity,
                "Rejected cache write larger than the cache capacity"
            );
            return PutOutcome::Rejected;
        }

        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.sweep(now);
        state.remove(&key);

        if ttl.is_zero() {
            return PutOutcome::Expired;
        }

        let evicted = state.make_room(size, self.capacity);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.usage += size;
        state.entries.insert(
            key,
            CacheEntry {
                payload,
                expires_at: now.checked_add(ttl),
                priority,
                seq,
            },
        );

        debug_assert!(state.usage <= self.capacity);
        PutOutcome::Inserted { evicted }
    }

    /// Removes the entry for `key`, returning its payload if it was still valid.
    pub fn remove(&self, key: &K) -> Option<Bytes> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.remove(key)?;
        entry.is_valid(now).then_some(entry.payload)
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.usage = 0;
    }

    /// The configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes currently used by valid entries.
    pub fn usage(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.sweep(Instant::now());
        state.usage
    }

    /// The number of valid entries.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.sweep(Instant::now());
        state.entries.len()
    }

    /// Whether the cache holds no valid entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time;

    use super::*;

    fn payload(size: usize) -> Bytes {
        Bytes::from(vec![0xAB; size])
    }

    const TTL: Duration = Duration::from_secs(5);

    #[test]
    fn test_get_after_put() {
        let cache = BoundedCache::new(100);
        let outcome = cache.put("a", Bytes::from_static(b"hello"), TTL, CachePriority::Medium);

        assert_eq!(outcome, PutOutcome::Inserted { evicted: 0 });
        assert_eq!(cache.get(&"a"), Some(Bytes::from_static(b"hello")));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.usage(), 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(60), TTL, CachePriority::Low);

        let outcome = cache.put("b", payload(101), TTL, CachePriority::Highest);

        assert_eq!(outcome, PutOutcome::Rejected);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(payload(60)));
        assert_eq!(cache.usage(), 60);
    }

    #[test]
    fn test_oversized_replacement_keeps_old_entry() {
        let cache = BoundedCache::new(10);
        cache.put("a", payload(5), TTL, CachePriority::Medium);

        assert_eq!(
            cache.put("a", payload(11), TTL, CachePriority::Medium),
            PutOutcome::Rejected
        );
        assert_eq!(cache.get(&"a"), Some(payload(5)));
    }

    #[test]
    fn test_payload_of_exact_capacity_fits() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(30), TTL, CachePriority::Highest);

        let outcome = cache.put("b", payload(100), TTL, CachePriority::Lowest);

        assert_eq!(outcome, PutOutcome::Inserted { evicted: 1 });
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.usage(), 100);
    }

    #[test]
    fn test_evicts_lower_priority_first() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(60), TTL, CachePriority::Medium);

        let outcome = cache.put("b", payload(50), TTL, CachePriority::Low);

        assert_eq!(outcome, PutOutcome::Inserted { evicted: 1 });
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(payload(50)));
        assert_eq!(cache.usage(), 50);
    }

    #[tokio::test]
    async fn test_priority_wins_over_expiration() {
        time::pause();
        let cache = BoundedCache::new(100);

        // `low` outlives `high`, but is still evicted first.
        cache.put("low", payload(40), Duration::from_secs(60), CachePriority::Low);
        cache.put("high", payload(40), Duration::from_secs(10), CachePriority::High);

        cache.put("new", payload(40), TTL, CachePriority::Medium);

        assert_eq!(cache.get(&"low"), None);
        assert!(cache.get(&"high").is_some());
        assert!(cache.get(&"new").is_some());
    }

    #[tokio::test]
    async fn test_equal_priority_evicts_soonest_expiration() {
        time::pause();
        let cache = BoundedCache::new(90);

        cache.put("late", payload(30), Duration::from_secs(30), CachePriority::Medium);
        cache.put("soon", payload(30), Duration::from_secs(10), CachePriority::Medium);
        cache.put("mid", payload(30), Duration::from_secs(20), CachePriority::Medium);

        let outcome = cache.put("new", payload(50), TTL, CachePriority::Highest);

        assert_eq!(outcome, PutOutcome::Inserted { evicted: 2 });
        assert_eq!(cache.get(&"soon"), None);
        assert_eq!(cache.get(&"mid"), None);
        assert!(cache.get(&"late").is_some());
        assert_eq!(cache.usage(), 80);
    }

    #[tokio::test]
    async fn test_expiration() {
        time::pause();
        let cache = BoundedCache::new(100);
        cache.put("a", payload(10), Duration::from_secs(5), CachePriority::Medium);

        time::advance(Duration::from_millis(4_999)).await;
        assert!(cache.get(&"a").is_some());

        // Expired exactly at its expiration time.
        time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.usage(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_free_room_before_eviction() {
        time::pause();
        let cache = BoundedCache::new(100);
        cache.put("old", payload(60), Duration::from_secs(1), CachePriority::Lowest);
        cache.put("keep", payload(40), Duration::from_secs(60), CachePriority::Lowest);

        time::advance(Duration::from_secs(2)).await;

        let outcome = cache.put("new", payload(60), TTL, CachePriority::Highest);
        assert_eq!(outcome, PutOutcome::Inserted { evicted: 0 });
        assert!(cache.get(&"keep").is_some());
    }

    #[test]
    fn test_zero_ttl() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(10), TTL, CachePriority::Medium);

        let outcome = cache.put("a", payload(10), Duration::ZERO, CachePriority::Medium);

        assert_eq!(outcome, PutOutcome::Expired);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_replacement_frees_old_size_first() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(70), TTL, CachePriority::Medium);
        cache.put("b", payload(20), TTL, CachePriority::Lowest);

        // 90 used, but replacing `a` frees its 70 bytes before charging 80.
        let outcome = cache.put("a", payload(80), TTL, CachePriority::Medium);

        assert_eq!(outcome, PutOutcome::Inserted { evicted: 0 });
        assert_eq!(cache.get(&"a"), Some(payload(80)));
        assert!(cache.get(&"b").is_some());
        assert_eq!(cache.usage(), 100);
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(10), Duration::MAX, CachePriority::Lowest);
        cache.put("b", payload(10), TTL, CachePriority::Lowest);

        // `b` expires first, so it goes first.
        cache.put("c", payload(90), TTL, CachePriority::Lowest);
        assert_eq!(cache.get(&"b"), None);
        assert!(cache.get(&"a").is_some());
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let cache = BoundedCache::new(1_000);
        let priorities = [
            CachePriority::Lowest,
            CachePriority::Low,
            CachePriority::Medium,
            CachePriority::High,
            CachePriority::Highest,
        ];

        for i in 0..500usize {
            let size = (i * 37) % 400 + 1;
            let priority = priorities[i % priorities.len()];
            let ttl = Duration::from_secs((i % 7) as u64 + 1);
            cache.put(i % 50, payload(size), ttl, priority);

            assert!(cache.usage() <= cache.capacity());
        }
    }

    #[test]
    fn test_concurrent_writers_respect_capacity() {
        let cache = Arc::new(BoundedCache::new(512));

        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200usize {
                        let key = thread * 1_000 + i % 20;
                        cache.put(key, payload(i % 100 + 1), TTL, CachePriority::Medium);
                        assert!(cache.usage() <= 512);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.usage() <= 512);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = BoundedCache::new(100);
        cache.put("a", payload(10), TTL, CachePriority::Medium);
        cache.put("b", payload(20), TTL, CachePriority::Medium);

        assert_eq!(cache.remove(&"a"), Some(payload(10)));
        assert_eq!(cache.remove(&"a"), None);
        assert_eq!(cache.usage(), 20);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CachePriority::Lowest < CachePriority::Low);
        assert!(CachePriority::Low < CachePriority::Medium);
        assert!(CachePriority::Medium < CachePriority::High);
        assert!(CachePriority::High < CachePriority::Highest);
        assert_eq!(CachePriority::default(), CachePriority::Medium);
    }
}
