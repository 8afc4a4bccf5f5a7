//! Answer cache with time-sharded expiration.
//!
//! Entries live in a chain of shards ordered from newest (head) to oldest.
//! Writes always land in the head; once the head is full a fresh shard is
//! pushed in front of it and the displaced chain is reclaimed in the
//! background. Reclamation only ever touches shards behind the one it was
//! handed, so it never races with writers on the live head.

use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Entries per shard before a new head is pushed.
pub const SHARD_CAPACITY: usize = 1024;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

struct ShardState<V> {
    entries: FxHashMap<String, CacheEntry<V>>,
    last_write: Instant,
    next: Option<Arc<Shard<V>>>,
}

struct Shard<V> {
    state: Mutex<ShardState<V>>,
}

impl<V> Shard<V> {
    fn new(now: Instant, next: Option<Arc<Shard<V>>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ShardState {
                entries: FxHashMap::default(),
                last_write: now,
                next,
            }),
        })
    }
}

/// String-keyed cache whose entries expire after a fixed duration.
///
/// With expiration disabled the cache is a single unbounded shard.
pub struct ShardCache<V> {
    head: RwLock<Arc<Shard<V>>>,
    expiration: Option<Duration>,
    shard_capacity: usize,
    clock: Clock,
}

impl<V: Clone + Send + Sync + 'static> ShardCache<V> {
    /// Create a cache. `None` or a zero duration disables expiration.
    pub fn new(expiration: Option<Duration>) -> Self {
        Self::with_clock(expiration, Arc::new(Instant::now))
    }

    pub fn with_clock(expiration: Option<Duration>, clock: Clock) -> Self {
        let now = clock();
        Self {
            head: RwLock::new(Shard::new(now, None)),
            expiration: expiration.filter(|d| !d.is_zero()),
            shard_capacity: SHARD_CAPACITY,
            clock,
        }
    }

    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity.max(1);
        self
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Look up `key`, newest shard first.
    ///
    /// The first shard holding the key decides: shards are time ordered,
    /// so if that copy is stale every older copy is too.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = (self.clock)();
        let mut shard = self.head()?;

        loop {
            let next = {
                let Ok(state) = shard.state.lock() else {
                    return None;
                };
                match state.entries.get(key) {
                    Some(entry) if self.is_fresh(entry, now) => return Some(entry.value.clone()),
                    Some(_) => return None,
                    None => state.next.clone(),
                }
            };
            shard = next?;
        }
    }

    /// Store `value` under `key` in the head shard, last write wins.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = (self.clock)();

        loop {
            let Some(shard) = self.head() else {
                return;
            };

            {
                let Ok(mut state) = shard.state.lock() else {
                    return;
                };
                let has_room = self.expiration.is_none()
                    || state.entries.len() < self.shard_capacity
                    || state.entries.contains_key(&key);
                if has_room {
                    state.entries.insert(
                        key,
                        CacheEntry {
                            value,
                            inserted_at: now,
                        },
                    );
                    state.last_write = now;
                    return;
                }
            }

            self.rotate(&shard, now);
        }
    }

    /// Number of shards currently reachable from the head.
    pub fn shard_count(&self) -> usize {
        self.fold_shards(0, |count, _| count + 1)
    }

    /// Number of stored entries, stale ones included until reclaimed.
    pub fn len(&self) -> usize {
        self.fold_shards(0, |count, state| count + state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self) -> Option<Arc<Shard<V>>> {
        self.head.read().ok().map(|head| Arc::clone(&*head))
    }

    fn is_fresh(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.expiration {
            Some(expiration) => now.saturating_duration_since(entry.inserted_at) <= expiration,
            None => true,
        }
    }

    fn fold_shards<T>(&self, init: T, mut f: impl FnMut(T, &ShardState<V>) -> T) -> T {
        let mut acc = init;
        let mut shard = self.head();
        while let Some(current) = shard {
            let Ok(state) = current.state.lock() else {
                break;
            };
            acc = f(acc, &*state);
            shard = state.next.clone();
        }
        acc
    }

    /// Push a fresh head in front of `full`, unless another writer already did.
    fn rotate(&self, full: &Arc<Shard<V>>, now: Instant) {
        let Some(expiration) = self.expiration else {
            return;
        };

        {
            let Ok(mut head) = self.head.write() else {
                return;
            };
            if !Arc::ptr_eq(&*head, full) {
                return;
            }
            *head = Shard::new(now, Some(Arc::clone(full)));
        }

        debug!("cache head shard full, rotating");
        spawn_reclaim(Arc::clone(full), now, expiration);
    }
}

/// Run [`reclaim`] off the writer's path.
fn spawn_reclaim<V: Send + Sync + 'static>(shard: Arc<Shard<V>>, now: Instant, expiration: Duration) {
    let job = move || {
        let reclaimed = reclaim(&*shard, now, expiration);
        trace!("cache reclaim finished, fully reclaimed: {}", reclaimed);
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            std::thread::spawn(job);
        }
    }
}

/// Clear every shard from `shard` towards the tail that saw no write during
/// the last `expiration`, unlinking tails that are fully reclaimed.
///
/// Returns true when `shard` and everything behind it is empty, so the
/// caller one level up may unlink it.
fn reclaim<V>(shard: &Shard<V>, now: Instant, expiration: Duration) -> bool {
    let next = match shard.state.lock() {
        Ok(state) => state.next.clone(),
        Err(_) => return false,
    };
    let tail_reclaimed = match &next {
        Some(next) => reclaim(&**next, now, expiration),
        None => true,
    };

    let Ok(mut state) = shard.state.lock() else {
        return false;
    };
    if tail_reclaimed && state.next.is_some() {
        state.next = None;
    }
    let expired = now.saturating_duration_since(state.last_write) > expiration;
    if expired && !state.entries.is_empty() {
        trace!("cache reclaiming shard of {} entries", state.entries.len());
        state.entries = FxHashMap::default();
    }

    expired && tail_reclaimed
}

/// Optional cache reference. A disabled handle never stores and always misses.
pub struct CacheHandle<V>(Option<Arc<ShardCache<V>>>);

impl<V: Clone + Send + Sync + 'static> CacheHandle<V> {
    pub fn new(cache: ShardCache<V>) -> Self {
        Self(Some(Arc::new(cache)))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.0.as_ref()?.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if let Some(cache) = &self.0 {
            cache.set(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.0.as_ref().map_or(0, |cache| cache.shard_count())
    }
}

impl<V> Clone for CacheHandle<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V> Default for CacheHandle<V> {
    fn default() -> Self {
        Self(None)
    }
}
