// Logical Clock & Token Registry
//
// A monotonic sequence plus a registry keyed by an idempotency token.
// Label deduplication, per-table admission watermarks and schema fences
// are all built from these two pieces.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

/// Monotonic counter. The first `tick` returns 1.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a value already handed out (e.g. recovered from the log).
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn tick(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out, 0 if none.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Never hand out `value` or anything below it.
    pub fn observe(&self, value: u64) {
        self.last.fetch_max(value, Ordering::SeqCst);
    }
}

/// A clock value bound to a token, with the content it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp<V> {
    pub id: u64,
    pub value: V,
}

/// Registry of tokens, each holding the stamp it was claimed with.
///
/// Not synchronized; owners wrap it in whatever lock scopes their
/// serialization point.
#[derive(Debug)]
pub struct TokenRegistry<K, V> {
    entries: HashMap<K, Stamp<V>>,
}

impl<K, V> Default for TokenRegistry<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> TokenRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&Stamp<V>> {
        self.entries.get(key)
    }

    /// Claim `key` for `id`. Returns the current holder if already claimed.
    pub fn claim(&mut self, key: K, id: u64, value: V) -> Result<(), &Stamp<V>> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(key) {
            Entry::Occupied(held) => Err(held.into_mut()),
            Entry::Vacant(slot) => {
                slot.insert(Stamp { id, value });
                Ok(())
            }
        }
    }

    /// Bind `key` to `id` unconditionally, returning the previous stamp.
    pub fn replace(&mut self, key: K, id: u64, value: V) -> Option<Stamp<V>> {
        self.entries.insert(key, Stamp { id, value })
    }

    /// Raise the watermark for `key` to `id` if higher. Returns the watermark.
    pub fn advance(&mut self, key: K, id: u64, value: V) -> u64 {
        let stamp = self.entries.entry(key).or_insert(Stamp { id, value });
        if id > stamp.id {
            stamp.id = id;
        }
        stamp.id
    }

    /// Highest id recorded for `key`, 0 if never stamped.
    pub fn high_water(&self, key: &K) -> u64 {
        self.entries.get(key).map(|s| s.id).unwrap_or(0)
    }

    /// Drop `key`, but only while it is still held by `id`.
    pub fn release(&mut self, key: &K, id: u64) -> bool {
        if self.entries.get(key).is_some_and(|s| s.id == id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Exclusive claim on a key within a shared set, released on drop. Keeps a
/// daemon pass and an explicit driver from working the same record at once.
pub(crate) struct InFlight<'a, K: Eq + Hash + Copy> {
    set: &'a parking_lot::Mutex<HashSet<K>>,
    key: K,
}

impl<'a, K: Eq + Hash + Copy> InFlight<'a, K> {
    pub(crate) fn acquire(set: &'a parking_lot::Mutex<HashSet<K>>, key: K) -> Option<Self> {
        set.lock().insert(key).then(|| Self { set, key })
    }
}

impl<K: Eq + Hash + Copy> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Wall-clock source, injected so ageing logic is testable.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and offline tooling.
#[derive(Debug, Default)]
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
