//! Keyed ownership caches: lazily-populated maps with LIFO teardown.
//!
//! These are the memoization primitives beneath the rest of the arena.
//! A cache maps an opaque [`Key`] to a constructed value and owns that
//! value: when the cache is cleared (or dropped), values are released in
//! reverse insertion order, so objects built on top of earlier objects
//! go away first.
//!
//! Two variants exist, mirroring how they are reached:
//!
//! - [`KeyedCache`] is single-thread-confined (no locking), used for
//!   state that already lives behind a frame instance's lock.
//! - [`SharedCache`] is spinlock-guarded and type-erased, used for
//!   device-wide resources reachable from many producer threads.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::spinlock::SpinLock;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Opaque cache key, unique for the lifetime of the process.
///
/// Mint one per cached resource (usually in a `static` or a long-lived
/// struct) and use it consistently with a single value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u64);

impl Key {
    /// Mint a process-unique key.
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Key {
    /// Equivalent to [`Key::new`]: every default is a fresh key.
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Single-threaded variant
// ---------------------------------------------------------------------------

struct Slot<V> {
    key: Option<Key>,
    value: Option<V>,
}

/// Lazily-populated keyed store with LIFO teardown.
///
/// Values inserted first are dropped last. Entries cleared via
/// [`KeyedCache::set`] with `None` are dropped immediately and lose
/// their teardown position.
pub struct KeyedCache<V> {
    slots: Vec<Slot<V>>,
    index: FxHashMap<Key, usize>,
    dead: usize,
}

impl<V> KeyedCache<V> {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: FxHashMap::default(),
            dead: 0,
        }
    }

    /// Value for `key` if present.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<&V> {
        self.index
            .get(&key)
            .and_then(|&i| self.slots[i].value.as_ref())
    }

    /// Value for `key`, constructing it on first access.
    ///
    /// The constructor runs at most once per key; later calls return the
    /// stored value.
    #[must_use]
    pub fn get_or_insert_with(&mut self, key: Key, ctor: impl FnOnce() -> V) -> &V {
        let i = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.slots.len();
                self.slots.push(Slot {
                    key: Some(key),
                    value: None,
                });
                let _ = self.index.insert(key, i);
                i
            }
        };
        self.slots[i].value.get_or_insert_with(ctor)
    }

    /// Unconditionally replace the value for `key`.
    ///
    /// `None` clears the entry and drops the previous value right away.
    pub fn set(&mut self, key: Key, value: Option<V>) {
        match value {
            Some(v) => match self.index.get(&key) {
                Some(&i) => self.slots[i].value = Some(v),
                None => {
                    let i = self.slots.len();
                    self.slots.push(Slot {
                        key: Some(key),
                        value: Some(v),
                    });
                    let _ = self.index.insert(key, i);
                }
            },
            None => {
                if let Some(i) = self.index.remove(&key) {
                    self.slots[i].key = None;
                    self.slots[i].value = None;
                    self.dead += 1;
                    if self.dead * 2 > self.slots.len() {
                        self.compact();
                    }
                }
            }
        }
    }

    /// Drop dead slots and rebuild the index, preserving the relative
    /// order of live entries.
    fn compact(&mut self) {
        self.slots.retain(|s| s.key.is_some() || s.value.is_some());
        self.index.clear();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(key) = slot.key {
                let _ = self.index.insert(key, i);
            }
        }
        self.dead = 0;
    }

    /// Adopt an anonymous value with no key; it participates in LIFO
    /// teardown like keyed entries.
    pub fn add(&mut self, value: V) {
        self.slots.push(Slot {
            key: None,
            value: Some(value),
        });
    }

    /// Number of live entries (keyed and anonymous).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// True when no live entry remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every value in reverse insertion order, then forget all
    /// keys. Idempotent.
    pub fn clear(&mut self) {
        while let Some(mut slot) = self.slots.pop() {
            // Explicit reverse-order release.
            drop(slot.value.take());
        }
        self.index.clear();
        self.dead = 0;
    }
}

impl<V> Default for KeyedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for KeyedCache<V> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// Spinlock-guarded, type-erased variant
// ---------------------------------------------------------------------------

type AnyValue = Arc<dyn Any + Send + Sync>;

/// Concurrency-safe keyed cache for device-wide shared resources.
///
/// Values are stored type-erased and handed out as `Arc<T>`; the single
/// downcast happens here. A key must always be used with the same value
/// type.
///
/// Constructors run *outside* the lock. When two threads race to build
/// the same entry, one construction is discarded: the loser's value is
/// dropped (and thereby disposed) and the winner's value is returned to
/// both. Constructors must therefore be side-effect-free enough that a
/// discarded construction is harmless.
pub struct SharedCache {
    inner: SpinLock<KeyedCache<AnyValue>>,
}

impl SharedCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(KeyedCache::new()),
        }
    }

    /// Value for `key`, constructing it on first access.
    #[must_use]
    pub fn get_or_insert_with<T, F>(&self, key: Key, ctor: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let existing = self.inner.lock().get(key).map(Arc::clone);
        if let Some(v) = existing {
            match v.downcast::<T>() {
                Ok(v) => return v,
                // A key reused with a different type is a caller bug;
                // rebuild and replace below rather than hand back junk.
                Err(_) => log::error!("shared cache {key:?} reused with a different value type"),
            }
        }

        let fresh: Arc<T> = Arc::new(ctor());
        let mut guard = self.inner.lock();
        if let Some(v) = guard.get(key).map(Arc::clone) {
            if let Ok(v) = v.downcast::<T>() {
                // Lost the construction race; `fresh` is dropped after
                // the guard releases.
                return v;
            }
        }
        guard.set(key, Some(Arc::clone(&fresh) as AnyValue));
        drop(guard);
        fresh
    }

    /// Unconditionally replace the value for `key`; `None` clears and
    /// drops the previous value.
    pub fn set<T>(&self, key: Key, value: Option<T>)
    where
        T: Send + Sync + 'static,
    {
        let erased = value.map(|v| Arc::new(v) as AnyValue);
        let previous = {
            let mut guard = self.inner.lock();
            let previous = guard.get(key).map(Arc::clone);
            guard.set(key, erased);
            previous
        };
        // Previous value (if any, and if this was its last reference)
        // drops outside the lock.
        drop(previous);
    }

    /// Adopt an anonymous shared value for LIFO teardown.
    pub fn add<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.inner.lock().add(Arc::new(value));
    }

    /// Drop every entry in reverse insertion order. Idempotent.
    ///
    /// Values drop outside the lock, so teardown may itself release
    /// backend resources.
    pub fn clear(&self) {
        let mut detached = std::mem::take(&mut *self.inner.lock());
        detached.clear();
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}
