//! Thread-safe keyed cache with bounded-retry access.
//!
//! [`KeyedCache`] wraps a sharded concurrent map and never blocks on a
//! contended shard for single-key work: those operations use the map's
//! non-blocking `try_*` accessors and give up with [`Error::CacheAccess`]
//! once the retry budget is spent.  Whole-cache scans ([`KeyedCache::entries`],
//! [`KeyedCache::remove_by_value`] and [`KeyedCache::dispose`]) are the
//! exception: the map has no non-blocking iterator, so collecting keys waits
//! for each shard's read lock.  No guard in this crate outlives a single
//! synchronous map call, so that wait is short.  Values leave the cache by being dropped, so any cleanup a
//! value needs belongs in its `Drop` impl; the drop always happens after the
//! shard lock has been released.

use std::fmt::Debug;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::try_result::TryResult;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};

/// Default number of attempts per operation.
pub const DEFAULT_RETRY_BUDGET: usize = 100;

pub struct KeyedCache<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
    retry_budget: usize,
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_retry_budget(DEFAULT_RETRY_BUDGET)
    }

    /// Create a cache whose operations give up after `retry_budget`
    /// attempts (clamped to ≥ 1).
    pub fn with_retry_budget(retry_budget: usize) -> Self {
        Self {
            inner: DashMap::new(),
            retry_budget: retry_budget.max(1),
        }
    }

    /// Insert `value` under `key`.
    ///
    /// When the key is already present and `replace` is false this is a
    /// no-op: the first writer wins.  With `replace` the previous value is
    /// swapped out and dropped.
    pub fn add(&self, key: K, value: V, replace: bool) -> Result<()> {
        for _ in 0..self.retry_budget {
            match self.inner.try_entry(key.clone()) {
                Some(Entry::Vacant(slot)) => {
                    slot.insert(value);
                    return Ok(());
                }
                Some(Entry::Occupied(mut slot)) => {
                    if replace {
                        let previous = slot.insert(value);
                        drop(slot);
                        drop(previous);
                    }
                    return Ok(());
                }
                None => std::hint::spin_loop(),
            }
        }
        Err(self.exhausted("add", &key))
    }

    /// Return the value stored under `key`, inserting `make()` first when the
    /// key is absent.  Concurrent callers all observe the winning value.
    pub fn get_or_add_with(&self, key: K, make: impl FnOnce() -> V) -> Result<V> {
        let mut make = Some(make);
        for _ in 0..self.retry_budget {
            match self.inner.try_entry(key.clone()) {
                Some(Entry::Occupied(slot)) => return Ok(slot.get().clone()),
                Some(Entry::Vacant(slot)) => {
                    let Some(make) = make.take() else { break };
                    return Ok(slot.insert(make()).value().clone());
                }
                None => std::hint::spin_loop(),
            }
        }
        Err(self.exhausted("add", &key))
    }

    /// Look up `key`.  `Ok(None)` means the key is not present.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        for _ in 0..self.retry_budget {
            match self.inner.try_get(key) {
                TryResult::Present(entry) => return Ok(Some(entry.value().clone())),
                TryResult::Absent => return Ok(None),
                TryResult::Locked => std::hint::spin_loop(),
            }
        }
        Err(self.exhausted("get", key))
    }

    /// Remove `key`, dropping its value.  Returns whether anything was removed.
    pub fn remove_key(&self, key: &K) -> Result<bool> {
        for _ in 0..self.retry_budget {
            match self.inner.try_entry(key.clone()) {
                Some(Entry::Occupied(slot)) => {
                    let (_, value) = slot.remove_entry();
                    drop(value);
                    return Ok(true);
                }
                Some(Entry::Vacant(_)) => return Ok(false),
                None => std::hint::spin_loop(),
            }
        }
        Err(self.exhausted("remove", key))
    }

    /// Remove every key whose value equals `value`.  Returns how many keys
    /// were removed.
    ///
    /// Collecting the matching keys blocks on shard read locks; each removal
    /// is then bounded like [`KeyedCache::remove_key`].
    pub fn remove_by_value(&self, value: &V) -> Result<usize>
    where
        V: PartialEq,
    {
        let keys: Vec<K> = self
            .inner
            .iter()
            .filter(|entry| entry.value() == value)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.remove_key(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Snapshot of every entry currently in the cache.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop every value and leave the cache empty.  Blocks while collecting
    /// keys, then removes each under the retry budget.
    pub fn dispose(&self) -> Result<()> {
        let keys: Vec<K> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        let count = keys.len();
        for key in keys {
            self.remove_key(&key)?;
        }
        debug!(count, "cache disposed");
        Ok(())
    }

    fn exhausted(&self, op: &'static str, key: &K) -> Error {
        Error::CacheAccess {
            op,
            key: format!("{key:?}"),
            attempts: self.retry_budget,
        }
    }
}
