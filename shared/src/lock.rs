use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-key exclusion for optimistic mutations.
///
/// Acquisition never waits: a held key is reported as busy and the caller
/// decides what to do. Leases release on drop.
pub struct MutationLocks<K> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K> Default for MutationLocks<K> {
    fn default() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Clone + Eq + Hash> MutationLocks<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if it is already held.
    pub fn try_acquire(&self, key: &K) -> Option<KeyLease<K>> {
        let mut held = lock_set(&self.held);
        if !held.insert(key.clone()) {
            return None;
        }
        Some(KeyLease {
            key: key.clone(),
            held: Arc::clone(&self.held),
        })
    }

    #[must_use]
    pub fn is_held(&self, key: &K) -> bool {
        lock_set(&self.held).contains(key)
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        lock_set(&self.held).len()
    }
}

/// Exclusive claim on one key; dropping it frees the key.
pub struct KeyLease<K: Eq + Hash> {
    key: K,
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> KeyLease<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyLease<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease").field("key", &self.key).finish()
    }
}

impl<K: Eq + Hash> Drop for KeyLease<K> {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.key);
    }
}

// The set is only ever inserted into or removed from, so a poisoned guard
// still holds a consistent value.
fn lock_set<K>(held: &Mutex<HashSet<K>>) -> MutexGuard<'_, HashSet<K>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}
