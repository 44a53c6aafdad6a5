use std::collections::HashMap;

use crate::entity::Entity;
use crate::error::SyncError;

/// Counts from a single [`CollectionCache::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    /// Items left out because their key was held back by the caller.
    pub skipped: usize,
}

/// Ordered, key-unique client copy of one remote collection.
///
/// Order is first-appearance order. Replacing an entry never moves it.
#[derive(Debug, Clone)]
pub struct CollectionCache<E: Entity> {
    items: Vec<E>,
    positions: HashMap<E::Key, usize>,
}

impl<E: Entity> Default for CollectionCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> CollectionCache<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            positions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.items.iter()
    }

    #[must_use]
    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.positions.get(key).map(|&i| &self.items[i])
    }

    #[must_use]
    pub fn position(&self, key: &E::Key) -> Option<usize> {
        self.positions.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: &E::Key) -> bool {
        self.positions.contains_key(key)
    }

    /// Merge a page: existing keys are replaced in place, new keys appended.
    /// Merging the same page twice leaves the cache unchanged the second time.
    pub fn merge(&mut self, page: impl IntoIterator<Item = E>) -> MergeStats {
        self.merge_unless(page, |_| false)
    }

    /// Like [`Self::merge`], but items whose key matches `hold` are dropped
    /// and the cached entry (or its absence) is left as it is.
    pub fn merge_unless<P>(&mut self, page: impl IntoIterator<Item = E>, mut hold: P) -> MergeStats
    where
        P: FnMut(&E::Key) -> bool,
    {
        let mut stats = MergeStats::default();
        for item in page {
            let key = item.key();
            if hold(&key) {
                stats.skipped += 1;
            } else if let Some(&i) = self.positions.get(&key) {
                self.items[i] = item;
                stats.replaced += 1;
            } else {
                self.positions.insert(key, self.items.len());
                self.items.push(item);
                stats.inserted += 1;
            }
        }
        stats
    }

    /// Replace the entity at `key` with `transform(&current)`, returning the
    /// value it had before.
    pub fn mutate<F>(&mut self, key: &E::Key, transform: F) -> Result<E, SyncError>
    where
        F: FnOnce(&E) -> E,
    {
        let i = self
            .position(key)
            .ok_or_else(|| SyncError::not_found(key))?;
        let next = transform(&self.items[i]);
        debug_assert!(next.key() == *key, "transform must not change the entity key");
        Ok(std::mem::replace(&mut self.items[i], next))
    }

    /// Overwrite the entry at `key`. Returns `false` (and does nothing) when
    /// the key is no longer present.
    pub fn restore(&mut self, key: &E::Key, prior: E) -> bool {
        match self.position(key) {
            Some(i) => {
                self.items[i] = prior;
                true
            }
            None => false,
        }
    }

    /// Overwrite the entry sharing `entity`'s key. Unlike [`Self::merge`] this
    /// never appends.
    pub fn replace(&mut self, entity: E) -> bool {
        let key = entity.key();
        self.restore(&key, entity)
    }

    pub fn remove(&mut self, key: &E::Key) -> Result<E, SyncError> {
        self.remove_indexed(key).map(|(_, entity)| entity)
    }

    /// Remove `key`, returning the index it occupied alongside the value.
    pub fn remove_indexed(&mut self, key: &E::Key) -> Result<(usize, E), SyncError> {
        let i = self
            .positions
            .remove(key)
            .ok_or_else(|| SyncError::not_found(key))?;
        let entity = self.items.remove(i);
        self.reindex_from(i);
        Ok((i, entity))
    }

    /// Insert at `index` (clamped to the end). An existing entry with the same
    /// key is replaced where it stands instead. Returns the final index.
    pub fn insert_at(&mut self, index: usize, entity: E) -> usize {
        let key = entity.key();
        if let Some(&i) = self.positions.get(&key) {
            self.items[i] = entity;
            return i;
        }
        let i = index.min(self.items.len());
        self.items.insert(i, entity);
        self.reindex_from(i);
        i
    }

    /// Append a new entity. Fails if the key is already present.
    pub fn push(&mut self, entity: E) -> Result<usize, SyncError> {
        let key = entity.key();
        if self.positions.contains_key(&key) {
            return Err(SyncError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let i = self.items.len();
        self.positions.insert(key, i);
        self.items.push(entity);
        Ok(i)
    }

    /// Swap the entry at `old_key` for `entity`, which may carry a different
    /// key, keeping the position. If the new key is already held by another
    /// entry, that entry is updated and `old_key` is dropped.
    pub fn rekey(&mut self, old_key: &E::Key, entity: E) -> Result<usize, SyncError> {
        let new_key = entity.key();
        if new_key == *old_key {
            let i = self.position(old_key).ok_or_else(|| SyncError::not_found(old_key))?;
            self.items[i] = entity;
            return Ok(i);
        }
        if self.contains(&new_key) {
            self.remove(old_key)?;
            let i = self
                .position(&new_key)
                .ok_or_else(|| SyncError::not_found(&new_key))?;
            self.items[i] = entity;
            return Ok(i);
        }
        let i = self
            .positions
            .remove(old_key)
            .ok_or_else(|| SyncError::not_found(old_key))?;
        self.items[i] = entity;
        self.positions.insert(new_key, i);
        Ok(i)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.positions.clear();
    }

    #[must_use]
    pub fn snapshot_all(&self) -> Vec<E> {
        self.items.clone()
    }

    pub fn any<P>(&self, predicate: P) -> bool
    where
        P: FnMut(&E) -> bool,
    {
        self.items.iter().any(predicate)
    }

    fn reindex_from(&mut self, start: usize) {
        for (i, item) in self.items.iter().enumerate().skip(start) {
            self.positions.insert(item.key(), i);
        }
    }
}
