//! Copy-on-write ordered sets of keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexSet;

/// An ordered collection of unique keys.
///
/// Keys keep the position of their first insertion. Removing a key drops its position, so
/// adding it back appends it at the end. Equality and hashing look at the ordered sequence, so
/// two lists with the same members in a different order are different lists.
///
/// Clones share storage. [`KeyList::add`] and [`KeyList::remove`] return a clone of `self`
/// when they would not change anything, which [`KeyList::ptr_eq`] can detect.
pub struct KeyList<T> {
    keys: Arc<IndexSet<T>>,
}

impl<T: Hash + Eq + Clone> KeyList<T> {
    /// An empty key list.
    pub fn empty() -> Self {
        Self {
            keys: Arc::new(IndexSet::new()),
        }
    }

    /// Build a key list from a sequence, dropping duplicates after their first occurrence.
    pub fn copy_of(keys: impl IntoIterator<Item = T>) -> Self {
        Self {
            keys: Arc::new(keys.into_iter().collect()),
        }
    }

    /// Returns a list with `key` appended, or this list if `key` is already present.
    pub fn add(&self, key: T) -> Self {
        if self.keys.contains(&key) {
            return self.clone();
        }
        let mut keys = (*self.keys).clone();
        keys.insert(key);
        Self {
            keys: Arc::new(keys),
        }
    }

    /// Returns a list without `key`, or this list if `key` is absent.
    pub fn remove(&self, key: &T) -> Self {
        if !self.keys.contains(key) {
            return self.clone();
        }
        let mut keys = (*self.keys).clone();
        keys.shift_remove(key);
        Self {
            keys: Arc::new(keys),
        }
    }

    /// Whether `key` is a member.
    pub fn contains(&self, key: &T) -> bool {
        self.keys.contains(key)
    }

    /// Keys in order, copied into a `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        self.keys.iter().cloned().collect()
    }
}

impl<T> KeyList<T> {
    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the list has no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over the keys in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.keys.iter()
    }

    /// Whether both lists share the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.keys, &other.keys)
    }
}

impl<T> Clone for KeyList<T> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
        }
    }
}

impl<T: Hash + Eq + Clone> Default for KeyList<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: PartialEq> PartialEq for KeyList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.keys.len() == other.keys.len() && self.keys.iter().eq(other.keys.iter())
    }
}

impl<T: Eq> Eq for KeyList<T> {}

impl<T: Hash> Hash for KeyList<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keys.len().hash(state);
        for key in self.keys.iter() {
            key.hash(state);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for KeyList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys.iter()).finish()
    }
}

impl<T: Hash + Eq + Clone> FromIterator<T> for KeyList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::copy_of(iter)
    }
}
