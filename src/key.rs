//! Type-erased keys for keyed values.

use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// Compares two trait objects by downcasting `other` to the concrete type of `self`.
pub trait DynEq: Any {
    /// Returns `true` if `other` has the same concrete type and is equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Object-safe view of a key type.
///
/// Implemented for every `Hash + Eq + Debug + Send + Sync + 'static` type, so any such type
/// can sit behind an `Arc<dyn ErasedKey>` in hash maps.
pub trait ErasedKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the key as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> ErasedKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(ErasedKey);

/// Bounds required of key types used in key lists.
pub trait KeyType: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> KeyType for T {}

/// A key of any [`KeyType`], with its concrete type erased.
///
/// Two keys are equal only when their concrete types match and the values compare equal.
#[derive(Clone)]
pub struct Key {
    key_type: TypeId,
    key: Arc<dyn ErasedKey>,
}

impl Key {
    /// Erase a typed key.
    pub fn new<K: KeyType>(key: K) -> Self {
        Self {
            key_type: TypeId::of::<K>(),
            key: Arc::new(key),
        }
    }

    /// Downcast the key to its original type.
    pub fn downcast<K: 'static>(&self) -> Option<&K> {
        self.key.as_any().downcast_ref()
    }

    /// The `TypeId` of the original key type.
    pub fn key_type(&self) -> TypeId {
        self.key_type
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.key)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.key.hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type && self.key.dyn_eq(other.key.as_any())
    }
}

impl Eq for Key {}
