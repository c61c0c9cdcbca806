//! Typed reads of stored values.

use std::any::{type_name, TypeId};

use crate::error::TrickleFailure;
use crate::key::{Key, KeyType};
use crate::key_list::KeyList;
use crate::name::{KeyListNodeName, KeyedAt, KeyedNodeName, NodeName};
use crate::storage::Value;
use crate::value_id::ValueId;

/// The state of a value as seen from outside the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome<T> {
    /// Nothing has been stored for the value yet.
    NotYetComputed,
    /// The requested key is not in its key list.
    NoSuchKey,
    /// The value was computed successfully.
    Computed(T),
    /// The value could not be computed.
    Failure(TrickleFailure),
}

impl<T> NodeOutcome<T> {
    /// The computed value, if any.
    pub fn computed(self) -> Option<T> {
        match self {
            NodeOutcome::Computed(value) => Some(value),
            NodeOutcome::NotYetComputed | NodeOutcome::NoSuchKey | NodeOutcome::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&TrickleFailure> {
        match self {
            NodeOutcome::Failure(failure) => Some(failure),
            NodeOutcome::NotYetComputed | NodeOutcome::NoSuchKey | NodeOutcome::Computed(_) => {
                None
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Something that can be read from an instance: a plain node, a key list, a keyed node's
/// aggregated list, or one keyed value.
///
/// | Query                 | Output     |
/// |-----------------------|------------|
/// | `NodeName<T>`         | `T`        |
/// | `KeyListNodeName<K>`  | `Vec<K>`   |
/// | `KeyedNodeName<K, T>` | `Vec<T>`   |
/// | `KeyedAt<K, T>`       | `T`        |
pub trait NodeQuery: sealed::Sealed {
    /// The value type returned by reads.
    type Output;

    /// The slot being read.
    fn value_id(&self) -> ValueId;

    /// The type the node must be declared with: the value type, or the key type for key lists.
    fn declared_type(&self) -> (TypeId, &'static str);

    /// The key type of keyed nodes.
    fn key_type(&self) -> Option<(TypeId, &'static str)>;

    /// Convert a stored value into the output type.
    fn extract(value: &Value) -> Option<Self::Output>;
}

impl<T: Clone + 'static> sealed::Sealed for NodeName<T> {}

impl<T: Clone + 'static> NodeQuery for NodeName<T> {
    type Output = T;

    fn value_id(&self) -> ValueId {
        ValueId::nonkeyed(self)
    }

    fn declared_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<T>(), type_name::<T>())
    }

    fn key_type(&self) -> Option<(TypeId, &'static str)> {
        None
    }

    fn extract(value: &Value) -> Option<T> {
        value.downcast_ref::<T>().cloned()
    }
}

impl<K: KeyType> sealed::Sealed for KeyListNodeName<K> {}

impl<K: KeyType> NodeQuery for KeyListNodeName<K> {
    type Output = Vec<K>;

    fn value_id(&self) -> ValueId {
        ValueId::full_key_list(self)
    }

    fn declared_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<K>(), type_name::<K>())
    }

    fn key_type(&self) -> Option<(TypeId, &'static str)> {
        None
    }

    fn extract(value: &Value) -> Option<Vec<K>> {
        let keys = value.downcast_ref::<KeyList<Key>>()?;
        keys.iter().map(|key| key.downcast::<K>().cloned()).collect()
    }
}

impl<K: KeyType, T: Clone + 'static> sealed::Sealed for KeyedNodeName<K, T> {}

impl<K: KeyType, T: Clone + 'static> NodeQuery for KeyedNodeName<K, T> {
    type Output = Vec<T>;

    fn value_id(&self) -> ValueId {
        ValueId::full_keyed_list(self)
    }

    fn declared_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<T>(), type_name::<T>())
    }

    fn key_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<K>(), type_name::<K>()))
    }

    fn extract(value: &Value) -> Option<Vec<T>> {
        value.downcast_ref::<Vec<T>>().cloned()
    }
}

impl<K: KeyType, T: Clone + 'static> sealed::Sealed for KeyedAt<K, T> {}

impl<K: KeyType, T: Clone + 'static> NodeQuery for KeyedAt<K, T> {
    type Output = T;

    fn value_id(&self) -> ValueId {
        ValueId::keyed(self.name(), self.key().clone())
    }

    fn declared_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<T>(), type_name::<T>())
    }

    fn key_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<K>(), type_name::<K>()))
    }

    fn extract(value: &Value) -> Option<T> {
        value.downcast_ref::<T>().cloned()
    }
}
