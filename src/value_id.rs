//! Identities of the storable slots of an instance.

use std::fmt;
use std::sync::Arc;

use crate::key::{Key, KeyType};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};

/// The identity of one stored value.
///
/// A plain node owns one slot. A key list owns its full contents plus one existence flag per key
/// it has ever held. A keyed node owns one slot per current key plus its aggregated list.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ValueId {
    /// The value of a plain node.
    Nonkeyed(Arc<str>),
    /// The full contents of a key list node.
    FullKeyList(Arc<str>),
    /// Whether a key is currently a member of a key list node.
    KeyListKey(Arc<str>, Key),
    /// The value of a keyed node for one key.
    Keyed(Arc<str>, Key),
    /// The values of a keyed node for all current keys, in key order.
    FullKeyedList(Arc<str>),
}

impl ValueId {
    /// The value of a plain node.
    pub fn nonkeyed<T>(name: &NodeName<T>) -> Self {
        ValueId::Nonkeyed(name.shared().clone())
    }

    /// The contents of a key list node.
    pub fn full_key_list<K>(name: &KeyListNodeName<K>) -> Self {
        ValueId::FullKeyList(name.shared().clone())
    }

    /// The membership flag of `key` in a key list node.
    pub fn key_list_key<K: KeyType>(name: &KeyListNodeName<K>, key: K) -> Self {
        ValueId::KeyListKey(name.shared().clone(), Key::new(key))
    }

    /// The value of a keyed node for `key`.
    pub fn keyed<K: KeyType, T>(name: &KeyedNodeName<K, T>, key: K) -> Self {
        ValueId::Keyed(name.shared().clone(), Key::new(key))
    }

    /// The aggregated values of a keyed node.
    pub fn full_keyed_list<K, T>(name: &KeyedNodeName<K, T>) -> Self {
        ValueId::FullKeyedList(name.shared().clone())
    }

    /// The name of the node owning this slot.
    pub fn node_name(&self) -> &str {
        match self {
            ValueId::Nonkeyed(name)
            | ValueId::FullKeyList(name)
            | ValueId::KeyListKey(name, _)
            | ValueId::Keyed(name, _)
            | ValueId::FullKeyedList(name) => name,
        }
    }

    /// The key of a per-key slot.
    pub fn key(&self) -> Option<&Key> {
        match self {
            ValueId::KeyListKey(_, key) | ValueId::Keyed(_, key) => Some(key),
            ValueId::Nonkeyed(_) | ValueId::FullKeyList(_) | ValueId::FullKeyedList(_) => None,
        }
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueId::Nonkeyed(name) => write!(f, "Nonkeyed({})", name),
            ValueId::FullKeyList(name) => write!(f, "FullKeyList({})", name),
            ValueId::KeyListKey(name, key) => write!(f, "KeyListKey({}, {:?})", name, key),
            ValueId::Keyed(name, key) => write!(f, "Keyed({}, {:?})", name, key),
            ValueId::FullKeyedList(name) => write!(f, "FullKeyedList({})", name),
        }
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
