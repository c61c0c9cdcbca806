//! Input changes and the trait for receiving them.

use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::definition::NodeValue;
use crate::error::TrickleError;
use crate::key::{Key, KeyType};
use crate::key_list::KeyList;
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};
use crate::storage::{Timestamp, Value};

#[derive(Clone, Copy, Debug)]
pub(crate) struct TypeTag {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl TypeTag {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum ChangeKind {
    SetBasic {
        value: Value,
        value_type: TypeTag,
    },
    SetKeys {
        keys: KeyList<Key>,
        key_type: TypeTag,
    },
    AddKey {
        key: Key,
        key_type: TypeTag,
    },
    RemoveKey {
        key: Key,
        key_type: TypeTag,
    },
    EditKeys {
        added: Vec<Key>,
        removed: Vec<Key>,
        key_type: TypeTag,
    },
    SetKeyed {
        values: Vec<(Key, Value)>,
        key_type: TypeTag,
        value_type: TypeTag,
    },
}

/// One change to an input node.
///
/// All changes passed together to [`InputReceiver::set_inputs`] take effect at the same
/// timestamp.
#[derive(Clone)]
pub struct InputChange {
    pub(crate) node: Arc<str>,
    pub(crate) kind: ChangeKind,
}

impl InputChange {
    /// Set a plain input node.
    pub fn set<T: NodeValue>(name: &NodeName<T>, value: T) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::SetBasic {
                value: Arc::new(value),
                value_type: TypeTag::of::<T>(),
            },
        }
    }

    /// Replace the contents of a key list input node. Duplicates are dropped.
    pub fn set_keys<K: KeyType>(name: &KeyListNodeName<K>, keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::SetKeys {
                keys: KeyList::copy_of(keys.into_iter().map(Key::new)),
                key_type: TypeTag::of::<K>(),
            },
        }
    }

    /// Append a key to a key list input node, unless already present.
    pub fn add_key<K: KeyType>(name: &KeyListNodeName<K>, key: K) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::AddKey {
                key: Key::new(key),
                key_type: TypeTag::of::<K>(),
            },
        }
    }

    /// Remove a key from a key list input node, if present.
    pub fn remove_key<K: KeyType>(name: &KeyListNodeName<K>, key: K) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::RemoveKey {
                key: Key::new(key),
                key_type: TypeTag::of::<K>(),
            },
        }
    }

    /// Add and then remove several keys of a key list input node.
    pub fn edit_keys<K: KeyType>(
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::EditKeys {
                added: added.into_iter().map(Key::new).collect(),
                removed: removed.into_iter().map(Key::new).collect(),
                key_type: TypeTag::of::<K>(),
            },
        }
    }

    /// Set the value of a keyed input node for one key.
    ///
    /// Ignored if the key is not in the node's key list when the change is applied.
    pub fn set_keyed<K: KeyType, T: NodeValue>(name: &KeyedNodeName<K, T>, key: K, value: T) -> Self {
        Self::set_keyed_many(name, [(key, value)])
    }

    /// Set the values of a keyed input node for several keys. Keys not in the key list are
    /// skipped.
    pub fn set_keyed_many<K: KeyType, T: NodeValue>(
        name: &KeyedNodeName<K, T>,
        values: impl IntoIterator<Item = (K, T)>,
    ) -> Self {
        Self {
            node: name.shared().clone(),
            kind: ChangeKind::SetKeyed {
                values: values
                    .into_iter()
                    .map(|(key, value)| (Key::new(key), Arc::new(value) as Value))
                    .collect(),
                key_type: TypeTag::of::<K>(),
                value_type: TypeTag::of::<T>(),
            },
        }
    }

    /// The name of the changed node.
    pub fn node_name(&self) -> &str {
        &self.node
    }
}

impl fmt::Debug for InputChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ChangeKind::SetBasic { .. } => write!(f, "SetBasic({})", self.node),
            ChangeKind::SetKeys { keys, .. } => write!(f, "SetKeys({}, {:?})", self.node, keys),
            ChangeKind::AddKey { key, .. } => write!(f, "AddKey({}, {:?})", self.node, key),
            ChangeKind::RemoveKey { key, .. } => write!(f, "RemoveKey({}, {:?})", self.node, key),
            ChangeKind::EditKeys { added, removed, .. } => {
                write!(f, "EditKeys({}, +{:?}, -{:?})", self.node, added, removed)
            }
            ChangeKind::SetKeyed { values, .. } => {
                let keys: Vec<&Key> = values.iter().map(|(key, _)| key).collect();
                write!(f, "SetKeyed({}, {:?})", self.node, keys)
            }
        }
    }
}

/// Anything that accepts input changes.
///
/// Only [`set_inputs`](InputReceiver::set_inputs) is required; the single-change methods are
/// shorthands for a batch of one. Every method returns the instance timestamp after the change,
/// which only advances when something observable changed.
pub trait InputReceiver {
    /// Apply a batch of changes at one shared timestamp.
    ///
    /// The whole batch is validated first; if any change names an unknown node, a derived node,
    /// or the wrong types, nothing is applied.
    fn set_inputs(&self, changes: Vec<InputChange>) -> Result<Timestamp, TrickleError>;

    /// Set a plain input node.
    fn set_input<T: NodeValue>(&self, name: &NodeName<T>, value: T) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::set(name, value)])
    }

    /// Replace the contents of a key list input node.
    fn set_keys<K: KeyType>(
        &self,
        name: &KeyListNodeName<K>,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::set_keys(name, keys)])
    }

    /// Append a key to a key list input node.
    fn add_key_input<K: KeyType>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::add_key(name, key)])
    }

    /// Remove a key from a key list input node.
    fn remove_key_input<K: KeyType>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::remove_key(name, key)])
    }

    /// Add and remove several keys of a key list input node.
    fn edit_keys<K: KeyType>(
        &self,
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::edit_keys(name, added, removed)])
    }

    /// Set a keyed input node's value for one key.
    fn set_keyed_input<K: KeyType, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: K,
        value: T,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::set_keyed(name, key, value)])
    }

    /// Set a keyed input node's values for several keys.
    fn set_keyed_inputs<K: KeyType, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        values: impl IntoIterator<Item = (K, T)>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(vec![InputChange::set_keyed_many(name, values)])
    }
}
