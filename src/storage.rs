//! Type-erased, timestamped value storage for one instance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TrickleFailure;
use crate::key::Key;
use crate::key_list::KeyList;
use crate::value_id::ValueId;

/// A per-instance counter marking which round of input changes a value reflects.
pub type Timestamp = u64;

/// A stored value of any node type.
///
/// Plain and keyed values hold the node's `T`. Key lists hold a `KeyList<Key>`, existence flags
/// hold a `bool`, and aggregated keyed lists hold a `Vec<T>`.
pub type Value = Arc<dyn Any + Send + Sync>;

/// The current state of one slot.
#[derive(Clone)]
pub(crate) struct TimestampedValue {
    pub(crate) timestamp: Timestamp,
    pub(crate) outcome: Result<Value, TrickleFailure>,
}

/// Map from every written [`ValueId`] to its current state.
pub(crate) struct ValueStore {
    entries: HashMap<ValueId, TimestampedValue, ahash::RandomState>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub(crate) fn get(&self, value_id: &ValueId) -> Option<&TimestampedValue> {
        self.entries.get(value_id)
    }

    pub(crate) fn timestamp(&self, value_id: &ValueId) -> Option<Timestamp> {
        self.entries.get(value_id).map(|entry| entry.timestamp)
    }

    /// Write a slot, replacing whatever it held.
    pub(crate) fn set(
        &mut self,
        value_id: ValueId,
        timestamp: Timestamp,
        outcome: Result<Value, TrickleFailure>,
    ) {
        self.entries
            .insert(value_id, TimestampedValue { timestamp, outcome });
    }

    pub(crate) fn remove(&mut self, value_id: &ValueId) -> bool {
        self.entries.remove(value_id).is_some()
    }

    /// Current members of a key list. A key list that is unset or failed has no members.
    pub(crate) fn current_keys(&self, key_list: &Arc<str>) -> KeyList<Key> {
        match self.entries.get(&ValueId::FullKeyList(key_list.clone())) {
            Some(TimestampedValue {
                outcome: Ok(value), ..
            }) => value
                .downcast_ref::<KeyList<Key>>()
                .cloned()
                .unwrap_or_default(),
            _ => KeyList::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut store = ValueStore::new();
        let id = ValueId::Nonkeyed("a".into());
        assert_eq!(store.timestamp(&id), None);

        store.set(id.clone(), 1, Ok(Arc::new(10i32)));
        store.set(id.clone(), 3, Ok(Arc::new(30i32)));
        let entry = store.get(&id).unwrap();
        assert_eq!(entry.timestamp, 3);
        let value = entry.outcome.as_ref().ok().unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&30));

        assert!(store.remove(&id));
        assert!(!store.remove(&id));
    }

    #[test]
    fn test_current_keys_of_failed_list_is_empty() {
        let mut store = ValueStore::new();
        let name: Arc<str> = "keys".into();
        let list = KeyList::copy_of([Key::new(1), Key::new(2)]);
        store.set(ValueId::FullKeyList(name.clone()), 1, Ok(Arc::new(list.clone())));
        assert_eq!(store.current_keys(&name), list);

        store.set(
            ValueId::FullKeyList(name.clone()),
            2,
            Err(TrickleFailure::missing_input(ValueId::Nonkeyed("a".into()))),
        );
        assert!(store.current_keys(&name).is_empty());
        assert!(store.current_keys(&"other".into()).is_empty());
    }
}
