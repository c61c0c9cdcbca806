//! Typed node names.
//!
//! A name ties a string identifier to the value type stored under it. The same string may only be
//! declared once per definition, whatever its kind.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::key::KeyType;

macro_rules! impl_name_traits {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    name: self.name.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<$($param),+> PartialEq for $name<$($param),+> {
            fn eq(&self, other: &Self) -> bool {
                self.name == other.name
            }
        }

        impl<$($param),+> Eq for $name<$($param),+> {}

        impl<$($param),+> Hash for $name<$($param),+> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.name.hash(state);
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.name)
            }
        }

        impl<$($param),+> fmt::Display for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.name)
            }
        }

        impl<$($param),+> $name<$($param),+> {
            /// Create a name.
            pub fn new(name: impl Into<Arc<str>>) -> Self {
                Self {
                    name: name.into(),
                    _marker: PhantomData,
                }
            }

            /// The string identifier.
            pub fn name(&self) -> &str {
                &self.name
            }

            pub(crate) fn shared(&self) -> &Arc<str> {
                &self.name
            }
        }
    };
}

/// Name of a plain node holding a single `T`.
pub struct NodeName<T> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

/// Name of a key list node whose keys are `K`.
pub struct KeyListNodeName<K> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> K>,
}

/// Name of a keyed node holding one `T` per key `K`.
///
/// Used on its own, it refers to the aggregated list of all keyed values.
pub struct KeyedNodeName<K, T> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> (K, T)>,
}

impl_name_traits!(NodeName<T>);
impl_name_traits!(KeyListNodeName<K>);
impl_name_traits!(KeyedNodeName<K, T>);

impl<K: KeyType, T> KeyedNodeName<K, T> {
    /// Refer to the value of this node for a single key.
    pub fn at(&self, key: K) -> KeyedAt<K, T> {
        KeyedAt {
            name: self.clone(),
            key,
        }
    }
}

/// One keyed value: a keyed node name paired with a key.
pub struct KeyedAt<K, T> {
    name: KeyedNodeName<K, T>,
    key: K,
}

impl<K, T> KeyedAt<K, T> {
    /// The keyed node.
    pub fn name(&self) -> &KeyedNodeName<K, T> {
        &self.name
    }

    /// The key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Clone, T> Clone for KeyedAt<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for KeyedAt<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}]", self.name, self.key)
    }
}
