//! Graph schemas and the builder that validates them.
//!
//! Nodes are declared one at a time. Inputs can only be handles to nodes that were already
//! declared on the same builder, so declaration order is a topological order of the graph.

use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{TrickleError, TrickleFailure};
use crate::key::{Key, KeyType};
use crate::key_list::KeyList;
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};
use crate::runtime::{Instance, InstanceBuilder};
use crate::step::InputValues;
use crate::storage::Value;
use crate::sync::SyncInstance;
use crate::value_id::ValueId;

/// Bounds required of values stored in nodes.
pub trait NodeValue: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> NodeValue for T {}

pub(crate) type Operation = Arc<dyn Fn(&InputValues) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type KeyedOperation =
    Arc<dyn Fn(&Key, &InputValues) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type CatchFn = Arc<dyn Fn(&TrickleFailure) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type ValueEq = fn(&Value, &Value) -> bool;

static NEXT_BUILDER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BuilderId(u64);

impl BuilderId {
    fn next() -> Self {
        BuilderId(NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Inputs and handles
// ============================================================================

/// What a declared input reads from its upstream node.
#[derive(Clone, Debug)]
pub(crate) enum InputRef {
    Basic(Arc<str>),
    KeyList(Arc<str>),
    Keyed { node: Arc<str>, key_source: Arc<str> },
    FullKeyed(Arc<str>),
}

impl InputRef {
    /// The value read by this input, for a consumer evaluating `key` (if keyed).
    pub(crate) fn value_id(&self, key: Option<&Key>) -> ValueId {
        match (self, key) {
            (InputRef::Basic(name), _) => ValueId::Nonkeyed(name.clone()),
            (InputRef::KeyList(name), _) => ValueId::FullKeyList(name.clone()),
            (InputRef::Keyed { node, .. }, Some(key)) => ValueId::Keyed(node.clone(), key.clone()),
            (InputRef::Keyed { node, .. }, None) | (InputRef::FullKeyed(node), _) => {
                ValueId::FullKeyedList(node.clone())
            }
        }
    }

    fn node_name(&self) -> &Arc<str> {
        match self {
            InputRef::Basic(name)
            | InputRef::KeyList(name)
            | InputRef::Keyed { node: name, .. }
            | InputRef::FullKeyed(name) => name,
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Basic(name) | InputRef::KeyList(name) => f.write_str(name),
            InputRef::Keyed { node, .. } => write!(f, "{}[key]", node),
            InputRef::FullKeyed(name) => write!(f, "{}[*]", name),
        }
    }
}

/// An input whose value type has been erased, for declaring nodes with any number of inputs.
#[derive(Clone, Debug)]
pub struct AnyInput {
    builder: BuilderId,
    input: InputRef,
}

/// A typed input that can be passed to the node constructors of the builder that produced it.
pub struct Input<T> {
    inner: AnyInput,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Input<T> {
    fn new(builder: BuilderId, input: InputRef) -> Self {
        Self {
            inner: AnyInput { builder, input },
            _marker: PhantomData,
        }
    }

    /// Erase the value type.
    pub fn erase(&self) -> AnyInput {
        self.inner.clone()
    }
}

impl<T> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Input<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Input({})", self.inner.input)
    }
}

impl<T> From<Input<T>> for AnyInput {
    fn from(input: Input<T>) -> Self {
        input.inner
    }
}

/// Handle to a declared plain node.
#[derive(Debug, Clone)]
pub struct BuiltNode<T> {
    name: NodeName<T>,
    builder: BuilderId,
}

impl<T> BuiltNode<T> {
    /// The node's name.
    pub fn name(&self) -> &NodeName<T> {
        &self.name
    }

    /// The node's value, as an input to later nodes.
    pub fn output(&self) -> Input<T> {
        Input::new(self.builder, InputRef::Basic(self.name.shared().clone()))
    }
}

/// Handle to a declared key list node.
#[derive(Debug, Clone)]
pub struct BuiltKeyListNode<K> {
    name: KeyListNodeName<K>,
    builder: BuilderId,
}

impl<K> BuiltKeyListNode<K> {
    /// The node's name.
    pub fn name(&self) -> &KeyListNodeName<K> {
        &self.name
    }

    /// The keys in order, as an input to later nodes.
    pub fn list_output(&self) -> Input<Vec<K>> {
        Input::new(self.builder, InputRef::KeyList(self.name.shared().clone()))
    }
}

/// Handle to a declared keyed node.
#[derive(Debug, Clone)]
pub struct BuiltKeyedNode<K, T> {
    name: KeyedNodeName<K, T>,
    key_source: Arc<str>,
    builder: BuilderId,
}

impl<K, T> BuiltKeyedNode<K, T> {
    /// The node's name.
    pub fn name(&self) -> &KeyedNodeName<K, T> {
        &self.name
    }

    /// The value for the key being evaluated. Only usable by keyed nodes over the same key list.
    pub fn keyed_output(&self) -> Input<T> {
        Input::new(
            self.builder,
            InputRef::Keyed {
                node: self.name.shared().clone(),
                key_source: self.key_source.clone(),
            },
        )
    }

    /// The values for all keys, in key order.
    pub fn full_output(&self) -> Input<Vec<T>> {
        Input::new(self.builder, InputRef::FullKeyed(self.name.shared().clone()))
    }
}

/// Fallback used by a node when one of its inputs failed with an error.
///
/// It receives the combined failure of the node's inputs and produces a substitute value. It is
/// not consulted while any input is still missing.
pub struct Catch<T> {
    f: Arc<dyn Fn(&TrickleFailure) -> anyhow::Result<T> + Send + Sync>,
}

impl<T> Catch<T> {
    /// Wrap a fallback function.
    pub fn new(f: impl Fn(&TrickleFailure) -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<T: 'static> Catch<T> {
    fn erase_with(self, erase: fn(T) -> Value) -> CatchFn {
        let f = self.f;
        Arc::new(move |failure: &TrickleFailure| f(failure).map(erase))
    }
}

// ============================================================================
// Schema entries
// ============================================================================

pub(crate) struct BasicNode {
    pub(crate) name: Arc<str>,
    pub(crate) inputs: Vec<InputRef>,
    pub(crate) operation: Option<Operation>,
    pub(crate) on_catch: Option<CatchFn>,
    pub(crate) value_type: TypeId,
    pub(crate) value_eq: Option<ValueEq>,
}

pub(crate) struct KeyListNode {
    pub(crate) name: Arc<str>,
    pub(crate) inputs: Vec<InputRef>,
    pub(crate) operation: Option<Operation>,
    pub(crate) on_catch: Option<CatchFn>,
    pub(crate) key_type: TypeId,
    /// Converts the stored key list into the `Vec<K>` handed to consumers.
    pub(crate) to_list: fn(&KeyList<Key>) -> Value,
}

pub(crate) struct KeyedNode {
    pub(crate) name: Arc<str>,
    pub(crate) key_source: Arc<str>,
    pub(crate) inputs: Vec<InputRef>,
    pub(crate) operation: Option<KeyedOperation>,
    pub(crate) on_catch: Option<CatchFn>,
    pub(crate) value_type: TypeId,
    pub(crate) value_eq: Option<ValueEq>,
    /// Builds the `Vec<T>` aggregate from per-key values in key order.
    pub(crate) collect: fn(&[Value]) -> Value,
}

#[derive(Clone)]
pub(crate) enum Node {
    Basic(Arc<BasicNode>),
    KeyList(Arc<KeyListNode>),
    Keyed(Arc<KeyedNode>),
}

fn erase<T: NodeValue>(value: T) -> Value {
    Arc::new(value)
}

fn erase_key_list<K: KeyType>(keys: Vec<K>) -> Value {
    Arc::new(KeyList::copy_of(keys.into_iter().map(Key::new)))
}

fn value_eq<T: PartialEq + 'static>(a: &Value, b: &Value) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn key_list_to_vec<K: KeyType>(list: &KeyList<Key>) -> Value {
    Arc::new(
        list.iter()
            .filter_map(|key| key.downcast::<K>().cloned())
            .collect::<Vec<K>>(),
    )
}

fn collect_keyed<T: NodeValue>(values: &[Value]) -> Value {
    Arc::new(
        values
            .iter()
            .filter_map(|value| value.downcast_ref::<T>().cloned())
            .collect::<Vec<T>>(),
    )
}

fn downcast_key<K: KeyType>(key: &Key) -> anyhow::Result<&K> {
    key.downcast::<K>()
        .ok_or_else(|| anyhow!("key {:?} is not a {}", key, type_name::<K>()))
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates nodes and validates them as they are declared.
///
/// Every `create_*` method fails fast with a [`TrickleError`] on a duplicate name, an input
/// handle from another builder, or invalid keyed wiring. Derived nodes come in one method per
/// input count; the `_n` variants take any number of inputs and read them by index.
pub struct DefinitionBuilder {
    id: BuilderId,
    used_names: HashSet<Arc<str>>,
    basic_nodes: HashMap<Arc<str>, Arc<BasicNode>>,
    key_list_nodes: HashMap<Arc<str>, Arc<KeyListNode>>,
    keyed_nodes: HashMap<Arc<str>, Arc<KeyedNode>>,
    topological_ordering: Vec<Node>,
}

impl Default for DefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            id: BuilderId::next(),
            used_names: HashSet::new(),
            basic_nodes: HashMap::new(),
            key_list_nodes: HashMap::new(),
            keyed_nodes: HashMap::new(),
            topological_ordering: Vec::new(),
        }
    }

    fn check_name(&self, name: &Arc<str>) -> Result<(), TrickleError> {
        if self.used_names.contains(name) {
            return Err(TrickleError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Validate inputs for `node`; `key_source` is set when `node` is keyed.
    fn check_inputs(
        &self,
        node: &Arc<str>,
        inputs: Vec<AnyInput>,
        key_source: Option<&Arc<str>>,
    ) -> Result<Vec<InputRef>, TrickleError> {
        inputs
            .into_iter()
            .map(|input| {
                if input.builder != self.id {
                    return Err(TrickleError::ForeignHandle {
                        node: node.to_string(),
                        input: input.input.node_name().to_string(),
                    });
                }
                if let InputRef::Keyed {
                    node: input_node,
                    key_source: input_source,
                } = &input.input
                {
                    match key_source {
                        None => {
                            return Err(TrickleError::KeyedInputOutsideKeyedNode {
                                node: node.to_string(),
                                input: input_node.to_string(),
                            })
                        }
                        Some(expected) if expected != input_source => {
                            return Err(TrickleError::MismatchedKeySource {
                                node: node.to_string(),
                                input: input_node.to_string(),
                                expected: expected.to_string(),
                                found: input_source.to_string(),
                            })
                        }
                        Some(_) => {}
                    }
                }
                Ok(input.input)
            })
            .collect()
    }

    fn check_key_source<K>(
        &self,
        node: &Arc<str>,
        key_source: &BuiltKeyListNode<K>,
    ) -> Result<(), TrickleError> {
        if key_source.builder != self.id {
            return Err(TrickleError::ForeignHandle {
                node: node.to_string(),
                input: key_source.name.to_string(),
            });
        }
        Ok(())
    }

    fn push(&mut self, node: Node) {
        match &node {
            Node::Basic(basic) => {
                self.used_names.insert(basic.name.clone());
                self.basic_nodes.insert(basic.name.clone(), basic.clone());
            }
            Node::KeyList(key_list) => {
                self.used_names.insert(key_list.name.clone());
                self.key_list_nodes
                    .insert(key_list.name.clone(), key_list.clone());
            }
            Node::Keyed(keyed) => {
                self.used_names.insert(keyed.name.clone());
                self.keyed_nodes.insert(keyed.name.clone(), keyed.clone());
            }
        }
        self.topological_ordering.push(node);
    }

    // ---- plain nodes ----

    /// Declare a plain input node, set from outside the graph.
    pub fn create_input_node<T: NodeValue + PartialEq>(
        &mut self,
        name: &NodeName<T>,
    ) -> Result<BuiltNode<T>, TrickleError> {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        self.push(Node::Basic(Arc::new(BasicNode {
            name: shared,
            inputs: Vec::new(),
            operation: None,
            on_catch: None,
            value_type: TypeId::of::<T>(),
            value_eq: Some(value_eq::<T>),
        })));
        Ok(BuiltNode {
            name: name.clone(),
            builder: self.id,
        })
    }

    /// Declare a plain derived node over any number of inputs.
    pub fn create_node_n<T, F>(
        &mut self,
        name: &NodeName<T>,
        inputs: Vec<AnyInput>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        T: NodeValue,
        F: Fn(&InputValues) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        let inputs = self.check_inputs(&shared, inputs, None)?;
        if inputs.is_empty() {
            return Err(TrickleError::NoInputs {
                name: shared.to_string(),
            });
        }
        self.push(Node::Basic(Arc::new(BasicNode {
            name: shared,
            inputs,
            operation: Some(Arc::new(move |values: &InputValues| f(values).map(erase))),
            on_catch: on_catch.map(|c| c.erase_with(erase::<T>)),
            value_type: TypeId::of::<T>(),
            value_eq: None,
        })));
        Ok(BuiltNode {
            name: name.clone(),
            builder: self.id,
        })
    }

    /// Declare a plain derived node with one input.
    pub fn create_node1<A, T, F>(
        &mut self,
        name: &NodeName<T>,
        a: &Input<A>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        A: 'static,
        T: NodeValue,
        F: Fn(&A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_node_n(
            name,
            vec![a.erase()],
            move |values| f(values.get::<A>(0)?),
            on_catch,
        )
    }

    /// Declare a plain derived node with two inputs.
    pub fn create_node2<A, B, T, F>(
        &mut self,
        name: &NodeName<T>,
        a: &Input<A>,
        b: &Input<B>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        A: 'static,
        B: 'static,
        T: NodeValue,
        F: Fn(&A, &B) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_node_n(
            name,
            vec![a.erase(), b.erase()],
            move |values| f(values.get::<A>(0)?, values.get::<B>(1)?),
            on_catch,
        )
    }

    /// Declare a plain derived node with three inputs.
    pub fn create_node3<A, B, C, T, F>(
        &mut self,
        name: &NodeName<T>,
        a: &Input<A>,
        b: &Input<B>,
        c: &Input<C>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        A: 'static,
        B: 'static,
        C: 'static,
        T: NodeValue,
        F: Fn(&A, &B, &C) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_node_n(
            name,
            vec![a.erase(), b.erase(), c.erase()],
            move |values| f(values.get::<A>(0)?, values.get::<B>(1)?, values.get::<C>(2)?),
            on_catch,
        )
    }

    // ---- key lists ----

    /// Declare a key list input node. It starts out empty.
    pub fn create_key_list_input_node<K: KeyType>(
        &mut self,
        name: &KeyListNodeName<K>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError> {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        self.push(Node::KeyList(Arc::new(KeyListNode {
            name: shared,
            inputs: Vec::new(),
            operation: None,
            on_catch: None,
            key_type: TypeId::of::<K>(),
            to_list: key_list_to_vec::<K>,
        })));
        Ok(BuiltKeyListNode {
            name: name.clone(),
            builder: self.id,
        })
    }

    /// Declare a derived key list over any number of inputs.
    ///
    /// The returned keys are deduplicated, keeping first occurrences.
    pub fn create_key_list_node_n<K, F>(
        &mut self,
        name: &KeyListNodeName<K>,
        inputs: Vec<AnyInput>,
        f: F,
        on_catch: Option<Catch<Vec<K>>>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        K: KeyType,
        F: Fn(&InputValues) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        let inputs = self.check_inputs(&shared, inputs, None)?;
        if inputs.is_empty() {
            return Err(TrickleError::NoInputs {
                name: shared.to_string(),
            });
        }
        self.push(Node::KeyList(Arc::new(KeyListNode {
            name: shared,
            inputs,
            operation: Some(Arc::new(move |values: &InputValues| {
                f(values).map(erase_key_list)
            })),
            on_catch: on_catch.map(|c| c.erase_with(erase_key_list::<K>)),
            key_type: TypeId::of::<K>(),
            to_list: key_list_to_vec::<K>,
        })));
        Ok(BuiltKeyListNode {
            name: name.clone(),
            builder: self.id,
        })
    }

    /// Declare a derived key list with one input.
    pub fn create_key_list_node1<A, K, F>(
        &mut self,
        name: &KeyListNodeName<K>,
        a: &Input<A>,
        f: F,
        on_catch: Option<Catch<Vec<K>>>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        A: 'static,
        K: KeyType,
        F: Fn(&A) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        self.create_key_list_node_n(
            name,
            vec![a.erase()],
            move |values| f(values.get::<A>(0)?),
            on_catch,
        )
    }

    /// Declare a derived key list with two inputs.
    pub fn create_key_list_node2<A, B, K, F>(
        &mut self,
        name: &KeyListNodeName<K>,
        a: &Input<A>,
        b: &Input<B>,
        f: F,
        on_catch: Option<Catch<Vec<K>>>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        A: 'static,
        B: 'static,
        K: KeyType,
        F: Fn(&A, &B) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        self.create_key_list_node_n(
            name,
            vec![a.erase(), b.erase()],
            move |values| f(values.get::<A>(0)?, values.get::<B>(1)?),
            on_catch,
        )
    }

    // ---- keyed nodes ----

    /// Declare a keyed input node over an input key list.
    ///
    /// A key without a supplied value reads as a missing input.
    pub fn create_keyed_input_node<K: KeyType, T: NodeValue + PartialEq>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError> {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        self.check_key_source(&shared, key_source)?;
        let source_name = key_source.name.shared().clone();
        let source_is_input = self
            .key_list_nodes
            .get(&source_name)
            .is_some_and(|node| node.operation.is_none());
        if !source_is_input {
            return Err(TrickleError::KeyedInputOnDerivedKeyList {
                node: shared.to_string(),
                key_source: source_name.to_string(),
            });
        }
        self.push(Node::Keyed(Arc::new(KeyedNode {
            name: shared,
            key_source: source_name.clone(),
            inputs: Vec::new(),
            operation: None,
            on_catch: None,
            value_type: TypeId::of::<T>(),
            value_eq: Some(value_eq::<T>),
            collect: collect_keyed::<T>,
        })));
        Ok(BuiltKeyedNode {
            name: name.clone(),
            key_source: source_name,
            builder: self.id,
        })
    }

    /// Declare a derived keyed node over any number of inputs.
    ///
    /// The function receives the key along with the inputs. Inputs taken from
    /// [`BuiltKeyedNode::keyed_output`] resolve to the value for the same key.
    pub fn create_keyed_node_n<K, T, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        inputs: Vec<AnyInput>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: KeyType,
        T: NodeValue,
        F: Fn(&K, &InputValues) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let shared = name.shared().clone();
        self.check_name(&shared)?;
        self.check_key_source(&shared, key_source)?;
        let source_name = key_source.name.shared().clone();
        let inputs = self.check_inputs(&shared, inputs, Some(&source_name))?;
        self.push(Node::Keyed(Arc::new(KeyedNode {
            name: shared,
            key_source: source_name.clone(),
            inputs,
            operation: Some(Arc::new(move |key: &Key, values: &InputValues| {
                f(downcast_key::<K>(key)?, values).map(erase)
            })),
            on_catch: on_catch.map(|c| c.erase_with(erase::<T>)),
            value_type: TypeId::of::<T>(),
            value_eq: None,
            collect: collect_keyed::<T>,
        })));
        Ok(BuiltKeyedNode {
            name: name.clone(),
            key_source: source_name,
            builder: self.id,
        })
    }

    /// Declare a derived keyed node computed from the key alone.
    pub fn create_keyed_node0<K, T, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: KeyType,
        T: NodeValue,
        F: Fn(&K) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_keyed_node_n(name, key_source, Vec::new(), move |key, _| f(key), on_catch)
    }

    /// Declare a derived keyed node with one input.
    pub fn create_keyed_node1<K, A, T, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        a: &Input<A>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: KeyType,
        A: 'static,
        T: NodeValue,
        F: Fn(&K, &A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_keyed_node_n(
            name,
            key_source,
            vec![a.erase()],
            move |key, values| f(key, values.get::<A>(0)?),
            on_catch,
        )
    }

    /// Declare a derived keyed node with two inputs.
    pub fn create_keyed_node2<K, A, B, T, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        a: &Input<A>,
        b: &Input<B>,
        f: F,
        on_catch: Option<Catch<T>>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: KeyType,
        A: 'static,
        B: 'static,
        T: NodeValue,
        F: Fn(&K, &A, &B) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.create_keyed_node_n(
            name,
            key_source,
            vec![a.erase(), b.erase()],
            move |key, values| f(key, values.get::<A>(0)?, values.get::<B>(1)?),
            on_catch,
        )
    }

    /// Finish the definition.
    pub fn build(self) -> Definition {
        let mut keyed_nodes_by_source: HashMap<Arc<str>, Vec<Arc<str>>> = HashMap::new();
        for node in &self.topological_ordering {
            if let Node::Keyed(keyed) = node {
                keyed_nodes_by_source
                    .entry(keyed.key_source.clone())
                    .or_default()
                    .push(keyed.name.clone());
            }
        }
        Definition {
            inner: Arc::new(DefinitionInner {
                basic_nodes: self.basic_nodes,
                key_list_nodes: self.key_list_nodes,
                keyed_nodes: self.keyed_nodes,
                topological_ordering: self.topological_ordering,
                keyed_nodes_by_source,
            }),
        }
    }
}

// ============================================================================
// Definition
// ============================================================================

struct DefinitionInner {
    basic_nodes: HashMap<Arc<str>, Arc<BasicNode>>,
    key_list_nodes: HashMap<Arc<str>, Arc<KeyListNode>>,
    keyed_nodes: HashMap<Arc<str>, Arc<KeyedNode>>,
    topological_ordering: Vec<Node>,
    keyed_nodes_by_source: HashMap<Arc<str>, Vec<Arc<str>>>,
}

/// An immutable, validated graph schema.
///
/// Cheap to clone; any number of instances can be created from one definition.
#[derive(Clone)]
pub struct Definition {
    inner: Arc<DefinitionInner>,
}

impl Definition {
    /// Create an instance with default settings.
    pub fn instantiate(&self) -> Instance {
        self.instance_builder().build()
    }

    /// Create a pull-based instance with default settings.
    pub fn instantiate_sync(&self) -> SyncInstance {
        self.instance_builder().build_sync()
    }

    /// Configure a new instance.
    pub fn instance_builder(&self) -> InstanceBuilder {
        InstanceBuilder::new(self.clone())
    }

    /// Node names in topological order.
    pub fn topological_order(&self) -> impl Iterator<Item = &str> + '_ {
        self.inner.topological_ordering.iter().map(|node| match node {
            Node::Basic(node) => &*node.name,
            Node::KeyList(node) => &*node.name,
            Node::Keyed(node) => &*node.name,
        })
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.inner.topological_ordering
    }

    pub(crate) fn basic_node(&self, name: &str) -> Option<&Arc<BasicNode>> {
        self.inner.basic_nodes.get(name)
    }

    pub(crate) fn key_list_node(&self, name: &str) -> Option<&Arc<KeyListNode>> {
        self.inner.key_list_nodes.get(name)
    }

    pub(crate) fn keyed_node(&self, name: &str) -> Option<&Arc<KeyedNode>> {
        self.inner.keyed_nodes.get(name)
    }

    /// Whether `name` is declared as any kind of node.
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.inner.basic_nodes.contains_key(name)
            || self.inner.key_list_nodes.contains_key(name)
            || self.inner.keyed_nodes.contains_key(name)
    }

    /// Keyed nodes whose key source is `key_list`.
    pub(crate) fn keyed_nodes_on(&self, key_list: &str) -> &[Arc<str>] {
        self.inner
            .keyed_nodes_by_source
            .get(key_list)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every value that computing `target` may need, found by walking inputs backward.
    ///
    /// Keyed values also pull in the full contents of their key list. Asking for a keyed node's
    /// aggregated list makes all of that node's per-key values relevant.
    pub fn relevant_values(&self, target: &ValueId) -> RelevantValues {
        let mut values = HashSet::new();
        let mut all_keys = HashSet::new();
        let mut queue = VecDeque::from([target.clone()]);

        while let Some(current) = queue.pop_front() {
            if values.contains(&current) {
                continue;
            }
            match &current {
                ValueId::Nonkeyed(name) => {
                    if let Some(node) = self.basic_node(name) {
                        queue.extend(node.inputs.iter().map(|input| input.value_id(None)));
                    }
                }
                ValueId::FullKeyList(name) | ValueId::KeyListKey(name, _) => {
                    if let Some(node) = self.key_list_node(name) {
                        queue.extend(node.inputs.iter().map(|input| input.value_id(None)));
                    }
                }
                ValueId::Keyed(name, key) => {
                    if let Some(node) = self.keyed_node(name) {
                        queue.push_back(ValueId::FullKeyList(node.key_source.clone()));
                        queue.extend(node.inputs.iter().map(|input| input.value_id(Some(key))));
                    }
                }
                ValueId::FullKeyedList(name) => {
                    if let Some(node) = self.keyed_node(name) {
                        all_keys.insert(name.clone());
                        queue.push_back(ValueId::FullKeyList(node.key_source.clone()));
                        queue.extend(node.inputs.iter().map(|input| input.value_id(None)));
                    }
                }
            }
            values.insert(current);
        }

        RelevantValues { values, all_keys }
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.topological_order()).finish()
    }
}

fn write_inputs(f: &mut fmt::Formatter<'_>, inputs: &[InputRef], derived: bool) -> fmt::Result {
    if !derived {
        return Ok(());
    }
    f.write_str("(")?;
    for (i, input) in inputs.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", input)?;
    }
    f.write_str(")")
}

impl fmt::Display for Definition {
    /// One line per node, in topological order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.nodes() {
            match node {
                Node::Basic(node) => {
                    write!(f, "Basic   {}", node.name)?;
                    write_inputs(f, &node.inputs, node.operation.is_some())?;
                }
                Node::KeyList(node) => {
                    write!(f, "KeyList {}", node.name)?;
                    write_inputs(f, &node.inputs, node.operation.is_some())?;
                }
                Node::Keyed(node) => {
                    write!(f, "Keyed   {}<{}>", node.name, node.key_source)?;
                    write_inputs(f, &node.inputs, node.operation.is_some())?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The set of values relevant to one query, from [`Definition::relevant_values`].
#[derive(Debug, Clone)]
pub struct RelevantValues {
    values: HashSet<ValueId>,
    all_keys: HashSet<Arc<str>>,
}

impl RelevantValues {
    /// Whether computing `value_id` may be needed.
    pub fn contains(&self, value_id: &ValueId) -> bool {
        if self.values.contains(value_id) {
            return true;
        }
        match value_id {
            ValueId::Keyed(name, _) => self.all_keys.contains(name),
            _ => false,
        }
    }
}
