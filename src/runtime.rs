//! The mutable evaluation state of one graph.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::definition::{Definition, InputRef, Node, RelevantValues};
use crate::error::{TrickleError, TrickleFailure};
use crate::input::{ChangeKind, InputChange, InputReceiver, TypeTag};
use crate::key::Key;
use crate::key_list::KeyList;
use crate::query::{NodeOutcome, NodeQuery};
use crate::step::{InputValues, InstanceId, Step, StepResult};
use crate::storage::{Timestamp, TimestampedValue, Value, ValueStore};
use crate::sync::SyncInstance;
use crate::tracer::{NoopTracer, ResultDisposition, Tracer};
use crate::value_id::ValueId;

struct InstanceState {
    cur_timestamp: Timestamp,
    values: ValueStore,
}

/// What to do about one derived value during a scheduling pass.
enum Plan {
    /// Stored value already reflects the latest inputs.
    UpToDate(Timestamp),
    /// Some input is not up to date yet.
    Waiting,
    /// Run the node's function on the resolved inputs.
    Compute {
        timestamp: Timestamp,
        inputs: Vec<Value>,
    },
    /// Run the node's fallback on the combined input failure.
    Catch {
        timestamp: Timestamp,
        failure: TrickleFailure,
    },
    /// Store the combined input failure without running anything.
    Fail {
        timestamp: Timestamp,
        failure: TrickleFailure,
    },
}

/// A running copy of a [`Definition`]: one timestamped value per [`ValueId`].
///
/// Evaluation is two-phase. [`get_next_steps`](Instance::get_next_steps) returns every
/// computation that can run now; each [`Step`] is executed outside the instance (possibly in
/// parallel) and its result handed back with [`report_result`](Instance::report_result).
/// [`complete_synchronously`](Instance::complete_synchronously) drives that loop on the calling
/// thread until nothing is left.
///
/// All methods take `&self`; state is guarded by one internal lock that is never held while a
/// step runs.
pub struct Instance {
    definition: Definition,
    id: InstanceId,
    tracer: Arc<dyn Tracer>,
    catch_panics: bool,
    state: Mutex<InstanceState>,
}

impl Instance {
    fn new(definition: Definition, tracer: Arc<dyn Tracer>, catch_panics: bool) -> Self {
        let mut values = ValueStore::new();
        for node in definition.nodes() {
            match node {
                Node::Basic(node) if node.operation.is_none() => {
                    let value_id = ValueId::Nonkeyed(node.name.clone());
                    let failure = TrickleFailure::missing_input(value_id.clone());
                    values.set(value_id, 0, Err(failure));
                }
                Node::KeyList(node) if node.operation.is_none() => {
                    values.set(
                        ValueId::FullKeyList(node.name.clone()),
                        0,
                        Ok(Arc::new(KeyList::<Key>::empty())),
                    );
                }
                _ => {}
            }
        }
        Self {
            definition,
            id: InstanceId::next(),
            tracer,
            catch_panics,
            state: Mutex::new(InstanceState {
                cur_timestamp: 0,
                values,
            }),
        }
    }

    /// The definition this instance was created from.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// The timestamp of the latest batch of input changes that changed anything.
    pub fn current_timestamp(&self) -> Timestamp {
        self.state.lock().cur_timestamp
    }

    /// The stored timestamp of a value, if it has ever been written.
    ///
    /// Membership flags of removed keys keep their last timestamp.
    pub fn get_timestamp(&self, value_id: &ValueId) -> Option<Timestamp> {
        self.state.lock().values.timestamp(value_id)
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    fn validate_change(&self, change: &InputChange) -> Result<(), TrickleError> {
        let name = &*change.node;
        if !self.definition.contains(name) {
            return Err(TrickleError::UnknownNode {
                name: name.to_string(),
            });
        }
        let check_type = |declared: std::any::TypeId, used: &TypeTag| {
            if declared == used.id {
                Ok(())
            } else {
                Err(TrickleError::TypeMismatch {
                    name: name.to_string(),
                    expected: used.name,
                })
            }
        };
        let not_an_input = || TrickleError::NotAnInput {
            name: name.to_string(),
        };

        match &change.kind {
            ChangeKind::SetBasic { value_type, .. } => {
                let node = self
                    .definition
                    .basic_node(name)
                    .ok_or_else(|| wrong_kind(name, "plain"))?;
                if node.operation.is_some() {
                    return Err(not_an_input());
                }
                check_type(node.value_type, value_type)
            }
            ChangeKind::SetKeys { key_type, .. }
            | ChangeKind::AddKey { key_type, .. }
            | ChangeKind::RemoveKey { key_type, .. }
            | ChangeKind::EditKeys { key_type, .. } => {
                let node = self
                    .definition
                    .key_list_node(name)
                    .ok_or_else(|| wrong_kind(name, "key list"))?;
                if node.operation.is_some() {
                    return Err(not_an_input());
                }
                check_type(node.key_type, key_type)
            }
            ChangeKind::SetKeyed {
                key_type,
                value_type,
                ..
            } => {
                let node = self
                    .definition
                    .keyed_node(name)
                    .ok_or_else(|| wrong_kind(name, "keyed"))?;
                if node.operation.is_some() {
                    return Err(not_an_input());
                }
                check_type(node.value_type, value_type)?;
                match self.definition.key_list_node(&node.key_source) {
                    Some(source) => check_type(source.key_type, key_type),
                    None => Err(TrickleError::UnknownNode {
                        name: node.key_source.to_string(),
                    }),
                }
            }
        }
    }

    /// Apply one validated change at `timestamp`. Returns whether anything changed.
    fn apply_change(&self, state: &mut InstanceState, change: InputChange, timestamp: Timestamp) -> bool {
        let InputChange { node, kind } = change;
        match kind {
            ChangeKind::SetBasic { value, .. } => {
                let value_id = ValueId::Nonkeyed(node.clone());
                let unchanged = match (state.values.get(&value_id), self.definition.basic_node(&node)) {
                    (Some(TimestampedValue { outcome: Ok(old), .. }), Some(basic)) => {
                        basic.value_eq.is_some_and(|eq| eq(old, &value))
                    }
                    _ => false,
                };
                if unchanged {
                    return false;
                }
                state.values.set(value_id, timestamp, Ok(value));
                true
            }
            ChangeKind::SetKeys { keys, .. } => self.change_key_list(state, &node, timestamp, |_| keys),
            ChangeKind::AddKey { key, .. } => {
                self.change_key_list(state, &node, timestamp, |old| old.add(key))
            }
            ChangeKind::RemoveKey { key, .. } => {
                self.change_key_list(state, &node, timestamp, |old| old.remove(&key))
            }
            ChangeKind::EditKeys { added, removed, .. } => {
                self.change_key_list(state, &node, timestamp, |old| {
                    let with_added = added.into_iter().fold(old.clone(), |list, key| list.add(key));
                    removed.iter().fold(with_added, |list, key| list.remove(key))
                })
            }
            ChangeKind::SetKeyed { values, .. } => {
                let Some(keyed) = self.definition.keyed_node(&node) else {
                    return false;
                };
                let members = state.values.current_keys(&keyed.key_source);
                let mut changed = false;
                for (key, value) in values {
                    if !members.contains(&key) {
                        continue;
                    }
                    let value_id = ValueId::Keyed(node.clone(), key);
                    let unchanged = match state.values.get(&value_id) {
                        Some(TimestampedValue { outcome: Ok(old), .. }) => {
                            keyed.value_eq.is_some_and(|eq| eq(old, &value))
                        }
                        _ => false,
                    };
                    if !unchanged {
                        state.values.set(value_id, timestamp, Ok(value));
                        changed = true;
                    }
                }
                changed
            }
        }
    }

    fn change_key_list(
        &self,
        state: &mut InstanceState,
        name: &Arc<str>,
        timestamp: Timestamp,
        edit: impl FnOnce(&KeyList<Key>) -> KeyList<Key>,
    ) -> bool {
        let old = state.values.current_keys(name);
        let new = edit(&old);
        if new == old {
            return false;
        }
        self.write_key_list(state, name, &old, Ok(new), timestamp);
        true
    }

    /// Store a new outcome for a key list, updating membership flags and pruning the keyed
    /// values of removed keys. A failed list has no members.
    fn write_key_list(
        &self,
        state: &mut InstanceState,
        name: &Arc<str>,
        old: &KeyList<Key>,
        new: Result<KeyList<Key>, TrickleFailure>,
        timestamp: Timestamp,
    ) {
        let members = match &new {
            Ok(list) => list.clone(),
            Err(_) => KeyList::empty(),
        };
        for key in members.iter().filter(|key| !old.contains(key)) {
            state.values.set(
                ValueId::KeyListKey(name.clone(), key.clone()),
                timestamp,
                Ok(Arc::new(true)),
            );
        }
        for key in old.iter().filter(|key| !members.contains(key)) {
            state.values.set(
                ValueId::KeyListKey(name.clone(), key.clone()),
                timestamp,
                Ok(Arc::new(false)),
            );
            for keyed in self.definition.keyed_nodes_on(name) {
                let value_id = ValueId::Keyed(keyed.clone(), key.clone());
                if state.values.remove(&value_id) {
                    self.tracer.on_keyed_value_pruned(&value_id);
                }
            }
        }
        state.values.set(
            ValueId::FullKeyList(name.clone()),
            timestamp,
            new.map(|list| Arc::new(list) as Value),
        );
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Every computation that can run now, given the current inputs.
    ///
    /// Values whose inputs failed are assigned their failure directly when the node has no
    /// applicable fallback, without producing a step. The returned steps are independent of each
    /// other and may be executed in any order or in parallel.
    ///
    /// Returns [`TrickleError::TimestampRegression`] if a stored value is found to be newer than
    /// the inputs it depends on, which means the instance state is corrupt.
    pub fn get_next_steps(&self) -> Result<Vec<Step>, TrickleError> {
        self.next_steps(None)
    }

    /// Like [`get_next_steps`](Self::get_next_steps), but only considering `relevant` values.
    pub(crate) fn next_steps(
        &self,
        relevant: Option<&RelevantValues>,
    ) -> Result<Vec<Step>, TrickleError> {
        let is_relevant = |value_id: &ValueId| relevant.map_or(true, |r| r.contains(value_id));
        let mut state = self.state.lock();
        let mut up_to_date: HashMap<ValueId, Timestamp> = HashMap::new();
        let mut steps = Vec::new();

        for node in self.definition.nodes() {
            match node {
                Node::Basic(node) => {
                    let value_id = ValueId::Nonkeyed(node.name.clone());
                    if !is_relevant(&value_id) {
                        continue;
                    }
                    let Some(operation) = &node.operation else {
                        if let Some(timestamp) = state.values.timestamp(&value_id) {
                            up_to_date.insert(value_id, timestamp);
                        }
                        continue;
                    };
                    let plan = self.plan(
                        &state,
                        &up_to_date,
                        &value_id,
                        &node.inputs,
                        None,
                        0,
                        node.on_catch.is_some(),
                    )?;
                    match plan {
                        Plan::UpToDate(timestamp) => {
                            up_to_date.insert(value_id, timestamp);
                        }
                        Plan::Waiting => {}
                        Plan::Compute { timestamp, inputs } => {
                            let operation = operation.clone();
                            let values = InputValues::new(inputs);
                            steps.push(self.step(value_id, timestamp, move || operation(&values)));
                        }
                        Plan::Catch { timestamp, failure } => {
                            if let Some(on_catch) = node.on_catch.clone() {
                                steps.push(self.step(value_id, timestamp, move || on_catch(&failure)));
                            }
                        }
                        Plan::Fail { timestamp, failure } => {
                            self.tracer.on_failure_stored(&value_id, timestamp, &failure);
                            state.values.set(value_id.clone(), timestamp, Err(failure));
                            up_to_date.insert(value_id, timestamp);
                        }
                    }
                }
                Node::KeyList(node) => {
                    let value_id = ValueId::FullKeyList(node.name.clone());
                    if !is_relevant(&value_id) {
                        continue;
                    }
                    let Some(operation) = &node.operation else {
                        if let Some(timestamp) = state.values.timestamp(&value_id) {
                            up_to_date.insert(value_id, timestamp);
                        }
                        continue;
                    };
                    let plan = self.plan(
                        &state,
                        &up_to_date,
                        &value_id,
                        &node.inputs,
                        None,
                        0,
                        node.on_catch.is_some(),
                    )?;
                    match plan {
                        Plan::UpToDate(timestamp) => {
                            up_to_date.insert(value_id, timestamp);
                        }
                        Plan::Waiting => {}
                        Plan::Compute { timestamp, inputs } => {
                            let operation = operation.clone();
                            let values = InputValues::new(inputs);
                            steps.push(self.step(value_id, timestamp, move || operation(&values)));
                        }
                        Plan::Catch { timestamp, failure } => {
                            if let Some(on_catch) = node.on_catch.clone() {
                                steps.push(self.step(value_id, timestamp, move || on_catch(&failure)));
                            }
                        }
                        Plan::Fail { timestamp, failure } => {
                            self.tracer.on_failure_stored(&value_id, timestamp, &failure);
                            let old = state.values.current_keys(&node.name);
                            self.write_key_list(&mut state, &node.name, &old, Err(failure), timestamp);
                            up_to_date.insert(value_id, timestamp);
                        }
                    }
                }
                Node::Keyed(node) => {
                    let full_id = ValueId::FullKeyedList(node.name.clone());
                    let full_relevant = is_relevant(&full_id);
                    let list_id = ValueId::FullKeyList(node.key_source.clone());
                    let Some(&list_timestamp) = up_to_date.get(&list_id) else {
                        continue;
                    };

                    let list = match state.values.get(&list_id).map(|entry| &entry.outcome) {
                        Some(Ok(value)) => value
                            .downcast_ref::<KeyList<Key>>()
                            .cloned()
                            .unwrap_or_default(),
                        Some(Err(failure)) => {
                            if full_relevant {
                                let failure = failure.clone();
                                self.write_aggregate(
                                    &mut state,
                                    &mut up_to_date,
                                    full_id,
                                    list_timestamp,
                                    Err(failure),
                                )?;
                            }
                            continue;
                        }
                        None => continue,
                    };

                    let mut all_ready = true;
                    let mut aggregate_timestamp = list_timestamp;
                    for key in list.iter() {
                        let value_id = ValueId::Keyed(node.name.clone(), key.clone());
                        if !full_relevant && !is_relevant(&value_id) {
                            continue;
                        }
                        let Some(operation) = &node.operation else {
                            if state.values.get(&value_id).is_none() {
                                let failure = TrickleFailure::missing_input(value_id.clone());
                                state.values.set(value_id.clone(), list_timestamp, Err(failure));
                            }
                            if let Some(timestamp) = state.values.timestamp(&value_id) {
                                aggregate_timestamp = aggregate_timestamp.max(timestamp);
                                up_to_date.insert(value_id, timestamp);
                            }
                            continue;
                        };
                        let added_at = state
                            .values
                            .timestamp(&ValueId::KeyListKey(node.key_source.clone(), key.clone()))
                            .unwrap_or(0);
                        let plan = self.plan(
                            &state,
                            &up_to_date,
                            &value_id,
                            &node.inputs,
                            Some(key),
                            added_at,
                            node.on_catch.is_some(),
                        )?;
                        match plan {
                            Plan::UpToDate(timestamp) => {
                                aggregate_timestamp = aggregate_timestamp.max(timestamp);
                                up_to_date.insert(value_id, timestamp);
                            }
                            Plan::Waiting => all_ready = false,
                            Plan::Compute { timestamp, inputs } => {
                                all_ready = false;
                                let operation = operation.clone();
                                let key = key.clone();
                                let values = InputValues::new(inputs);
                                steps.push(self.step(value_id, timestamp, move || {
                                    operation(&key, &values)
                                }));
                            }
                            Plan::Catch { timestamp, failure } => {
                                all_ready = false;
                                if let Some(on_catch) = node.on_catch.clone() {
                                    steps.push(self.step(value_id, timestamp, move || {
                                        on_catch(&failure)
                                    }));
                                }
                            }
                            Plan::Fail { timestamp, failure } => {
                                self.tracer.on_failure_stored(&value_id, timestamp, &failure);
                                state.values.set(value_id.clone(), timestamp, Err(failure));
                                aggregate_timestamp = aggregate_timestamp.max(timestamp);
                                up_to_date.insert(value_id, timestamp);
                            }
                        }
                    }

                    if !full_relevant || !all_ready {
                        continue;
                    }
                    let mut values = Vec::with_capacity(list.len());
                    let mut failures = Vec::new();
                    for key in list.iter() {
                        let value_id = ValueId::Keyed(node.name.clone(), key.clone());
                        match state.values.get(&value_id).map(|entry| &entry.outcome) {
                            Some(Ok(value)) => values.push(value.clone()),
                            Some(Err(failure)) => failures.push(failure.clone()),
                            None => {}
                        }
                    }
                    let outcome = if failures.is_empty() {
                        Ok((node.collect)(&values))
                    } else {
                        Err(TrickleFailure::combine(failures.iter()))
                    };
                    self.write_aggregate(
                        &mut state,
                        &mut up_to_date,
                        full_id,
                        aggregate_timestamp,
                        outcome,
                    )?;
                }
            }
        }

        for step in &steps {
            self.tracer
                .on_step_scheduled(step.value_id(), step.timestamp());
        }
        Ok(steps)
    }

    /// Decide what a derived value needs, given which of its inputs are up to date.
    ///
    /// `base` is the lowest timestamp the value can be at; keyed values use the time their key
    /// was added.
    #[allow(clippy::too_many_arguments)]
    fn plan(
        &self,
        state: &InstanceState,
        up_to_date: &HashMap<ValueId, Timestamp>,
        value_id: &ValueId,
        inputs: &[InputRef],
        key: Option<&Key>,
        base: Timestamp,
        catches: bool,
    ) -> Result<Plan, TrickleError> {
        let mut max_timestamp = base;
        let mut resolved = Vec::with_capacity(inputs.len());
        let mut failures = Vec::new();

        for input in inputs {
            let input_id = input.value_id(key);
            let Some(&timestamp) = up_to_date.get(&input_id) else {
                return Ok(Plan::Waiting);
            };
            max_timestamp = max_timestamp.max(timestamp);
            match state.values.get(&input_id).map(|entry| &entry.outcome) {
                Some(Ok(value)) => resolved.push(self.resolve_input(input, value)),
                Some(Err(failure)) => failures.push(failure),
                None => return Ok(Plan::Waiting),
            }
        }

        if let Some(stored) = state.values.timestamp(value_id) {
            if stored > max_timestamp {
                return Err(TrickleError::TimestampRegression {
                    value_id: value_id.clone(),
                    stored,
                    inputs: max_timestamp,
                });
            }
            if stored == max_timestamp {
                return Ok(Plan::UpToDate(stored));
            }
        }

        if failures.is_empty() {
            return Ok(Plan::Compute {
                timestamp: max_timestamp,
                inputs: resolved,
            });
        }
        let failure = TrickleFailure::combine(failures);
        if catches && failure.missing_inputs().is_empty() {
            Ok(Plan::Catch {
                timestamp: max_timestamp,
                failure,
            })
        } else {
            Ok(Plan::Fail {
                timestamp: max_timestamp,
                failure,
            })
        }
    }

    /// Convert a stored input into the form handed to node functions.
    fn resolve_input(&self, input: &InputRef, value: &Value) -> Value {
        if let InputRef::KeyList(name) = input {
            if let (Some(node), Some(list)) = (
                self.definition.key_list_node(name),
                value.downcast_ref::<KeyList<Key>>(),
            ) {
                return (node.to_list)(list);
            }
        }
        value.clone()
    }

    fn write_aggregate(
        &self,
        state: &mut InstanceState,
        up_to_date: &mut HashMap<ValueId, Timestamp>,
        value_id: ValueId,
        timestamp: Timestamp,
        outcome: Result<Value, TrickleFailure>,
    ) -> Result<(), TrickleError> {
        match state.values.timestamp(&value_id) {
            Some(stored) if stored > timestamp => {
                return Err(TrickleError::TimestampRegression {
                    value_id,
                    stored,
                    inputs: timestamp,
                });
            }
            Some(stored) if stored == timestamp => {}
            _ => state.values.set(value_id.clone(), timestamp, outcome),
        }
        up_to_date.insert(value_id, timestamp);
        Ok(())
    }

    fn step(
        &self,
        value_id: ValueId,
        timestamp: Timestamp,
        operation: impl FnOnce() -> anyhow::Result<Value> + Send + 'static,
    ) -> Step {
        Step::new(
            value_id,
            timestamp,
            self.id,
            self.catch_panics,
            Box::new(operation),
        )
    }

    /// Store the result of an executed step.
    ///
    /// A result is only applied if it is newer than what is stored, so duplicate and out-of-order
    /// results are harmless. Results for keys that have since left their key list are dropped.
    pub fn report_result(&self, result: StepResult) -> Result<(), TrickleError> {
        if result.instance != self.id {
            return Err(TrickleError::ForeignResult);
        }
        let StepResult {
            value_id,
            timestamp,
            result,
            ..
        } = result;
        if matches!(
            value_id,
            ValueId::KeyListKey(..) | ValueId::FullKeyedList(_)
        ) {
            return Err(TrickleError::UnexpectedResult { value_id });
        }

        let mut state = self.state.lock();
        if state
            .values
            .timestamp(&value_id)
            .is_some_and(|stored| stored >= timestamp)
        {
            self.tracer
                .on_result_reported(&value_id, timestamp, ResultDisposition::Stale);
            return Ok(());
        }
        let outcome = result.map_err(|error| TrickleFailure::from_error(value_id.clone(), error));

        match &value_id {
            ValueId::Keyed(name, key) => {
                let Some(node) = self.definition.keyed_node(name) else {
                    return Err(TrickleError::UnexpectedResult {
                        value_id: value_id.clone(),
                    });
                };
                let is_member = state.values.current_keys(&node.key_source).contains(key);
                let added_at = state
                    .values
                    .timestamp(&ValueId::KeyListKey(node.key_source.clone(), key.clone()))
                    .unwrap_or(0);
                if !is_member || timestamp < added_at {
                    self.tracer
                        .on_result_reported(&value_id, timestamp, ResultDisposition::KeyRemoved);
                    return Ok(());
                }
                state.values.set(value_id.clone(), timestamp, outcome);
            }
            ValueId::FullKeyList(name) => {
                let new = outcome.and_then(|value| {
                    value.downcast_ref::<KeyList<Key>>().cloned().ok_or_else(|| {
                        TrickleFailure::from_error(
                            value_id.clone(),
                            Arc::new(anyhow!("computed value is not a key list")),
                        )
                    })
                });
                let old = state.values.current_keys(name);
                self.write_key_list(&mut state, name, &old, new, timestamp);
            }
            ValueId::Nonkeyed(_) => {
                state.values.set(value_id.clone(), timestamp, outcome);
            }
            ValueId::KeyListKey(..) | ValueId::FullKeyedList(_) => {
                return Err(TrickleError::UnexpectedResult {
                    value_id: value_id.clone(),
                });
            }
        }
        self.tracer
            .on_result_reported(&value_id, timestamp, ResultDisposition::Applied);
        Ok(())
    }

    /// Execute steps on the calling thread until no more are produced.
    pub fn complete_synchronously(&self) -> Result<(), TrickleError> {
        loop {
            let steps = self.get_next_steps()?;
            if steps.is_empty() {
                return Ok(());
            }
            for step in steps {
                self.report_result(step.execute())?;
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Check that `query` names a node of the right kind and types.
    pub(crate) fn check_query<Q: NodeQuery>(&self, query: &Q) -> Result<ValueId, TrickleError> {
        let value_id = query.value_id();
        let name = value_id.node_name();
        if !self.definition.contains(name) {
            return Err(TrickleError::UnknownNode {
                name: name.to_string(),
            });
        }
        let (declared, declared_name) = query.declared_type();
        let mismatch = |expected: &'static str| TrickleError::TypeMismatch {
            name: name.to_string(),
            expected,
        };

        match &value_id {
            ValueId::Nonkeyed(_) => {
                let node = self
                    .definition
                    .basic_node(name)
                    .ok_or_else(|| wrong_kind(name, "plain"))?;
                if node.value_type != declared {
                    return Err(mismatch(declared_name));
                }
            }
            ValueId::FullKeyList(_) | ValueId::KeyListKey(..) => {
                let node = self
                    .definition
                    .key_list_node(name)
                    .ok_or_else(|| wrong_kind(name, "key list"))?;
                if node.key_type != declared {
                    return Err(mismatch(declared_name));
                }
            }
            ValueId::Keyed(..) | ValueId::FullKeyedList(_) => {
                let node = self
                    .definition
                    .keyed_node(name)
                    .ok_or_else(|| wrong_kind(name, "keyed"))?;
                if node.value_type != declared {
                    return Err(mismatch(declared_name));
                }
                if let Some((key_type, key_name)) = query.key_type() {
                    let source_key_type = self
                        .definition
                        .key_list_node(&node.key_source)
                        .map(|source| source.key_type);
                    if source_key_type != Some(key_type) {
                        return Err(mismatch(key_name));
                    }
                }
            }
        }
        Ok(value_id)
    }

    /// The current state of a value. Never fails for a well-formed query.
    ///
    /// This reads what is stored; it does not compute anything. A keyed query for a key that is
    /// not in the key list yields [`NodeOutcome::NoSuchKey`].
    pub fn get_node_outcome<Q: NodeQuery>(
        &self,
        query: &Q,
    ) -> Result<NodeOutcome<Q::Output>, TrickleError> {
        let value_id = self.check_query(query)?;
        let state = self.state.lock();

        if let ValueId::Keyed(name, key) = &value_id {
            let Some(node) = self.definition.keyed_node(name) else {
                return Err(wrong_kind(name, "keyed"));
            };
            match state
                .values
                .get(&ValueId::FullKeyList(node.key_source.clone()))
                .map(|entry| &entry.outcome)
            {
                None => return Ok(NodeOutcome::NotYetComputed),
                Some(Err(failure)) => return Ok(NodeOutcome::Failure(failure.clone())),
                Some(Ok(_)) => {
                    if !state.values.current_keys(&node.key_source).contains(key) {
                        return Ok(NodeOutcome::NoSuchKey);
                    }
                }
            }
        }

        match state.values.get(&value_id).map(|entry| &entry.outcome) {
            None => Ok(NodeOutcome::NotYetComputed),
            Some(Ok(value)) => Q::extract(value)
                .map(NodeOutcome::Computed)
                .ok_or_else(|| TrickleError::TypeMismatch {
                    name: value_id.node_name().to_string(),
                    expected: query.declared_type().1,
                }),
            Some(Err(failure)) => Ok(NodeOutcome::Failure(failure.clone())),
        }
    }

    /// The computed value, or an error saying why there is none.
    pub fn get_node_value<Q: NodeQuery>(&self, query: &Q) -> Result<Q::Output, TrickleError> {
        match self.get_node_outcome(query)? {
            NodeOutcome::Computed(value) => Ok(value),
            NodeOutcome::NotYetComputed => Err(TrickleError::NotYetComputed {
                value_id: query.value_id(),
            }),
            NodeOutcome::NoSuchKey => Err(TrickleError::NoSuchKey {
                value_id: query.value_id(),
            }),
            NodeOutcome::Failure(failure) => Err(TrickleError::Failed {
                value_id: query.value_id(),
                failure,
            }),
        }
    }
}

fn wrong_kind(name: &str, expected: &'static str) -> TrickleError {
    TrickleError::WrongNodeKind {
        name: name.to_string(),
        expected,
    }
}

impl InputReceiver for Instance {
    fn set_inputs(&self, changes: Vec<InputChange>) -> Result<Timestamp, TrickleError> {
        for change in &changes {
            self.validate_change(change)?;
        }
        let mut state = self.state.lock();
        let timestamp = state.cur_timestamp + 1;
        let mut changed = false;
        for change in changes {
            changed |= self.apply_change(&mut state, change, timestamp);
        }
        if changed {
            state.cur_timestamp = timestamp;
        }
        self.tracer.on_inputs_applied(state.cur_timestamp, changed);
        Ok(state.cur_timestamp)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("definition", &self.definition)
            .field("current_timestamp", &self.current_timestamp())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and creates instances of a [`Definition`].
///
/// # Example
///
/// ```ignore
/// let instance = definition
///     .instance_builder()
///     .tracer(LogTracer)
///     .catch_panics(false)
///     .build();
/// ```
pub struct InstanceBuilder {
    definition: Definition,
    tracer: Arc<dyn Tracer>,
    catch_panics: bool,
}

impl InstanceBuilder {
    /// Create a builder with default settings.
    pub fn new(definition: Definition) -> Self {
        Self {
            definition,
            tracer: Arc::new(NoopTracer),
            catch_panics: true,
        }
    }

    /// Set the tracer that observes instance events.
    ///
    /// Defaults to [`NoopTracer`].
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Whether a panic in a node function is captured as a failure of that value.
    ///
    /// Defaults to `true`. When `false`, the panic propagates out of [`Step::execute`].
    pub fn catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Build an [`Instance`].
    pub fn build(self) -> Instance {
        Instance::new(self.definition, self.tracer, self.catch_panics)
    }

    /// Build a [`SyncInstance`].
    pub fn build_sync(self) -> SyncInstance {
        SyncInstance::new(self.build())
    }
}
