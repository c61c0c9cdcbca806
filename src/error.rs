//! Error types: usage errors raised immediately, and failures captured during evaluation.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::value_id::ValueId;

/// Errors raised directly to the caller.
///
/// These report misuse of the API: invalid graph wiring, unknown or mistyped names, setting a
/// derived node, or results handed to the wrong instance. The read helpers that insist on a
/// computed value ([`get_node_value`](crate::Instance::get_node_value) and friends) also use
/// this type to report why no value is available.
///
/// Errors raised by node computations never surface here directly; they are stored as a
/// [`TrickleFailure`] on the affected values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrickleError {
    /// Two nodes were declared with the same name.
    #[error("Cannot create two nodes with the same name '{name}'")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// An input handle came from a different builder.
    #[error("Cannot reuse nodes or inputs across builders (input '{input}' of node '{node}')")]
    ForeignHandle {
        /// The node being declared.
        node: String,
        /// The foreign input.
        input: String,
    },

    /// A keyed input node was declared over a derived key list.
    #[error(
        "Keyed input nodes can only use input key lists as their key sources, but {key_source} is not an input"
    )]
    KeyedInputOnDerivedKeyList {
        /// The keyed input node being declared.
        node: String,
        /// The derived key list it was declared over.
        key_source: String,
    },

    /// A derived node was declared without inputs.
    #[error("Node '{name}' has no inputs; declare it with create_input_node if it is set externally")]
    NoInputs {
        /// The node being declared.
        name: String,
    },

    /// A per-key output was used by a node that is not keyed.
    #[error("Keyed output of '{input}' can only be used by keyed nodes, but '{node}' is not keyed")]
    KeyedInputOutsideKeyedNode {
        /// The node being declared.
        node: String,
        /// The keyed node whose per-key output was used.
        input: String,
    },

    /// A per-key output was used by a keyed node over a different key list.
    #[error(
        "Keyed node '{node}' is keyed on '{expected}', but its input '{input}' is keyed on '{found}'"
    )]
    MismatchedKeySource {
        /// The node being declared.
        node: String,
        /// The keyed input.
        input: String,
        /// Key source of the node being declared.
        expected: String,
        /// Key source of the input.
        found: String,
    },

    /// A name not declared in the definition.
    #[error("Unrecognized node name {name}")]
    UnknownNode {
        /// The unknown name.
        name: String,
    },

    /// A name used with the wrong kind of node.
    #[error("Node {name} is not a {expected} node")]
    WrongNodeKind {
        /// The name.
        name: String,
        /// The kind the caller expected.
        expected: &'static str,
    },

    /// A typed name or value does not match the declared value type.
    #[error("Node {name} does not hold values of type {expected}")]
    TypeMismatch {
        /// The node.
        name: String,
        /// The type the caller used.
        expected: &'static str,
    },

    /// An attempt to set a derived node from outside.
    #[error("Cannot directly set the value of a non-input node {name}")]
    NotAnInput {
        /// The derived node.
        name: String,
    },

    /// A result reported to an instance other than the one that produced its step.
    #[error("Received a result that did not originate from this instance")]
    ForeignResult,

    /// A result for a value that is never computed by a step.
    #[error("Received a result for {value_id}, which is never computed by a step")]
    UnexpectedResult {
        /// The value the result claims to be for.
        value_id: ValueId,
    },

    /// The value has no computed outcome yet.
    #[error("Value for {value_id} has not yet been computed")]
    NotYetComputed {
        /// The requested value.
        value_id: ValueId,
    },

    /// The requested key is not in the current key list.
    #[error("No value for {value_id}: the key is not in its key list")]
    NoSuchKey {
        /// The requested value.
        value_id: ValueId,
    },

    /// The value failed to compute.
    #[error("Value for {value_id} was not computed successfully: {failure}")]
    Failed {
        /// The requested value.
        value_id: ValueId,
        /// Everything that contributed to the failure.
        failure: TrickleFailure,
    },

    /// A stored value is newer than the inputs it was computed from.
    #[error(
        "Stored timestamp {stored} of {value_id} is newer than the latest input timestamp {inputs}"
    )]
    TimestampRegression {
        /// The value found in an impossible state.
        value_id: ValueId,
        /// Its stored timestamp.
        stored: u64,
        /// The newest timestamp among its inputs.
        inputs: u64,
    },
}

/// Why a value could not be computed.
///
/// `errors` holds the errors raised by node computations, keyed by the value whose computation
/// raised them. `missing_inputs` holds input values that have never been supplied. Failures flow
/// downstream unchanged and are combined by union when a node has several failing inputs.
#[derive(Clone, Default)]
pub struct TrickleFailure {
    errors: IndexMap<ValueId, Arc<anyhow::Error>>,
    missing_inputs: IndexSet<ValueId>,
}

impl TrickleFailure {
    /// A failure caused by `error` while computing `value_id`.
    pub fn from_error(value_id: ValueId, error: Arc<anyhow::Error>) -> Self {
        let mut errors = IndexMap::new();
        errors.insert(value_id, error);
        Self {
            errors,
            missing_inputs: IndexSet::new(),
        }
    }

    /// A failure caused by `value_id` never having been supplied.
    pub fn missing_input(value_id: ValueId) -> Self {
        let mut missing_inputs = IndexSet::new();
        missing_inputs.insert(value_id);
        Self {
            errors: IndexMap::new(),
            missing_inputs,
        }
    }

    /// The union of several failures.
    pub fn combine<'a>(failures: impl IntoIterator<Item = &'a TrickleFailure>) -> Self {
        let mut combined = Self::default();
        for failure in failures {
            combined.merge(failure);
        }
        combined
    }

    /// Add everything in `other` to this failure.
    pub fn merge(&mut self, other: &TrickleFailure) {
        for (value_id, error) in &other.errors {
            self.errors
                .entry(value_id.clone())
                .or_insert_with(|| error.clone());
        }
        self.missing_inputs
            .extend(other.missing_inputs.iter().cloned());
    }

    /// Errors raised by computations, keyed by the value being computed.
    pub fn errors(&self) -> &IndexMap<ValueId, Arc<anyhow::Error>> {
        &self.errors
    }

    /// Inputs that have never been supplied.
    pub fn missing_inputs(&self) -> &IndexSet<ValueId> {
        &self.missing_inputs
    }
}

impl PartialEq for TrickleFailure {
    /// Failures are equal when they name the same values; errors are compared by message.
    fn eq(&self, other: &Self) -> bool {
        self.missing_inputs == other.missing_inputs
            && self.errors.len() == other.errors.len()
            && self.errors.iter().all(|(value_id, error)| {
                other.errors.get(value_id).is_some_and(|other_error| {
                    Arc::ptr_eq(error, other_error) || error.to_string() == other_error.to_string()
                })
            })
    }
}

impl fmt::Debug for TrickleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrickleFailure")
            .field(
                "errors",
                &self
                    .errors
                    .iter()
                    .map(|(value_id, error)| (value_id, error.to_string()))
                    .collect::<Vec<_>>(),
            )
            .field("missing_inputs", &self.missing_inputs)
            .finish()
    }
}

impl fmt::Display for TrickleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (value_id, error) in &self.errors {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{} failed: {:#}", value_id, error)?;
        }
        if !self.missing_inputs.is_empty() {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "missing inputs: {:?}", self.missing_inputs)?;
        }
        Ok(())
    }
}
