//! Trickle: an incremental evaluation engine for graphs of named, typed nodes.
//!
//! A graph is declared once with a [`DefinitionBuilder`] and then instantiated any number of
//! times. Each [`Instance`] holds timestamped values; after inputs change, only values whose
//! inputs actually changed are recomputed.
//!
//! # Key Features
//!
//! - **Three node kinds**: plain values, dynamic key lists, and keyed nodes with one value per key
//! - **Timestamp-driven staleness**: every stored value records the input round it reflects
//! - **Two-phase evaluation**: independent [`Step`]s run outside the instance lock, in any order
//!   or in parallel, and their results are reported back
//! - **Partial failure**: errors and unset inputs are captured as [`TrickleFailure`] data and
//!   flow downstream; a [`Catch`] fallback can substitute a value
//! - **Pull-based reads**: [`SyncInstance`] evaluates only what one read needs
//!
//! # Example
//!
//! ```ignore
//! use trickle::{DefinitionBuilder, InputReceiver, NodeName};
//!
//! let a = NodeName::<i32>::new("a");
//! let b = NodeName::<i32>::new("b");
//!
//! let mut builder = DefinitionBuilder::new();
//! let a_node = builder.create_input_node(&a)?;
//! builder.create_node1(&b, &a_node.output(), |a: &i32| Ok(a * 2), None)?;
//!
//! let instance = builder.build().instantiate_sync();
//! instance.set_input(&a, 3)?;
//! assert_eq!(instance.get_value(&b)?, 6);
//! ```
//!
//! # Observing evaluation
//!
//! Instances report scheduling, stored failures, and reported results to a [`Tracer`]. See the
//! [`tracer`] module.

mod definition;
mod error;
mod input;
mod key;
mod key_list;
mod name;
mod query;
mod runtime;
mod step;
mod storage;
mod sync;
pub mod tracer;
mod value_id;

pub use definition::{
    AnyInput, BuiltKeyListNode, BuiltKeyedNode, BuiltNode, Catch, Definition, DefinitionBuilder,
    Input, NodeValue, RelevantValues,
};
pub use error::{TrickleError, TrickleFailure};
pub use input::{InputChange, InputReceiver};
pub use key::{Key, KeyType};
pub use key_list::KeyList;
pub use name::{KeyListNodeName, KeyedAt, KeyedNodeName, NodeName};
pub use query::{NodeOutcome, NodeQuery};
pub use runtime::{Instance, InstanceBuilder};
pub use step::{InputValues, Step, StepResult};
pub use storage::{Timestamp, Value};
pub use sync::SyncInstance;
pub use tracer::{LogTracer, NoopTracer, ResultDisposition, Tracer};
pub use value_id::ValueId;
