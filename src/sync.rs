//! Pull-based evaluation: compute just enough to answer one read.

use crate::error::TrickleError;
use crate::input::{InputChange, InputReceiver};
use crate::query::{NodeOutcome, NodeQuery};
use crate::runtime::Instance;
use crate::storage::Timestamp;
use crate::value_id::ValueId;

/// An [`Instance`] that evaluates on demand.
///
/// Each read first runs every step the requested value depends on, and nothing else, on the
/// calling thread.
///
/// # Example
///
/// ```ignore
/// let instance = definition.instantiate_sync();
/// instance.set_input(&a, 3)?;
/// assert_eq!(instance.get_value(&b)?, 6);
/// ```
#[derive(Debug)]
pub struct SyncInstance {
    instance: Instance,
}

impl SyncInstance {
    pub(crate) fn new(instance: Instance) -> Self {
        Self { instance }
    }

    /// The wrapped instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Evaluate everything `target` depends on.
    fn evaluate(&self, target: &ValueId) -> Result<(), TrickleError> {
        let relevant = self.instance.definition().relevant_values(target);
        let mut round = 0usize;
        loop {
            let steps = self.instance.next_steps(Some(&relevant))?;
            if steps.is_empty() {
                return Ok(());
            }
            tracing::trace!(value_id = %target, round, steps = steps.len(), "evaluating");
            for step in steps {
                self.instance.report_result(step.execute())?;
            }
            round += 1;
        }
    }

    /// The value of `query` after evaluating its dependencies.
    pub fn get_value<Q: NodeQuery>(&self, query: &Q) -> Result<Q::Output, TrickleError> {
        let value_id = self.instance.check_query(query)?;
        self.evaluate(&value_id)?;
        self.instance.get_node_value(query)
    }

    /// The outcome of `query` after evaluating its dependencies.
    pub fn get_outcome<Q: NodeQuery>(
        &self,
        query: &Q,
    ) -> Result<NodeOutcome<Q::Output>, TrickleError> {
        let value_id = self.instance.check_query(query)?;
        self.evaluate(&value_id)?;
        self.instance.get_node_outcome(query)
    }

    /// Evaluate the whole graph.
    pub fn complete_synchronously(&self) -> Result<(), TrickleError> {
        self.instance.complete_synchronously()
    }
}

impl InputReceiver for SyncInstance {
    fn set_inputs(&self, changes: Vec<InputChange>) -> Result<Timestamp, TrickleError> {
        self.instance.set_inputs(changes)
    }
}
