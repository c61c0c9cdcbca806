//! Units of pending computation and their results.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::storage::{Timestamp, Value};
use crate::value_id::ValueId;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of the instance a step was produced by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Resolved input values handed to a node's function, in declaration order.
///
/// Key list inputs appear as `Vec<K>` and aggregated keyed inputs as `Vec<T>`.
pub struct InputValues {
    values: Vec<Value>,
}

impl InputValues {
    pub(crate) fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The input at `index`, as a `T`.
    pub fn get<T: 'static>(&self, index: usize) -> anyhow::Result<&T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| anyhow!("no input at index {} of {}", index, self.values.len()))?;
        value
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow!("input {} is not a {}", index, type_name::<T>()))
    }
}

type Operation = Box<dyn FnOnce() -> anyhow::Result<Value> + Send>;

/// An independent unit of computation produced by
/// [`Instance::get_next_steps`](crate::Instance::get_next_steps).
///
/// The inputs are captured when the step is created, so a step can be executed on any thread
/// without holding the instance lock. Its result goes back through
/// [`Instance::report_result`](crate::Instance::report_result).
pub struct Step {
    value_id: ValueId,
    timestamp: Timestamp,
    instance: InstanceId,
    catch_panics: bool,
    operation: Operation,
}

impl Step {
    pub(crate) fn new(
        value_id: ValueId,
        timestamp: Timestamp,
        instance: InstanceId,
        catch_panics: bool,
        operation: Operation,
    ) -> Self {
        Self {
            value_id,
            timestamp,
            instance,
            catch_panics,
            operation,
        }
    }

    /// The value this step computes.
    pub fn value_id(&self) -> &ValueId {
        &self.value_id
    }

    /// The input timestamp this step was computed from.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Run the computation.
    ///
    /// Errors returned by the node's function are captured in the result. Panics are captured
    /// too unless the instance was built with `catch_panics(false)`.
    pub fn execute(self) -> StepResult {
        let operation = self.operation;
        let result = if self.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(operation))
                .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(&*payload))))
        } else {
            operation()
        };
        StepResult {
            value_id: self.value_id,
            timestamp: self.timestamp,
            instance: self.instance,
            result: result.map_err(Arc::new),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("value_id", &self.value_id)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// The outcome of executing a [`Step`].
#[derive(Clone)]
pub struct StepResult {
    pub(crate) value_id: ValueId,
    pub(crate) timestamp: Timestamp,
    pub(crate) instance: InstanceId,
    pub(crate) result: Result<Value, Arc<anyhow::Error>>,
}

impl StepResult {
    /// The value this result is for.
    pub fn value_id(&self) -> &ValueId {
        &self.value_id
    }

    /// The input timestamp the value was computed from.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The computed value as a `T`, if the computation succeeded and produced a `T`.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.result.as_ref().ok()?.downcast_ref::<T>()
    }

    /// The captured error, if the computation failed.
    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.result.as_ref().err()
    }
}

impl fmt::Debug for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StepResult");
        debug
            .field("value_id", &self.value_id)
            .field("timestamp", &self.timestamp);
        match &self.result {
            Ok(_) => debug.field("result", &"Ok(..)"),
            Err(error) => debug.field("result", &format_args!("Err({})", error)),
        };
        debug.finish()
    }
}
