//! Tracer trait for observing evaluation.
//!
//! This module defines the [`Tracer`] trait and two implementations: [`NoopTracer`], the
//! default, which discards everything, and [`LogTracer`], which forwards every event to the
//! `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use trickle::{Tracer, ValueId, Timestamp};
//!
//! struct StepCounter(std::sync::atomic::AtomicUsize);
//!
//! impl Tracer for StepCounter {
//!     fn on_step_scheduled(&self, _value_id: &ValueId, _timestamp: Timestamp) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//!
//! let instance = definition.instance_builder().tracer(StepCounter(Default::default())).build();
//! ```

use crate::error::TrickleFailure;
use crate::storage::Timestamp;
use crate::value_id::ValueId;

/// What happened to a reported step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// The result was stored.
    Applied,
    /// The slot already held a value at the same or a newer timestamp.
    Stale,
    /// The result was for a key no longer in its key list.
    KeyRemoved,
}

/// Observer for instance events.
///
/// All methods have default empty implementations, so you only need to override the events
/// you're interested in.
///
/// Hooks are called while the instance lock is held. Implementations must not call back into
/// the instance.
pub trait Tracer: Send + Sync + 'static {
    /// Called after a batch of input changes, with the instance timestamp afterwards.
    #[inline]
    fn on_inputs_applied(&self, _timestamp: Timestamp, _changed: bool) {}

    /// Called for each step returned by `get_next_steps`.
    #[inline]
    fn on_step_scheduled(&self, _value_id: &ValueId, _timestamp: Timestamp) {}

    /// Called when a failure is stored without running a step.
    #[inline]
    fn on_failure_stored(
        &self,
        _value_id: &ValueId,
        _timestamp: Timestamp,
        _failure: &TrickleFailure,
    ) {
    }

    /// Called for each reported step result.
    #[inline]
    fn on_result_reported(
        &self,
        _value_id: &ValueId,
        _timestamp: Timestamp,
        _disposition: ResultDisposition,
    ) {
    }

    /// Called when a keyed value is dropped because its key left the key list.
    #[inline]
    fn on_keyed_value_pruned(&self, _value_id: &ValueId) {}
}

/// Tracer that discards all events. The default.
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that emits every event through `tracing`.
///
/// Scheduling events are logged at `trace` level, everything else at `debug`.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_inputs_applied(&self, timestamp: Timestamp, changed: bool) {
        tracing::debug!(timestamp, changed, "inputs applied");
    }

    fn on_step_scheduled(&self, value_id: &ValueId, timestamp: Timestamp) {
        tracing::trace!(%value_id, timestamp, "step scheduled");
    }

    fn on_failure_stored(&self, value_id: &ValueId, timestamp: Timestamp, failure: &TrickleFailure) {
        tracing::debug!(%value_id, timestamp, %failure, "failure stored");
    }

    fn on_result_reported(
        &self,
        value_id: &ValueId,
        timestamp: Timestamp,
        disposition: ResultDisposition,
    ) {
        tracing::trace!(%value_id, timestamp, ?disposition, "result reported");
    }

    fn on_keyed_value_pruned(&self, value_id: &ValueId) {
        tracing::debug!(%value_id, "keyed value pruned");
    }
}
