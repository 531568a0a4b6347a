//! External correlation: linking host call contexts supplied by the client to the
//! correlation ids of activity records.
//!
//! Clients push an id for an [`ExternalKind`] before calling into an instrumented API and
//! pop it afterwards. Whenever the instrumented API allocates a correlation id, the current
//! top of every kind's stack is reported as an
//! [`external_correlation::Record`](crate::activity::external_correlation::Record).

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use tracing::trace;

use crate::{
    activity::{
        Activity, CorrelationId, ExternalKind, Kind,
        external_correlation::RawExternalCorrelation,
    },
    error::MsptirError,
};

/// Something that accepts raw activity records.
pub trait RecordSink: Send + Sync {
    /// Append one raw record.
    fn record(&self, record: &[u8]) -> Result<(), MsptirError>;

    /// Whether records of `kind` are currently collected.
    fn is_activity_kind_enable(&self, kind: Kind) -> bool;
}

/// Per-kind stacks of externally supplied correlation ids.
#[derive(Debug, Default)]
pub struct ExternalCorrelationReporter {
    stacks: Mutex<BTreeMap<ExternalKind, Vec<u64>>>,
}

impl ExternalCorrelationReporter {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<ExternalKind, Vec<u64>>>, MsptirError> {
        Ok(self.stacks.lock()?)
    }

    /// Push `id` onto the stack of `kind`.
    pub fn push_external_correlation_id(
        &self,
        kind: ExternalKind,
        id: u64,
    ) -> Result<(), MsptirError> {
        self.lock()?.entry(kind).or_default().push(id);
        Ok(())
    }

    /// Pop the most recently pushed id of `kind`.
    ///
    /// Returns [`MsptirError::QueueEmpty`] if nothing is pushed for `kind`.
    pub fn pop_external_correlation_id(&self, kind: ExternalKind) -> Result<u64, MsptirError> {
        let mut stacks = self.lock()?;
        let stack = stacks.get_mut(&kind).ok_or(MsptirError::QueueEmpty)?;
        let id = stack.pop().ok_or(MsptirError::QueueEmpty)?;
        if stack.is_empty() {
            stacks.remove(&kind);
        }
        Ok(id)
    }

    /// The number of ids currently pushed for `kind`.
    pub fn depth(&self, kind: ExternalKind) -> usize {
        self.lock()
            .map(|stacks| stacks.get(&kind).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Emit one external correlation record per tracked external kind, linking the top of
    /// its stack to `correlation_id`.
    ///
    /// Does nothing if [`Kind::ExternalCorrelation`] is disabled. A failure to emit a record
    /// aborts the remaining kinds; records emitted for earlier kinds are kept.
    pub fn report_external_correlation_id(
        &self,
        sink: &dyn RecordSink,
        correlation_id: CorrelationId,
    ) -> Result<(), MsptirError> {
        if !sink.is_activity_kind_enable(Kind::ExternalCorrelation) {
            return Ok(());
        }
        let stacks = self.lock()?;
        for (kind, stack) in stacks.iter() {
            if let Some(external_id) = stack.last() {
                trace!("reporting external correlation {kind:?}:{external_id} -> {correlation_id}");
                let record = RawExternalCorrelation::new(*kind, *external_id, correlation_id);
                sink.record(record.as_bytes()).map_err(|error| {
                    MsptirError::Internal(format!(
                        "unable to report external correlation id for {kind:?}: {error}"
                    ))
                })?;
            }
        }
        Ok(())
    }
}
