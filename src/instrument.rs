//! Producer-side helpers for instrumenting host code.
//!
//! These emit records into an [`ActivityManager`], typically the
//! [global](ActivityManager::global) one:
//!
//! ```no_run
//! use msptir::{activity::manager::ActivityManager, instrument};
//!
//! let manager = ActivityManager::global();
//! let range = instrument::range_start(manager, "load weights", Some("setup"))?;
//! {
//!     let _span = instrument::ApiSpan::enter(manager, "aclrtMemcpy")?;
//!     // ...
//! }
//! instrument::range_end(manager, range)?;
//! # Ok::<(), msptir::MsptirError>(())
//! ```

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::{
    activity::{
        CorrelationId, ProcessId, ThreadId, Timestamp,
        api::RawApi,
        manager::ActivityManager,
        marker::{Flag, ObjectId, RawMarker},
    },
    error::MsptirError,
};

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MARKER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: ThreadId = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// The current time in nanoseconds since the Unix epoch.
pub fn timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_nanos() as Timestamp)
}

/// A new process-wide unique correlation id. The first id is 1.
pub fn next_correlation_id() -> CorrelationId {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn process_id() -> ProcessId {
    std::process::id()
}

/// A small numeric id for the calling thread, stable for its lifetime.
pub fn thread_id() -> ThreadId {
    THREAD_ID.with(|id| *id)
}

fn host_object() -> ObjectId {
    ObjectId::Process {
        process_id: process_id(),
        thread_id: thread_id(),
    }
}

fn emit_marker(
    manager: &ActivityManager,
    flag: Flag,
    id: u64,
    message: Option<&str>,
    domain: Option<&str>,
) -> Result<(), MsptirError> {
    let marker = RawMarker::new(flag, timestamp(), id, host_object(), message, domain);
    manager.record_activity(&marker)
}

/// Emit an instantaneous marker. Returns the marker id.
pub fn mark(
    manager: &ActivityManager,
    message: &str,
    domain: Option<&str>,
) -> Result<u64, MsptirError> {
    let id = NEXT_MARKER_ID.fetch_add(1, Ordering::Relaxed);
    emit_marker(manager, Flag::Instantaneous, id, Some(message), domain)?;
    Ok(id)
}

/// Emit the start marker of a range. Returns the id to pass to [`range_end`].
pub fn range_start(
    manager: &ActivityManager,
    message: &str,
    domain: Option<&str>,
) -> Result<u64, MsptirError> {
    let id = NEXT_MARKER_ID.fetch_add(1, Ordering::Relaxed);
    emit_marker(manager, Flag::Start, id, Some(message), domain)?;
    Ok(id)
}

/// Emit the end marker of the range started with `id`.
pub fn range_end(manager: &ActivityManager, id: u64) -> Result<(), MsptirError> {
    emit_marker(manager, Flag::End, id, None, None)
}

/// Guard covering one host API call.
///
/// Entering allocates a correlation id and reports the current external correlation ids for
/// it. Dropping the guard records an Api record spanning its lifetime.
#[derive(Debug)]
pub struct ApiSpan<'a> {
    manager: &'a ActivityManager,
    name: &'a str,
    start: Timestamp,
    correlation_id: CorrelationId,
}

impl<'a> ApiSpan<'a> {
    pub fn enter(manager: &'a ActivityManager, name: &'a str) -> Result<Self, MsptirError> {
        let correlation_id = next_correlation_id();
        manager.report_external_correlation_id(correlation_id)?;
        Ok(Self {
            manager,
            name,
            start: timestamp(),
            correlation_id,
        })
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl Drop for ApiSpan<'_> {
    fn drop(&mut self) {
        let api = RawApi::new(
            self.start,
            timestamp(),
            process_id(),
            thread_id(),
            self.correlation_id,
            self.name,
        );
        if let Err(error) = self.manager.record_activity(&api) {
            warn!("unable to record api span {}: {error}", self.name);
        }
    }
}
