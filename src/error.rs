//! Error types used by this crate.

use thiserror::Error;

/// Msptir error kinds
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum MsptirError {
    /// A caller supplied a null callback, an out-of-range kind or a malformed record.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Unexpected internal state, e.g. a poisoned lock or a manager that is not running.
    #[error("internal error: {0}")]
    Internal(String),
    /// Popping an external correlation id for a kind that has nothing pushed.
    #[error("queue empty")]
    QueueEmpty,
    /// Record iteration reached the end of the valid part of a buffer.
    #[error("max limit reached")]
    MaxLimitReached,
    /// A nullptr check failed.
    #[error("unexpected nullptr")]
    NullPointer,
    /// A record inside a buffer could not be decoded, typically an invalid kind value or a
    /// record crossing the end of the valid region.
    #[error("<corrupted>")]
    Corrupted,
    /// A value was a sentinel enum value.
    #[error("unexpected sentinel enum variant: {0}")]
    SentinelEnum(u32),
    /// An error related to the record buffer handler.
    #[error("activity record buffer handler: {0}")]
    ActivityRecordBufferHandler(String),
    /// An error attempting to build some context. Typically a misconfiguration issue.
    #[error("builder: {0}")]
    Builder(String),
    /// A device collection job failed to start or stop.
    #[error("device: {0}")]
    Device(String),
}

impl MsptirError {
    /// Map this error onto the result code of the C interface.
    pub fn result_code(&self) -> crate::ffi::MsptirResult {
        use crate::ffi::MsptirResult as R;
        match self {
            MsptirError::InvalidParameter(_)
            | MsptirError::NullPointer
            | MsptirError::SentinelEnum(_) => R::InvalidParameter,
            MsptirError::QueueEmpty => R::QueueEmpty,
            MsptirError::MaxLimitReached => R::MaxLimitReached,
            MsptirError::Builder(_) => R::NotReady,
            MsptirError::Internal(_)
            | MsptirError::Corrupted
            | MsptirError::ActivityRecordBufferHandler(_)
            | MsptirError::Device(_) => R::InternalError,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MsptirError {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        MsptirError::Internal(format!("lock poisoned: {value}"))
    }
}
