//! Support for host API activity records, obtained by enabling
//! [`crate::activity::Kind::Api`].

use std::ffi::c_char;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::utils::{intern, interned_str};

/// Raw layout of an API record. `name` is only decoded if it was interned by [RawApi::new].
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawApi {
    pub kind: u32,
    pub pad: u32,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub process_id: super::ProcessId,
    pub thread_id: super::ThreadId,
    pub correlation_id: super::CorrelationId,
    pub name: *const c_char,
}

impl RawApi {
    pub fn new(
        start: super::Timestamp,
        end: super::Timestamp,
        process_id: super::ProcessId,
        thread_id: super::ThreadId,
        correlation_id: super::CorrelationId,
        name: &str,
    ) -> Self {
        Self {
            kind: super::Kind::Api as u32,
            pad: 0,
            start,
            end,
            process_id,
            thread_id,
            correlation_id,
            name: intern(name),
        }
    }
}

/// API activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub process_id: super::ProcessId,
    pub thread_id: super::ThreadId,
    pub correlation_id: super::CorrelationId,
    pub name: Option<String>,
}

impl From<&RawApi> for Record {
    fn from(value: &RawApi) -> Self {
        Self {
            start: value.start,
            end: value.end,
            process_id: value.process_id,
            thread_id: value.thread_id,
            correlation_id: value.correlation_id,
            name: interned_str(value.name).map(ToOwned::to_owned),
        }
    }
}
