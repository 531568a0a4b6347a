//! Support for kernel activity records, obtained by enabling [`crate::activity::Kind::Kernel`].

use std::ffi::c_char;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::utils::{intern_opt, interned_demangled, interned_str};

/// Raw layout of a kernel record.
///
/// `kernel_type` and `name` are only decoded if they were interned by [RawKernel::new].
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawKernel {
    pub kind: u32,
    pub pad: u32,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub device_id: super::DeviceId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::CorrelationId,
    pub kernel_type: *const c_char,
    pub name: *const c_char,
}

impl RawKernel {
    pub fn new(
        start: super::Timestamp,
        end: super::Timestamp,
        device_id: super::DeviceId,
        stream_id: super::StreamId,
        correlation_id: super::CorrelationId,
        kernel_type: Option<&str>,
        name: Option<&str>,
    ) -> Self {
        Self {
            kind: super::Kind::Kernel as u32,
            pad: 0,
            start,
            end,
            device_id,
            stream_id,
            correlation_id,
            kernel_type: intern_opt(kernel_type),
            name: intern_opt(name),
        }
    }
}

/// Kernel activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub device_id: super::DeviceId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::CorrelationId,
    /// The kind of compute unit the kernel ran on, e.g. `AI_CORE`.
    pub kernel_type: Option<String>,
    /// The kernel name, demangled if it is a mangled symbol.
    pub name: Option<String>,
}

impl Record {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

impl From<&RawKernel> for Record {
    fn from(value: &RawKernel) -> Self {
        Self {
            start: value.start,
            end: value.end,
            device_id: value.device_id,
            stream_id: value.stream_id,
            correlation_id: value.correlation_id,
            kernel_type: interned_str(value.kernel_type).map(ToOwned::to_owned),
            name: interned_demangled(value.name),
        }
    }
}
