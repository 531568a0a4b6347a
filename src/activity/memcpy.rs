//! Support for memcpy activity records, obtained by enabling [`crate::activity::Kind::Memcpy`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::error::MsptirError;

/// Direction of a memory copy.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum CopyKind {
    Unknown = 0,
    HostToHost = 1,
    HostToDevice = 2,
    DeviceToHost = 3,
    DeviceToDevice = 4,
}

/// Raw layout of a memcpy record.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawMemcpy {
    pub kind: u32,
    pub copy_kind: u32,
    pub bytes: u64,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub device_id: super::DeviceId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::CorrelationId,
    pub is_async: u8,
    pub pad: [u8; 7],
}

impl RawMemcpy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        copy_kind: CopyKind,
        bytes: u64,
        start: super::Timestamp,
        end: super::Timestamp,
        device_id: super::DeviceId,
        stream_id: super::StreamId,
        correlation_id: super::CorrelationId,
        is_async: bool,
    ) -> Self {
        Self {
            kind: super::Kind::Memcpy as u32,
            copy_kind: copy_kind as u32,
            bytes,
            start,
            end,
            device_id,
            stream_id,
            correlation_id,
            is_async: is_async.into(),
            pad: [0; 7],
        }
    }
}

/// Memcpy activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub copy_kind: CopyKind,
    pub bytes: u64,
    pub start: super::Timestamp,
    pub end: super::Timestamp,
    pub device_id: super::DeviceId,
    pub stream_id: super::StreamId,
    pub correlation_id: super::CorrelationId,
    pub is_async: bool,
}

impl TryFrom<&RawMemcpy> for Record {
    type Error = MsptirError;

    fn try_from(value: &RawMemcpy) -> Result<Self, Self::Error> {
        Ok(Self {
            copy_kind: CopyKind::from_repr(value.copy_kind).ok_or(MsptirError::Corrupted)?,
            bytes: value.bytes,
            start: value.start,
            end: value.end,
            device_id: value.device_id,
            stream_id: value.stream_id,
            correlation_id: value.correlation_id,
            is_async: value.is_async != 0,
        })
    }
}
