//! Support for marker activity records, obtained by enabling
//! [`crate::activity::Kind::Marker`].

use std::ffi::c_char;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::{
    error::MsptirError,
    utils::{intern_opt, interned_str},
};

/// What a marker record marks.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum Flag {
    /// A single point in time.
    Instantaneous = 1,
    /// The start of a range.
    Start = 2,
    /// The end of a range.
    End = 4,
}

/// Where the marker was observed.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum SourceKind {
    Host = 0,
    Device = 1,
}

/// The object a marker belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum ObjectId {
    Process {
        process_id: super::ProcessId,
        thread_id: super::ThreadId,
    },
    Device {
        device_id: super::DeviceId,
        stream_id: super::StreamId,
    },
}

impl ObjectId {
    fn source_kind(&self) -> SourceKind {
        match self {
            ObjectId::Process { .. } => SourceKind::Host,
            ObjectId::Device { .. } => SourceKind::Device,
        }
    }

    fn to_raw(self) -> [u32; 2] {
        match self {
            ObjectId::Process {
                process_id,
                thread_id,
            } => [process_id, thread_id],
            ObjectId::Device {
                device_id,
                stream_id,
            } => [device_id, stream_id],
        }
    }
}

/// Raw layout of a marker record, 64 bytes on 64-bit targets.
///
/// `name` and `domain` are only decoded if they were interned by [RawMarker::new].
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawMarker {
    pub kind: u32,
    pub flag: u32,
    pub source_kind: u32,
    pub pad: u32,
    pub timestamp: super::Timestamp,
    pub id: u64,
    /// Process and thread id for host markers, device and stream id for device markers.
    pub object_id: [u32; 2],
    pub name: *const c_char,
    pub domain: *const c_char,
    pub reserved: u64,
}

impl RawMarker {
    pub fn new(
        flag: Flag,
        timestamp: super::Timestamp,
        id: u64,
        object_id: ObjectId,
        name: Option<&str>,
        domain: Option<&str>,
    ) -> Self {
        Self {
            kind: super::Kind::Marker as u32,
            flag: flag as u32,
            source_kind: object_id.source_kind() as u32,
            pad: 0,
            timestamp,
            id,
            object_id: object_id.to_raw(),
            name: intern_opt(name),
            domain: intern_opt(domain),
            reserved: 0,
        }
    }

    /// An instantaneous marker.
    pub fn instant(
        timestamp: super::Timestamp,
        id: u64,
        object_id: ObjectId,
        name: &str,
        domain: Option<&str>,
    ) -> Self {
        Self::new(Flag::Instantaneous, timestamp, id, object_id, Some(name), domain)
    }
}

/// Marker activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub flag: Flag,
    pub timestamp: super::Timestamp,
    pub id: u64,
    pub object_id: ObjectId,
    pub name: Option<String>,
    pub domain: Option<String>,
}

impl Record {
    pub fn source_kind(&self) -> SourceKind {
        self.object_id.source_kind()
    }
}

impl TryFrom<&RawMarker> for Record {
    type Error = MsptirError;

    fn try_from(value: &RawMarker) -> Result<Self, Self::Error> {
        let [first, second] = value.object_id;
        Ok(Self {
            flag: Flag::from_repr(value.flag).ok_or(MsptirError::Corrupted)?,
            timestamp: value.timestamp,
            id: value.id,
            object_id: match SourceKind::from_repr(value.source_kind)
                .ok_or(MsptirError::Corrupted)?
            {
                SourceKind::Host => ObjectId::Process {
                    process_id: first,
                    thread_id: second,
                },
                SourceKind::Device => ObjectId::Device {
                    device_id: first,
                    stream_id: second,
                },
            },
            name: interned_str(value.name).map(ToOwned::to_owned),
            domain: interned_str(value.domain).map(ToOwned::to_owned),
        })
    }
}
