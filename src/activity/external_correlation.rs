//! Support for external correlation activity records, obtained by enabling
//! [`crate::activity::Kind::ExternalCorrelation`].
//!
//! These records are emitted by [`crate::correlation::ExternalCorrelationReporter`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::error::MsptirError;

/// Raw value of the invalid external kind sentinel.
pub const EXTERNAL_KIND_INVALID: u32 = 0;
/// Raw value one past the last valid external kind.
pub const EXTERNAL_KIND_COUNT: u32 = 5;

/// The kind of an externally supplied correlation id.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum ExternalKind {
    Unknown = 1,
    Custom0 = 2,
    Custom1 = 3,
    Custom2 = 4,
}

impl TryFrom<u32> for ExternalKind {
    type Error = MsptirError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            EXTERNAL_KIND_INVALID | EXTERNAL_KIND_COUNT => Err(MsptirError::SentinelEnum(value)),
            other => Self::from_repr(other).ok_or_else(|| {
                MsptirError::InvalidParameter(format!("unknown external correlation kind {other}"))
            }),
        }
    }
}

/// Raw layout of an external correlation record.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawExternalCorrelation {
    pub kind: u32,
    pub external_kind: u32,
    pub external_id: u64,
    pub correlation_id: super::CorrelationId,
}

impl RawExternalCorrelation {
    pub fn new(
        external_kind: ExternalKind,
        external_id: u64,
        correlation_id: super::CorrelationId,
    ) -> Self {
        Self {
            kind: super::Kind::ExternalCorrelation as u32,
            external_kind: external_kind as u32,
            external_id,
            correlation_id,
        }
    }
}

/// External correlation activity record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Record {
    pub external_kind: ExternalKind,
    pub external_id: u64,
    pub correlation_id: super::CorrelationId,
}

impl TryFrom<&RawExternalCorrelation> for Record {
    type Error = MsptirError;

    fn try_from(value: &RawExternalCorrelation) -> Result<Self, Self::Error> {
        Ok(Self {
            external_kind: ExternalKind::from_repr(value.external_kind)
                .ok_or(MsptirError::Corrupted)?,
            external_id: value.external_id,
            correlation_id: value.correlation_id,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn external_kind_conversion() {
        assert_eq!(ExternalKind::try_from(1), Ok(ExternalKind::Unknown));
        assert_eq!(ExternalKind::try_from(4), Ok(ExternalKind::Custom2));
        assert_eq!(
            ExternalKind::try_from(EXTERNAL_KIND_INVALID),
            Err(MsptirError::SentinelEnum(EXTERNAL_KIND_INVALID))
        );
        assert_eq!(
            ExternalKind::try_from(EXTERNAL_KIND_COUNT),
            Err(MsptirError::SentinelEnum(EXTERNAL_KIND_COUNT))
        );
        assert!(matches!(
            ExternalKind::try_from(17),
            Err(MsptirError::InvalidParameter(_))
        ));
    }

    #[test]
    fn unknown_external_kind_is_corrupted() {
        let mut raw = RawExternalCorrelation::new(ExternalKind::Custom1, 3, 4);
        assert_eq!(raw.correlation_id, 4);
        raw.external_kind = 9;
        assert_eq!(Record::try_from(&raw), Err(MsptirError::Corrupted));
    }
}
