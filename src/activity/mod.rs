//! The Activity API: kind-tagged records packed into client buffers.
//!
//! Producers hand raw, fixed-layout records to the [`manager::ActivityManager`], which packs
//! them into buffers obtained from the client and returns filled buffers through the
//! client's completion callback as [`RecordBuffer`]s.
use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    ptr::NonNull,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::FromRepr;
use tracing::{trace, warn};

use crate::error::MsptirError;

pub mod api;
pub mod buffer;
pub mod external_correlation;
pub mod kernel;
pub mod manager;
pub mod marker;
pub mod memcpy;

pub use external_correlation::ExternalKind;

/// Default activity buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;
/// Alignment of buffers allocated by this crate. Every record layout has a size that is a
/// multiple of this, so records stay naturally aligned inside such buffers.
pub const BUFFER_ALIGN: usize = 8;

/// Raw value of the invalid activity kind sentinel.
pub const KIND_INVALID: u32 = 0;
/// Raw value one past the last valid activity kind.
pub const KIND_COUNT: u32 = 6;

/// The kind of an activity record.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum Kind {
    /// User markers, see [`crate::instrument::mark`].
    Marker = 1,
    /// Device kernel executions.
    Kernel = 2,
    /// Host API calls.
    Api = 3,
    /// Device memory copies.
    Memcpy = 4,
    /// Links between externally supplied ids and correlation ids.
    ExternalCorrelation = 5,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Marker,
        Kind::Kernel,
        Kind::Api,
        Kind::Memcpy,
        Kind::ExternalCorrelation,
    ];
}

impl TryFrom<u32> for Kind {
    type Error = MsptirError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            KIND_INVALID | KIND_COUNT => Err(MsptirError::SentinelEnum(value)),
            other => Self::from_repr(other).ok_or_else(|| {
                MsptirError::InvalidParameter(format!("unknown activity kind {other}"))
            }),
        }
    }
}

impl From<Kind> for u32 {
    fn from(value: Kind) -> Self {
        value as u32
    }
}

/// A time stamp in nanoseconds since the Unix epoch.
pub type Timestamp = u64;

pub type ProcessId = u32;
pub type ThreadId = u32;
pub type CorrelationId = u64;
pub type StreamId = u32;
pub type DeviceId = u32;

/// The common header of every raw record: its kind discriminant.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawActivity {
    pub kind: u32,
}

/// A fixed-layout record that can be copied into an activity buffer byte-for-byte.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, start with a `kind: u32` field holding [`Self::KIND`]
/// and contain no implicit padding, so that every byte of a value is initialized.
pub unsafe trait Activity: Copy + 'static {
    const KIND: Kind;

    /// The bytes of this record, as they are stored in a buffer.
    fn as_bytes(&self) -> &[u8] {
        // Safety: the trait contract guarantees there are no uninitialized padding bytes.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
    }

    /// Read a record of this layout from the start of `bytes`.
    fn read(bytes: &[u8]) -> Result<Self, MsptirError> {
        if bytes.len() < size_of::<Self>() {
            return Err(MsptirError::Corrupted);
        }
        // Safety: the length was checked above and the layout is plain old data. Buffers
        // handed in by clients are not required to be aligned.
        Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Declares the raw layout of every kind, generating the [`Activity`] implementations and
/// the per-kind record size table from one list.
macro_rules! activity_layouts {
    ($($kind:ident => $raw:ty),* $(,)?) => {
        $(
            unsafe impl Activity for $raw {
                const KIND: Kind = Kind::$kind;
            }

            #[cfg(target_pointer_width = "64")]
            const _: () = assert!(size_of::<$raw>() % BUFFER_ALIGN == 0);
        )*

        impl Kind {
            /// The size in bytes of records of this kind.
            pub const fn record_size(self) -> usize {
                match self {
                    $(Kind::$kind => size_of::<$raw>(),)*
                }
            }
        }
    };
}

activity_layouts! {
    Marker => marker::RawMarker,
    Kernel => kernel::RawKernel,
    Api => api::RawApi,
    Memcpy => memcpy::RawMemcpy,
    ExternalCorrelation => external_correlation::RawExternalCorrelation,
}

/// Read the kind of the record starting at `bytes`.
fn peek_kind(bytes: &[u8]) -> Option<u32> {
    bytes
        .get(..size_of::<u32>())
        .map(|kind| u32::from_ne_bytes([kind[0], kind[1], kind[2], kind[3]]))
}

/// Validate that `bytes` holds exactly one record and return its kind.
pub fn record_kind(bytes: &[u8]) -> Result<Kind, MsptirError> {
    let raw_kind = peek_kind(bytes).ok_or_else(|| {
        MsptirError::InvalidParameter(format!("record of {} bytes has no kind", bytes.len()))
    })?;
    let kind = Kind::try_from(raw_kind)?;
    if bytes.len() != kind.record_size() {
        return Err(MsptirError::InvalidParameter(format!(
            "{kind:?} record must be {} bytes, got {}",
            kind.record_size(),
            bytes.len()
        )));
    }
    Ok(kind)
}

/// An activity record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum Record {
    /// A user marker, enabled through [`Kind::Marker`].
    Marker(marker::Record),
    /// A device kernel execution, enabled through [`Kind::Kernel`].
    Kernel(kernel::Record),
    /// A host API call, enabled through [`Kind::Api`].
    Api(api::Record),
    /// A device memory copy, enabled through [`Kind::Memcpy`].
    Memcpy(memcpy::Record),
    /// A link between an external id and a correlation id, enabled through
    /// [`Kind::ExternalCorrelation`].
    ExternalCorrelation(external_correlation::Record),
}

impl Record {
    /// The kind of this record.
    pub fn kind(&self) -> Kind {
        match self {
            Record::Marker(_) => Kind::Marker,
            Record::Kernel(_) => Kind::Kernel,
            Record::Api(_) => Kind::Api,
            Record::Memcpy(_) => Kind::Memcpy,
            Record::ExternalCorrelation(_) => Kind::ExternalCorrelation,
        }
    }

    /// Decode the record at the start of `bytes`.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, MsptirError> {
        let kind = peek_kind(bytes)
            .and_then(Kind::from_repr)
            .ok_or(MsptirError::Corrupted)?;
        match kind {
            Kind::Marker => Ok(Record::Marker(
                (&marker::RawMarker::read(bytes)?).try_into()?,
            )),
            Kind::Kernel => Ok(Record::Kernel(
                (&kernel::RawKernel::read(bytes)?).into(),
            )),
            Kind::Api => Ok(Record::Api((&api::RawApi::read(bytes)?).into())),
            Kind::Memcpy => Ok(Record::Memcpy(
                (&memcpy::RawMemcpy::read(bytes)?).try_into()?,
            )),
            Kind::ExternalCorrelation => Ok(Record::ExternalCorrelation(
                (&external_correlation::RawExternalCorrelation::read(bytes)?).try_into()?,
            )),
        }
    }
}

/// Advance `record` to the next record in `buffer`.
///
/// A null `*record` starts at the beginning of the buffer. Each step reads the kind of the
/// record under the cursor and skips that kind's size. Returns
/// [`MsptirError::MaxLimitReached`] once the cursor reaches `valid_size`.
///
/// # Safety
/// `buffer` must be valid for reads of `valid_size` bytes and `*record` must be null or a
/// pointer previously produced by this function for the same buffer.
pub unsafe fn get_next_record(
    buffer: *const u8,
    valid_size: usize,
    record: &mut *const RawActivity,
) -> Result<(), MsptirError> {
    if buffer.is_null() {
        return Err(MsptirError::InvalidParameter("buffer is null".into()));
    }
    // Safety: the caller guarantees `valid_size` readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(buffer, valid_size) };

    let next_offset = if record.is_null() {
        0
    } else {
        let offset = (*record as usize)
            .checked_sub(buffer as usize)
            .filter(|offset| *offset < valid_size)
            .ok_or_else(|| {
                MsptirError::InvalidParameter("record cursor is outside of the buffer".into())
            })?;
        let kind = peek_kind(&bytes[offset..])
            .and_then(Kind::from_repr)
            .ok_or(MsptirError::Corrupted)?;
        offset + kind.record_size()
    };

    if next_offset >= valid_size {
        return Err(MsptirError::MaxLimitReached);
    }

    let kind = peek_kind(&bytes[next_offset..])
        .and_then(Kind::from_repr)
        .ok_or(MsptirError::Corrupted)?;
    if next_offset + kind.record_size() > valid_size {
        return Err(MsptirError::Corrupted);
    }

    *record = bytes[next_offset..].as_ptr() as *const RawActivity;
    Ok(())
}

/// Who frees the memory behind a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Allocated by [`buffer::BufferAllocation::alloc`], freed on drop.
    Crate,
    /// Supplied by a foreign client that frees it after it is handed back.
    Foreign,
}

pub(crate) fn buffer_layout(size: usize) -> Result<Layout, MsptirError> {
    Layout::from_size_align(size, BUFFER_ALIGN)
        .map_err(|e| MsptirError::InvalidParameter(format!("buffer layout: {e}")))
}

pub(crate) fn buffer_alloc(size: usize) -> Option<NonNull<u8>> {
    let layout = buffer_layout(size).ok().filter(|layout| layout.size() > 0)?;
    // Safety: the layout has a non-zero size.
    NonNull::new(unsafe { alloc_zeroed(layout) })
}

/// # Safety
/// `ptr` must have been returned by [buffer_alloc] with the same `size`.
pub(crate) unsafe fn buffer_free(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = buffer_layout(size) {
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }
}

/// A completed buffer with activity records, as handed to the client.
///
/// Dropping a buffer that was allocated by this crate frees it. Buffers supplied by a
/// foreign client must be returned with [`RecordBuffer::into_raw_parts`].
#[derive(Debug)]
pub struct RecordBuffer {
    /// Pointer to the raw bytes.
    ptr: NonNull<u8>,
    /// The size of the allocation.
    size: usize,
    /// The number of valid bytes within the buffer.
    valid_size: usize,
    origin: Origin,
}

// Safety: a RecordBuffer exclusively owns its memory; it is never aliased once delivered.
unsafe impl Send for RecordBuffer {}

impl RecordBuffer {
    /// Construct a RecordBuffer over crate-allocated memory.
    ///
    /// # Safety
    /// `ptr` must come from [buffer_alloc] with `size`, and `valid_size <= size`.
    pub(crate) unsafe fn from_parts(
        ptr: NonNull<u8>,
        size: usize,
        valid_size: usize,
        origin: Origin,
    ) -> Self {
        debug_assert!(valid_size <= size);
        Self {
            ptr,
            size,
            valid_size,
            origin,
        }
    }

    /// Attempt to construct a RecordBuffer over memory owned by a foreign client.
    ///
    /// If the supplied `ptr` is a nullptr, this function will return an error.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `size` bytes until the buffer is dropped or turned
    /// back into raw parts, and `valid_size` must not exceed `size`.
    pub unsafe fn try_from_foreign(
        ptr: *mut u8,
        size: usize,
        valid_size: usize,
    ) -> Result<Self, MsptirError> {
        let ptr = NonNull::new(ptr).ok_or(MsptirError::NullPointer)?;
        if valid_size > size {
            return Err(MsptirError::InvalidParameter(format!(
                "valid size {valid_size} exceeds buffer size {size}"
            )));
        }
        Ok(Self {
            ptr,
            size,
            valid_size,
            origin: Origin::Foreign,
        })
    }

    /// The size of the allocation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of bytes holding records.
    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    /// The valid bytes of this buffer.
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: construction guarantees `valid_size` readable bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.valid_size) }
    }

    /// Release ownership of the memory, returning `(ptr, size, valid_size)`.
    ///
    /// Memory allocated by this crate must be freed with its layout: size `size`,
    /// alignment [`BUFFER_ALIGN`].
    pub fn into_raw_parts(self) -> (*mut u8, usize, usize) {
        let parts = (self.ptr.as_ptr(), self.size, self.valid_size);
        std::mem::forget(self);
        parts
    }

    /// Iterate over the records of this buffer without consuming it.
    pub fn iter(&self) -> Records<'_> {
        Records {
            bytes: self.as_bytes(),
            cursor: std::ptr::null(),
            done: false,
        }
    }
}

impl Drop for RecordBuffer {
    fn drop(&mut self) {
        match self.origin {
            Origin::Crate => unsafe { buffer_free(self.ptr, self.size) },
            Origin::Foreign => {
                warn!(
                    "foreign activity buffer of {} bytes dropped without being returned",
                    self.size
                )
            }
        }
    }
}

/// Shared stepping logic of the record iterators.
fn next_record(
    bytes: &[u8],
    cursor: &mut *const RawActivity,
    done: &mut bool,
) -> Option<Result<Record, MsptirError>> {
    if *done {
        return None;
    }
    // Safety: `bytes` is a valid slice and the cursor is only ever advanced by
    // get_next_record over this same slice.
    match unsafe { get_next_record(bytes.as_ptr(), bytes.len(), cursor) } {
        Ok(()) => {
            let offset = *cursor as usize - bytes.as_ptr() as usize;
            Some(Record::try_from_bytes(&bytes[offset..]))
        }
        Err(MsptirError::MaxLimitReached) => {
            *done = true;
            None
        }
        Err(error) => {
            warn!("unexpected error in record buffer iterator: {error}");
            *done = true;
            Some(Err(error))
        }
    }
}

/// A borrowing iterator over the [`Record`]s of a [`RecordBuffer`].
pub struct Records<'a> {
    bytes: &'a [u8],
    cursor: *const RawActivity,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, MsptirError>;

    fn next(&mut self) -> Option<Self::Item> {
        next_record(self.bytes, &mut self.cursor, &mut self.done)
    }
}

impl<'a> IntoIterator for &'a RecordBuffer {
    type Item = Result<Record, MsptirError>;
    type IntoIter = Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for RecordBuffer {
    type Item = Result<Record, MsptirError>;
    type IntoIter = RecordBufferIterator;

    fn into_iter(self) -> Self::IntoIter {
        trace!("iterating record buffer of {} valid bytes", self.valid_size);
        RecordBufferIterator {
            buffer: self,
            current_record_ptr: std::ptr::null(),
            done: false,
        }
    }
}

/// An iterator over activity [`Record`]s in an owned [`RecordBuffer`].
pub struct RecordBufferIterator {
    buffer: RecordBuffer,
    current_record_ptr: *const RawActivity,
    done: bool,
}

// Safety: the cursor only points into the owned buffer.
unsafe impl Send for RecordBufferIterator {}

impl RecordBufferIterator {
    /// Give back the buffer, e.g. to return foreign memory after iterating.
    pub fn into_buffer(self) -> RecordBuffer {
        self.buffer
    }
}

impl Iterator for RecordBufferIterator {
    type Item = Result<Record, MsptirError>;

    fn next(&mut self) -> Option<Self::Item> {
        next_record(
            self.buffer.as_bytes(),
            &mut self.current_record_ptr,
            &mut self.done,
        )
    }
}
