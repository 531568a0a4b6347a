//! C interface over the [global](ActivityManager::global) activity manager.
//!
//! Buffers obtained through the C request callback are owned by the client. They are never
//! freed by this crate and are always handed back through the C complete callback, including
//! buffers that hold no records when callbacks are reset.

use tracing::{trace, warn};

use crate::{
    activity::{
        ExternalKind, Kind, RawActivity, RecordBuffer,
        buffer::{BufferAllocation, BufferCompleteFn, BufferRequestFn},
        get_next_record,
        manager::ActivityManager,
    },
    error::MsptirError,
};

/// Result codes of the C interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum MsptirResult {
    Success = 0,
    InvalidParameter = 1,
    InternalError = 2,
    MaxLimitReached = 3,
    QueueEmpty = 4,
    NotReady = 5,
}

impl From<Result<(), MsptirError>> for MsptirResult {
    fn from(value: Result<(), MsptirError>) -> Self {
        match value {
            Ok(()) => MsptirResult::Success,
            Err(error) => error.result_code(),
        }
    }
}

/// Called when a new buffer is needed. The client stores the buffer, its size and the
/// maximum number of records (0 for no limit) in the out parameters, or a nullptr to
/// decline.
pub type MsptirBufferRequestFn =
    unsafe extern "C" fn(buffer: *mut *mut u8, size: *mut usize, max_num_records: *mut usize);

/// Called with a buffer previously handed out by the request callback.
pub type MsptirBufferCompleteFn =
    unsafe extern "C" fn(buffer: *mut u8, size: usize, valid_size: usize);

fn manager() -> &'static ActivityManager {
    ActivityManager::global()
}

fn request_foreign(request: MsptirBufferRequestFn) -> Option<BufferAllocation> {
    let mut buffer = std::ptr::null_mut();
    let mut size = 0;
    let mut max_num_records = 0;
    // Safety: the out parameters point to valid locals.
    unsafe { request(&mut buffer, &mut size, &mut max_num_records) };
    trace!("client provided buffer {buffer:?} of {size} bytes");
    // Safety: the client hands over a buffer valid for `size` bytes until it is completed.
    unsafe { BufferAllocation::from_foreign(buffer, size, max_num_records) }.ok()
}

fn complete_foreign(complete: MsptirBufferCompleteFn, buffer: RecordBuffer) {
    let (ptr, size, valid_size) = buffer.into_raw_parts();
    // Safety: the buffer goes back to the client it was obtained from.
    unsafe { complete(ptr, size, valid_size) }
}

/// Register the buffer callbacks and start delivering buffers.
#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_register_callbacks(
    request: Option<MsptirBufferRequestFn>,
    complete: Option<MsptirBufferCompleteFn>,
) -> MsptirResult {
    manager()
        .register_callbacks(
            request.map(|request| {
                Box::new(move || request_foreign(request)) as Box<BufferRequestFn>
            }),
            complete.map(|complete| {
                Box::new(move |buffer: RecordBuffer| complete_foreign(complete, buffer))
                    as Box<BufferCompleteFn>
            }),
        )
        .into()
}

#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_enable(kind: u32) -> MsptirResult {
    Kind::try_from(kind)
        .and_then(|kind| manager().register(kind))
        .into()
}

#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_disable(kind: u32) -> MsptirResult {
    Kind::try_from(kind)
        .and_then(|kind| manager().unregister(kind))
        .into()
}

/// Deliver all buffers holding records. Returns once they were completed.
#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_flush_all() -> MsptirResult {
    manager().flush_all().into()
}

/// Set the periodic flush interval in milliseconds, 0 to disable.
#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_flush_period(time_ms: u32) -> MsptirResult {
    manager().flush_period(time_ms).into()
}

/// Advance `record` to the next record of `buffer`. Start with `*record` set to a nullptr.
///
/// # Safety
/// `buffer` must be valid for reads of `valid_size` bytes and `record` must be a valid
/// pointer to a nullptr or to a record previously returned for the same buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn msptir_activity_get_next_record(
    buffer: *const u8,
    valid_size: usize,
    record: *mut *const RawActivity,
) -> MsptirResult {
    // Safety: checked for null, validity is up to the caller.
    let Some(record) = (unsafe { record.as_mut() }) else {
        return MsptirResult::InvalidParameter;
    };
    unsafe { get_next_record(buffer, valid_size, record) }.into()
}

#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_push_external_correlation_id(
    kind: u32,
    id: u64,
) -> MsptirResult {
    ExternalKind::try_from(kind)
        .and_then(|kind| manager().push_external_correlation_id(kind, id))
        .into()
}

/// Pop the most recently pushed id of `kind` into `last_id`. Nothing is popped if `last_id`
/// is a nullptr.
///
/// # Safety
/// `last_id` must be a nullptr or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn msptir_activity_pop_external_correlation_id(
    kind: u32,
    last_id: *mut u64,
) -> MsptirResult {
    // Safety: checked for null, validity is up to the caller.
    let Some(last_id) = (unsafe { last_id.as_mut() }) else {
        warn!("msptir_activity_pop_external_correlation_id called with a nullptr");
        return MsptirResult::InvalidParameter;
    };
    let id =
        ExternalKind::try_from(kind).and_then(|kind| manager().pop_external_correlation_id(kind));
    match id {
        Ok(id) => {
            *last_id = id;
            MsptirResult::Success
        }
        Err(error) => error.result_code(),
    }
}

/// Append one raw record of `size` bytes, e.g. from an external parser.
///
/// String fields of records appended this way are handed back to C clients as they are, but
/// are not decoded by the Rust [Record](crate::activity::Record) types.
///
/// # Safety
/// `record` must be a nullptr or valid for reads of `size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn msptir_activity_record(record: *const u8, size: usize) -> MsptirResult {
    if record.is_null() {
        warn!("msptir_activity_record called with a nullptr");
        return MsptirResult::InvalidParameter;
    }
    // Safety: checked for null, validity is up to the caller.
    let record = unsafe { std::slice::from_raw_parts(record, size) };
    manager().record(record).into()
}

/// Stop every device job, hand all buffers back through the complete callback and stop the
/// worker. Callbacks can be registered again afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn msptir_activity_finalize() -> MsptirResult {
    manager().shutdown().into()
}

#[unsafe(no_mangle)]
pub extern "C" fn msptir_set_device(device: u32) -> MsptirResult {
    manager().set_device(device).into()
}

#[unsafe(no_mangle)]
pub extern "C" fn msptir_reset_all_device() -> MsptirResult {
    manager().reset_all_device().into()
}

/// Store the number of records dropped so far in `count`.
///
/// # Safety
/// `count` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn msptir_dropped_records(count: *mut u64) -> MsptirResult {
    // Safety: checked for null, validity is up to the caller.
    match unsafe { count.as_mut() } {
        Some(count) => {
            *count = manager().dropped_records();
            MsptirResult::Success
        }
        None => {
            warn!("msptir_dropped_records called with a nullptr");
            MsptirResult::InvalidParameter
        }
    }
}
