//! The filling side of activity buffers.
//!
//! A [`BufferAllocation`] is what the client's request callback hands over. An
//! [`ActivityBuffer`] owns one allocation while records are appended to it, and turns it into
//! a [`RecordBuffer`] when it is delivered through the completion callback. Ownership only
//! moves forward: once delivered, the filling side no longer has access to the memory.

use std::ptr::NonNull;

use tracing::trace;

use super::{Origin, RecordBuffer, buffer_alloc, buffer_free};
use crate::error::MsptirError;

/// Type of callback function used to request a new buffer. Returning `None` declines.
pub type BufferRequestFn = dyn Fn() -> Option<BufferAllocation> + Send + Sync;

/// Type of callback function that receives completed buffers.
pub type BufferCompleteFn = dyn Fn(RecordBuffer) + Send + Sync;

/// Memory handed to the activity manager by a buffer request callback.
#[derive(Debug)]
pub struct BufferAllocation {
    ptr: NonNull<u8>,
    size: usize,
    max_num_records: usize,
    origin: Origin,
}

// Safety: the allocation is exclusively owned by this handle.
unsafe impl Send for BufferAllocation {}

impl BufferAllocation {
    /// Allocate a zero-initialized buffer of `size` bytes.
    ///
    /// `max_num_records == 0` means the buffer is bounded by its size only. Returns `None` if
    /// `size` is zero or the allocation fails.
    pub fn alloc(size: usize, max_num_records: usize) -> Option<Self> {
        buffer_alloc(size).map(|ptr| Self {
            ptr,
            size,
            max_num_records,
            origin: Origin::Crate,
        })
    }

    /// Wrap memory owned by a foreign client.
    ///
    /// The memory is never freed by this crate; it is handed back through
    /// [`RecordBuffer::into_raw_parts`].
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `size` bytes until the buffer is handed back.
    pub unsafe fn from_foreign(
        ptr: *mut u8,
        size: usize,
        max_num_records: usize,
    ) -> Result<Self, MsptirError> {
        let ptr = NonNull::new(ptr).ok_or(MsptirError::NullPointer)?;
        Ok(Self {
            ptr,
            size,
            max_num_records,
            origin: Origin::Foreign,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_num_records(&self) -> usize {
        self.max_num_records
    }
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        if self.origin == Origin::Crate {
            unsafe { buffer_free(self.ptr, self.size) }
        }
    }
}

/// A buffer that records are appended to.
#[derive(Debug, Default)]
pub struct ActivityBuffer {
    allocation: Option<BufferAllocation>,
    records_num: usize,
    valid_size: usize,
}

impl ActivityBuffer {
    /// An uninitialized buffer. Appending to it fails until [`ActivityBuffer::init`]
    /// succeeds.
    pub fn new() -> Self {
        Default::default()
    }

    /// Obtain memory from the client's request callback.
    ///
    /// If the client declines, the buffer stays uninitialized and an error is returned.
    pub fn init(&mut self, request: &BufferRequestFn) -> Result<(), MsptirError> {
        trace!("buffer requested");
        match request() {
            Some(allocation) if allocation.size > 0 => {
                trace!(
                    "buffer of {} bytes obtained, max records: {}",
                    allocation.size, allocation.max_num_records
                );
                self.allocation = Some(allocation);
                self.records_num = 0;
                self.valid_size = 0;
                Ok(())
            }
            _ => Err(MsptirError::Internal(
                "client declined to provide an activity buffer".into(),
            )),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.allocation.is_some()
    }

    /// Append one record.
    ///
    /// Fails without writing anything if the buffer is uninitialized, the record does not
    /// fit in the remaining space, or the buffer already holds its maximum number of
    /// records. Callers treat a failure as the signal to swap buffers.
    pub fn record(&mut self, record: &[u8]) -> Result<(), MsptirError> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| MsptirError::Internal("activity buffer is not initialized".into()))?;

        let end = self
            .valid_size
            .checked_add(record.len())
            .filter(|end| *end <= allocation.size)
            .ok_or_else(|| {
                MsptirError::Internal(format!(
                    "record of {} bytes does not fit, {} of {} bytes used",
                    record.len(),
                    self.valid_size,
                    allocation.size
                ))
            })?;
        if allocation.max_num_records != 0 && self.records_num >= allocation.max_num_records {
            return Err(MsptirError::Internal(format!(
                "buffer holds its maximum of {} records",
                allocation.max_num_records
            )));
        }

        // Safety: `end <= size`, and the allocation is exclusively owned by this buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                record.as_ptr(),
                allocation.ptr.as_ptr().add(self.valid_size),
                record.len(),
            );
        }
        self.valid_size = end;
        self.records_num += 1;
        Ok(())
    }

    /// Hand the buffer to the client's completion callback. Does nothing if the buffer was
    /// never initialized.
    pub fn un_init<F>(mut self, complete: F)
    where
        F: FnOnce(RecordBuffer),
    {
        if let Some(allocation) = self.allocation.take() {
            trace!(
                "buffer complete - size: {}, valid: {}, records: {}",
                allocation.size, self.valid_size, self.records_num
            );
            let ptr = allocation.ptr;
            let size = allocation.size;
            let origin = allocation.origin;
            std::mem::forget(allocation);
            // Safety: ownership of the allocation moves into the RecordBuffer.
            complete(unsafe { RecordBuffer::from_parts(ptr, size, self.valid_size, origin) });
        }
    }

    /// The size of the underlying allocation, zero if uninitialized.
    pub fn buf_size(&self) -> usize {
        self.allocation.as_ref().map_or(0, |a| a.size)
    }

    /// The number of bytes holding records.
    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    pub fn records_num(&self) -> usize {
        self.records_num
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::activity::{Kind, test::sample_record};

    fn init(size: usize, max_num_records: usize) -> ActivityBuffer {
        let mut buffer = ActivityBuffer::new();
        buffer
            .init(&move || BufferAllocation::alloc(size, max_num_records))
            .unwrap();
        buffer
    }

    #[test]
    fn uninitialized_buffer_rejects_records() {
        let mut buffer = ActivityBuffer::new();
        assert!(!buffer.is_initialized());
        assert!(buffer.record(&sample_record(Kind::Api, 0)).is_err());
        assert_eq!(buffer.buf_size(), 0);
        // Nothing to deliver.
        buffer.un_init(|_| panic!("uninitialized buffer delivered"));
    }

    #[test]
    fn declined_request_leaves_buffer_uninitialized() {
        let mut buffer = ActivityBuffer::new();
        assert!(buffer.init(&|| None).is_err());
        assert!(buffer.init(&|| BufferAllocation::alloc(0, 0)).is_err());
        assert!(!buffer.is_initialized());
    }

    #[test]
    fn capacity_bound() {
        let record = sample_record(Kind::ExternalCorrelation, 0);
        let mut buffer = init(record.len() * 3 + record.len() / 2, 0);
        for _ in 0..3 {
            buffer.record(&record).unwrap();
        }
        assert!(buffer.record(&record).is_err());
        assert_eq!(buffer.valid_size(), record.len() * 3);
        assert_eq!(buffer.records_num(), 3);
        assert!(buffer.valid_size() <= buffer.buf_size());

        let mut delivered = None;
        buffer.un_init(|b| delivered = Some(b));
        let delivered = delivered.unwrap();
        assert_eq!(delivered.valid_size(), record.len() * 3);
        assert_eq!(delivered.iter().count(), 3);
    }

    #[test]
    fn record_count_bound() {
        let record = sample_record(Kind::Marker, 0);
        let mut buffer = init(4096, 2);
        buffer.record(&record).unwrap();
        buffer.record(&record).unwrap();
        assert!(buffer.record(&record).is_err());
        assert_eq!(buffer.records_num(), 2);
    }

    #[test]
    fn foreign_allocation_is_handed_back() {
        let mut memory = vec![0u64; 32];
        let ptr = memory.as_mut_ptr() as *mut u8;
        let size = memory.len() * size_of::<u64>();
        let address = ptr as usize;
        let mut buffer = ActivityBuffer::new();
        buffer
            .init(&move || {
                unsafe { BufferAllocation::from_foreign(address as *mut u8, size, 0) }.ok()
            })
            .unwrap();
        buffer.record(&sample_record(Kind::Api, 1)).unwrap();

        let mut parts = None;
        buffer.un_init(|b| parts = Some(b.into_raw_parts()));
        assert_eq!(parts, Some((ptr, size, Kind::Api.record_size())));
    }
}
