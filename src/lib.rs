//! Host-side activity tracing for AI accelerators.
//!
//! Timestamped, kind-tagged activity records produced by any number of threads are packed
//! into client-supplied buffers and handed back to the client once they are full, flushed,
//! or when tracing stops. The easiest way to get started is through a [Context]:
//!
//! ```no_run
//! use msptir::{Context, activity::Kind, instrument};
//!
//! let context = Context::builder()
//!     .with_kinds([Kind::Marker, Kind::Api])
//!     .with_record_buffer_handler(|buffer| {
//!         for record in buffer {
//!             println!("{:?}", record?);
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//! instrument::mark(context.manager(), "hello", None)?;
//! drop(context);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
use std::{collections::BTreeSet, num::NonZero, sync::Arc};

use tracing::{trace, warn};

pub mod activity;
pub mod correlation;
pub mod device;
pub mod error;
pub mod ffi;
pub mod instrument;
mod utils;

pub use error::MsptirError;

use activity::{
    DEFAULT_BUFFER_SIZE, DeviceId, Kind, RecordBuffer,
    manager::{ActivityManager, default_request_callback},
};
use device::JobFactory;

/// Type of the function handling completed activity record buffers.
pub type RecordBufferHandlerFn =
    dyn Fn(RecordBuffer) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// Configured tracing session on an [ActivityManager].
///
/// Dropping the context flushes outstanding records, disables the kinds it enabled, stops
/// collection on all devices and unregisters its buffer callbacks.
#[derive(Debug)]
pub struct Context {
    manager: Arc<ActivityManager>,
    enabled_kinds: Vec<Kind>,
}

impl Context {
    /// Return a builder to help set up the [Context].
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn manager(&self) -> &ActivityManager {
        &self.manager
    }

    pub fn enabled_kinds(&self) -> &[Kind] {
        &self.enabled_kinds
    }

    /// Flush the activity buffers, potentially triggering the record buffer handler.
    pub fn flush_activity(&self) -> Result<(), MsptirError> {
        self.manager.flush_all()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(error) = self.flush_activity() {
            warn!("unable to flush activity buffers: {error}");
        }

        trace!("disabling activity kinds: {:?}", self.enabled_kinds);
        if let Err(error) = self
            .enabled_kinds
            .iter()
            .try_for_each(|kind| self.manager.unregister(*kind))
        {
            warn!("unable to disable activity kinds: {error}");
        }

        if let Err(error) = self.manager.reset_all_device() {
            warn!("unable to reset devices: {error}");
        }
        if let Err(error) = self.manager.reset_callbacks() {
            warn!("unable to reset activity buffer callbacks: {error}");
        }
    }
}

/// Builder to help initialize a [Context].
pub struct ContextBuilder {
    enabled_kinds: BTreeSet<Kind>,
    record_buffer_handler: Option<Box<RecordBufferHandlerFn>>,
    buffer_size: usize,
    max_records_per_buffer: usize,
    flush_period: Option<NonZero<u32>>,
    devices: BTreeSet<DeviceId>,
    job_factory: Option<Arc<dyn JobFactory>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            enabled_kinds: BTreeSet::new(),
            record_buffer_handler: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_records_per_buffer: 0,
            flush_period: None,
            devices: BTreeSet::new(),
            job_factory: None,
        }
    }
}

impl ContextBuilder {
    /// Add the supplied activity kinds to the set of activated activity kinds.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.enabled_kinds.extend(kinds);
        self
    }

    /// Set the activity record buffer handler function.
    ///
    /// The handler function should return as quickly as possible to minimize profiling
    /// overhead.
    pub fn with_record_buffer_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(RecordBuffer) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.record_buffer_handler = Some(Box::new(handler));
        self
    }

    /// Set the size in bytes of the buffers records are packed into.
    ///
    /// Defaults to [DEFAULT_BUFFER_SIZE].
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Limit the number of records per buffer. 0, the default, fills buffers up to their
    /// size.
    pub fn max_records_per_buffer(mut self, records: usize) -> Self {
        self.max_records_per_buffer = records;
        self
    }

    /// Set the flush period in milliseconds.
    ///
    /// If interval is None, buffers are only delivered once they are full or flushed
    /// explicitly, which is the default mode of operation.
    pub fn flush_period(mut self, milliseconds: Option<NonZero<u32>>) -> Self {
        self.flush_period = milliseconds;
        self
    }

    /// Track the supplied devices.
    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.devices.extend(devices);
        self
    }

    /// Set the factory producing collection jobs for tracked devices.
    pub fn with_job_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.job_factory = Some(factory);
        self
    }

    /// Build the [Context] on the [global](ActivityManager::global) manager.
    pub fn build(self) -> Result<Context, MsptirError> {
        self.build_with_manager(Arc::clone(ActivityManager::global()))
    }

    /// Build the [Context] on the supplied manager.
    pub fn build_with_manager(self, manager: Arc<ActivityManager>) -> Result<Context, MsptirError> {
        let enabled_kinds: Vec<Kind> = self.enabled_kinds.into_iter().collect();
        let handler = match (self.record_buffer_handler, enabled_kinds.is_empty()) {
            (Some(_), true) => {
                return Err(MsptirError::Builder(
                    "record buffer handler provided, but no activity kinds were enabled".into(),
                ));
            }
            (None, false) => {
                return Err(MsptirError::Builder(format!(
                    "activity kinds {enabled_kinds:?} are enabled, but no record buffer handler is set"
                )));
            }
            (handler, _) => handler,
        };
        if self.buffer_size == 0 {
            return Err(MsptirError::Builder("buffer size must not be zero".into()));
        }

        if let Some(factory) = self.job_factory {
            manager.set_job_factory(factory)?;
        }

        if let Some(handler) = handler {
            trace!("registering activity buffer callbacks");
            manager.register_callbacks(
                Some(default_request_callback(
                    self.buffer_size,
                    self.max_records_per_buffer,
                )),
                Some(Box::new(move |buffer: RecordBuffer| {
                    if let Err(error) = handler(buffer) {
                        warn!(
                            "{}",
                            MsptirError::ActivityRecordBufferHandler(error.to_string())
                        );
                    }
                })),
            )?;
        }

        if let Some(milliseconds) = self.flush_period {
            manager.flush_period(milliseconds.get())?;
        }

        let context = Context {
            manager,
            enabled_kinds,
        };

        trace!("enabling activity kinds: {:?}", context.enabled_kinds);
        context
            .enabled_kinds
            .iter()
            .try_for_each(|kind| context.manager.register(*kind))?;

        trace!("tracking devices: {:?}", self.devices);
        self.devices
            .into_iter()
            .try_for_each(|device| context.manager.set_device(device))?;

        Ok(context)
    }
}
