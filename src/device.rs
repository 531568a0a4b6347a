//! Interfaces to per-device collection.
//!
//! The activity manager does not talk to devices itself. When a device is tracked through
//! [`ActivityManager::set_device`](crate::activity::manager::ActivityManager::set_device),
//! a [`DevProfTask`] is created for it, holding one [`DevProfJob`] per enabled kind that has
//! a device-side source. Jobs are produced by a client-supplied [`JobFactory`] and feed their
//! records back through an [`ActivitySink`].

use tracing::{trace, warn};

use crate::{
    activity::{DeviceId, Kind, manager::ActivitySink},
    error::MsptirError,
};

/// One device-side collection channel, e.g. sampling kernel executions of one device.
pub trait DevProfJob: Send {
    /// The kind of records this job produces.
    fn kind(&self) -> Kind;

    /// Start collecting. Records are expected to be delivered through `sink`, typically from
    /// a thread owned by the job.
    fn start(&mut self, sink: ActivitySink) -> Result<(), MsptirError>;

    /// Stop collecting. Must not return before the job stopped calling into its sink.
    fn stop(&mut self) -> Result<(), MsptirError>;
}

/// Creates collection jobs for devices.
pub trait JobFactory: Send + Sync {
    /// Create the job collecting `kind` on `device`, or `None` if `kind` has no device-side
    /// source.
    fn create(&self, device: DeviceId, kind: Kind) -> Option<Box<dyn DevProfJob>>;
}

/// The collection jobs of one device.
pub struct DevProfTask {
    device: DeviceId,
    jobs: Vec<Box<dyn DevProfJob>>,
}

impl std::fmt::Debug for DevProfTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevProfTask")
            .field("device", &self.device)
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DevProfTask {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            jobs: Vec::new(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The kinds for which a job is running.
    pub fn kinds(&self) -> Vec<Kind> {
        self.jobs.iter().map(|job| job.kind()).collect()
    }

    /// Start jobs for every kind in `kinds`. Stops at the first job that fails to start.
    pub fn start(
        &mut self,
        kinds: &[Kind],
        factory: &dyn JobFactory,
        sink: &ActivitySink,
    ) -> Result<(), MsptirError> {
        kinds
            .iter()
            .try_for_each(|kind| self.add_kind(*kind, factory, sink))
    }

    /// Start the job for `kind` unless it is already running.
    pub fn add_kind(
        &mut self,
        kind: Kind,
        factory: &dyn JobFactory,
        sink: &ActivitySink,
    ) -> Result<(), MsptirError> {
        if self.jobs.iter().any(|job| job.kind() == kind) {
            return Ok(());
        }
        if let Some(mut job) = factory.create(self.device, kind) {
            trace!("starting {kind:?} collection on device {}", self.device);
            job.start(sink.clone()).map_err(|error| {
                MsptirError::Device(format!(
                    "unable to start {kind:?} collection on device {}: {error}",
                    self.device
                ))
            })?;
            self.jobs.push(job);
        }
        Ok(())
    }

    /// Stop every job. Failures are logged and the first one is returned after all jobs were
    /// stopped.
    pub fn stop(&mut self) -> Result<(), MsptirError> {
        let mut first_error = None;
        for mut job in self.jobs.drain(..) {
            trace!("stopping {:?} collection on device {}", job.kind(), self.device);
            if let Err(error) = job.stop() {
                warn!(
                    "unable to stop {:?} collection on device {}: {error}",
                    job.kind(),
                    self.device
                );
                first_error.get_or_insert(MsptirError::Device(error.to_string()));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for DevProfTask {
    fn drop(&mut self) {
        if !self.jobs.is_empty() {
            if let Err(error) = self.stop() {
                warn!("unable to stop device task: {error}");
            }
        }
    }
}
