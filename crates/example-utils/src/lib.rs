//! A synthetic accelerator for tests and demos.
//!
//! [SyntheticDevices] is a [JobFactory] whose jobs pretend to sample a device: each job
//! runs a thread that emits kernel or memcpy records through its sink until stopped.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use msptir::{
    MsptirError,
    activity::{
        DeviceId, Kind,
        kernel::RawKernel,
        manager::ActivitySink,
        memcpy::{CopyKind, RawMemcpy},
    },
    device::{DevProfJob, JobFactory},
    instrument,
};
use tracing::{trace, warn};

/// Mangled name of the kernel the synthetic device pretends to run.
pub const KERNEL_NAME: &str = "_Z10sin_kernelPfPKfm";

/// Creates [SyntheticJob]s for kernel and memcpy records.
#[derive(Debug)]
pub struct SyntheticDevices {
    interval: Duration,
    records_per_job: Option<u64>,
    emitted: Arc<AtomicU64>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl SyntheticDevices {
    /// Jobs emit one record every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            records_per_job: None,
            emitted: Arc::default(),
        }
    }

    /// Stop each job after it emitted `records` records.
    pub fn with_records_per_job(mut self, records: u64) -> Self {
        self.records_per_job = Some(records);
        self
    }

    /// Records successfully handed to a sink by all jobs of this factory.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl JobFactory for SyntheticDevices {
    fn create(&self, device: DeviceId, kind: Kind) -> Option<Box<dyn DevProfJob>> {
        matches!(kind, Kind::Kernel | Kind::Memcpy).then(|| {
            Box::new(SyntheticJob {
                device,
                kind,
                interval: self.interval,
                limit: self.records_per_job,
                emitted: Arc::clone(&self.emitted),
                stop: Arc::default(),
                thread: None,
            }) as Box<dyn DevProfJob>
        })
    }
}

/// Emits records of one kind for one device from a background thread.
#[derive(Debug)]
pub struct SyntheticJob {
    device: DeviceId,
    kind: Kind,
    interval: Duration,
    limit: Option<u64>,
    emitted: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

fn sample(kind: Kind, device: DeviceId) -> Vec<u8> {
    use msptir::activity::Activity;

    let correlation_id = instrument::next_correlation_id();
    let start = instrument::timestamp();
    match kind {
        Kind::Memcpy => RawMemcpy::new(
            CopyKind::HostToDevice,
            4096,
            start,
            start + 500,
            device,
            0,
            correlation_id,
            true,
        )
        .as_bytes()
        .to_vec(),
        _ => RawKernel::new(
            start,
            start + 1_000,
            device,
            0,
            correlation_id,
            Some("AI_CORE"),
            Some(KERNEL_NAME),
        )
        .as_bytes()
        .to_vec(),
    }
}

impl DevProfJob for SyntheticJob {
    fn kind(&self) -> Kind {
        self.kind
    }

    fn start(&mut self, sink: ActivitySink) -> Result<(), MsptirError> {
        if self.thread.is_some() {
            return Err(MsptirError::Device(format!(
                "{:?} job on device {} already started",
                self.kind, self.device
            )));
        }
        self.stop.store(false, Ordering::Relaxed);

        let (kind, device, interval, limit) = (self.kind, self.device, self.interval, self.limit);
        let stop = Arc::clone(&self.stop);
        let emitted = Arc::clone(&self.emitted);
        let thread = std::thread::Builder::new()
            .name(format!("synthetic-{device}-{kind:?}"))
            .spawn(move || {
                use msptir::correlation::RecordSink;

                let mut count = 0;
                while !stop.load(Ordering::Relaxed) && limit.is_none_or(|limit| count < limit) {
                    match sink.record(&sample(kind, device)) {
                        Ok(()) => {
                            emitted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            warn!("synthetic device {device} stops emitting: {error}");
                            break;
                        }
                    }
                    count += 1;
                    std::thread::sleep(interval);
                }
                trace!("synthetic {kind:?} job on device {device} emitted {count} records");
            })
            .map_err(|e| MsptirError::Device(format!("unable to spawn job thread: {e}")))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MsptirError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                MsptirError::Device(format!("{:?} job on device {} panicked", self.kind, self.device))
            }),
            None => Ok(()),
        }
    }
}
