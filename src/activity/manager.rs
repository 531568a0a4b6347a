//! The activity manager: packs records from any number of producer threads into client
//! buffers and delivers completed buffers from a background worker.
//!
//! Appending and swapping buffers is serialized through one lock. A full buffer moves to a
//! queue of pending buffers and the worker is woken to hand it to the client's completion
//! callback outside of that lock. If the client declines to provide a new buffer, records are
//! dropped and counted instead of blocking or failing the instrumented application.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread::{JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use super::{
    Activity, CorrelationId, DeviceId, ExternalKind, Kind,
    buffer::{ActivityBuffer, BufferAllocation, BufferCompleteFn, BufferRequestFn},
    record_kind,
};
use crate::{
    correlation::{ExternalCorrelationReporter, RecordSink},
    device::{DevProfTask, JobFactory},
    error::MsptirError,
};

/// The client's buffer callbacks.
struct Callbacks {
    request: Box<BufferRequestFn>,
    complete: Box<BufferCompleteFn>,
}

/// A buffer together with the callbacks of the client it belongs to.
struct Filling {
    buffer: ActivityBuffer,
    callbacks: Arc<Callbacks>,
}

impl Filling {
    /// Ask the client for a new buffer. A panicking request callback counts as a decline.
    fn request(callbacks: &Arc<Callbacks>) -> Option<Self> {
        let mut buffer = ActivityBuffer::new();
        let requested =
            std::panic::catch_unwind(AssertUnwindSafe(|| buffer.init(&*callbacks.request)));
        match requested {
            Ok(result) => result.ok()?,
            Err(_) => {
                warn!("activity buffer request callback panicked");
                return None;
            }
        }
        Some(Self {
            buffer,
            callbacks: Arc::clone(callbacks),
        })
    }

    fn deliver(self) {
        let complete = &self.callbacks.complete;
        let buffer = self.buffer;
        if std::panic::catch_unwind(AssertUnwindSafe(|| buffer.un_init(|b| complete(b)))).is_err()
        {
            warn!("activity buffer complete callback panicked");
        }
    }
}

/// State guarded by the buffer lock.
#[derive(Default)]
struct BufferState {
    callbacks: Option<Arc<Callbacks>>,
    current: Option<Filling>,
    pending: VecDeque<Filling>,
    running: bool,
    worker: Option<ThreadId>,
    /// Incremented for every worker started; a worker exits once it is no longer current.
    generation: u64,
    /// Number of buffers ever moved to `pending`.
    enqueued: u64,
    /// Number of buffers ever handed to a completion callback.
    delivered: u64,
    flush_period: Option<Duration>,
    next_flush: Option<Instant>,
}

impl BufferState {
    /// Move the current buffer to the pending queue. An empty buffer stays current for reuse
    /// unless `force` is set.
    fn swap_current(&mut self, force: bool) -> bool {
        match self.current.take() {
            Some(current) if force || current.buffer.valid_size() > 0 => {
                self.pending.push_back(current);
                self.enqueued += 1;
                true
            }
            other => {
                self.current = other;
                false
            }
        }
    }

    /// Append `record`, swapping in a new buffer from `callbacks` if needed.
    fn append(&mut self, callbacks: &Arc<Callbacks>, record: &[u8]) -> Result<(), &'static str> {
        if let Some(current) = self.current.as_mut() {
            if current.buffer.record(record).is_ok() {
                return Ok(());
            }
            if current.buffer.records_num() == 0 {
                return Err("record does not fit in an empty activity buffer");
            }
            self.swap_current(true);
        }
        let mut fresh =
            Filling::request(callbacks).ok_or("client declined to provide an activity buffer")?;
        let result = fresh
            .buffer
            .record(record)
            .map_err(|_| "record does not fit in an empty activity buffer");
        self.current = Some(fresh);
        result
    }
}

/// The set of enabled activity kinds.
#[derive(Debug, Default)]
struct KindRegistry {
    enabled: RwLock<HashSet<Kind>>,
}

impl KindRegistry {
    /// Returns whether `kind` was newly enabled.
    fn enable(&self, kind: Kind) -> Result<bool, MsptirError> {
        Ok(self.enabled.write()?.insert(kind))
    }

    fn disable(&self, kind: Kind) -> Result<bool, MsptirError> {
        Ok(self.enabled.write()?.remove(&kind))
    }

    fn is_enabled(&self, kind: Kind) -> bool {
        self.enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&kind)
    }

    fn snapshot(&self) -> Vec<Kind> {
        let mut kinds: Vec<_> = self
            .enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }
}

/// State shared between the manager, its worker and the sinks handed to device jobs.
#[derive(Default)]
struct Shared {
    buffers: Mutex<BufferState>,
    /// Wakes the worker.
    wake: Condvar,
    /// Signals that a buffer was delivered.
    delivered: Condvar,
    kinds: KindRegistry,
    dropped: AtomicU64,
    recorded: AtomicU64,
    /// Number of worker threads spawned that did not exit yet.
    workers: AtomicUsize,
}

impl Shared {
    fn lock_buffers(&self) -> Result<MutexGuard<'_, BufferState>, MsptirError> {
        Ok(self.buffers.lock()?)
    }

    fn count_drop(&self, reason: &str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            warn!("dropped activity record: {reason} ({dropped} dropped so far)");
        } else {
            trace!("dropped activity record: {reason}");
        }
    }

    fn record(&self, record: &[u8]) -> Result<(), MsptirError> {
        let kind = record_kind(record)?;
        if !self.kinds.is_enabled(kind) {
            return Ok(());
        }

        let mut state = self.lock_buffers()?;
        let Some(callbacks) = state.callbacks.clone() else {
            drop(state);
            self.count_drop("no buffer callbacks registered");
            return Err(MsptirError::Internal(
                "activity manager is not running, no buffer callbacks registered".into(),
            ));
        };

        let enqueued = state.enqueued;
        let result = state.append(&callbacks, record);
        let swapped = state.enqueued != enqueued;
        drop(state);
        if swapped {
            self.wake.notify_one();
        }

        match result {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => self.count_drop(reason),
        }
        Ok(())
    }

    /// Hand a buffer to its client and account for it.
    fn deliver(&self, filling: Filling) {
        filling.deliver();
        let mut state = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        state.delivered += 1;
        drop(state);
        self.delivered.notify_all();
    }

    /// Deliver pending buffers on the calling thread, used when no worker is running.
    fn drain(&self) {
        loop {
            let next = self
                .buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .pop_front();
            match next {
                Some(filling) => self.deliver(filling),
                None => break,
            }
        }
    }

    fn run_worker(self: Arc<Self>, generation: u64) {
        trace!("activity worker {generation} started");
        let mut state = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            // Detached from a completion callback and replaced by a newer worker.
            if state.generation != generation {
                break;
            }
            if let Some(filling) = state.pending.pop_front() {
                drop(state);
                self.deliver(filling);
                state = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            if !state.running {
                break;
            }
            let now = Instant::now();
            let next_flush = state.next_flush;
            state = match next_flush {
                Some(deadline) if deadline <= now => {
                    trace!("periodic activity buffer flush");
                    state.swap_current(false);
                    state.next_flush = state.flush_period.map(|period| now + period);
                    state
                }
                Some(deadline) => {
                    self.wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
        drop(state);
        self.workers.fetch_sub(1, Ordering::Relaxed);
        trace!("activity worker {generation} stopped");
    }
}

/// A cloneable handle through which device jobs append records.
///
/// Holds no strong reference to the manager; recording after the manager is gone fails.
#[derive(Clone)]
pub struct ActivitySink {
    shared: Weak<Shared>,
}

impl std::fmt::Debug for ActivitySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivitySink")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl ActivitySink {
    fn upgrade(&self) -> Result<Arc<Shared>, MsptirError> {
        self.shared
            .upgrade()
            .ok_or_else(|| MsptirError::Internal("activity manager was dropped".into()))
    }

    pub fn record_activity<A: Activity>(&self, activity: &A) -> Result<(), MsptirError> {
        self.record(activity.as_bytes())
    }
}

impl RecordSink for ActivitySink {
    fn record(&self, record: &[u8]) -> Result<(), MsptirError> {
        self.upgrade()?.record(record)
    }

    fn is_activity_kind_enable(&self, kind: Kind) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.kinds.is_enabled(kind))
    }
}

/// The activity pipeline.
///
/// One instance is reachable process-wide through [`ActivityManager::global`]. Independent
/// instances can be created with [`ActivityManager::new`], e.g. for tests.
pub struct ActivityManager {
    shared: Arc<Shared>,
    /// Join handle of the worker; its lock also serializes starting and stopping it.
    worker: Mutex<Option<JoinHandle<()>>>,
    devices: Mutex<BTreeMap<DeviceId, DevProfTask>>,
    job_factory: RwLock<Option<Arc<dyn JobFactory>>>,
    correlation: ExternalCorrelationReporter,
}

impl Default for ActivityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActivityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityManager")
            .field("enabled_kinds", &self.shared.kinds.snapshot())
            .field("devices", &self.get_all_valid_device())
            .field("recorded", &self.recorded_records())
            .field("dropped", &self.dropped_records())
            .field("workers", &self.shared.workers.load(Ordering::Relaxed))
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<ActivityManager>> = OnceLock::new();

impl ActivityManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            worker: Mutex::new(None),
            devices: Mutex::new(BTreeMap::new()),
            job_factory: RwLock::new(None),
            correlation: ExternalCorrelationReporter::new(),
        }
    }

    /// The process-wide manager, constructed on first use.
    pub fn global() -> &'static Arc<ActivityManager> {
        GLOBAL.get_or_init(|| {
            trace!("creating global activity manager");
            Arc::new(ActivityManager::new())
        })
    }

    /// A handle for producers that outlive a borrow of the manager, e.g. device jobs.
    pub fn sink(&self) -> ActivitySink {
        ActivitySink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register the client's buffer callbacks and start the worker if it is not running.
    ///
    /// Registering while callbacks are installed replaces them; the current buffer is first
    /// handed back to the client it was requested from.
    pub fn register_callbacks(
        &self,
        request: Option<Box<BufferRequestFn>>,
        complete: Option<Box<BufferCompleteFn>>,
    ) -> Result<(), MsptirError> {
        let (Some(request), Some(complete)) = (request, complete) else {
            return Err(MsptirError::InvalidParameter(
                "buffer request and complete callbacks are required".into(),
            ));
        };
        let callbacks = Arc::new(Callbacks { request, complete });

        let mut worker = self.worker.lock()?;
        let mut state = self.shared.lock_buffers()?;
        if state.swap_current(true) {
            self.shared.wake.notify_one();
        }
        state.callbacks = Some(callbacks);

        if !state.running {
            trace!("starting activity worker");
            let shared = Arc::clone(&self.shared);
            let generation = state.generation + 1;
            let handle = std::thread::Builder::new()
                .name("msptir-activity".into())
                .spawn(move || shared.run_worker(generation))
                .map_err(|e| {
                    MsptirError::Internal(format!("unable to spawn activity worker: {e}"))
                })?;
            self.shared.workers.fetch_add(1, Ordering::Relaxed);
            state.generation = generation;
            state.running = true;
            state.worker = Some(handle.thread().id());
            state.next_flush = state.flush_period.map(|period| Instant::now() + period);
            *worker = Some(handle);
        }
        Ok(())
    }

    /// Hand every buffer back to the client, stop the worker and unregister the callbacks.
    ///
    /// The current buffer is returned even if it is empty, since its memory belongs to the
    /// client. Records arriving afterwards are rejected until callbacks are registered again.
    pub fn reset_callbacks(&self) -> Result<(), MsptirError> {
        let mut worker = self.worker.lock()?;
        {
            let mut state = self.shared.lock_buffers()?;
            state.swap_current(true);
            state.callbacks = None;
            state.running = false;
            state.worker = None;
            state.next_flush = None;
        }
        self.shared.wake.notify_all();

        if let Some(handle) = worker.take() {
            if handle.thread().id() == std::thread::current().id() {
                // Called from a completion callback, the worker exits once this returns.
                trace!("activity worker stopping itself");
            } else if handle.join().is_err() {
                warn!("activity worker panicked");
            }
        }
        self.shared.drain();
        Ok(())
    }

    /// Set the period in milliseconds at which the current buffer is delivered even if it is
    /// not full. Zero disables periodic flushing.
    pub fn flush_period(&self, milliseconds: u32) -> Result<(), MsptirError> {
        let period = (milliseconds > 0).then(|| Duration::from_millis(milliseconds.into()));
        trace!("setting activity buffer flush period to {period:?}");
        let mut state = self.shared.lock_buffers()?;
        let running = state.running;
        state.flush_period = period;
        state.next_flush = period
            .filter(|_| running)
            .map(|period| Instant::now() + period);
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Deliver the current buffer, if it holds any records, and every buffer queued before
    /// it. Returns once they were handed to the client.
    pub fn flush_all(&self) -> Result<(), MsptirError> {
        trace!("flushing activity buffers");
        let mut state = self.shared.lock_buffers()?;
        state.swap_current(false);
        let target = state.enqueued;

        if !state.running {
            drop(state);
            self.shared.drain();
            return Ok(());
        }
        self.shared.wake.notify_one();
        if state.worker == Some(std::thread::current().id()) {
            // Waiting on ourselves would never finish.
            return Ok(());
        }
        while state.delivered < target {
            state = self.shared.delivered.wait(state)?;
        }
        Ok(())
    }

    /// Append one raw record.
    ///
    /// Safe to call from any number of threads. Records of disabled kinds are ignored. If no
    /// buffer can be obtained for the record it is dropped and counted; this is not reported
    /// as an error. Fails if `record` is not a well-formed record or if no callbacks are
    /// registered.
    pub fn record(&self, record: &[u8]) -> Result<(), MsptirError> {
        self.shared.record(record)
    }

    /// Append one typed record.
    pub fn record_activity<A: Activity>(&self, activity: &A) -> Result<(), MsptirError> {
        self.shared.record(activity.as_bytes())
    }

    /// Enable collection of `kind`. Tracked devices start collecting it if they can.
    pub fn register(&self, kind: Kind) -> Result<(), MsptirError> {
        if !self.shared.kinds.enable(kind)? {
            return Ok(());
        }
        trace!("enabling activity record collection for kind: {kind:?}");
        let Some(factory) = self.job_factory()? else {
            return Ok(());
        };
        let sink = self.sink();
        let mut devices = self.devices.lock()?;
        devices
            .values_mut()
            .try_for_each(|task| task.add_kind(kind, factory.as_ref(), &sink))
    }

    /// Disable collection of `kind`. Records of this kind are discarded from now on; device
    /// jobs keep running until the device is reset.
    pub fn unregister(&self, kind: Kind) -> Result<(), MsptirError> {
        if self.shared.kinds.disable(kind)? {
            trace!("disabling activity record collection for kind: {kind:?}");
        }
        Ok(())
    }

    pub fn is_activity_kind_enable(&self, kind: Kind) -> bool {
        self.shared.kinds.is_enabled(kind)
    }

    /// The currently enabled kinds, in ascending order.
    pub fn enabled_kinds(&self) -> Vec<Kind> {
        self.shared.kinds.snapshot()
    }

    /// Set the factory producing collection jobs for tracked devices.
    pub fn set_job_factory(&self, factory: Arc<dyn JobFactory>) -> Result<(), MsptirError> {
        *self.job_factory.write()? = Some(factory);
        Ok(())
    }

    fn job_factory(&self) -> Result<Option<Arc<dyn JobFactory>>, MsptirError> {
        Ok(self.job_factory.read()?.clone())
    }

    /// Track `device`, starting collection jobs for the enabled kinds.
    ///
    /// The device stays tracked even if a job fails to start.
    pub fn set_device(&self, device: DeviceId) -> Result<(), MsptirError> {
        let kinds = self.enabled_kinds();
        let factory = self.job_factory()?;
        let mut devices = self.devices.lock()?;
        if devices.contains_key(&device) {
            return Ok(());
        }
        trace!("tracking device {device}");
        let task = devices
            .entry(device)
            .or_insert_with(|| DevProfTask::new(device));
        match factory {
            Some(factory) => task.start(&kinds, factory.as_ref(), &self.sink()),
            None => Ok(()),
        }
    }

    /// Stop collection on every tracked device and forget them.
    pub fn reset_all_device(&self) -> Result<(), MsptirError> {
        let tasks = std::mem::take(&mut *self.devices.lock()?);
        let mut first_error = None;
        for (device, mut task) in tasks {
            trace!("resetting device {device}");
            if let Err(error) = task.stop() {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// A snapshot of the tracked devices.
    pub fn get_all_valid_device(&self) -> BTreeSet<DeviceId> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn push_external_correlation_id(
        &self,
        kind: ExternalKind,
        id: u64,
    ) -> Result<(), MsptirError> {
        self.correlation.push_external_correlation_id(kind, id)
    }

    pub fn pop_external_correlation_id(&self, kind: ExternalKind) -> Result<u64, MsptirError> {
        self.correlation.pop_external_correlation_id(kind)
    }

    /// Link the current external ids of every kind to `correlation_id`.
    pub fn report_external_correlation_id(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<(), MsptirError> {
        self.correlation
            .report_external_correlation_id(self, correlation_id)
    }

    /// The number of records dropped because no buffer could hold them.
    pub fn dropped_records(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// The number of records appended to a buffer.
    pub fn recorded_records(&self) -> u64 {
        self.shared.recorded.load(Ordering::Relaxed)
    }

    /// The number of buffers handed to completion callbacks.
    pub fn delivered_buffers(&self) -> u64 {
        self.shared
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delivered
    }

    /// Stop all device jobs, then hand every buffer back to the client and stop the worker.
    pub fn shutdown(&self) -> Result<(), MsptirError> {
        trace!("shutting down activity manager");
        let devices = self.reset_all_device();
        self.reset_callbacks()?;
        devices
    }
}

impl RecordSink for ActivityManager {
    fn record(&self, record: &[u8]) -> Result<(), MsptirError> {
        ActivityManager::record(self, record)
    }

    fn is_activity_kind_enable(&self, kind: Kind) -> bool {
        ActivityManager::is_activity_kind_enable(self, kind)
    }
}

impl Drop for ActivityManager {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!("unable to shut down activity manager: {error}");
        }
    }
}

/// A buffer request callback allocating buffers of `size` bytes.
pub fn default_request_callback(size: usize, max_num_records: usize) -> Box<BufferRequestFn> {
    Box::new(move || BufferAllocation::alloc(size, max_num_records))
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize},
    };

    use super::*;
    use crate::{
        activity::{
            Record, RecordBuffer,
            kernel::RawKernel,
            marker::{self, ObjectId, RawMarker},
            test::sample_record,
        },
        device::DevProfJob,
    };

    type Delivered = Arc<Mutex<Vec<Vec<Record>>>>;

    /// A manager collecting delivered buffers as decoded records.
    fn collecting_manager(size: usize, max_num_records: usize) -> (ActivityManager, Delivered) {
        let manager = ActivityManager::new();
        let delivered: Delivered = Arc::default();
        let sink = Arc::clone(&delivered);
        manager
            .register_callbacks(
                Some(default_request_callback(size, max_num_records)),
                Some(Box::new(move |buffer: RecordBuffer| {
                    let records = buffer.into_iter().collect::<Result<Vec<_>, _>>().unwrap();
                    sink.lock().unwrap().push(records);
                })),
            )
            .unwrap();
        (manager, delivered)
    }

    fn instant_marker(id: u64) -> RawMarker {
        RawMarker::instant(
            id,
            id,
            ObjectId::Process {
                process_id: 1,
                thread_id: 1,
            },
            "marker",
            None,
        )
    }

    fn marker_ids(buffers: &[Vec<Record>]) -> Vec<u64> {
        buffers
            .iter()
            .flatten()
            .map(|record| match record {
                Record::Marker(marker::Record { id, .. }) => *id,
                other => panic!("unexpected record {other:?}"),
            })
            .collect()
    }

    #[test]
    fn register_callbacks_requires_both() {
        let manager = ActivityManager::new();
        assert!(matches!(
            manager.register_callbacks(None, Some(Box::new(|_: RecordBuffer| ()))),
            Err(MsptirError::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.register_callbacks(Some(default_request_callback(64, 0)), None),
            Err(MsptirError::InvalidParameter(_))
        ));
    }

    #[test]
    fn idempotent_enable_disable() {
        let manager = ActivityManager::new();
        manager.register(Kind::Kernel).unwrap();
        manager.register(Kind::Kernel).unwrap();
        assert!(manager.is_activity_kind_enable(Kind::Kernel));
        manager.unregister(Kind::Api).unwrap();
        assert!(!manager.is_activity_kind_enable(Kind::Api));
        manager.unregister(Kind::Kernel).unwrap();
        assert!(!manager.is_activity_kind_enable(Kind::Kernel));
        assert!(manager.enabled_kinds().is_empty());
    }

    #[test]
    fn record_without_callbacks_is_rejected() {
        let manager = ActivityManager::new();
        manager.register(Kind::Marker).unwrap();
        assert!(matches!(
            manager.record_activity(&instant_marker(1)),
            Err(MsptirError::Internal(_))
        ));
        assert_eq!(manager.dropped_records(), 1);
    }

    #[test]
    fn malformed_record_is_invalid() {
        let (manager, _) = collecting_manager(1024, 0);
        manager.register(Kind::Marker).unwrap();
        let bytes = instant_marker(1).as_bytes().to_vec();
        assert!(matches!(
            manager.record(&bytes[..8]),
            Err(MsptirError::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.record(&[0u8; 8]),
            Err(MsptirError::SentinelEnum(0))
        ));
    }

    #[test]
    fn disabled_kinds_are_discarded() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.record_activity(&instant_marker(1)).unwrap();
        manager.flush_all().unwrap();
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(manager.recorded_records(), 0);
        assert_eq!(manager.dropped_records(), 0);
    }

    #[test]
    fn flush_all_delivers_in_append_order() {
        let (manager, delivered) = collecting_manager(2 * 1024 * 1024, 0);
        manager.register(Kind::Marker).unwrap();
        for id in 0..10 {
            manager.record_activity(&instant_marker(id)).unwrap();
        }
        manager.flush_all().unwrap();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(marker_ids(&delivered), (0..10).collect::<Vec<_>>());
        assert_eq!(manager.recorded_records(), 10);
    }

    #[test]
    fn flush_all_skips_empty_buffers() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.flush_all().unwrap();
        manager.flush_all().unwrap();
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(manager.delivered_buffers(), 0);
    }

    #[test]
    fn overflow_swaps_buffers() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.register(Kind::Marker).unwrap();
        let per_buffer = 1024 / Kind::Marker.record_size();
        let total = per_buffer as u64 + 3;
        for id in 0..total {
            manager.record_activity(&instant_marker(id)).unwrap();
        }
        manager.flush_all().unwrap();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].len(), per_buffer);
        assert_eq!(marker_ids(&delivered), (0..total).collect::<Vec<_>>());
        assert_eq!(manager.dropped_records(), 0);
    }

    #[test]
    fn max_num_records_bounds_buffers() {
        let (manager, delivered) = collecting_manager(64 * 1024, 4);
        manager.register(Kind::Marker).unwrap();
        for id in 0..10 {
            manager.record_activity(&instant_marker(id)).unwrap();
        }
        manager.flush_all().unwrap();
        let delivered = delivered.lock().unwrap();
        assert_eq!(
            delivered.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[test]
    fn declined_buffers_are_dropped_and_counted() {
        let manager = ActivityManager::new();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        manager
            .register_callbacks(
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    None::<BufferAllocation>
                })),
                Some(Box::new(|_: RecordBuffer| panic!("nothing should be delivered"))),
            )
            .unwrap();
        manager.register(Kind::Api).unwrap();
        for n in 0..100 {
            manager.record(&sample_record(Kind::Api, n)).unwrap();
        }
        assert_eq!(manager.dropped_records(), 100);
        assert_eq!(manager.recorded_records(), 0);
        assert_eq!(requests.load(Ordering::Relaxed), 100);
        manager.flush_all().unwrap();
    }

    #[test]
    fn panicking_request_callback_counts_as_decline() {
        let manager = ActivityManager::new();
        let delivered: Delivered = Arc::default();
        let sink = Arc::clone(&delivered);
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        manager
            .register_callbacks(
                Some(Box::new(move || {
                    if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                        panic!("no buffer available yet");
                    }
                    BufferAllocation::alloc(1024, 0)
                })),
                Some(Box::new(move |buffer: RecordBuffer| {
                    sink.lock()
                        .unwrap()
                        .push(buffer.into_iter().map(Result::unwrap).collect());
                })),
            )
            .unwrap();
        manager.register(Kind::Marker).unwrap();

        manager.record_activity(&instant_marker(1)).unwrap();
        assert_eq!(manager.dropped_records(), 1);
        // The buffer lock is still usable.
        manager.record_activity(&instant_marker(2)).unwrap();
        manager.flush_all().unwrap();

        assert_eq!(marker_ids(&delivered.lock().unwrap()), vec![2]);
        assert_eq!(requests.load(Ordering::Relaxed), 2);
        assert_eq!(manager.recorded_records(), 1);
    }

    #[test]
    fn names_not_interned_are_not_followed() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.register(Kind::Kernel).unwrap();
        let mut raw = RawKernel::new(1, 2, 0, 0, 7, Some("AI_CORE"), Some("MatMul"));
        raw.name = 0x10 as *const _;
        manager.record_activity(&raw).unwrap();
        manager.flush_all().unwrap();

        let delivered = delivered.lock().unwrap();
        match &delivered[0][..] {
            [Record::Kernel(kernel)] => {
                assert_eq!(kernel.name, None);
                assert_eq!(kernel.kernel_type.as_deref(), Some("AI_CORE"));
                assert_eq!(kernel.correlation_id, 7);
            }
            other => panic!("unexpected records {other:?}"),
        }
    }

    #[test]
    fn oversized_record_is_dropped() {
        let (manager, delivered) = collecting_manager(16, 0);
        manager.register(Kind::Kernel).unwrap();
        manager.record(&sample_record(Kind::Kernel, 1)).unwrap();
        manager.record(&sample_record(Kind::Kernel, 2)).unwrap();
        assert_eq!(manager.dropped_records(), 2);
        manager.reset_callbacks().unwrap();
        // The empty buffer still goes back to the client.
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].is_empty());
    }

    #[test]
    fn periodic_flush_delivers_partial_buffers() {
        let (manager, delivered) = collecting_manager(1024 * 1024, 0);
        manager.register(Kind::Marker).unwrap();
        manager.flush_period(10).unwrap();
        manager.record_activity(&instant_marker(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while delivered.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "periodic flush did not happen");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(marker_ids(&delivered.lock().unwrap()), vec![1]);
        manager.flush_period(0).unwrap();
    }

    #[test]
    fn concurrent_producers() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 500;
        let (manager, delivered) = collecting_manager(4096, 0);
        manager.register(Kind::Marker).unwrap();
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for n in 0..PER_THREAD {
                        manager
                            .record_activity(&instant_marker(t * PER_THREAD + n))
                            .unwrap();
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        manager.flush_all().unwrap();

        let mut ids = marker_ids(&delivered.lock().unwrap());
        // Per-thread order is preserved.
        for t in 0..THREADS {
            let own: Vec<_> = ids
                .iter()
                .copied()
                .filter(|id| id / PER_THREAD == t)
                .collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
        ids.sort();
        assert_eq!(ids, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
        assert_eq!(manager.dropped_records(), 0);
    }

    #[test]
    fn reset_callbacks_rejects_later_records() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.register(Kind::Marker).unwrap();
        manager.record_activity(&instant_marker(1)).unwrap();
        manager.reset_callbacks().unwrap();
        assert_eq!(marker_ids(&delivered.lock().unwrap()), vec![1]);
        assert!(manager.record_activity(&instant_marker(2)).is_err());
        assert_eq!(manager.dropped_records(), 1);
    }

    #[test]
    fn flush_all_from_complete_callback_does_not_deadlock() {
        let manager = Arc::new(ActivityManager::new());
        let weak = Arc::downgrade(&manager);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager
            .register_callbacks(
                Some(default_request_callback(1024, 0)),
                Some(Box::new(move |_: RecordBuffer| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if let Some(manager) = weak.upgrade() {
                        manager.flush_all().unwrap();
                    }
                })),
            )
            .unwrap();
        manager.register(Kind::Marker).unwrap();
        manager.record_activity(&instant_marker(1)).unwrap();
        manager.flush_all().unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        manager.reset_callbacks().unwrap();
    }

    #[test]
    fn reregistering_from_complete_callback_leaves_one_worker() {
        let manager = Arc::new(ActivityManager::new());
        let weak = Arc::downgrade(&manager);
        let restarted = Arc::new(AtomicBool::new(false));
        let once = Arc::clone(&restarted);
        manager
            .register_callbacks(
                Some(default_request_callback(1024, 0)),
                Some(Box::new(move |_: RecordBuffer| {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    if !once.swap(true, Ordering::Relaxed) {
                        manager.reset_callbacks().unwrap();
                        manager
                            .register_callbacks(
                                Some(default_request_callback(1024, 0)),
                                Some(Box::new(|_: RecordBuffer| ())),
                            )
                            .unwrap();
                    }
                })),
            )
            .unwrap();
        manager.register(Kind::Marker).unwrap();
        manager.record_activity(&instant_marker(1)).unwrap();
        manager.flush_all().unwrap();
        assert!(restarted.load(Ordering::Relaxed));

        // The detached worker exits once its callback returns.
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.shared.workers.load(Ordering::Relaxed) != 1 {
            assert!(Instant::now() < deadline, "detached worker kept running");
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.record_activity(&instant_marker(2)).unwrap();
        manager.flush_all().unwrap();
        manager.reset_callbacks().unwrap();
        assert_eq!(manager.shared.workers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reregistering_returns_current_buffer_to_previous_client() {
        let (manager, first) = collecting_manager(1024, 0);
        manager.register(Kind::Marker).unwrap();
        manager.record_activity(&instant_marker(1)).unwrap();

        let second: Delivered = Arc::default();
        let sink = Arc::clone(&second);
        manager
            .register_callbacks(
                Some(default_request_callback(1024, 0)),
                Some(Box::new(move |buffer: RecordBuffer| {
                    sink.lock()
                        .unwrap()
                        .push(buffer.into_iter().map(Result::unwrap).collect());
                })),
            )
            .unwrap();
        manager.record_activity(&instant_marker(2)).unwrap();
        manager.flush_all().unwrap();

        assert_eq!(marker_ids(&first.lock().unwrap()), vec![1]);
        assert_eq!(marker_ids(&second.lock().unwrap()), vec![2]);
    }

    #[test]
    fn external_correlation_report() {
        let (manager, delivered) = collecting_manager(1024, 0);
        manager.register(Kind::ExternalCorrelation).unwrap();
        manager
            .push_external_correlation_id(ExternalKind::Custom0, 1)
            .unwrap();
        manager
            .push_external_correlation_id(ExternalKind::Custom0, 2)
            .unwrap();
        manager.report_external_correlation_id(100).unwrap();
        assert_eq!(
            manager.pop_external_correlation_id(ExternalKind::Custom0),
            Ok(2)
        );
        assert_eq!(
            manager.pop_external_correlation_id(ExternalKind::Custom0),
            Ok(1)
        );
        manager.flush_all().unwrap();

        let delivered = delivered.lock().unwrap();
        let records: Vec<_> = delivered.iter().flatten().collect();
        assert_eq!(records.len(), 1);
        match records[0] {
            Record::ExternalCorrelation(r) => {
                assert_eq!(r.external_kind, ExternalKind::Custom0);
                assert_eq!(r.external_id, 2);
                assert_eq!(r.correlation_id, 100);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[derive(Default)]
    struct JobLog {
        started: Mutex<Vec<(DeviceId, Kind)>>,
        stopped: Mutex<Vec<(DeviceId, Kind)>>,
    }

    struct MockJob {
        device: DeviceId,
        kind: Kind,
        log: Arc<JobLog>,
        sink: Option<ActivitySink>,
    }

    impl DevProfJob for MockJob {
        fn kind(&self) -> Kind {
            self.kind
        }

        fn start(&mut self, sink: ActivitySink) -> Result<(), MsptirError> {
            self.log
                .started
                .lock()
                .unwrap()
                .push((self.device, self.kind));
            sink.record(&sample_record(self.kind, self.device.into()))?;
            self.sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), MsptirError> {
            self.log
                .stopped
                .lock()
                .unwrap()
                .push((self.device, self.kind));
            self.sink = None;
            Ok(())
        }
    }

    struct MockFactory(Arc<JobLog>);

    impl JobFactory for MockFactory {
        fn create(&self, device: DeviceId, kind: Kind) -> Option<Box<dyn DevProfJob>> {
            matches!(kind, Kind::Kernel | Kind::Memcpy).then(|| {
                Box::new(MockJob {
                    device,
                    kind,
                    log: Arc::clone(&self.0),
                    sink: None,
                }) as Box<dyn DevProfJob>
            })
        }
    }

    #[test]
    fn device_lifecycle() {
        let (manager, delivered) = collecting_manager(4096, 0);
        let log = Arc::new(JobLog::default());
        manager
            .set_job_factory(Arc::new(MockFactory(Arc::clone(&log))))
            .unwrap();
        manager.register(Kind::Kernel).unwrap();
        manager.register(Kind::Api).unwrap();

        manager.set_device(0).unwrap();
        manager.set_device(1).unwrap();
        manager.set_device(1).unwrap();
        let snapshot = manager.get_all_valid_device();
        assert_eq!(snapshot, BTreeSet::from([0, 1]));
        assert_eq!(
            *log.started.lock().unwrap(),
            vec![(0, Kind::Kernel), (1, Kind::Kernel)]
        );

        // Enabling a device-side kind starts it on tracked devices.
        manager.register(Kind::Memcpy).unwrap();
        assert_eq!(log.started.lock().unwrap().len(), 4);

        // Disabling only stops intake.
        manager.unregister(Kind::Memcpy).unwrap();
        assert!(log.stopped.lock().unwrap().is_empty());

        manager.reset_all_device().unwrap();
        assert!(manager.get_all_valid_device().is_empty());
        assert_eq!(log.stopped.lock().unwrap().len(), 4);
        // The snapshot taken earlier is unaffected.
        assert_eq!(snapshot.len(), 2);

        manager.flush_all().unwrap();
        let kinds: Vec<_> = delivered
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(Record::kind)
            .collect();
        assert_eq!(kinds, vec![Kind::Kernel, Kind::Kernel, Kind::Memcpy, Kind::Memcpy]);
    }

    #[test]
    fn shutdown_stops_devices_and_delivers_last_buffer() {
        let (manager, delivered) = collecting_manager(4096, 0);
        let log = Arc::new(JobLog::default());
        manager
            .set_job_factory(Arc::new(MockFactory(Arc::clone(&log))))
            .unwrap();
        manager.register(Kind::Kernel).unwrap();
        manager.set_device(3).unwrap();
        drop(manager);

        assert_eq!(*log.stopped.lock().unwrap(), vec![(3, Kind::Kernel)]);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 1);
    }

    #[test]
    fn sink_outliving_manager_fails() {
        let manager = ActivityManager::new();
        manager.register(Kind::Api).unwrap();
        let sink = manager.sink();
        assert!(sink.is_activity_kind_enable(Kind::Api));
        drop(manager);
        assert!(!sink.is_activity_kind_enable(Kind::Api));
        assert!(sink.record(&sample_record(Kind::Api, 1)).is_err());
    }
}
