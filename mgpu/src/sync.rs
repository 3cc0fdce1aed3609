//! Cross-device ordering: completion counters, timeline semaphores,
//! inter-GPU barriers and events.
//!
//! Devices on one instance cannot wait on each other's semaphores, so a
//! cross-device barrier is bridged through the host. Every device owns a
//! barrier timeline semaphore and a bridge worker thread. Inserting a
//! barrier reserves the next value on the destination's semaphore and hands
//! the worker a request: wait until the source device's completion counter
//! reaches a frame, then host-signal the reserved value. The destination's
//! next submission waits on that value on the GPU, so the caller is never
//! blocked.

use std::{
    sync::{
        Arc, Condvar, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ash::vk;
use thiserror::Error;

use crate::command::{GpuCommandSubmission, SemaphoreWait};
use crate::registry::GpuDeviceRegistry;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Vulkan error creating semaphore: {0}")]
    SemaphoreCreation(vk::Result),
    #[error("Vulkan error creating event: {0}")]
    EventCreation(vk::Result),
    #[error("Vulkan error operating on event: {0}")]
    Event(vk::Result),
    #[error("Failed to spawn bridge worker: {0}")]
    WorkerSpawn(std::io::Error),
}

// ---------------------------------------------------------------------------
// Completion counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CounterState {
    value: u64,
    closed: bool,
}

/// A host-side monotonically increasing counter that threads can block on.
#[derive(Debug, Default)]
pub struct TimelineCounter {
    state: Mutex<CounterState>,
    changed: Condvar,
}

impl TimelineCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        self.state.lock().expect("timeline counter lock poisoned").value
    }

    /// Raise the counter to `value`. Lower values are ignored. Returns the
    /// value after the call.
    pub fn signal(&self, value: u64) -> u64 {
        let mut state = self.state.lock().expect("timeline counter lock poisoned");
        if value > state.value {
            state.value = value;
            self.changed.notify_all();
        }
        state.value
    }

    /// Wake every waiter and make future waits return immediately.
    pub fn close(&self) {
        self.state.lock().expect("timeline counter lock poisoned").closed = true;
        self.changed.notify_all();
    }

    /// Block until the counter reaches `target`. Returns `false` if the
    /// counter was closed first.
    pub fn wait(&self, target: u64) -> bool {
        let state = self.state.lock().expect("timeline counter lock poisoned");
        let state = self
            .changed
            .wait_while(state, |s| s.value < target && !s.closed)
            .expect("timeline counter lock poisoned");
        state.value >= target
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, target: u64, timeout: Duration) -> bool {
        let state = self.state.lock().expect("timeline counter lock poisoned");
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.value < target && !s.closed)
            .expect("timeline counter lock poisoned");
        state.value >= target
    }
}

/// One [`TimelineCounter`] per device ordinal. Out-of-range ordinals are
/// ignored by every method.
#[derive(Debug)]
pub struct CompletionCounters {
    counters: Vec<Arc<TimelineCounter>>,
}

impl CompletionCounters {
    pub fn new(device_count: u32) -> Self {
        Self {
            counters: (0..device_count)
                .map(|_| Arc::new(TimelineCounter::new()))
                .collect(),
        }
    }

    pub fn get(&self, device: u32) -> Option<&Arc<TimelineCounter>> {
        self.counters.get(device as usize)
    }

    pub fn signal(&self, device: u32, frame_id: u64) {
        if let Some(counter) = self.get(device) {
            counter.signal(frame_id);
        }
    }

    pub fn value(&self, device: u32) -> Option<u64> {
        self.get(device).map(|c| c.value())
    }

    /// The frame after the last one `device` published. `None` once the
    /// counter is saturated.
    pub fn next_frame(&self, device: u32) -> Option<u64> {
        self.value(device)?.checked_add(1)
    }

    pub fn wait(&self, device: u32, frame_id: u64) -> bool {
        self.get(device).is_some_and(|c| c.wait(frame_id))
    }

    pub fn wait_timeout(&self, device: u32, frame_id: u64, timeout: Duration) -> bool {
        self.get(device)
            .is_some_and(|c| c.wait_timeout(frame_id, timeout))
    }

    pub fn close_all(&self) {
        for counter in &self.counters {
            counter.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Barrier lanes and bridge workers
// ---------------------------------------------------------------------------

/// Ask a bridge worker to signal `dst_value` once `source` reaches
/// `source_frame`.
struct BridgeRequest {
    source: Arc<TimelineCounter>,
    source_frame: u64,
    dst_value: u64,
}

/// Run `signal` for every request, in order, once its source frame has been
/// reached. A closed source still gets its value signaled so that GPU work
/// already waiting on it can drain during teardown.
fn spawn_bridge_worker(
    dst: u32,
    requests: Receiver<BridgeRequest>,
    mut signal: impl FnMut(u64) -> Result<(), vk::Result> + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mgpu-bridge-{dst}"))
        .spawn(move || {
            for request in requests {
                let reached = request.source.wait(request.source_frame);
                if !reached {
                    tracing::debug!(
                        "Releasing barrier value {} on GPU {dst} during shutdown",
                        request.dst_value
                    );
                }
                if let Err(e) = signal(request.dst_value) {
                    tracing::error!(
                        "GPU {dst} failed to signal barrier value {}: {e}",
                        request.dst_value
                    );
                }
            }
            tracing::debug!("Bridge worker for GPU {dst} exiting");
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingBarrierWait {
    value: u64,
    stage: vk::PipelineStageFlags,
}

/// Destination-side barrier state: the semaphore, the last reserved value,
/// and waits not yet attached to a submission.
struct BarrierLane {
    semaphore: vk::Semaphore,
    last_reserved: u64,
    pending: Vec<PendingBarrierWait>,
    requests: Option<Sender<BridgeRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl BarrierLane {
    fn new(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            last_reserved: 0,
            pending: Vec::new(),
            requests: None,
            worker: None,
        }
    }

    /// Reserve the next semaphore value for a barrier guarding `stage`.
    fn reserve(&mut self, stage: vk::PipelineStageFlags) -> u64 {
        self.last_reserved += 1;
        self.pending.push(PendingBarrierWait {
            value: self.last_reserved,
            stage,
        });
        self.last_reserved
    }

    fn take_waits(&mut self) -> Vec<SemaphoreWait> {
        self.pending
            .drain(..)
            .map(|p| SemaphoreWait {
                semaphore: self.semaphore,
                stage: p.stage,
                value: p.value,
            })
            .collect()
    }

    /// Stop accepting requests and wait for the worker to finish.
    fn shut_down(&mut self) {
        self.requests = None;
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("Bridge worker panicked");
        }
    }
}

#[derive(Default)]
struct OwnedHandles {
    semaphores: Vec<vk::Semaphore>,
    events: Vec<vk::Event>,
}

// ---------------------------------------------------------------------------
// CrossDeviceSynchronizer
// ---------------------------------------------------------------------------

/// Ordering between work on different active devices.
pub struct CrossDeviceSynchronizer {
    registry: Arc<GpuDeviceRegistry>,
    counters: CompletionCounters,
    lanes: Vec<Mutex<BarrierLane>>,
    owned: Vec<Mutex<OwnedHandles>>,
}

impl std::fmt::Debug for CrossDeviceSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossDeviceSynchronizer")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl CrossDeviceSynchronizer {
    /// Create barrier semaphores and bridge workers for every active device.
    pub fn new(registry: Arc<GpuDeviceRegistry>) -> Result<Self, SyncError> {
        let count = registry.active_gpu_count();
        let mut this = Self {
            counters: CompletionCounters::new(count),
            lanes: Vec::with_capacity(count as usize),
            owned: (0..count).map(|_| Mutex::default()).collect(),
            registry,
        };

        // On error `this` is dropped, which cleans up the lanes made so far.
        for gpu in this.registry.available_gpus() {
            // SAFETY: bring-up always enables timeline semaphores.
            let semaphore = unsafe { gpu.create_raw_timeline_semaphore(0) }
                .map_err(SyncError::SemaphoreCreation)?;

            let (sender, receiver) = mpsc::channel();
            let registry = Arc::clone(&this.registry);
            let dst = gpu.ordinal();
            let spawned = spawn_bridge_worker(dst, receiver, move |value| {
                match registry.gpu_by_index(dst) {
                    // SAFETY: the semaphore outlives the worker (lanes are
                    // shut down before handles are destroyed), and values
                    // arrive strictly increasing from BarrierLane::reserve.
                    Some(gpu) => unsafe { gpu.signal_raw_semaphore(semaphore, value) },
                    None => Ok(()),
                }
            });
            let worker = match spawned {
                Ok(worker) => worker,
                Err(e) => {
                    // SAFETY: created above and never handed out.
                    unsafe { gpu.destroy_raw_semaphore(semaphore) };
                    return Err(SyncError::WorkerSpawn(e));
                }
            };

            let mut lane = BarrierLane::new(semaphore);
            lane.requests = Some(sender);
            lane.worker = Some(worker);
            this.lanes.push(Mutex::new(lane));
        }

        Ok(this)
    }

    pub fn registry(&self) -> &Arc<GpuDeviceRegistry> {
        &self.registry
    }

    fn record_semaphore(&self, device: u32, semaphore: vk::Semaphore) {
        if let Some(owned) = self.owned.get(device as usize) {
            owned
                .lock()
                .expect("owned handles lock poisoned")
                .semaphores
                .push(semaphore);
        }
    }

    /// Create a timeline semaphore on `device` starting at `initial_value`.
    /// `Ok(None)` when `device` is out of range.
    pub fn create_timeline_semaphore(
        &self,
        device: u32,
        initial_value: u64,
    ) -> Result<Option<vk::Semaphore>, SyncError> {
        let Some(gpu) = self.registry.gpu_by_index(device) else {
            return Ok(None);
        };
        // SAFETY: bring-up always enables timeline semaphores.
        let semaphore = unsafe { gpu.create_raw_timeline_semaphore(initial_value) }
            .map_err(SyncError::SemaphoreCreation)?;
        self.record_semaphore(device, semaphore);
        Ok(Some(semaphore))
    }

    /// Destroy a semaphore made by
    /// [`create_timeline_semaphore`](Self::create_timeline_semaphore).
    /// Unknown handles and devices are ignored.
    ///
    /// # Safety
    /// No pending GPU work may wait on or signal `semaphore`.
    pub unsafe fn destroy_semaphore(&self, device: u32, semaphore: vk::Semaphore) {
        let (Some(gpu), Some(owned)) = (
            self.registry.gpu_by_index(device),
            self.owned.get(device as usize),
        ) else {
            return;
        };
        let mut owned = owned.lock().expect("owned handles lock poisoned");
        let Some(pos) = owned.semaphores.iter().position(|&s| s == semaphore) else {
            return;
        };
        owned.semaphores.swap_remove(pos);
        tracing::debug!("Dropping semaphore {:?} on GPU {device}", semaphore);
        // SAFETY: owned by this device; caller guarantees it is idle.
        unsafe { gpu.destroy_raw_semaphore(semaphore) };
    }

    /// Publish that `device` has finished frame `frame_id`.
    pub fn signal_frame_complete(&self, device: u32, frame_id: u64) {
        self.counters.signal(device, frame_id);
    }

    /// Block until `device` has published frame `frame_id`. Returns `false`
    /// right away for an out-of-range device.
    pub fn wait_for_frame_complete(&self, device: u32, frame_id: u64) -> bool {
        let _span = tracing::debug_span!("wait_for_frame_complete", device, frame_id)
            .entered();
        self.counters.wait(device, frame_id)
    }

    pub fn wait_for_frame_complete_timeout(
        &self,
        device: u32,
        frame_id: u64,
        timeout: Duration,
    ) -> bool {
        let _span = tracing::debug_span!("wait_for_frame_complete", device, frame_id)
            .entered();
        self.counters.wait_timeout(device, frame_id, timeout)
    }

    pub fn frame_counter(&self, device: u32) -> Option<u64> {
        self.counters.value(device)
    }

    /// Make `dst`'s next submission wait, at `dst_stage`, for `src` to
    /// publish its next frame. A no-op when `src` has already published
    /// `u64::MAX`.
    pub fn insert_inter_gpu_barrier(
        &self,
        src: u32,
        dst: u32,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let Some(next) = self.counters.next_frame(src) else {
            return;
        };
        self.insert_inter_gpu_barrier_at(src, dst, next, src_stage, dst_stage);
    }

    /// Make `dst`'s next submission wait, at `dst_stage`, for `src` to
    /// publish `frame_id`.
    ///
    /// The source side is frame-granular: `src_stage` is informational and
    /// the dependency is on the whole published frame.
    pub fn insert_inter_gpu_barrier_at(
        &self,
        src: u32,
        dst: u32,
        frame_id: u64,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let (Some(source), Some(lane)) =
            (self.counters.get(src), self.lanes.get(dst as usize))
        else {
            return;
        };
        if src == dst {
            tracing::warn!("Ignoring barrier from GPU {src} to itself");
            return;
        }

        let mut lane = lane.lock().expect("barrier lane lock poisoned");
        let Some(requests) = lane.requests.clone() else {
            return;
        };
        let dst_value = lane.reserve(dst_stage);
        tracing::debug!(
            "Barrier GPU {src} frame {frame_id} ({src_stage:?}) -> GPU {dst} \
             value {dst_value} ({dst_stage:?})"
        );
        let request = BridgeRequest {
            source: Arc::clone(source),
            source_frame: frame_id,
            dst_value,
        };
        if requests.send(request).is_err() {
            tracing::error!("Bridge worker for GPU {dst} is gone");
        }
    }

    /// Append the waits for every barrier inserted against the submission's
    /// device since the last call.
    pub fn encode_pending_barriers(&self, submission: &mut GpuCommandSubmission) {
        if let Some(lane) = self.lanes.get(submission.gpu_index as usize) {
            let waits = lane.lock().expect("barrier lane lock poisoned").take_waits();
            submission.waits.extend(waits);
        }
    }

    /// Create an event on `device`. `Ok(None)` when out of range.
    pub fn create_cross_gpu_event(&self, device: u32) -> Result<Option<vk::Event>, SyncError> {
        let (Some(gpu), Some(owned)) = (
            self.registry.gpu_by_index(device),
            self.owned.get(device as usize),
        ) else {
            return Ok(None);
        };
        let event = gpu.create_raw_event().map_err(SyncError::EventCreation)?;
        owned
            .lock()
            .expect("owned handles lock poisoned")
            .events
            .push(event);
        Ok(Some(event))
    }

    fn owned_event(&self, device: u32, event: vk::Event) -> bool {
        self.owned.get(device as usize).is_some_and(|owned| {
            owned
                .lock()
                .expect("owned handles lock poisoned")
                .events
                .contains(&event)
        })
    }

    /// Set `event` from the host. Unknown events and devices are ignored.
    pub fn signal_event(&self, device: u32, event: vk::Event) -> Result<(), SyncError> {
        let Some(gpu) = self.registry.gpu_by_index(device) else {
            return Ok(());
        };
        if !self.owned_event(device, event) {
            return Ok(());
        }
        // SAFETY: the event was created on this device and is still owned.
        unsafe { gpu.set_raw_event(event) }.map_err(SyncError::Event)
    }

    /// Poll until `event` is set, then reset it. Returns `Ok(false)` for
    /// unknown events and devices.
    pub fn wait_for_event(&self, device: u32, event: vk::Event) -> Result<bool, SyncError> {
        let Some(gpu) = self.registry.gpu_by_index(device) else {
            return Ok(false);
        };
        if !self.owned_event(device, event) {
            return Ok(false);
        }
        let _span = tracing::debug_span!("wait_for_event", device).entered();
        // SAFETY: the event was created on this device and is still owned.
        while !unsafe { gpu.get_raw_event_status(event) }.map_err(SyncError::Event)? {
            thread::sleep(Duration::from_micros(50));
        }
        // SAFETY: as above; the caller is the only waiter of a one-shot event.
        unsafe { gpu.reset_raw_event(event) }.map_err(SyncError::Event)?;
        Ok(true)
    }
}

impl Drop for CrossDeviceSynchronizer {
    fn drop(&mut self) {
        tracing::debug!("Dropping CrossDeviceSynchronizer");
        self.counters.close_all();
        for lane in &mut self.lanes {
            lane.get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .shut_down();
        }
        for gpu in self.registry.available_gpus() {
            let ordinal = gpu.ordinal() as usize;
            if let Err(e) = gpu.wait_idle() {
                tracing::error!("GPU {ordinal} failed to idle: {e}");
            }
            let owned = self.owned.get_mut(ordinal).map(|o| {
                std::mem::take(o.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner))
            });
            let barrier = self.lanes.get_mut(ordinal).map(|l| {
                l.get_mut()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .semaphore
            });
            // SAFETY: the device is idle, workers are joined, and every
            // handle below was created on this device.
            unsafe {
                for semaphore in owned.iter().flat_map(|o| o.semaphores.iter()) {
                    gpu.destroy_raw_semaphore(*semaphore);
                }
                for event in owned.iter().flat_map(|o| o.events.iter()) {
                    gpu.destroy_raw_event(*event);
                }
                if let Some(semaphore) = barrier {
                    gpu.destroy_raw_semaphore(semaphore);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn counter_never_decreases() {
        let counter = TimelineCounter::new();
        assert_eq!(counter.signal(5), 5);
        assert_eq!(counter.signal(3), 5);
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn signal_then_query_observes_frame() {
        let counters = CompletionCounters::new(3);

        counters.signal(1, 42);

        assert_eq!(counters.value(1), Some(42));
        assert_eq!(counters.value(0), Some(0));
        assert!(counters.wait(1, 42));
        assert!(counters.wait(1, 10));
    }

    #[test]
    fn out_of_range_device_is_ignored() {
        let counters = CompletionCounters::new(2);

        counters.signal(7, 1);

        assert_eq!(counters.value(7), None);
        assert!(!counters.wait(7, 1));
        assert!(!counters.wait_timeout(7, 1, Duration::from_millis(1)));
    }

    #[test]
    fn next_frame_stops_at_the_last_representable_frame() {
        let counters = CompletionCounters::new(2);
        counters.signal(0, 4);
        counters.signal(1, u64::MAX);

        assert_eq!(counters.next_frame(0), Some(5));
        assert_eq!(counters.next_frame(1), None);
        assert_eq!(counters.next_frame(9), None);
    }

    #[test]
    fn wait_timeout_gives_up() {
        let counters = CompletionCounters::new(1);
        assert!(!counters.wait_timeout(0, 1, Duration::from_millis(10)));
    }

    #[test]
    fn wait_blocks_until_other_thread_signals() {
        let counter = Arc::new(TimelineCounter::new());
        let waiter = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || counter.wait(3))
        };

        counter.signal(1);
        counter.signal(3);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn close_wakes_waiters() {
        let counter = Arc::new(TimelineCounter::new());
        let waiter = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || counter.wait(100))
        };

        counter.close();

        assert!(!waiter.join().unwrap());
    }

    fn recording_worker(
        counter_source: &Arc<Mutex<Vec<u64>>>,
    ) -> (Sender<BridgeRequest>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel();
        let signaled = Arc::clone(counter_source);
        let worker = spawn_bridge_worker(0, receiver, move |value| {
            signaled.lock().unwrap().push(value);
            Ok(())
        })
        .unwrap();
        (sender, worker)
    }

    #[test]
    fn bridge_signals_after_source_frame() {
        let signaled = Arc::new(Mutex::new(Vec::new()));
        let (sender, worker) = recording_worker(&signaled);
        let source = Arc::new(TimelineCounter::new());

        sender
            .send(BridgeRequest {
                source: Arc::clone(&source),
                source_frame: 2,
                dst_value: 1,
            })
            .unwrap();
        sender
            .send(BridgeRequest {
                source: Arc::clone(&source),
                source_frame: 3,
                dst_value: 2,
            })
            .unwrap();
        source.signal(3);
        drop(sender);
        worker.join().unwrap();

        assert_eq!(*signaled.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn bridge_releases_values_when_source_closes() {
        let signaled = Arc::new(Mutex::new(Vec::new()));
        let (sender, worker) = recording_worker(&signaled);
        let source = Arc::new(TimelineCounter::new());

        sender
            .send(BridgeRequest {
                source: Arc::clone(&source),
                source_frame: 99,
                dst_value: 1,
            })
            .unwrap();
        source.close();
        drop(sender);
        worker.join().unwrap();

        assert_eq!(*signaled.lock().unwrap(), vec![1]);
    }

    #[test]
    fn lane_reserves_increasing_values_and_drains_waits() {
        let semaphore = vk::Semaphore::from_raw(0x51);
        let mut lane = BarrierLane::new(semaphore);

        assert_eq!(lane.reserve(vk::PipelineStageFlags::FRAGMENT_SHADER), 1);
        assert_eq!(lane.reserve(vk::PipelineStageFlags::TRANSFER), 2);

        let waits = lane.take_waits();
        assert_eq!(
            waits,
            vec![
                SemaphoreWait {
                    semaphore,
                    stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                    value: 1,
                },
                SemaphoreWait {
                    semaphore,
                    stage: vk::PipelineStageFlags::TRANSFER,
                    value: 2,
                },
            ]
        );
        assert!(lane.take_waits().is_empty());
        assert_eq!(lane.reserve(vk::PipelineStageFlags::TRANSFER), 3);
    }
}
