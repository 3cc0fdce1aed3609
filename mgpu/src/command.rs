//! Per-device command buffer lifecycle and submission fan-out.
//!
//! Buffers come from each device's pool via
//! [`begin_command_buffer`](CommandSubmissionDistributor::begin_command_buffer),
//! are filled inside
//! [`record_command_buffer`](CommandSubmissionDistributor::record_command_buffer),
//! are finished with
//! [`end_command_buffer`](CommandSubmissionDistributor::end_command_buffer),
//! submitted as part of a [`GpuCommandSubmission`], and recycled once
//! [`wait_for_gpu_completion`](CommandSubmissionDistributor::wait_for_gpu_completion)
//! sees their fence signaled.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use ash::vk;
use thiserror::Error;

use crate::device::GpuDevice;
use crate::frame::WorkloadHint;
use crate::registry::GpuDeviceRegistry;

// ---------------------------------------------------------------------------
// Submission description
// ---------------------------------------------------------------------------

/// A command buffer tagged with the device that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    gpu_index: u32,
    handle: vk::CommandBuffer,
}

impl CommandBufferHandle {
    pub fn gpu_index(&self) -> u32 {
        self.gpu_index
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }
}

/// Wait on `semaphore` before `stage`. `value` is the timeline value to
/// reach and is ignored for binary semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
    pub value: u64,
}

/// Signal `semaphore` when the submission completes. `value` is ignored for
/// binary semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSignal {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// One device's share of a frame.
///
/// A null `fence` asks the distributor to supply its own. A caller-supplied
/// fence must be unsignaled and stays owned by the caller.
#[derive(Debug, Clone, Default)]
pub struct GpuCommandSubmission {
    pub gpu_index: u32,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreSignal>,
    pub fence: vk::Fence,
}

impl GpuCommandSubmission {
    pub fn new(gpu_index: u32, command_buffers: Vec<CommandBufferHandle>) -> Self {
        Self {
            gpu_index,
            command_buffers,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Allocate(vk::Result),
    #[error("Vulkan error beginning command buffer: {0}")]
    Begin(vk::Result),
    #[error("Vulkan error ending command buffer: {0}")]
    End(vk::Result),
    #[error("Command buffer {0:?} is not recording")]
    NotRecording(vk::CommandBuffer),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error(
        "Command buffer {0:?} is not ready for submission \
         (still recording, unknown or already submitted)"
    )]
    NotExecutable(vk::CommandBuffer),
    #[error("Command buffer {buffer:?} belongs to GPU {owner}, not GPU {target}")]
    WrongDevice {
        buffer: vk::CommandBuffer,
        owner: u32,
        target: u32,
    },
    #[error("Vulkan error creating submission fence: {0}")]
    FenceCreation(vk::Result),
    #[error("Vulkan error submitting to GPU {gpu}: {result}")]
    Submit { gpu: u32, result: vk::Result },
}

// ---------------------------------------------------------------------------
// CommandBufferTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    /// Ended and waiting in the outstanding queue (or drained from it).
    Executable,
    /// Submitted; in flight until its fence is retired.
    Pending,
}

#[derive(Debug)]
struct InFlight {
    fence: vk::Fence,
    /// True when the distributor created the fence and must destroy it.
    owns_fence: bool,
    command_buffers: Vec<vk::CommandBuffer>,
}

/// Host-side bookkeeping for one device's command buffers.
#[derive(Debug, Default)]
struct CommandBufferTracker {
    states: HashMap<vk::CommandBuffer, CommandBufferState>,
    outstanding: VecDeque<vk::CommandBuffer>,
    recycled: Vec<vk::CommandBuffer>,
    in_flight: Vec<InFlight>,
}

impl CommandBufferTracker {
    fn take_recycled(&mut self) -> Option<vk::CommandBuffer> {
        self.recycled.pop()
    }

    fn began(&mut self, command_buffer: vk::CommandBuffer) {
        self.states
            .insert(command_buffer, CommandBufferState::Recording);
    }

    /// A buffer whose `vkBeginCommandBuffer` failed goes back to the pool
    /// of reusable handles.
    fn abandon(&mut self, command_buffer: vk::CommandBuffer) {
        self.states.remove(&command_buffer);
        self.recycled.push(command_buffer);
    }

    fn is_recording(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.states.get(&command_buffer) == Some(&CommandBufferState::Recording)
    }

    fn ended(&mut self, command_buffer: vk::CommandBuffer) {
        self.states
            .insert(command_buffer, CommandBufferState::Executable);
        self.outstanding.push_back(command_buffer);
    }

    fn state(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        self.states.get(&command_buffer).copied()
    }

    fn drain_outstanding(&mut self) -> Vec<vk::CommandBuffer> {
        self.outstanding.drain(..).collect()
    }

    fn check_submittable(
        &self,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<(), SubmitError> {
        match command_buffers
            .iter()
            .find(|&&cb| self.state(cb) != Some(CommandBufferState::Executable))
        {
            Some(&cb) => Err(SubmitError::NotExecutable(cb)),
            None => Ok(()),
        }
    }

    fn submitted(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
        owns_fence: bool,
    ) {
        for cb in command_buffers {
            self.states.insert(*cb, CommandBufferState::Pending);
        }
        self.outstanding.retain(|cb| !command_buffers.contains(cb));
        self.in_flight.push(InFlight {
            fence,
            owns_fence,
            command_buffers: command_buffers.to_vec(),
        });
    }

    fn in_flight_fences(&self) -> Vec<vk::Fence> {
        self.in_flight.iter().map(|f| f.fence).collect()
    }

    /// Retire in-flight entries guarded by `fences`, returning the fences
    /// the distributor owns. Their command buffers become reusable.
    fn retire(&mut self, fences: &[vk::Fence]) -> Vec<vk::Fence> {
        let (done, still_in_flight): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.in_flight)
                .into_iter()
                .partition(|f| fences.contains(&f.fence));
        self.in_flight = still_in_flight;

        let mut owned_fences = Vec::new();
        for entry in done {
            for cb in entry.command_buffers {
                self.states.remove(&cb);
                self.recycled.push(cb);
            }
            if entry.owns_fence {
                owned_fences.push(entry.fence);
            }
        }
        owned_fences
    }

    /// Every command buffer handle and distributor-owned fence, leaving the
    /// tracker empty.
    fn take_all(&mut self) -> (Vec<vk::CommandBuffer>, Vec<vk::Fence>) {
        let mut buffers: Vec<vk::CommandBuffer> =
            self.states.drain().map(|(cb, _)| cb).collect();
        buffers.append(&mut self.recycled);
        self.outstanding.clear();
        let fences = self
            .in_flight
            .drain(..)
            .filter(|f| f.owns_fence)
            .map(|f| f.fence)
            .collect();
        (buffers, fences)
    }
}

/// Install `estimated` as frame weights for `active_count` devices.
/// Mismatched lengths are ignored; all-zero estimates clear the weights.
fn apply_workload_estimates(hint: &WorkloadHint, active_count: u32, estimated: &[u32]) {
    if estimated.len() != active_count as usize {
        tracing::warn!(
            "Ignoring {} workload estimate(s) for {active_count} active GPU(s)",
            estimated.len()
        );
        return;
    }
    if estimated.iter().all(|&w| w == 0) {
        hint.clear();
    } else {
        hint.set_weights(estimated.to_vec());
    }
}

// ---------------------------------------------------------------------------
// CommandSubmissionDistributor
// ---------------------------------------------------------------------------

/// Records and submits command buffers on every active device.
pub struct CommandSubmissionDistributor {
    registry: Arc<GpuDeviceRegistry>,
    hint: Arc<WorkloadHint>,
    trackers: Vec<Mutex<CommandBufferTracker>>,
}

impl std::fmt::Debug for CommandSubmissionDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSubmissionDistributor")
            .field("devices", &self.trackers.len())
            .finish_non_exhaustive()
    }
}

impl CommandSubmissionDistributor {
    /// `hint` is normally
    /// [`FrameDistributor::workload_hint`](crate::frame::FrameDistributor::workload_hint).
    pub fn new(registry: Arc<GpuDeviceRegistry>, hint: Arc<WorkloadHint>) -> Self {
        let trackers = (0..registry.active_gpu_count())
            .map(|_| Mutex::default())
            .collect();
        Self {
            registry,
            hint,
            trackers,
        }
    }

    /// Allocate (or reuse) a primary command buffer on `device` and begin
    /// one-time-submit recording. `Ok(None)` when `device` is out of range.
    pub fn begin_command_buffer(
        &self,
        device: u32,
    ) -> Result<Option<CommandBufferHandle>, CommandBufferError> {
        let (Some(gpu), Some(tracker)) = (
            self.registry.gpu_by_index(device),
            self.trackers.get(device as usize),
        ) else {
            return Ok(None);
        };
        let mut tracker = tracker.lock().expect("command tracker lock poisoned");

        let handle = match tracker.take_recycled() {
            Some(recycled) => recycled,
            None => gpu
                .allocate_command_buffers(1)
                .map_err(CommandBufferError::Allocate)?
                .pop()
                .ok_or(CommandBufferError::Allocate(vk::Result::ERROR_UNKNOWN))?,
        };

        // SAFETY: the handle came from this device's pool and is either
        // fresh or was retired after its fence signaled.
        if let Err(e) = unsafe { gpu.begin_raw_command_buffer(handle) } {
            tracker.abandon(handle);
            return Err(CommandBufferError::Begin(e));
        }
        tracker.began(handle);

        Ok(Some(CommandBufferHandle {
            gpu_index: device,
            handle,
        }))
    }

    /// Record into a begun buffer with its device's command pool locked.
    ///
    /// `record` gets the owning device and the raw handle for its `cmd_*`
    /// calls and must not call back into this distributor.
    pub fn record_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        record: impl FnOnce(&GpuDevice, vk::CommandBuffer),
    ) -> Result<(), CommandBufferError> {
        let raw = command_buffer.handle;
        let (Some(gpu), Some(tracker)) = (
            self.registry.gpu_by_index(command_buffer.gpu_index),
            self.trackers.get(command_buffer.gpu_index as usize),
        ) else {
            return Err(CommandBufferError::NotRecording(raw));
        };
        let tracker = tracker.lock().expect("command tracker lock poisoned");
        if !tracker.is_recording(raw) {
            return Err(CommandBufferError::NotRecording(raw));
        }
        gpu.with_command_pool_locked(|| record(gpu, raw));
        Ok(())
    }

    /// Finish recording and queue the buffer as outstanding on its device.
    pub fn end_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), CommandBufferError> {
        let raw = command_buffer.handle;
        let (Some(gpu), Some(tracker)) = (
            self.registry.gpu_by_index(command_buffer.gpu_index),
            self.trackers.get(command_buffer.gpu_index as usize),
        ) else {
            return Err(CommandBufferError::NotRecording(raw));
        };
        let mut tracker = tracker.lock().expect("command tracker lock poisoned");
        if !tracker.is_recording(raw) {
            return Err(CommandBufferError::NotRecording(raw));
        }
        // SAFETY: the tracker says this buffer is recording on this device.
        unsafe { gpu.end_raw_command_buffer(raw) }
            .map_err(CommandBufferError::End)?;
        tracker.ended(raw);
        Ok(())
    }

    /// Remove and return the executable buffers waiting on `device`, oldest
    /// first.
    pub fn drain_outstanding(&self, device: u32) -> Vec<CommandBufferHandle> {
        self.trackers
            .get(device as usize)
            .map(|tracker| {
                tracker
                    .lock()
                    .expect("command tracker lock poisoned")
                    .drain_outstanding()
                    .into_iter()
                    .map(|handle| CommandBufferHandle {
                        gpu_index: device,
                        handle,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Submit to the device's graphics queue without waiting. Submissions
    /// naming an out-of-range device are dropped with a warning.
    pub fn submit_command_buffers_to_gpu(
        &self,
        submission: &GpuCommandSubmission,
    ) -> Result<(), SubmitError> {
        let target = submission.gpu_index;
        let (Some(gpu), Some(tracker)) = (
            self.registry.gpu_by_index(target),
            self.trackers.get(target as usize),
        ) else {
            tracing::warn!("Dropping submission for out-of-range GPU {target}");
            return Ok(());
        };

        if let Some(foreign) = submission
            .command_buffers
            .iter()
            .find(|cb| cb.gpu_index != target)
        {
            return Err(SubmitError::WrongDevice {
                buffer: foreign.handle,
                owner: foreign.gpu_index,
                target,
            });
        }
        let command_buffers: Vec<vk::CommandBuffer> =
            submission.command_buffers.iter().map(|cb| cb.handle).collect();

        let mut tracker = tracker.lock().expect("command tracker lock poisoned");
        tracker.check_submittable(&command_buffers)?;

        let owns_fence = submission.fence == vk::Fence::null();
        let fence = if owns_fence {
            let create_info = vk::FenceCreateInfo::default();
            // SAFETY: create_info has no borrowed pointers.
            unsafe { gpu.create_raw_fence(&create_info) }
                .map_err(SubmitError::FenceCreation)?
        } else {
            submission.fence
        };

        let waits = &submission.waits;
        let signals = &submission.signals;
        let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = waits.iter().map(|w| w.stage).collect();
        let wait_values: Vec<u64> = waits.iter().map(|w| w.value).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            signals.iter().map(|s| s.semaphore).collect();
        let signal_values: Vec<u64> = signals.iter().map(|s| s.value).collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        // SAFETY: every command buffer is executable and from this device
        // (checked above); semaphores and the fence are the caller's
        // responsibility per GpuCommandSubmission; all arrays live on this
        // frame.
        let submitted = unsafe { gpu.graphics_queue_submit(&[submit_info], fence) };
        if let Err(result) = submitted {
            if owns_fence {
                // SAFETY: the fence was never submitted.
                unsafe { gpu.destroy_raw_fence(fence) };
            }
            return Err(SubmitError::Submit { gpu: target, result });
        }

        tracker.submitted(&command_buffers, fence, owns_fence);
        tracing::trace!(
            "GPU {target}: submitted {} command buffer(s), {} wait(s), {} signal(s)",
            command_buffers.len(),
            wait_semaphores.len(),
            signal_semaphores.len()
        );
        Ok(())
    }

    /// Submit every entry in order. Stops at the first error; entries
    /// already submitted stay in flight.
    pub fn submit_multi_gpu_frame(
        &self,
        submissions: &[GpuCommandSubmission],
    ) -> Result<(), SubmitError> {
        submissions
            .iter()
            .try_for_each(|submission| self.submit_command_buffers_to_gpu(submission))
    }

    /// Feed per-device workload estimates to the frame distributor.
    pub fn balance_workload_across_gpus(&self, estimated_workloads: &[u32]) {
        apply_workload_estimates(
            &self.hint,
            self.registry.active_gpu_count(),
            estimated_workloads,
        );
    }

    /// Block up to `timeout_ns` for everything in flight on `device`.
    ///
    /// Returns `true` when all of it finished (or nothing was in flight),
    /// retiring the fences and recycling their command buffers. Returns
    /// `false` on timeout, on a Vulkan error, or for an out-of-range device.
    pub fn wait_for_gpu_completion(&self, device: u32, timeout_ns: u64) -> bool {
        let (Some(gpu), Some(tracker)) = (
            self.registry.gpu_by_index(device),
            self.trackers.get(device as usize),
        ) else {
            return false;
        };

        let fences = tracker
            .lock()
            .expect("command tracker lock poisoned")
            .in_flight_fences();
        if fences.is_empty() {
            return true;
        }

        let _span = tracing::debug_span!("wait_for_gpu_completion", device).entered();
        // SAFETY: every fence was submitted on this device.
        match unsafe { gpu.wait_for_raw_fences(&fences, true, timeout_ns) } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return false,
            Err(e) => {
                tracing::error!("GPU {device}: error waiting for fences: {e}");
                return false;
            }
        }

        let owned = tracker
            .lock()
            .expect("command tracker lock poisoned")
            .retire(&fences);
        for fence in owned {
            // SAFETY: signaled, hence no longer pending, and created by us.
            unsafe { gpu.destroy_raw_fence(fence) };
        }
        true
    }
}

impl Drop for CommandSubmissionDistributor {
    fn drop(&mut self) {
        tracing::debug!("Dropping CommandSubmissionDistributor");
        let gpus = self.registry.available_gpus();
        for (gpu, tracker) in gpus.iter().zip(&mut self.trackers) {
            if let Err(e) = gpu.wait_idle() {
                tracing::error!("GPU {} failed to idle: {e}", gpu.ordinal());
            }
            let (buffers, fences) = tracker
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take_all();
            // SAFETY: the device is idle and every handle was created on it.
            unsafe {
                gpu.free_command_buffers(&buffers);
                for fence in fences {
                    gpu.destroy_raw_fence(fence);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn cb(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    #[test]
    fn buffer_moves_through_states() {
        let mut tracker = CommandBufferTracker::default();

        tracker.began(cb(1));
        assert_eq!(tracker.state(cb(1)), Some(CommandBufferState::Recording));

        tracker.ended(cb(1));
        assert_eq!(tracker.state(cb(1)), Some(CommandBufferState::Executable));

        tracker.submitted(&[cb(1)], vk::Fence::from_raw(9), true);
        assert_eq!(tracker.state(cb(1)), Some(CommandBufferState::Pending));
        assert!(tracker.drain_outstanding().is_empty());
    }

    #[test]
    fn open_or_unknown_buffers_are_not_submittable() {
        let mut tracker = CommandBufferTracker::default();
        tracker.began(cb(1));
        tracker.began(cb(2));
        tracker.ended(cb(2));

        assert_eq!(
            tracker.check_submittable(&[cb(2), cb(1)]),
            Err(SubmitError::NotExecutable(cb(1)))
        );
        assert_eq!(
            tracker.check_submittable(&[cb(77)]),
            Err(SubmitError::NotExecutable(cb(77)))
        );
        assert_eq!(tracker.check_submittable(&[cb(2)]), Ok(()));
    }

    #[test]
    fn submitted_buffers_cannot_be_resubmitted() {
        let mut tracker = CommandBufferTracker::default();
        tracker.began(cb(1));
        tracker.ended(cb(1));
        tracker.submitted(&[cb(1)], vk::Fence::from_raw(9), true);

        assert_eq!(
            tracker.check_submittable(&[cb(1)]),
            Err(SubmitError::NotExecutable(cb(1)))
        );
    }

    #[test]
    fn outstanding_queue_is_fifo() {
        let mut tracker = CommandBufferTracker::default();
        for raw in [3, 1, 2] {
            tracker.began(cb(raw));
            tracker.ended(cb(raw));
        }

        assert_eq!(tracker.drain_outstanding(), vec![cb(3), cb(1), cb(2)]);
        assert!(tracker.drain_outstanding().is_empty());
        // Draining does not change what may be submitted.
        assert_eq!(tracker.check_submittable(&[cb(1)]), Ok(()));
    }

    #[test]
    fn retire_recycles_buffers_and_returns_owned_fences() {
        let mut tracker = CommandBufferTracker::default();
        for raw in [1, 2, 3] {
            tracker.began(cb(raw));
            tracker.ended(cb(raw));
        }
        let internal = vk::Fence::from_raw(10);
        let external = vk::Fence::from_raw(11);
        let later = vk::Fence::from_raw(12);
        tracker.submitted(&[cb(1)], internal, true);
        tracker.submitted(&[cb(2)], external, false);
        tracker.submitted(&[cb(3)], later, true);

        let owned = tracker.retire(&[internal, external]);

        assert_eq!(owned, vec![internal]);
        assert_eq!(tracker.in_flight_fences(), vec![later]);
        assert_eq!(tracker.state(cb(1)), None);
        assert_eq!(tracker.state(cb(3)), Some(CommandBufferState::Pending));
        let mut reused = vec![
            tracker.take_recycled().unwrap(),
            tracker.take_recycled().unwrap(),
        ];
        reused.sort_by_key(|c| c.as_raw());
        assert_eq!(reused, vec![cb(1), cb(2)]);
        assert_eq!(tracker.take_recycled(), None);
    }

    #[test]
    fn take_all_empties_tracker() {
        let mut tracker = CommandBufferTracker::default();
        tracker.began(cb(1));
        tracker.ended(cb(1));
        tracker.began(cb(2));
        tracker.submitted(&[cb(1)], vk::Fence::from_raw(5), true);
        tracker.abandon(cb(3));

        let (mut buffers, fences) = tracker.take_all();
        buffers.sort_by_key(|c| c.as_raw());

        assert_eq!(buffers, vec![cb(1), cb(2), cb(3)]);
        assert_eq!(fences, vec![vk::Fence::from_raw(5)]);
        assert!(tracker.in_flight_fences().is_empty());
        assert_eq!(tracker.take_recycled(), None);
    }

    #[test]
    fn workload_estimates_install_weights() {
        let hint = WorkloadHint::new();

        apply_workload_estimates(&hint, 3, &[2, 1, 1]);

        assert_eq!(hint.weights(), Some(vec![2, 1, 1]));
    }

    #[test]
    fn mismatched_estimates_are_ignored() {
        let hint = WorkloadHint::new();
        apply_workload_estimates(&hint, 2, &[4, 1]);
        let generation = hint.generation();

        apply_workload_estimates(&hint, 2, &[1, 2, 3]);

        assert_eq!(hint.weights(), Some(vec![4, 1]));
        assert_eq!(hint.generation(), generation);
    }

    #[test]
    fn all_zero_estimates_clear_weights() {
        let hint = WorkloadHint::new();
        apply_workload_estimates(&hint, 2, &[4, 1]);

        apply_workload_estimates(&hint, 2, &[0, 0]);

        assert_eq!(hint.weights(), None);
    }

    #[test]
    fn recording_needs_a_begun_buffer_on_an_active_gpu() {
        let distributor = CommandSubmissionDistributor::new(
            Arc::new(GpuDeviceRegistry::new()),
            Arc::new(WorkloadHint::new()),
        );
        let stray = CommandBufferHandle {
            gpu_index: 0,
            handle: cb(1),
        };
        let mut called = false;

        let result = distributor.record_command_buffer(stray, |_, _| called = true);

        assert!(matches!(result, Err(CommandBufferError::NotRecording(raw)) if raw == cb(1)));
        assert!(!called);
        assert!(matches!(distributor.begin_command_buffer(0), Ok(None)));
    }
}
