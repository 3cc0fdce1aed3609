//! The table of active GPUs.
//!
//! [`GpuDeviceRegistry`] is filled once by
//! [`initialize_multi_gpu`](GpuDeviceRegistry::initialize_multi_gpu) and is
//! then shared read-only (usually as `Arc<GpuDeviceRegistry>`) with the
//! frame distributor, synchronizer, placement manager and submission
//! distributor. Initialization and teardown take `&mut self`, so they can
//! never race with readers.

use ash::vk;
use thiserror::Error;

use crate::device::{DeviceBringupError, DeviceCandidate, GpuDevice};
use crate::instance::{FetchPhysicalDeviceError, InstanceRef};

/// Settings for [`GpuDeviceRegistry::initialize_multi_gpu_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Upper bound on the number of devices to bring up. The active set
    /// never exceeds the number of physical devices.
    pub desired_gpu_count: u32,
    /// Request a queue from a dedicated transfer family when the device
    /// exposes one.
    pub dedicated_transfer_queue: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            desired_gpu_count: 3,
            dedicated_transfer_queue: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitializeError {
    #[error(transparent)]
    Enumeration(#[from] FetchPhysicalDeviceError),

    #[error("No Vulkan physical devices found")]
    NoDevicesFound,

    #[error("No candidate device could be brought up ({} failed)", failures.len())]
    NoActiveDevices {
        /// `(physical index, reason)` for every candidate that was tried.
        failures: Vec<(u32, DeviceBringupError)>,
    },
}

/// Anything that knows how many devices are active.
///
/// The frame distributor only needs this count, which keeps partitioning
/// independent of a live Vulkan device.
pub trait DeviceSet {
    fn active_gpu_count(&self) -> u32;
}

/// Try to bring up `min(desired, candidates.len())` candidates, in order.
///
/// `bring_up` gets the candidate's physical index, the ordinal it would
/// receive, and the candidate. Failures are logged and skipped; each
/// candidate is tried exactly once.
pub(crate) fn bring_up_candidates<C, D>(
    candidates: &[C],
    desired: u32,
    mut bring_up: impl FnMut(u32, u32, &C) -> Result<D, DeviceBringupError>,
) -> Result<Vec<D>, InitializeError> {
    if candidates.is_empty() {
        return Err(InitializeError::NoDevicesFound);
    }

    let attempt_count = (desired as usize).min(candidates.len());
    let mut active = Vec::with_capacity(attempt_count);
    let mut failures = Vec::new();

    for (physical_index, candidate) in
        candidates.iter().enumerate().take(attempt_count)
    {
        let physical_index = physical_index as u32;
        let ordinal = active.len() as u32;
        match bring_up(physical_index, ordinal, candidate) {
            Ok(device) => active.push(device),
            Err(e) => {
                tracing::warn!(
                    "Skipping physical device {physical_index}: {e}"
                );
                failures.push((physical_index, e));
            }
        }
    }

    if active.is_empty() {
        return Err(InitializeError::NoActiveDevices { failures });
    }
    Ok(active)
}

/// Owns every active [`GpuDevice`], indexed by ordinal.
#[derive(Debug, Default)]
pub struct GpuDeviceRegistry {
    devices: Vec<GpuDevice>,
}

impl Drop for GpuDeviceRegistry {
    fn drop(&mut self) {
        tracing::debug!("Dropping GpuDeviceRegistry");
        self.teardown();
    }
}

impl GpuDeviceRegistry {
    /// An empty registry. Nothing is active until initialization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring up to `desired_count` devices online with default settings.
    pub fn initialize_multi_gpu(
        &mut self,
        instance: &InstanceRef,
        desired_count: u32,
    ) -> Result<(), InitializeError> {
        self.initialize_multi_gpu_with(
            instance,
            RegistryConfig {
                desired_gpu_count: desired_count,
                ..Default::default()
            },
        )
    }

    /// Enumerate the instance's physical devices and bring up as many as
    /// `config` asks for. Any previously active devices are torn down first.
    pub fn initialize_multi_gpu_with(
        &mut self,
        instance: &InstanceRef,
        config: RegistryConfig,
    ) -> Result<(), InitializeError> {
        if !self.devices.is_empty() {
            tracing::info!("Re-initializing GPU registry, tearing down first");
            self.teardown();
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;
        tracing::info!(
            "Found {} physical device(s), want {}",
            physical_devices.len(),
            config.desired_gpu_count
        );

        self.devices = bring_up_candidates(
            &physical_devices,
            config.desired_gpu_count,
            |physical_index, ordinal, &physical_device| {
                // SAFETY: the handle was just enumerated from this instance.
                let candidate = unsafe {
                    DeviceCandidate::query(instance, physical_index, physical_device)
                };
                GpuDevice::bring_up(
                    instance,
                    &candidate,
                    ordinal,
                    config.dedicated_transfer_queue,
                )
            },
        )?;

        tracing::info!("{} GPU(s) active", self.devices.len());
        Ok(())
    }

    /// Destroy every active device, highest ordinal first. Safe to call on
    /// an empty registry.
    pub fn teardown(&mut self) {
        while let Some(device) = self.devices.pop() {
            drop(device);
        }
    }

    pub fn available_gpus(&self) -> &[GpuDevice] {
        &self.devices
    }

    pub fn available_gpus_mut(&mut self) -> &mut [GpuDevice] {
        &mut self.devices
    }

    pub fn gpu_by_index(&self, index: u32) -> Option<&GpuDevice> {
        self.devices.get(index as usize)
    }

    pub fn gpu_by_index_mut(&mut self, index: u32) -> Option<&mut GpuDevice> {
        self.devices.get_mut(index as usize)
    }

    pub fn active_gpu_count(&self) -> u32 {
        self.devices.len() as u32
    }

    /// True when the device has a compute family distinct from graphics.
    pub fn supports_async_compute_on_gpu(&self, index: u32) -> bool {
        self.gpu_by_index(index)
            .is_some_and(|gpu| gpu.queue_families().compute.is_some())
    }

    /// True when at least two devices are active.
    pub fn supports_memory_sharing(&self) -> bool {
        self.devices.len() >= 2
    }

    /// `vkAllocateMemory` on device `index`. `Ok(None)` when `index` is out
    /// of range.
    ///
    /// # Safety
    /// `allocate_info` must be valid for that device (memory type index in
    /// range, size within heap limits).
    pub unsafe fn allocate_memory(
        &self,
        index: u32,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<Option<vk::DeviceMemory>, vk::Result> {
        let Some(gpu) = self.gpu_by_index(index) else {
            return Ok(None);
        };
        // SAFETY: Caller guarantees allocate_info validity for this device.
        unsafe { gpu.allocate_raw_memory(allocate_info) }.map(Some)
    }

    /// `vkFreeMemory` on device `index`. No-op when `index` is out of range.
    ///
    /// # Safety
    /// `memory` must have been allocated from that device and nothing may
    /// still be bound to it.
    pub unsafe fn free_memory(&self, index: u32, memory: vk::DeviceMemory) {
        if let Some(gpu) = self.gpu_by_index(index) {
            // SAFETY: Caller guarantees memory provenance.
            unsafe { gpu.free_raw_memory(memory) };
        }
    }
}

impl DeviceSet for GpuDeviceRegistry {
    fn active_gpu_count(&self) -> u32 {
        GpuDeviceRegistry::active_gpu_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueFamilyIndices, select_queue_families};

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn graphics_device() -> Vec<vk::QueueFamilyProperties> {
        vec![family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)]
    }

    fn compute_only_device() -> Vec<vk::QueueFamilyProperties> {
        vec![family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)]
    }

    #[derive(Debug)]
    struct FakeDevice {
        physical_index: u32,
        ordinal: u32,
        #[allow(dead_code)]
        families: QueueFamilyIndices,
    }

    fn fake_bring_up(
        physical_index: u32,
        ordinal: u32,
        families: &Vec<vk::QueueFamilyProperties>,
    ) -> Result<FakeDevice, DeviceBringupError> {
        let families = select_queue_families(families)
            .ok_or(DeviceBringupError::NoGraphicsQueue)?;
        Ok(FakeDevice {
            physical_index,
            ordinal,
            families,
        })
    }

    #[test]
    fn desired_count_is_capped_by_available_devices() {
        let candidates = vec![graphics_device(), graphics_device()];

        let active = bring_up_candidates(&candidates, 3, fake_bring_up).unwrap();

        assert_eq!(active.len(), 2);
    }

    #[test]
    fn only_desired_count_candidates_are_attempted() {
        let candidates = vec![graphics_device(); 4];
        let mut attempts = 0;

        let active = bring_up_candidates(&candidates, 2, |p, o, c| {
            attempts += 1;
            fake_bring_up(p, o, c)
        })
        .unwrap();

        assert_eq!(active.len(), 2);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn ordinals_are_dense_after_a_skip() {
        let candidates =
            vec![compute_only_device(), graphics_device(), graphics_device()];

        let active = bring_up_candidates(&candidates, 3, fake_bring_up).unwrap();

        assert_eq!(active.len(), 2);
        assert_eq!(active[0].physical_index, 1);
        assert_eq!(active[0].ordinal, 0);
        assert_eq!(active[1].physical_index, 2);
        assert_eq!(active[1].ordinal, 1);
    }

    #[test]
    fn all_devices_without_graphics_fail_initialization() {
        let candidates = vec![compute_only_device(), compute_only_device()];

        let err = bring_up_candidates(&candidates, 3, fake_bring_up).unwrap_err();

        match err {
            InitializeError::NoActiveDevices { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].0, 0);
                assert_eq!(failures[1].0, 1);
                assert!(matches!(
                    failures[0].1,
                    DeviceBringupError::NoGraphicsQueue
                ));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn no_physical_devices_is_fatal() {
        let candidates: Vec<Vec<vk::QueueFamilyProperties>> = Vec::new();

        let err = bring_up_candidates(&candidates, 3, fake_bring_up).unwrap_err();

        assert!(matches!(err, InitializeError::NoDevicesFound));
    }

    #[test]
    fn bring_up_failure_is_not_retried() {
        let candidates = vec![graphics_device(), graphics_device()];
        let mut seen = Vec::new();

        let active = bring_up_candidates(&candidates, 2, |p, o, c| {
            seen.push(p);
            if p == 0 {
                Err(DeviceBringupError::CommandPoolCreation(
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ))
            } else {
                fake_bring_up(p, o, c)
            }
        })
        .unwrap();

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ordinal, 0);
    }

    #[test]
    fn empty_registry_answers_out_of_range_queries() {
        let registry = GpuDeviceRegistry::new();

        assert_eq!(registry.active_gpu_count(), 0);
        assert!(registry.gpu_by_index(0).is_none());
        assert!(!registry.supports_async_compute_on_gpu(0));
        assert!(!registry.supports_memory_sharing());
        assert!(registry.available_gpus().is_empty());
        let info = vk::MemoryAllocateInfo::default().allocation_size(256);
        // SAFETY: out of range, nothing is allocated.
        assert_eq!(unsafe { registry.allocate_memory(7, &info) }, Ok(None));
    }
}
