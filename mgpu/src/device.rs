//! Per-GPU state ([`GpuDevice`]) and logical-device bring-up.
//!
//! A `GpuDevice` owns one `VkDevice`, the queues fetched from it, a single
//! resettable command pool on the graphics family, and a `gpu-allocator`
//! allocator. It is created by the registry during initialization and
//! destroyed at registry teardown, releasing the allocator, then the
//! command pool, then the logical device.
//!
//! Raw Vulkan operations on the device are surfaced as `unsafe fn` methods
//! prefixed with `raw_` (or `cmd_` for recording). The other components go
//! through these rather than touching `ash::Device` directly.

use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::instance::{InstanceRef, VkVersion};
use crate::queue::{QueueFamilyIndices, select_queue_families};

/// Why a single candidate device was left out of the active set.
#[derive(Debug, Error)]
pub enum DeviceBringupError {
    #[error("No queue family supporting graphics")]
    NoGraphicsQueue,

    #[error("Device reports Vulkan {0}, at least 1.2 is required")]
    UnsupportedApiVersion(VkVersion),

    #[error("Device does not support timeline semaphores")]
    MissingTimelineSemaphores,

    #[error("Failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("Failed to create command pool: {0}")]
    CommandPoolCreation(vk::Result),

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

/// Describes how an allocation will be accessed by CPU and GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Highest bandwidth; not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. Staging uploads and pinned host data.
    CpuToGpu,
    /// GPU-writable, CPU-readable. Readback.
    GpuToCpu,
}

/// Everything queried about a physical device before bring-up.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub physical_index: u32,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

impl DeviceCandidate {
    /// Query a physical device's properties and queue families.
    ///
    /// # Safety
    /// `physical_device` must have been enumerated from `instance`.
    pub unsafe fn query(
        instance: &InstanceRef,
        physical_index: u32,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        // SAFETY: Caller guarantees physical_device provenance.
        let (properties, memory_properties, queue_families) = unsafe {
            (
                instance.get_raw_physical_device_properties(physical_device),
                instance
                    .get_raw_physical_device_memory_properties(physical_device),
                instance.get_raw_physical_device_queue_family_properties(
                    physical_device,
                ),
            )
        };
        Self {
            physical_index,
            physical_device,
            properties,
            memory_properties,
            queue_families,
        }
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown"))
    }
}

/// One active GPU.
///
/// Compute and transfer queues, when present, always come from families
/// distinct from graphics (see [`crate::queue`]), so every queue has its
/// own lock.
pub struct GpuDevice {
    ordinal: u32,
    physical_index: u32,
    name: String,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilyIndices,
    graphics_queue: Mutex<vk::Queue>,
    compute_queue: Option<Mutex<vk::Queue>>,
    transfer_queue: Option<Mutex<vk::Queue>>,
    command_pool: Mutex<vk::CommandPool>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .field("handle", &self.handle.handle())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        tracing::debug!(
            "Dropping GPU {} ({}) device {:?}",
            self.ordinal,
            self.name,
            self.handle.handle()
        );
        if let Err(e) = self.wait_idle() {
            tracing::error!("GPU {} failed to idle before teardown: {e}", self.ordinal);
        }
        // Allocator first, then the pool, then the device.
        self.allocator = None;
        let pool = *self
            .command_pool
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        // SAFETY: The device is idle and every object derived from it is
        // owned by components that hold the registry alive, so they are gone
        // by now. The pool was created from this device.
        unsafe {
            self.handle.destroy_command_pool(pool, None);
            self.handle.destroy_device(None);
        }
    }
}

impl GpuDevice {
    /// Bring up a logical device for `candidate`.
    ///
    /// Everything created for the candidate is destroyed again before an
    /// error is returned.
    pub fn bring_up(
        instance: &InstanceRef,
        candidate: &DeviceCandidate,
        ordinal: u32,
        dedicated_transfer: bool,
    ) -> Result<Self, DeviceBringupError> {
        let version = VkVersion::from_raw(candidate.properties.api_version);
        if !version.at_least(1, 2) {
            return Err(DeviceBringupError::UnsupportedApiVersion(version));
        }

        let queue_families = select_queue_families(&candidate.queue_families)
            .ok_or(DeviceBringupError::NoGraphicsQueue)?;

        // SAFETY: physical_device came from this instance and reports 1.2+.
        if !unsafe {
            instance.supports_timeline_semaphores(candidate.physical_device)
        } {
            return Err(DeviceBringupError::MissingTimelineSemaphores);
        }

        let priorities = [1.0_f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> =
            queue_families
                .requested_families(dedicated_transfer)
                .into_iter()
                .map(|family| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&priorities)
                })
                .collect();

        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut vk12_features);

        // SAFETY: physical_device was derived from instance;
        // device_create_info and everything it points at live on this frame.
        let handle = unsafe {
            instance.create_ash_device(
                candidate.physical_device,
                &device_create_info,
            )
        }
        .map_err(DeviceBringupError::DeviceCreation)?;

        // SAFETY: one queue was requested from each of these families above.
        let (graphics_queue, compute_queue, transfer_queue) = unsafe {
            (
                handle.get_device_queue(queue_families.graphics, 0),
                queue_families
                    .compute
                    .map(|family| handle.get_device_queue(family, 0)),
                queue_families
                    .transfer_queue_family(dedicated_transfer)
                    .map(|family| handle.get_device_queue(family, 0)),
            )
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: the graphics family index is valid for this device.
        let command_pool =
            match unsafe { handle.create_command_pool(&pool_info, None) } {
                Ok(pool) => pool,
                Err(e) => {
                    // SAFETY: nothing else was created from the device yet.
                    unsafe { handle.destroy_device(None) };
                    return Err(DeviceBringupError::CommandPoolCreation(e));
                }
            };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: handle.clone(),
            physical_device: candidate.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: the pool is the only object derived from the
                // device; destroy it before the device.
                unsafe {
                    handle.destroy_command_pool(command_pool, None);
                    handle.destroy_device(None);
                }
                return Err(DeviceBringupError::AllocatorCreation(e));
            }
        };

        let name = candidate.name();
        tracing::info!(
            "GPU {ordinal} ({name}, physical #{}): Vulkan {version}, \
             queue families graphics: {}, compute: {:?}, transfer: {:?}",
            candidate.physical_index,
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer_queue_family(dedicated_transfer),
        );

        Ok(Self {
            ordinal,
            physical_index: candidate.physical_index,
            name,
            physical_device: candidate.physical_device,
            properties: candidate.properties,
            memory_properties: candidate.memory_properties,
            queue_families,
            graphics_queue: Mutex::new(graphics_queue),
            compute_queue: compute_queue.map(Mutex::new),
            transfer_queue: transfer_queue.map(Mutex::new),
            command_pool: Mutex::new(command_pool),
            allocator: Some(Mutex::new(allocator)),
            handle,
        })
    }

    /// Position of this device in the active set. Every device-indexed
    /// call in this crate uses this number.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Position of this device in the instance's physical-device list.
    pub fn physical_index(&self) -> u32 {
        self.physical_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn has_compute_queue(&self) -> bool {
        self.compute_queue.is_some()
    }

    pub fn has_transfer_queue(&self) -> bool {
        self.transfer_queue.is_some()
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    /// Wait until all submitted work on this device has completed.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle", gpu = self.ordinal)
            .entered();
        // SAFETY: handle is a valid logical device for the lifetime of self.
        unsafe { self.handle.device_wait_idle() }
    }
}

// Memory
impl GpuDevice {
    /// Score a memory type for a given usage; `None` if incompatible.
    /// Higher scores are more preferred.
    fn score_memory_type(
        flags: vk::MemoryPropertyFlags,
        usage: MemoryUsage,
    ) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => {
                device_local.then_some(if host_visible { 1 } else { 2 })
            }
            MemoryUsage::CpuToGpu => {
                host_visible.then_some(if device_local { 2 } else { 1 })
            }
            MemoryUsage::GpuToCpu => {
                host_visible.then_some(if host_cached { 2 } else { 1 })
            }
        }
    }

    /// Best memory type index for `requirements` and `usage`. Ties go to
    /// the lowest index.
    fn select_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage)
                    .map(|s| (i as u32, s))
            })
            .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
            .map(|(i, _)| i)
    }

    /// Allocate memory through this device's `gpu-allocator` instance.
    ///
    /// Host-visible but non-coherent types get their size and alignment
    /// padded to `nonCoherentAtomSize` so whole-allocation flushes are
    /// always legal.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let atom = self.non_coherent_atom_size();
        let requirements = match self.select_memory_type(requirements, usage) {
            Some(idx) => {
                use vk::MemoryPropertyFlags as F;
                let flags = self.memory_properties.memory_types[idx as usize]
                    .property_flags;
                let pad = flags.contains(F::HOST_VISIBLE)
                    && !flags.contains(F::HOST_COHERENT);
                vk::MemoryRequirements {
                    size: if pad {
                        requirements.size.div_ceil(atom) * atom
                    } else {
                        requirements.size
                    },
                    alignment: if pad {
                        requirements.alignment.max(atom)
                    } else {
                        requirements.alignment
                    },
                    memory_type_bits: 1 << idx,
                }
            }
            None => requirements,
        };
        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        self.allocator
            .as_ref()
            .expect("allocator is dropped only during GpuDevice::drop")
            .lock()
            .expect("allocator lock poisoned")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        self.allocator
            .as_ref()
            .expect("allocator is dropped only during GpuDevice::drop")
            .lock()
            .expect("allocator lock poisoned")
            .free(allocation)
    }

    /// # Safety
    /// `allocate_info` must be valid and name a memory type of this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must come from this device, not yet be freed, and have no
    /// object still bound to it.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// Every range must reference mapped memory of this device and satisfy
    /// Vulkan flush alignment rules.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Every range must reference mapped memory of this device and satisfy
    /// Vulkan flush alignment rules.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }
}

// Buffers and images
impl GpuDevice {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device and no pending GPU work may use it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and idle state.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must come from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must come from this device and `offset` must
    /// satisfy the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must come from this device and no pending GPU work may use it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: Caller guarantees image provenance and idle state.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must come from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must come from this device and `offset` must
    /// satisfy the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }
}

// Command pool and command buffers. Vulkan requires the pool to be
// externally synchronized with every buffer allocated from it, recording
// included, so all of these run under the pool lock.
impl GpuDevice {
    fn lock_command_pool(&self) -> MutexGuard<'_, vk::CommandPool> {
        self.command_pool.lock().expect("command pool lock poisoned")
    }

    pub fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        let pool = self.lock_command_pool();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: the pool belongs to this device and is locked.
        unsafe { self.handle.allocate_command_buffers(&allocate_info) }
    }

    /// A no-op when `command_buffers` is empty.
    ///
    /// # Safety
    /// Every handle must have been allocated from this device's pool and
    /// none may be pending execution.
    pub unsafe fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        let pool = self.lock_command_pool();
        // SAFETY: Caller guarantees provenance and idle state; pool is locked.
        unsafe { self.handle.free_command_buffers(*pool, command_buffers) }
    }

    /// # Safety
    /// The pool lock must be held. Otherwise as
    /// [`begin_raw_command_buffer`](Self::begin_raw_command_buffer).
    unsafe fn reset_and_begin(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: Caller guarantees provenance, the pool lock, and that the
        // buffer is not pending; the pool was created with
        // RESET_COMMAND_BUFFER.
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
            self.handle.begin_command_buffer(command_buffer, &begin_info)
        }
    }

    /// Reset and begin one-time-submit recording.
    ///
    /// # Safety
    /// `command_buffer` must come from this device's pool and must not be
    /// pending execution.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let _pool = self.lock_command_pool();
        // SAFETY: Caller guarantees provenance; the pool is locked.
        unsafe { self.reset_and_begin(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must come from this device's pool and be recording.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let _pool = self.lock_command_pool();
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// Run `record` with this device's command pool locked.
    ///
    /// `cmd_*` calls must happen inside this (or inside
    /// [`record_raw_command_buffer`](Self::record_raw_command_buffer)).
    /// `record` must not call back into any other pool method of this
    /// device; the lock is not reentrant.
    pub fn with_command_pool_locked<R>(&self, record: impl FnOnce() -> R) -> R {
        let _pool = self.lock_command_pool();
        record()
    }

    /// Reset, begin, record with `record`, and end `command_buffer`,
    /// holding the pool lock from start to finish.
    ///
    /// # Safety
    /// `command_buffer` must come from this device's pool and must not be
    /// pending execution. `record` must not call back into any other pool
    /// method of this device.
    pub unsafe fn record_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), vk::Result> {
        record_locked(
            &self.command_pool,
            // SAFETY: Caller guarantees provenance; record_locked holds the
            // pool lock.
            || unsafe { self.reset_and_begin(command_buffer) },
            || record(command_buffer),
            // SAFETY: recording began just above, under the same lock.
            || unsafe { self.handle.end_command_buffer(command_buffer) },
        )
    }

    /// # Safety
    /// `command_buffer` must be recording; both buffers must come from this
    /// device; regions must be in bounds. Must run inside
    /// [`with_command_pool_locked`](Self::with_command_pool_locked) or
    /// [`record_raw_command_buffer`](Self::record_raw_command_buffer).
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees recording state, the pool lock, and copy
        // validity.
        unsafe { self.handle.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must come from this
    /// device with `TRANSFER_DST` usage; the range must be in bounds and
    /// 4-byte aligned. Must run inside
    /// [`with_command_pool_locked`](Self::with_command_pool_locked) or
    /// [`record_raw_command_buffer`](Self::record_raw_command_buffer).
    pub unsafe fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        // SAFETY: Caller guarantees recording state, the pool lock, and
        // range validity.
        unsafe {
            self.handle
                .cmd_fill_buffer(command_buffer, buffer, offset, size, data)
        }
    }
}

/// Begin, record and end back to back while holding `pool`.
fn record_locked<E>(
    pool: &Mutex<vk::CommandPool>,
    begin: impl FnOnce() -> Result<(), E>,
    record: impl FnOnce(),
    end: impl FnOnce() -> Result<(), E>,
) -> Result<(), E> {
    let _pool = pool.lock().expect("command pool lock poisoned");
    begin()?;
    record();
    end()
}

// Queue submission
impl GpuDevice {
    /// Submit to the graphics queue.
    ///
    /// # Safety
    /// Every handle in `submits` must come from this device, command buffers
    /// must be executable, and `fence`, when not null, must be unsignaled and
    /// from this device.
    pub unsafe fn graphics_queue_submit(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self.graphics_queue.lock().expect("graphics queue lock poisoned");
        // SAFETY: Caller guarantees handle validity; the queue is locked.
        unsafe { self.handle.queue_submit(*queue, submits, fence) }
    }
}

// Fences, semaphores and events
impl GpuDevice {
    /// # Safety
    /// `create_info` must be a valid fence create info.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// All handles in `fences` must come from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// Create a timeline semaphore starting at `initial_value`.
    ///
    /// # Safety
    /// The device must have been created with the timeline semaphore
    /// feature, which [`GpuDevice::bring_up`] always enables.
    pub unsafe fn create_raw_timeline_semaphore(
        &self,
        initial_value: u64,
    ) -> Result<vk::Semaphore, vk::Result> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info =
            vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        // SAFETY: create_info and its chain live on this frame.
        unsafe { self.handle.create_semaphore(&create_info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device and no GPU work may be
    /// waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: Caller guarantees semaphore provenance and drop ordering.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }

    /// Host-signal a timeline semaphore to `value`.
    ///
    /// # Safety
    /// `semaphore` must be a timeline semaphore of this device and `value`
    /// must be greater than its current and pending values.
    pub unsafe fn signal_raw_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<(), vk::Result> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        // SAFETY: Caller guarantees semaphore type, provenance and ordering.
        unsafe { self.handle.signal_semaphore(&signal_info) }
    }

    pub fn create_raw_event(&self) -> Result<vk::Event, vk::Result> {
        let create_info = vk::EventCreateInfo::default();
        // SAFETY: create_info has no borrowed pointers.
        unsafe { self.handle.create_event(&create_info, None) }
    }

    /// # Safety
    /// `event` must come from this device and no pending GPU work may use it.
    pub unsafe fn destroy_raw_event(&self, event: vk::Event) {
        // SAFETY: Caller guarantees event provenance and drop ordering.
        unsafe { self.handle.destroy_event(event, None) };
    }

    /// # Safety
    /// `event` must come from this device.
    pub unsafe fn set_raw_event(&self, event: vk::Event) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees event provenance.
        unsafe { self.handle.set_event(event) }
    }

    /// # Safety
    /// `event` must come from this device and no pending command may be
    /// waiting on it.
    pub unsafe fn reset_raw_event(&self, event: vk::Event) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees event provenance.
        unsafe { self.handle.reset_event(event) }
    }

    /// # Safety
    /// `event` must come from this device.
    pub unsafe fn get_raw_event_status(
        &self,
        event: vk::Event,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees event provenance.
        unsafe { self.handle.get_event_status(event) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::MemoryPropertyFlags as F;

    #[test]
    fn gpu_only_prefers_pure_vram() {
        assert_eq!(
            GpuDevice::score_memory_type(F::DEVICE_LOCAL, MemoryUsage::GpuOnly),
            Some(2)
        );
        assert_eq!(
            GpuDevice::score_memory_type(
                F::DEVICE_LOCAL | F::HOST_VISIBLE,
                MemoryUsage::GpuOnly
            ),
            Some(1)
        );
        assert_eq!(
            GpuDevice::score_memory_type(F::HOST_VISIBLE, MemoryUsage::GpuOnly),
            None
        );
    }

    #[test]
    fn host_usages_require_host_visible() {
        assert_eq!(
            GpuDevice::score_memory_type(F::DEVICE_LOCAL, MemoryUsage::CpuToGpu),
            None
        );
        assert_eq!(
            GpuDevice::score_memory_type(
                F::HOST_VISIBLE | F::DEVICE_LOCAL,
                MemoryUsage::CpuToGpu
            ),
            Some(2)
        );
        assert_eq!(
            GpuDevice::score_memory_type(
                F::HOST_VISIBLE | F::HOST_CACHED,
                MemoryUsage::GpuToCpu
            ),
            Some(2)
        );
    }

    #[test]
    fn recording_holds_the_pool_lock_throughout() {
        use std::cell::RefCell;
        use std::sync::TryLockError;

        let pool = Mutex::new(vk::CommandPool::null());
        let steps = RefCell::new(Vec::new());
        let step = |name: &'static str| {
            assert!(matches!(pool.try_lock(), Err(TryLockError::WouldBlock)));
            steps.borrow_mut().push(name);
        };
        let result: Result<(), vk::Result> = record_locked(
            &pool,
            || {
                step("begin");
                Ok(())
            },
            || step("record"),
            || {
                step("end");
                Ok(())
            },
        );
        assert_eq!(result, Ok(()));
        assert_eq!(*steps.borrow(), ["begin", "record", "end"]);
        assert!(pool.try_lock().is_ok());
    }

    #[test]
    fn failed_begin_skips_recording_and_releases_the_pool() {
        let pool = Mutex::new(vk::CommandPool::null());
        let mut recorded = false;
        let mut ended = false;
        let result = record_locked(
            &pool,
            || Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            || recorded = true,
            || {
                ended = true;
                Ok(())
            },
        );
        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(!recorded);
        assert!(!ended);
        assert!(pool.try_lock().is_ok());
    }
}
