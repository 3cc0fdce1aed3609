//! Resource placement across the active device set.
//!
//! [`MemoryPlacementManager`] records how each buffer or image is meant to
//! live relative to the devices ([`PlacementStrategy`]) and owns the
//! per-device backing that strategy implies. Data never moves implicitly:
//! [`copy_buffer_between_gpus`](MemoryPlacementManager::copy_buffer_between_gpus)
//! and
//! [`replicate_buffer_to_all_gpus`](MemoryPlacementManager::replicate_buffer_to_all_gpus)
//! are explicit and go through host staging, since devices on one instance
//! share no memory.

use std::{
    collections::HashMap,
    fmt,
    ptr::NonNull,
    sync::{Arc, Mutex, PoisonError},
};

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::device::{GpuDevice, MemoryUsage};
use crate::registry::GpuDeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementStrategy {
    /// A full copy on every target device. Kept coherent only by
    /// explicit replication.
    Replicated,
    /// Buffers are sharded across targets; images get one full image per
    /// target.
    Distributed,
    /// One persistently mapped, host-visible buffer on the first target.
    PinnedHost,
    /// Resident on the first target only.
    GpuLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("No active device among the requested targets")]
    NoTargetDevices,

    #[error("Cannot allocate a zero-sized buffer")]
    ZeroSize,

    #[error("{0:?} placement is not supported for images")]
    UnsupportedStrategy(PlacementStrategy),

    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding memory: {0}")]
    BindMemory(vk::Result),

    #[error("Unknown {0}")]
    UnknownBuffer(BufferId),

    #[error("{buffer} has no backing on GPU {gpu}")]
    NotResident { buffer: BufferId, gpu: u32 },

    #[error("{buffer} is not host visible")]
    NotHostVisible { buffer: BufferId },

    #[error("{buffer} is not replicated")]
    NotReplicated { buffer: BufferId },

    #[error("Requested {requested} bytes but only {available} are available")]
    SizeOutOfBounds {
        requested: vk::DeviceSize,
        available: vk::DeviceSize,
    },

    #[error("Allocation is not host-mapped")]
    NotMapped,

    #[error("Vulkan error moving data between devices: {0}")]
    Transfer(vk::Result),

    #[error("Vulkan error flushing or invalidating mapped memory: {0}")]
    FlushMemory(vk::Result),
}

// ---------------------------------------------------------------------------
// Placement planning
// ---------------------------------------------------------------------------

/// The part of a buffer that lives on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShard {
    pub gpu_index: u32,
    /// Raw handle; null until backed.
    pub buffer: vk::Buffer,
    /// Offset of this shard within the logical buffer.
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Resolve requested target devices: all active devices when `None`,
/// otherwise the requested ordinals in order, without out-of-range entries
/// or duplicates.
pub fn resolve_targets(targets: Option<&[u32]>, active_count: u32) -> Vec<u32> {
    match targets {
        None => (0..active_count).collect(),
        Some(requested) => {
            let mut resolved = Vec::with_capacity(requested.len());
            for &gpu in requested {
                if gpu < active_count && !resolved.contains(&gpu) {
                    resolved.push(gpu);
                } else if gpu >= active_count {
                    tracing::warn!("Dropping out-of-range placement target GPU {gpu}");
                }
            }
            resolved
        }
    }
}

/// Which device gets which bytes of a `size`-byte buffer. Zero-sized
/// shards are left out.
pub fn plan_buffer_placement(
    strategy: PlacementStrategy,
    targets: &[u32],
    size: vk::DeviceSize,
) -> Vec<BufferShard> {
    let whole = |gpu_index| BufferShard {
        gpu_index,
        buffer: vk::Buffer::null(),
        offset: 0,
        size,
    };
    match strategy {
        PlacementStrategy::Replicated => targets.iter().copied().map(whole).collect(),
        PlacementStrategy::PinnedHost | PlacementStrategy::GpuLocal => {
            targets.first().copied().map(whole).into_iter().collect()
        }
        PlacementStrategy::Distributed => {
            let n = targets.len() as vk::DeviceSize;
            if n == 0 {
                return Vec::new();
            }
            let shard = size / n;
            targets
                .iter()
                .enumerate()
                .map(|(i, &gpu_index)| {
                    let offset = shard * i as vk::DeviceSize;
                    let len = if i + 1 == targets.len() {
                        size - offset
                    } else {
                        shard
                    };
                    BufferShard {
                        gpu_index,
                        buffer: vk::Buffer::null(),
                        offset,
                        size: len,
                    }
                })
                .filter(|s| s.size > 0)
                .collect()
        }
    }
}

/// Devices that get a full image under `strategy`.
fn plan_image_placement(
    strategy: PlacementStrategy,
    targets: &[u32],
) -> Result<Vec<u32>, MemoryError> {
    match strategy {
        PlacementStrategy::Replicated | PlacementStrategy::Distributed => Ok(targets.to_vec()),
        PlacementStrategy::GpuLocal => Ok(targets.first().copied().into_iter().collect()),
        PlacementStrategy::PinnedHost => Err(MemoryError::UnsupportedStrategy(strategy)),
    }
}

#[derive(Debug)]
struct Placement<R> {
    strategy: PlacementStrategy,
    resources: R,
}

/// Id-keyed placement records. Ids are never reused.
#[derive(Debug)]
struct PlacementTable<R> {
    next_id: u64,
    records: HashMap<u64, Placement<R>>,
}

impl<R> Default for PlacementTable<R> {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: HashMap::new(),
        }
    }
}

impl<R> PlacementTable<R> {
    fn insert(&mut self, strategy: PlacementStrategy, resources: R) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, Placement { strategy, resources });
        id
    }

    fn get(&self, id: u64) -> Option<&Placement<R>> {
        self.records.get(&id)
    }

    fn strategy(&self, id: u64) -> Option<PlacementStrategy> {
        self.get(id).map(|p| p.strategy)
    }

    fn remove(&mut self, id: u64) -> Option<Placement<R>> {
        self.records.remove(&id)
    }

    fn drain(&mut self) -> impl Iterator<Item = Placement<R>> + '_ {
        self.records.drain().map(|(_, p)| p)
    }
}

// ---------------------------------------------------------------------------
// Backing storage
// ---------------------------------------------------------------------------

struct BufferBacking {
    shard: BufferShard,
    allocation: Option<Allocation>,
}

struct BufferResources {
    size: vk::DeviceSize,
    backings: Vec<BufferBacking>,
}

struct ImageBacking {
    gpu_index: u32,
    image: vk::Image,
    allocation: Option<Allocation>,
}

/// Create a buffer on `gpu` and bind freshly allocated memory to it.
fn create_backed_buffer(
    gpu: &GpuDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_usage: MemoryUsage,
) -> Result<(vk::Buffer, Allocation), MemoryError> {
    let create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    // SAFETY: create_info is fully initialised and has no borrowed data.
    let handle = unsafe { gpu.create_raw_buffer(&create_info) }
        .map_err(MemoryError::CreateBuffer)?;

    // SAFETY: handle is a valid buffer created from this device.
    let reqs = unsafe { gpu.get_raw_buffer_memory_requirements(handle) };
    let allocation = gpu
        .allocate_memory(name, reqs, memory_usage, true)
        .map_err(|e| {
            // SAFETY: handle was created from this device and is not bound
            // to memory yet.
            unsafe { gpu.destroy_raw_buffer(handle) };
            MemoryError::AllocateMemory(e)
        })?;

    // SAFETY: handle and allocation memory are valid and belong to this
    // device.
    let bind_result = unsafe {
        gpu.bind_raw_buffer_memory(handle, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bind_result {
        let _ = gpu.free_memory(allocation);
        // SAFETY: handle is valid and owned by this scope.
        unsafe { gpu.destroy_raw_buffer(handle) };
        return Err(MemoryError::BindMemory(e));
    }

    Ok((handle, allocation))
}

fn destroy_backed_buffer(gpu: &GpuDevice, buffer: vk::Buffer, allocation: Option<Allocation>) {
    tracing::debug!("Dropping buffer {:?} on GPU {}", buffer, gpu.ordinal());
    // SAFETY: the buffer was created from this device; callers only destroy
    // buffers no pending GPU work uses.
    unsafe { gpu.destroy_raw_buffer(buffer) };
    if let Some(allocation) = allocation
        && let Err(e) = gpu.free_memory(allocation)
    {
        tracing::error!("Failed to free GPU allocation: {e}");
    }
}

fn destroy_backed_image(gpu: &GpuDevice, image: vk::Image, allocation: Option<Allocation>) {
    tracing::debug!("Dropping image {:?} on GPU {}", image, gpu.ordinal());
    // SAFETY: as for destroy_backed_buffer.
    unsafe { gpu.destroy_raw_image(image) };
    if let Some(allocation) = allocation
        && let Err(e) = gpu.free_memory(allocation)
    {
        tracing::error!("Failed to free GPU allocation: {e}");
    }
}

/// Mapped range of `allocation` covering its first `len` bytes, rounded up
/// to the non-coherent atom. `None` for coherent memory or `len == 0`.
fn non_coherent_range<'a>(
    gpu: &GpuDevice,
    allocation: &'a Allocation,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> Option<vk::MappedMemoryRange<'a>> {
    let coherent = allocation
        .memory_properties()
        .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
    if coherent || len == 0 {
        return None;
    }
    let atom = gpu.non_coherent_atom_size();
    // Allocation offset and size are atom-aligned (GpuDevice::allocate_memory).
    let start = offset / atom * atom;
    let end = (offset + len).div_ceil(atom) * atom;
    Some(
        vk::MappedMemoryRange::default()
            // SAFETY: the allocation belongs to this device and is live.
            .memory(unsafe { allocation.memory() })
            .offset(allocation.offset() + start)
            .size(end.min(allocation.size()) - start),
    )
}

fn flush_written(
    gpu: &GpuDevice,
    allocation: &Allocation,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> Result<(), MemoryError> {
    if let Some(range) = non_coherent_range(gpu, allocation, offset, len) {
        // SAFETY: range references mapped memory of this device.
        unsafe { gpu.flush_raw_mapped_memory_ranges(std::slice::from_ref(&range)) }
            .map_err(MemoryError::FlushMemory)?;
    }
    Ok(())
}

fn invalidate_for_read(
    gpu: &GpuDevice,
    allocation: &Allocation,
    len: vk::DeviceSize,
) -> Result<(), MemoryError> {
    if let Some(range) = non_coherent_range(gpu, allocation, 0, len) {
        // SAFETY: range references mapped memory of this device.
        unsafe { gpu.invalidate_raw_mapped_memory_ranges(std::slice::from_ref(&range)) }
            .map_err(MemoryError::FlushMemory)?;
    }
    Ok(())
}

/// A temporary host-visible buffer, destroyed on drop.
struct StagingBuffer<'a> {
    gpu: &'a GpuDevice,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
}

impl<'a> StagingBuffer<'a> {
    fn new(
        gpu: &'a GpuDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> Result<Self, MemoryError> {
        let (handle, allocation) =
            create_backed_buffer(gpu, "mgpu staging", size, usage, memory_usage)?;
        Ok(Self {
            gpu,
            handle,
            allocation: Some(allocation),
        })
    }

    fn allocation(&self) -> &Allocation {
        self.allocation
            .as_ref()
            .expect("allocation is only None during drop")
    }

    fn allocation_mut(&mut self) -> &mut Allocation {
        self.allocation
            .as_mut()
            .expect("allocation is only None during drop")
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        destroy_backed_buffer(self.gpu, self.handle, self.allocation.take());
    }
}

/// Record with `record`, submit on the graphics queue, and block until the
/// work completes.
fn submit_one_shot(
    gpu: &GpuDevice,
    record: impl FnOnce(vk::CommandBuffer),
) -> Result<(), vk::Result> {
    let command_buffer = gpu
        .allocate_command_buffers(1)?
        .pop()
        .ok_or(vk::Result::ERROR_UNKNOWN)?;

    let result = (|| {
        // SAFETY: freshly allocated from this device's pool; `record` only
        // issues cmd_* calls.
        unsafe { gpu.record_raw_command_buffer(command_buffer, record) }?;

        let create_info = vk::FenceCreateInfo::default();
        // SAFETY: create_info has no borrowed pointers.
        let fence = unsafe { gpu.create_raw_fence(&create_info) }?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);
        // SAFETY: the buffer is executable and the fence unsignaled; both
        // belong to this device.
        let submitted =
            unsafe { gpu.graphics_queue_submit(&[submit_info], fence) }
                // SAFETY: the fence was submitted just above.
                .and_then(|()| unsafe {
                    gpu.wait_for_raw_fences(&[fence], true, u64::MAX)
                });
        // SAFETY: either never submitted or already signaled.
        unsafe { gpu.destroy_raw_fence(fence) };
        submitted
    })();

    if result.is_err() {
        // A failed submit may leave work pending; drain before freeing.
        let _ = gpu.wait_idle();
    }
    // SAFETY: the work has completed (or never started).
    unsafe { gpu.free_command_buffers(&[command_buffer]) };
    result
}

/// Copy `size` bytes from `src` (on `src_gpu`) to `dst` (on `dst_gpu`).
///
/// On the same device this is a single `vkCmdCopyBuffer`; across devices the
/// bytes go through a readback buffer on the source and an upload buffer on
/// the destination.
fn transfer_buffer(
    src_gpu: &GpuDevice,
    src: (vk::Buffer, vk::DeviceSize),
    dst_gpu: &GpuDevice,
    dst: (vk::Buffer, vk::DeviceSize),
    size: vk::DeviceSize,
) -> Result<(), MemoryError> {
    let copy = |gpu: &GpuDevice,
                from: (vk::Buffer, vk::DeviceSize),
                to: (vk::Buffer, vk::DeviceSize)| {
        let region = vk::BufferCopy {
            src_offset: from.1,
            dst_offset: to.1,
            size,
        };
        submit_one_shot(gpu, |command_buffer| {
            // SAFETY: the command buffer is recording under the pool lock;
            // both buffers were created with transfer usage and the region
            // was bounds-checked by the caller.
            unsafe {
                gpu.cmd_copy_buffer(command_buffer, from.0, to.0, &[region])
            };
        })
        .map_err(MemoryError::Transfer)
    };

    if src_gpu.ordinal() == dst_gpu.ordinal() {
        return copy(src_gpu, src, dst);
    }

    let readback = StagingBuffer::new(
        src_gpu,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::GpuToCpu,
    )?;
    copy(src_gpu, src, (readback.handle, 0))?;
    invalidate_for_read(src_gpu, readback.allocation(), size)?;

    let mut upload = StagingBuffer::new(
        dst_gpu,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::CpuToGpu,
    )?;
    let len = size as usize;
    let source_bytes = readback
        .allocation()
        .mapped_slice()
        .ok_or(MemoryError::NotMapped)?;
    upload
        .allocation_mut()
        .mapped_slice_mut()
        .ok_or(MemoryError::NotMapped)?[..len]
        .copy_from_slice(&source_bytes[..len]);
    flush_written(dst_gpu, upload.allocation(), 0, size)?;

    copy(dst_gpu, (upload.handle, 0), dst)
}

// ---------------------------------------------------------------------------
// MemoryPlacementManager
// ---------------------------------------------------------------------------

/// Owns placement records and their per-device buffers and images.
pub struct MemoryPlacementManager {
    registry: Arc<GpuDeviceRegistry>,
    buffers: Mutex<PlacementTable<BufferResources>>,
    images: Mutex<PlacementTable<Vec<ImageBacking>>>,
}

impl fmt::Debug for MemoryPlacementManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPlacementManager").finish_non_exhaustive()
    }
}

impl MemoryPlacementManager {
    pub fn new(registry: Arc<GpuDeviceRegistry>) -> Self {
        Self {
            registry,
            buffers: Mutex::default(),
            images: Mutex::default(),
        }
    }

    fn gpu(&self, index: u32) -> Option<&GpuDevice> {
        self.registry.gpu_by_index(index)
    }

    fn destroy_buffer_backings(&self, backings: Vec<BufferBacking>) {
        for backing in backings {
            if let Some(gpu) = self.gpu(backing.shard.gpu_index) {
                destroy_backed_buffer(gpu, backing.shard.buffer, backing.allocation);
            }
        }
    }

    fn destroy_image_backings(&self, backings: Vec<ImageBacking>) {
        for backing in backings {
            if let Some(gpu) = self.gpu(backing.gpu_index) {
                destroy_backed_image(gpu, backing.image, backing.allocation);
            }
        }
    }

    /// Allocate a `size`-byte buffer placed according to `strategy`.
    ///
    /// `targets` defaults to every active device. Transfer usage is always
    /// added so the buffer can take part in copies and replication.
    pub fn allocate_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
        strategy: PlacementStrategy,
        targets: Option<&[u32]>,
    ) -> Result<BufferId, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let targets = resolve_targets(targets, self.registry.active_gpu_count());
        let plan = plan_buffer_placement(strategy, &targets, size);
        if plan.is_empty() {
            return Err(MemoryError::NoTargetDevices);
        }

        let usage =
            usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let memory_usage = match strategy {
            PlacementStrategy::PinnedHost => MemoryUsage::CpuToGpu,
            _ => MemoryUsage::GpuOnly,
        };

        let mut backings = Vec::with_capacity(plan.len());
        for mut shard in plan {
            let Some(gpu) = self.gpu(shard.gpu_index) else {
                continue;
            };
            let backed =
                create_backed_buffer(gpu, "mgpu placed buffer", shard.size, usage, memory_usage);
            match backed {
                Ok((buffer, allocation)) => {
                    shard.buffer = buffer;
                    backings.push(BufferBacking {
                        shard,
                        allocation: Some(allocation),
                    });
                }
                Err(e) => {
                    self.destroy_buffer_backings(backings);
                    return Err(e);
                }
            }
        }

        let shards = backings.len();
        let id = BufferId(
            self.buffers
                .lock()
                .expect("placement table lock poisoned")
                .insert(strategy, BufferResources { size, backings }),
        );
        tracing::debug!("Allocated {id} ({size} bytes, {strategy:?}) across {shards} device(s)");
        Ok(id)
    }

    /// Release every backing of `buffer`. Unknown ids are ignored.
    ///
    /// No pending GPU work may still use the buffer.
    pub fn free_buffer(&self, buffer: BufferId) {
        let removed = self
            .buffers
            .lock()
            .expect("placement table lock poisoned")
            .remove(buffer.0);
        if let Some(placement) = removed {
            self.destroy_buffer_backings(placement.resources.backings);
        }
    }

    pub fn strategy_of_buffer(&self, buffer: BufferId) -> Option<PlacementStrategy> {
        self.buffers
            .lock()
            .expect("placement table lock poisoned")
            .strategy(buffer.0)
    }

    /// The per-device shards of `buffer`, empty if unknown.
    pub fn buffer_shards(&self, buffer: BufferId) -> Vec<BufferShard> {
        self.buffers
            .lock()
            .expect("placement table lock poisoned")
            .get(buffer.0)
            .map(|p| p.resources.backings.iter().map(|b| b.shard).collect())
            .unwrap_or_default()
    }

    /// The shard of `buffer` resident on `gpu_index`, if any.
    pub fn buffer_on_gpu(&self, buffer: BufferId, gpu_index: u32) -> Option<BufferShard> {
        self.buffer_shards(buffer)
            .into_iter()
            .find(|s| s.gpu_index == gpu_index)
    }

    /// Create an image from `create_info` on each device `strategy` places
    /// it on. [`PlacementStrategy::PinnedHost`] is rejected.
    pub fn allocate_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
        strategy: PlacementStrategy,
        targets: Option<&[u32]>,
    ) -> Result<ImageId, MemoryError> {
        let targets = resolve_targets(targets, self.registry.active_gpu_count());
        let devices = plan_image_placement(strategy, &targets)?;
        if devices.is_empty() {
            return Err(MemoryError::NoTargetDevices);
        }
        let linear = create_info.tiling == vk::ImageTiling::LINEAR;

        let mut backings: Vec<ImageBacking> = Vec::with_capacity(devices.len());
        for gpu_index in devices {
            let Some(gpu) = self.gpu(gpu_index) else {
                continue;
            };
            match Self::create_backed_image(gpu, create_info, linear) {
                Ok((image, allocation)) => backings.push(ImageBacking {
                    gpu_index,
                    image,
                    allocation: Some(allocation),
                }),
                Err(e) => {
                    self.destroy_image_backings(backings);
                    return Err(e);
                }
            }
        }

        let count = backings.len();
        let id = ImageId(
            self.images
                .lock()
                .expect("placement table lock poisoned")
                .insert(strategy, backings),
        );
        tracing::debug!("Allocated {id} ({strategy:?}) on {count} device(s)");
        Ok(id)
    }

    fn create_backed_image(
        gpu: &GpuDevice,
        create_info: &vk::ImageCreateInfo<'_>,
        linear: bool,
    ) -> Result<(vk::Image, Allocation), MemoryError> {
        // SAFETY: caller-provided create_info; validity is the caller's
        // contract for allocate_image.
        let image = unsafe { gpu.create_raw_image(create_info) }
            .map_err(MemoryError::CreateImage)?;
        // SAFETY: image was created from this device.
        let reqs = unsafe { gpu.get_raw_image_memory_requirements(image) };
        let allocation = gpu
            .allocate_memory("mgpu placed image", reqs, MemoryUsage::GpuOnly, linear)
            .map_err(|e| {
                // SAFETY: image is unbound and owned by this scope.
                unsafe { gpu.destroy_raw_image(image) };
                MemoryError::AllocateMemory(e)
            })?;
        // SAFETY: image and memory belong to this device; the offset comes
        // from the allocator and satisfies reqs.
        let bind_result =
            unsafe { gpu.bind_raw_image_memory(image, allocation.memory(), allocation.offset()) };
        if let Err(e) = bind_result {
            let _ = gpu.free_memory(allocation);
            // SAFETY: image is owned by this scope.
            unsafe { gpu.destroy_raw_image(image) };
            return Err(MemoryError::BindMemory(e));
        }
        Ok((image, allocation))
    }

    /// Release every backing of `image`. Unknown ids are ignored.
    pub fn free_image(&self, image: ImageId) {
        let removed = self
            .images
            .lock()
            .expect("placement table lock poisoned")
            .remove(image.0);
        if let Some(placement) = removed {
            self.destroy_image_backings(placement.resources);
        }
    }

    pub fn strategy_of_image(&self, image: ImageId) -> Option<PlacementStrategy> {
        self.images
            .lock()
            .expect("placement table lock poisoned")
            .strategy(image.0)
    }

    /// The `VkImage` backing `image` on `gpu_index`, if any.
    pub fn image_on_gpu(&self, image: ImageId, gpu_index: u32) -> Option<vk::Image> {
        self.images
            .lock()
            .expect("placement table lock poisoned")
            .get(image.0)?
            .resources
            .iter()
            .find(|b| b.gpu_index == gpu_index)
            .map(|b| b.image)
    }

    /// Copy the first `size` bytes of `src`'s shard on `src_gpu` into
    /// `dst`'s shard on `dst_gpu`, blocking until done. Out-of-range
    /// devices make this a no-op.
    pub fn copy_buffer_between_gpus(
        &self,
        src_gpu: u32,
        dst_gpu: u32,
        src: BufferId,
        dst: BufferId,
        size: vk::DeviceSize,
    ) -> Result<(), MemoryError> {
        let (Some(src_device), Some(dst_device)) = (self.gpu(src_gpu), self.gpu(dst_gpu)) else {
            return Ok(());
        };
        let src_shard = self.resident_shard(src, src_gpu)?;
        let dst_shard = self.resident_shard(dst, dst_gpu)?;
        let available = src_shard.size.min(dst_shard.size);
        if size > available {
            return Err(MemoryError::SizeOutOfBounds {
                requested: size,
                available,
            });
        }
        if size == 0 {
            return Ok(());
        }

        let _span =
            tracing::debug_span!("copy_buffer_between_gpus", src_gpu, dst_gpu, size).entered();
        transfer_buffer(
            src_device,
            (src_shard.buffer, 0),
            dst_device,
            (dst_shard.buffer, 0),
            size,
        )
    }

    fn resident_shard(&self, buffer: BufferId, gpu: u32) -> Result<BufferShard, MemoryError> {
        let table = self.buffers.lock().expect("placement table lock poisoned");
        let placement = table.get(buffer.0).ok_or(MemoryError::UnknownBuffer(buffer))?;
        placement
            .resources
            .backings
            .iter()
            .find(|b| b.shard.gpu_index == gpu)
            .map(|b| b.shard)
            .ok_or(MemoryError::NotResident { buffer, gpu })
    }

    /// Copy the first `size` bytes of a [`Replicated`](PlacementStrategy::Replicated)
    /// buffer from its home (first) device to every other copy, blocking
    /// until done.
    pub fn replicate_buffer_to_all_gpus(
        &self,
        buffer: BufferId,
        size: vk::DeviceSize,
    ) -> Result<(), MemoryError> {
        let (strategy, total, shards) = {
            let table = self.buffers.lock().expect("placement table lock poisoned");
            let placement = table.get(buffer.0).ok_or(MemoryError::UnknownBuffer(buffer))?;
            (
                placement.strategy,
                placement.resources.size,
                placement
                    .resources
                    .backings
                    .iter()
                    .map(|b| b.shard)
                    .collect::<Vec<_>>(),
            )
        };
        if strategy != PlacementStrategy::Replicated {
            return Err(MemoryError::NotReplicated { buffer });
        }
        if size > total {
            return Err(MemoryError::SizeOutOfBounds {
                requested: size,
                available: total,
            });
        }
        let Some((home, rest)) = shards.split_first() else {
            return Ok(());
        };
        if size == 0 {
            return Ok(());
        }
        let Some(home_device) = self.gpu(home.gpu_index) else {
            return Ok(());
        };

        let _span = tracing::debug_span!("replicate_buffer_to_all_gpus", size).entered();
        for copy in rest {
            if let Some(dst_device) = self.gpu(copy.gpu_index) {
                transfer_buffer(
                    home_device,
                    (home.buffer, 0),
                    dst_device,
                    (copy.buffer, 0),
                    size,
                )?;
            }
        }
        Ok(())
    }

    /// Host pointer to the first `size` bytes of a
    /// [`PinnedHost`](PlacementStrategy::PinnedHost) buffer. The mapping is
    /// persistent; [`unmap_memory`](Self::unmap_memory) publishes writes.
    pub fn map_memory(
        &self,
        buffer: BufferId,
        size: vk::DeviceSize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let table = self.buffers.lock().expect("placement table lock poisoned");
        let placement = table.get(buffer.0).ok_or(MemoryError::UnknownBuffer(buffer))?;
        if placement.strategy != PlacementStrategy::PinnedHost {
            return Err(MemoryError::NotHostVisible { buffer });
        }
        if size > placement.resources.size {
            return Err(MemoryError::SizeOutOfBounds {
                requested: size,
                available: placement.resources.size,
            });
        }
        placement
            .resources
            .backings
            .first()
            .and_then(|b| b.allocation.as_ref())
            .and_then(Allocation::mapped_ptr)
            .map(|ptr| ptr.cast::<u8>())
            .ok_or(MemoryError::NotMapped)
    }

    /// Make host writes through [`map_memory`](Self::map_memory) visible to
    /// the device, flushing non-coherent memory.
    pub fn unmap_memory(&self, buffer: BufferId) -> Result<(), MemoryError> {
        let table = self.buffers.lock().expect("placement table lock poisoned");
        let placement = table.get(buffer.0).ok_or(MemoryError::UnknownBuffer(buffer))?;
        if placement.strategy != PlacementStrategy::PinnedHost {
            return Err(MemoryError::NotHostVisible { buffer });
        }
        let Some(backing) = placement.resources.backings.first() else {
            return Ok(());
        };
        match (self.gpu(backing.shard.gpu_index), backing.allocation.as_ref()) {
            (Some(gpu), Some(allocation)) => {
                flush_written(gpu, allocation, 0, placement.resources.size)
            }
            _ => Ok(()),
        }
    }

    /// Copy `data` into a [`PinnedHost`](PlacementStrategy::PinnedHost)
    /// buffer at byte `offset` and flush.
    pub fn write_pod<T: Pod>(
        &self,
        buffer: BufferId,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<(), MemoryError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as vk::DeviceSize;

        let table = self.buffers.lock().expect("placement table lock poisoned");
        let placement = table.get(buffer.0).ok_or(MemoryError::UnknownBuffer(buffer))?;
        if placement.strategy != PlacementStrategy::PinnedHost {
            return Err(MemoryError::NotHostVisible { buffer });
        }
        let total = placement.resources.size;
        if offset.checked_add(len).is_none_or(|end| end > total) {
            return Err(MemoryError::SizeOutOfBounds {
                requested: offset.saturating_add(len),
                available: total,
            });
        }
        let backing = placement
            .resources
            .backings
            .first()
            .ok_or(MemoryError::NotMapped)?;
        let allocation = backing.allocation.as_ref().ok_or(MemoryError::NotMapped)?;
        let mapped_ptr = allocation.mapped_ptr().ok_or(MemoryError::NotMapped)?;

        // SAFETY: mapped_ptr points to CPU-visible allocation memory and the
        // written range was bounds-checked against the buffer size above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr().cast::<u8>().add(offset as usize),
                bytes.len(),
            );
        }

        match self.gpu(backing.shard.gpu_index) {
            Some(gpu) => flush_written(gpu, allocation, offset, len),
            None => Ok(()),
        }
    }
}

impl Drop for MemoryPlacementManager {
    fn drop(&mut self) {
        tracing::debug!("Dropping MemoryPlacementManager");
        for gpu in self.registry.available_gpus() {
            if let Err(e) = gpu.wait_idle() {
                tracing::error!("GPU {} failed to idle: {e}", gpu.ordinal());
            }
        }
        let buffers: Vec<_> = self
            .buffers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for placement in buffers {
            self.destroy_buffer_backings(placement.resources.backings);
        }
        let images: Vec<_> = self
            .images
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for placement in images {
            self.destroy_image_backings(placement.resources);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(plan: &[BufferShard]) -> Vec<(u32, u64, u64)> {
        plan.iter().map(|s| (s.gpu_index, s.offset, s.size)).collect()
    }

    #[test]
    fn targets_default_to_all_active_devices() {
        assert_eq!(resolve_targets(None, 3), vec![0, 1, 2]);
        assert!(resolve_targets(None, 0).is_empty());
    }

    #[test]
    fn out_of_range_and_duplicate_targets_are_dropped() {
        assert_eq!(resolve_targets(Some(&[2, 5, 0, 2]), 3), vec![2, 0]);
        assert!(resolve_targets(Some(&[4]), 3).is_empty());
    }

    #[test]
    fn replicated_places_full_copy_everywhere() {
        let plan = plan_buffer_placement(PlacementStrategy::Replicated, &[0, 1, 2], 4096);
        assert_eq!(sizes(&plan), vec![(0, 0, 4096), (1, 0, 4096), (2, 0, 4096)]);
    }

    #[test]
    fn distributed_shards_with_remainder_on_last() {
        let plan = plan_buffer_placement(PlacementStrategy::Distributed, &[0, 1, 2], 1000);
        assert_eq!(sizes(&plan), vec![(0, 0, 333), (1, 333, 333), (2, 666, 334)]);

        let total: u64 = plan.iter().map(|s| s.size).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn distributed_skips_empty_shards() {
        let plan = plan_buffer_placement(PlacementStrategy::Distributed, &[0, 1, 2], 2);
        assert_eq!(sizes(&plan), vec![(2, 0, 2)]);
    }

    #[test]
    fn single_residency_strategies_use_first_target() {
        for strategy in [PlacementStrategy::PinnedHost, PlacementStrategy::GpuLocal] {
            let plan = plan_buffer_placement(strategy, &[2, 0], 256);
            assert_eq!(sizes(&plan), vec![(2, 0, 256)]);
        }
        assert!(plan_buffer_placement(PlacementStrategy::GpuLocal, &[], 256).is_empty());
    }

    #[test]
    fn pinned_host_images_are_rejected() {
        assert!(matches!(
            plan_image_placement(PlacementStrategy::PinnedHost, &[0]),
            Err(MemoryError::UnsupportedStrategy(PlacementStrategy::PinnedHost))
        ));
        assert_eq!(
            plan_image_placement(PlacementStrategy::Distributed, &[0, 1]).unwrap(),
            vec![0, 1]
        );
        assert_eq!(
            plan_image_placement(PlacementStrategy::GpuLocal, &[1, 0]).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn strategy_lookup_after_insert() {
        let mut table = PlacementTable::default();

        let a = table.insert(PlacementStrategy::Distributed, ());
        let b = table.insert(PlacementStrategy::PinnedHost, ());

        assert_ne!(a, b);
        assert_eq!(table.strategy(a), Some(PlacementStrategy::Distributed));
        assert_eq!(table.strategy(b), Some(PlacementStrategy::PinnedHost));
    }

    #[test]
    fn removing_unknown_id_is_a_no_op() {
        let mut table = PlacementTable::default();
        let id = table.insert(PlacementStrategy::GpuLocal, ());

        assert!(table.remove(id + 100).is_none());
        assert_eq!(table.strategy(id), Some(PlacementStrategy::GpuLocal));

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert_eq!(table.strategy(id), None);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut table = PlacementTable::default();
        let first = table.insert(PlacementStrategy::Replicated, ());
        table.remove(first);

        let second = table.insert(PlacementStrategy::Replicated, ());

        assert_ne!(first, second);
    }

    #[test]
    fn empty_manager_treats_unknown_ids_as_absent() {
        let manager = MemoryPlacementManager::new(Arc::new(GpuDeviceRegistry::new()));

        manager.free_buffer(BufferId(42));
        manager.free_image(ImageId(42));

        assert_eq!(manager.strategy_of_buffer(BufferId(42)), None);
        assert!(manager.buffer_shards(BufferId(42)).is_empty());
        assert!(matches!(
            manager.allocate_buffer(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                64,
                PlacementStrategy::Replicated,
                None
            ),
            Err(MemoryError::NoTargetDevices)
        ));
        assert!(matches!(
            manager.map_memory(BufferId(1), 16),
            Err(MemoryError::UnknownBuffer(BufferId(1)))
        ));
        assert!(manager
            .copy_buffer_between_gpus(0, 1, BufferId(1), BufferId(2), 16)
            .is_ok());
    }
}
