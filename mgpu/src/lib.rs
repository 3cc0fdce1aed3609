//! Split-frame multi-GPU coordination over a single Vulkan instance, built
//! on [`ash`] and [`gpu_allocator`].
//!
//! # Component graph
//!
//! ```text
//! InstanceRef (borrowed, never destroyed here)
//! └── GpuDeviceRegistry ── GpuDevice (per active GPU)
//!     │                    ├── queues, command pool, allocator
//!     ├── FrameDistributor ◄── WorkloadHint ──┐
//!     ├── CrossDeviceSynchronizer             │
//!     ├── MemoryPlacementManager              │
//!     └── CommandSubmissionDistributor ───────┘
//! ```
//!
//! The registry is initialized once through `&mut self` and then shared as
//! `Arc<GpuDeviceRegistry>`; every other component holds that `Arc` and
//! treats the device table as read-only. Devices are addressed by ordinal,
//! their position in the active set. Out-of-range ordinals are never an
//! error: lookups return `None`, predicates return `false`, and commands do
//! nothing.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |
//! | `cmd_*` | records into a command buffer             |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod command;
pub mod device;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod sync;

pub use ash;

pub use command::{
    CommandBufferHandle, CommandSubmissionDistributor, GpuCommandSubmission,
    SemaphoreSignal, SemaphoreWait,
};
pub use device::GpuDevice;
pub use frame::{FrameDistributionMode, FrameDistributor, FrameRegion};
pub use instance::InstanceRef;
pub use memory::{BufferId, ImageId, MemoryPlacementManager, PlacementStrategy};
pub use registry::{GpuDeviceRegistry, RegistryConfig};
pub use sync::CrossDeviceSynchronizer;
