//! Non-owning access to a caller-created Vulkan instance.
//!
//! [`InstanceRef`] holds a clone of the caller's `ash::Instance` dispatch
//! table and exposes the physical-device queries the registry needs. It
//! never destroys the instance: creating and tearing it down is the job of
//! whoever hands it to
//! [`GpuDeviceRegistry`](crate::registry::GpuDeviceRegistry).
//!
//! [`VkVersion`] is a thin newtype over the packed Vulkan version word.

use std::fmt::Debug;

use ash::vk;
use thiserror::Error;

/// A packed Vulkan API version number.
///
/// Wraps the 32-bit encoding used by `VkPhysicalDeviceProperties::apiVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// True when this version is `major.minor` or newer. Patch level and
    /// variant are ignored.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

/// A borrowed Vulkan instance.
///
/// Cloning is cheap (it copies the dispatch table). Dropping it does
/// nothing to the underlying `VkInstance`.
#[derive(Clone)]
pub struct InstanceRef {
    handle: ash::Instance,
}

impl Debug for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRef")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl InstanceRef {
    /// Borrow `instance` for use by the multi-GPU core.
    ///
    /// # Safety
    /// `instance` must be a live instance, and it must stay alive until
    /// every registry initialized from this view (and every object derived
    /// from those registries) has been dropped.
    pub unsafe fn new(instance: &ash::Instance) -> Self {
        Self {
            handle: instance.clone(),
        }
    }

    /// Get the physical devices exposed by this instance, in the driver's
    /// enumeration order. These handles are ONLY valid in the context of
    /// this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance is live for the lifetime of self (contract of
        // InstanceRef::new); enumeration has no other preconditions.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: Caller guarantees physical_device provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: Caller guarantees physical_device provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: Caller guarantees physical_device provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// Whether the device advertises the Vulkan 1.2 `timelineSemaphore`
    /// feature.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance
    /// and must report an API version of at least 1.2.
    pub unsafe fn supports_timeline_semaphores(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> bool {
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12);
            // SAFETY: Caller guarantees provenance and a 1.2+ device, so the
            // Vulkan12Features chain entry is valid to query.
            unsafe {
                self.handle
                    .get_physical_device_features2(physical_device, &mut features2)
            };
        }
        vk12.timeline_semaphore == vk::TRUE
    }

    /// Create a logical device from a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    /// `create_info` must be a valid DeviceCreateInfo whose pointers stay
    /// valid for the duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees physical_device provenance and
        // create_info validity.
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_components() {
        let raw = vk::make_api_version(0, 1, 3, 275);
        let version = VkVersion::from_raw(raw);

        assert_eq!(version.to_raw(), raw);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
    }

    #[test]
    fn vk_version_at_least_ignores_patch() {
        let v1_2_0 = VkVersion::new(0, 1, 2, 0);
        let v1_1_999 = VkVersion::new(0, 1, 1, 999);

        assert!(v1_2_0.at_least(1, 2));
        assert!(v1_2_0.at_least(1, 1));
        assert!(!v1_2_0.at_least(1, 3));
        assert!(!v1_1_999.at_least(1, 2));
    }
}
