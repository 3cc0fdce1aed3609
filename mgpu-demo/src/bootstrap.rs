//! Loads Vulkan and creates the instance handed to `mgpu`.
//!
//! `mgpu` only borrows an instance, so the demo owns the loader, the
//! instance and the optional validation messenger here, and destroys them
//! after every `mgpu` object is gone.

use std::ffi::CStr;

use ash::vk;
use mgpu::instance::VkVersion;
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Vulkan {0} loader found, 1.2 or newer is required")]
    UnsupportedVersion(VkVersion),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
}

impl From<vk::Result> for BootstrapError {
    fn from(value: vk::Result) -> Self {
        BootstrapError::UnknownVulkan(value)
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    //SAFETY: Vulkan guarantees p_callback_data is valid
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "mgpu-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "mgpu-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "mgpu-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "mgpu-debug-messenger", "[{}] {}", type_str, message);
        }
        _ => {
            tracing::debug!(target: "mgpu-debug-messenger", "[{}] {}", type_str, message);
        }
    }

    vk::FALSE
}

fn message_severity(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match level {
        VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Warning => S::WARNING | S::ERROR,
        VulkanLogLevel::Error => S::ERROR,
    }
}

/// The loader, a headless instance, and an optional debug messenger.
pub struct Bootstrap {
    // Kept alive for the instance's function pointers.
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    version: VkVersion,
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("instance", &self.instance.handle())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.instance.handle());
        if let Some((debug_messenger, debug_utils_instance)) = self.debug_messenger.take() {
            //SAFETY: last use of this debug messenger, made from this instance
            unsafe { debug_utils_instance.destroy_debug_utils_messenger(debug_messenger, None) };
        }
        //SAFETY: We are in drop so this is the last use of instance. Every
        //mgpu object borrowing it was dropped before this one
        unsafe { self.instance.destroy_instance(None) };
    }
}

impl Bootstrap {
    /// Load Vulkan and create an instance at the loader's API version
    /// (which must be 1.2 or newer). Validation is enabled when
    /// `max_log_level` is set and the layer is installed.
    ///
    /// # Safety
    /// This loads vulkan using libloading, meaning that there can be
    /// arbitrary code executed.
    pub unsafe fn new(
        app_name: &CStr,
        max_log_level: Option<VulkanLogLevel>,
    ) -> Result<Self, BootstrapError> {
        //SAFETY: We pass on the burden of the safety from loading dlls to the
        //caller. Entry outlives the instance (dropped after it in Drop)
        let entry = unsafe { ash::Entry::load() }.map_err(BootstrapError::Loading)?;

        // SAFETY: entry is a live Vulkan entry.
        let api_version = unsafe { entry.try_enumerate_instance_version() }?
            .unwrap_or(vk::API_VERSION_1_0);
        let version = VkVersion::from_raw(api_version);
        if !version.at_least(1, 2) {
            return Err(BootstrapError::UnsupportedVersion(version));
        }

        // SAFETY: entry is live; None queries global extensions.
        let instance_exts_avail = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live.
        let instance_layers_avail = unsafe { entry.enumerate_instance_layer_properties() };

        let debug_utils_ext_name = ash::ext::debug_utils::NAME;
        let validation_layer_name = c"VK_LAYER_KHRONOS_validation";

        let debug_utils_available = instance_exts_avail
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(debug_utils_ext_name));
        let validation_layer_available = instance_layers_avail
            .as_ref()
            .map(|layers| {
                layers
                    .iter()
                    .any(|layer| layer.layer_name_as_c_str() == Ok(validation_layer_name))
            })
            .unwrap_or(false);

        let mut enabled_ext_ptrs: Vec<*const std::ffi::c_char> = Vec::new();
        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();

        let mut debug_messenger_create_info = match max_log_level {
            Some(level) if debug_utils_available && validation_layer_available => {
                enabled_ext_ptrs.push(debug_utils_ext_name.as_ptr());
                enabled_layers.push(validation_layer_name.as_ptr());
                Some(
                    vk::DebugUtilsMessengerCreateInfoEXT::default()
                        .message_severity(message_severity(level))
                        .message_type(
                            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                        )
                        .pfn_user_callback(Some(vulkan_debug_callback)),
                )
            }
            Some(_) => {
                tracing::warn!("Validation requested but the layer or debug utils is missing");
                None
            }
            None => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"mgpu")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_ext_ptrs)
            .enabled_layer_names(&enabled_layers);
        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        //SAFETY: We made a valid instance_create_info
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }?;

        let debug_messenger = debug_messenger_create_info.and_then(|mut create_info| {
            create_info.p_next = std::ptr::null();
            let debug_utils_instance = ash::ext::debug_utils::Instance::new(&entry, &instance);
            //SAFETY: Valid CI, instance is live
            let messenger =
                unsafe { debug_utils_instance.create_debug_utils_messenger(&create_info, None) };
            match messenger {
                Ok(messenger) => Some((messenger, debug_utils_instance)),
                Err(e) => {
                    tracing::error!("Continuing without a debug messenger: {e}");
                    None
                }
            }
        });

        tracing::info!("Created Vulkan {version} instance");
        Ok(Self {
            _entry: entry,
            instance,
            debug_messenger,
            version,
        })
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn version(&self) -> VkVersion {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_widens_with_verbosity() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(message_severity(VulkanLogLevel::Error), S::ERROR);
        assert!(message_severity(VulkanLogLevel::Warning).contains(S::ERROR));
        assert!(!message_severity(VulkanLogLevel::Info).contains(S::VERBOSE));
        assert!(message_severity(VulkanLogLevel::Verbose).contains(S::VERBOSE | S::INFO));
    }
}
