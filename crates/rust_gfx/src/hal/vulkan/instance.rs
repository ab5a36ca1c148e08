//! Instance, surface and adapter selection

use std::ffi::{c_char, CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface, Swapchain};
use ash::vk;
use ash::{Entry, Instance};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::error::{GfxError, GfxResult};

/// A window a Vulkan surface can be created for
pub trait VulkanSurfaceSource {
    /// Instance extensions presentation to this window needs
    fn required_instance_extensions(&self) -> GfxResult<Vec<CString>>;

    /// Create the surface on `instance`
    fn create_surface(&self, entry: &Entry, instance: &Instance) -> GfxResult<vk::SurfaceKHR>;
}

/// Adapter for any window exposing `raw-window-handle` handles
pub struct RawWindow<'a, W>(pub &'a W);

impl<W: HasRawDisplayHandle + HasRawWindowHandle> VulkanSurfaceSource for RawWindow<'_, W> {
    fn required_instance_extensions(&self) -> GfxResult<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.0.raw_display_handle())?;
        // SAFETY: ash-window returns static, nul-terminated extension names
        Ok(names.iter().map(|name| unsafe { CStr::from_ptr(*name) }.to_owned()).collect())
    }

    fn create_surface(&self, entry: &Entry, instance: &Instance) -> GfxResult<vk::SurfaceKHR> {
        // SAFETY: the handles come from a live window borrowed for this call
        let surface = unsafe {
            ash_window::create_surface(entry, instance, self.0.raw_display_handle(), self.0.raw_window_handle(), None)
        }?;
        Ok(surface)
    }
}

/// Instance plus the validation messenger, when enabled
pub(super) struct InstanceContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceContext {
    pub fn new(app_name: &str, window: &dyn VulkanSurfaceSource, validation: bool) -> GfxResult<Self> {
        // SAFETY: loads the system loader; the entry outlives every object created from it
        let entry = unsafe { Entry::load() }?;

        let app_name = CString::new(app_name).unwrap_or_default();
        let engine_name = CString::new("rust_gfx").unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = window.required_instance_extensions()?;
        let validation = validation && Self::has_validation_layer(&entry);
        if validation {
            extensions.push(DebugUtils::name().to_owned());
        }
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let layers: Vec<CString> = if validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap_or_default()]
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        // SAFETY: every pointer in create_info outlives the call
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        let debug = if validation {
            let utils = DebugUtils::new(&entry, &instance);
            match Self::create_messenger(&utils) {
                Ok(messenger) => Some((utils, messenger)),
                Err(e) => {
                    log::warn!("Validation messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        log::info!("Vulkan instance created (validation {})", if debug.is_some() { "on" } else { "off" });

        Ok(Self { entry, instance, debug })
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let Ok(layers) = entry.enumerate_instance_layer_properties() else {
            return false;
        };
        let found = layers.iter().any(|layer| {
            // SAFETY: layer_name is a nul-terminated array filled by the loader
            unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_bytes() == b"VK_LAYER_KHRONOS_validation"
        });
        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn create_messenger(utils: &DebugUtils) -> GfxResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        // SAFETY: the callback is a plain function with static lifetime
        Ok(unsafe { utils.create_debug_utils_messenger(&create_info, None) }?)
    }

    /// Destroy the messenger and the instance; every child object must be gone
    pub fn destroy(&mut self) {
        // SAFETY: called once, after the device and surface were destroyed
        unsafe {
            if let Some((utils, messenger)) = self.debug.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Route validation messages into `log`
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }
    vk::FALSE
}

/// The adapter picked for rendering
pub(super) struct Adapter {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub graphics_family: u32,
    pub present_family: u32,
    pub ray_tracing: bool,
    pub anisotropy: bool,
}

impl Adapter {
    /// Pick the first adapter with graphics, presentation and swapchain support,
    /// preferring discrete GPUs and, when asked for, ray tracing support
    pub fn select(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        want_ray_tracing: bool,
    ) -> GfxResult<Self> {
        // SAFETY: the instance is live
        let devices = unsafe { instance.enumerate_physical_devices() }?;
        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| Self::evaluate(instance, surface_loader, surface, device, want_ray_tracing).ok())
            .collect();
        candidates.sort_by_key(|adapter| {
            // SAFETY: the physical device belongs to the live instance
            let properties = unsafe { instance.get_physical_device_properties(adapter.physical_device) };
            let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            (!(adapter.ray_tracing == want_ray_tracing), !discrete)
        });
        let adapter = candidates
            .into_iter()
            .next()
            .ok_or(GfxError::Unknown("no GPU supports graphics and presentation to this surface".to_string()))?;
        log::info!("Selected GPU: {}", adapter.name);
        Ok(adapter)
    }

    fn evaluate(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
        want_ray_tracing: bool,
    ) -> GfxResult<Self> {
        // SAFETY: queries on a physical device of the live instance
        let (properties, features, families) = unsafe {
            (
                instance.get_physical_device_properties(device),
                instance.get_physical_device_features(device),
                instance.get_physical_device_queue_family_properties(device),
            )
        };

        let graphics_family = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .ok_or(GfxError::FeatureNotSupported)? as u32;
        let supports_present = |index: u32| {
            // SAFETY: index is a valid family of `device`
            unsafe { surface_loader.get_physical_device_surface_support(device, index, surface) }.unwrap_or(false)
        };
        let present_family = if supports_present(graphics_family) {
            graphics_family
        } else {
            (0..families.len() as u32).find(|i| supports_present(*i)).ok_or(GfxError::FeatureNotSupported)?
        };

        // SAFETY: as above
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let has = |name: &CStr| {
            extensions.iter().any(|e| {
                // SAFETY: extension_name is nul-terminated
                let extension = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
                extension == name
            })
        };
        if !has(Swapchain::name()) {
            return Err(GfxError::FeatureNotSupported);
        }
        let ray_tracing = want_ray_tracing
            && ray_tracing_extensions().iter().all(|name| has(name))
            && properties.api_version >= vk::API_VERSION_1_2;

        // SAFETY: device_name is nul-terminated
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy().into_owned();
        Ok(Self {
            physical_device: device,
            name,
            graphics_family,
            present_family,
            ray_tracing,
            anisotropy: features.sampler_anisotropy == vk::TRUE,
        })
    }
}

/// Device extensions the ray tracing path enables
pub(super) fn ray_tracing_extensions() -> [&'static CStr; 3] {
    [AccelerationStructure::name(), RayTracingPipeline::name(), DeferredHostOperations::name()]
}
