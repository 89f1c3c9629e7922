//! Vulkan context: instance, device, queues, command pools
//!
//! Owns the logical device and the queue handles (graphics / transfer /
//! present / compute) the rest of the core records and submits against.
//! Windowing stays outside this crate: the collaborator hands us raw
//! window/display handles and the framebuffer pixel size through
//! [`SurfaceProvider`], read only when the swapchain is (re)built.

use std::ffi::{c_void, CStr, CString};
use std::mem::ManuallyDrop;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Surface as SurfaceLoader;
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::commands::CommandPool;
use crate::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        String::from("<no message>")
    } else {
        let data = unsafe { *callback_data };
        if data.p_message.is_null() {
            String::from("<no message>")
        } else {
            unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy().into_owned()
        }
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[{message_type:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[{message_type:?}] {message}");
    } else {
        log::debug!("[{message_type:?}] {message}");
    }
    vk::FALSE
}

/// Windowing collaborator boundary.
///
/// The implementor (winit, GLFW, an offscreen harness) supplies what the
/// swapchain needs and nothing more.
pub trait SurfaceProvider {
    /// Raw display handle for surface creation
    fn raw_display_handle(&self) -> RawDisplayHandle;
    /// Raw window handle for surface creation
    fn raw_window_handle(&self) -> RawWindowHandle;
    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

/// Queue family indices resolved during device selection.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    /// Graphics-capable family
    pub graphics: u32,
    /// Family upload one-shots submit on (aliases graphics)
    pub transfer: u32,
    /// Present-capable family for the target surface
    pub present: u32,
    /// Compute-capable family (may alias graphics)
    pub compute: u32,
}

/// Vulkan context owning instance, device, queues and command pools.
pub struct VulkanContext {
    entry: Entry,
    instance: Instance,
    surface_loader: SurfaceLoader,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    transfer_queue: vk::Queue,
    present_queue: vk::Queue,
    compute_queue: vk::Queue,
    graphics_pool: ManuallyDrop<CommandPool>,
    transfer_pool: ManuallyDrop<CommandPool>,
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// Bring up the full context against the collaborator's surface.
    ///
    /// With `validation` set, the Khronos validation layer and a debug
    /// messenger routing into `log` are enabled when the loader offers them.
    pub fn new(
        surface_provider: &dyn SurfaceProvider,
        app_name: &str,
        validation: bool,
    ) -> RenderResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            RenderError::InitializationFailed(format!("failed to load Vulkan: {e:?}"))
        })?;

        let instance = Self::create_instance(&entry, surface_provider, app_name, validation)?;
        let debug_messenger = if validation {
            Self::create_debug_messenger(&entry, &instance)
        } else {
            None
        };
        let surface_loader = SurfaceLoader::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                surface_provider.raw_display_handle(),
                surface_provider.raw_window_handle(),
                None,
            )
            .map_err(RenderError::Api)?
        };

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;
        let device = Self::create_device(&instance, physical_device, &queue_families)?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };
        let compute_queue = unsafe { device.get_device_queue(queue_families.compute, 0) };

        let graphics_pool =
            CommandPool::new(device.clone(), queue_families.graphics, graphics_queue)?;
        let transfer_pool =
            CommandPool::new(device.clone(), queue_families.transfer, transfer_queue)?;

        log::info!(
            "vulkan context up: graphics family {}, transfer family {}, present family {}",
            queue_families.graphics,
            queue_families.transfer,
            queue_families.present
        );

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            transfer_queue,
            present_queue,
            compute_queue,
            graphics_pool: ManuallyDrop::new(graphics_pool),
            transfer_pool: ManuallyDrop::new(transfer_pool),
            debug_messenger,
        })
    }

    fn create_instance(
        entry: &Entry,
        surface_provider: &dyn SurfaceProvider,
        app_name: &str,
        validation: bool,
    ) -> RenderResult<Instance> {
        const ENGINE_NAME: &CStr =
            unsafe { CStr::from_bytes_with_nul_unchecked(b"forge_render\0") };
        let app_name_cstr = CString::new(app_name).map_err(|_| {
            RenderError::InitializationFailed("application name contains a NUL byte".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions =
            ash_window::enumerate_required_extensions(surface_provider.raw_display_handle())
                .map_err(RenderError::Api)?
                .to_vec();

        let mut layers: Vec<*const i8> = Vec::new();
        if validation {
            if Self::validation_layer_available(entry) {
                layers.push(VALIDATION_LAYER.as_ptr());
                extensions.push(DebugUtils::name().as_ptr());
            } else {
                log::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            }
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        unsafe { entry.create_instance(&create_info, None).map_err(RenderError::Api) }
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(_) => return false,
        };
        layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        })
    }

    fn create_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Option<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let loader = DebugUtils::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        match unsafe { loader.create_debug_utils_messenger(&info, None) } {
            Ok(messenger) => Some((loader, messenger)),
            Err(e) => {
                log::warn!("failed to create debug messenger: {e}");
                None
            }
        }
    }

    fn pick_physical_device(
        instance: &Instance,
        surface_loader: &SurfaceLoader,
        surface: vk::SurfaceKHR,
    ) -> RenderResult<(vk::PhysicalDevice, QueueFamilies)> {
        let devices =
            unsafe { instance.enumerate_physical_devices().map_err(RenderError::Api)? };

        for device in devices {
            if let Some(families) =
                Self::find_queue_families(instance, surface_loader, surface, device)?
            {
                return Ok((device, families));
            }
        }
        Err(RenderError::NoSuitableQueueFamily("graphics + present"))
    }

    fn find_queue_families(
        instance: &Instance,
        surface_loader: &SurfaceLoader,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> RenderResult<Option<QueueFamilies>> {
        let properties =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut present_support = Vec::with_capacity(properties.len());
        for index in 0..properties.len() as u32 {
            let supported = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(RenderError::Api)?
            };
            present_support.push(supported);
        }

        Ok(select_queue_families(&properties, &present_support))
    }

    fn create_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
    ) -> RenderResult<Device> {
        let mut unique_families =
            vec![families.graphics, families.transfer, families.present, families.compute];
        unique_families.sort_unstable();
        unique_families.dedup();

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe {
            instance
                .create_device(physical_device, &create_info, None)
                .map_err(RenderError::Api)
        }
    }

    /// The Vulkan entry point.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The Vulkan instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The logical device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The surface handed to swapchain creation.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader.
    pub fn surface_loader(&self) -> &SurfaceLoader {
        &self.surface_loader
    }

    /// The selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Resolved queue family indices.
    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    /// Graphics queue handle.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Present queue handle.
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Compute queue handle.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Transfer queue handle.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Pool for per-frame graphics command buffers.
    pub fn graphics_pool(&self) -> &CommandPool {
        &self.graphics_pool
    }

    /// Pool for one-shot transfer command buffers.
    pub fn transfer_pool(&self) -> &CommandPool {
        &self.transfer_pool
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    /// Pick a supported depth format for attachment use.
    pub fn find_depth_format(&self) -> vk::Format {
        for &format in &[
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ] {
            let props = unsafe {
                self.instance.get_physical_device_format_properties(self.physical_device, format)
            };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return format;
            }
        }
        vk::Format::D32_SFLOAT
    }
}

/// Resolve queue family indices from enumerated properties.
///
/// Upload one-shots record sampler-stage barriers and hand EXCLUSIVE-mode
/// resources straight to graphics work without ownership transfers, so the
/// transfer family always aliases graphics rather than a transfer-only
/// family (graphics queues support transfer implicitly).
fn select_queue_families(
    properties: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;
    let mut compute = None;

    for (index, family) in properties.iter().enumerate() {
        let index_u32 = index as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
            graphics = Some(index_u32);
        }
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) && compute.is_none() {
            compute = Some(index_u32);
        }
        if present_support[index] && present.is_none() {
            present = Some(index_u32);
        }
    }

    let graphics = graphics?;
    let present = present?;
    Some(QueueFamilies {
        graphics,
        transfer: graphics,
        present,
        compute: compute.unwrap_or(graphics),
    })
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // Pools before the device they record against, then surface and
            // instance last.
            ManuallyDrop::drop(&mut self.graphics_pool);
            ManuallyDrop::drop(&mut self.transfer_pool);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties { queue_flags: flags, queue_count: 1, ..Default::default() }
    }

    #[test]
    fn dedicated_transfer_family_is_not_used_for_uploads() {
        // Family 0 is transfer-only; uploads must stay on the graphics
        // family so their barriers and handoffs are valid there.
        let properties = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let families = select_queue_families(&properties, &[false, true]).unwrap();
        assert_eq!(families.graphics, 1);
        assert_eq!(families.transfer, families.graphics);
        assert_eq!(families.present, 1);
        assert_eq!(families.compute, 1);
    }

    #[test]
    fn compute_falls_back_to_graphics() {
        let properties = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let families = select_queue_families(&properties, &[true]).unwrap();
        assert_eq!(families.compute, families.graphics);
    }

    #[test]
    fn missing_graphics_or_present_rejects_the_device() {
        let compute_only = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        assert!(select_queue_families(&compute_only, &[true]).is_none());

        let no_present = [family(vk::QueueFlags::GRAPHICS)];
        assert!(select_queue_families(&no_present, &[false]).is_none());
    }
}
