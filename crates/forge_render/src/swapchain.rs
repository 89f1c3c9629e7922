//! Swapchain management
//!
//! Surface format, present mode and extent selection plus rebuild support.
//! Present mode follows the vsync preference: FIFO when vsync is on,
//! MAILBOX when it is off and the surface offers it, FIFO otherwise (the
//! only mode every implementation must support).

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use log::{debug, info};

use crate::context::VulkanContext;
use crate::error::{RenderError, RenderResult};

/// Swapchain with its images and views.
pub struct Swapchain {
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for the context's surface.
    pub fn new(context: &VulkanContext, window_extent: vk::Extent2D, vsync: bool) -> RenderResult<Self> {
        let loader = SwapchainLoader::new(context.instance(), context.device());
        Self::create(context, loader, window_extent, vsync, vk::SwapchainKHR::null())
    }

    /// Rebuild after a resize or a stale-surface report, chaining the old
    /// swapchain so in-flight presents can finish.
    pub fn rebuild(
        &mut self,
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        vsync: bool,
    ) -> RenderResult<()> {
        let loader = self.loader.clone();
        let rebuilt = Self::create(context, loader, window_extent, vsync, self.swapchain)?;
        // The caller drains the device before rebuilding, so the old views
        // and retired swapchain are no longer referenced.
        let mut old = std::mem::replace(self, rebuilt);
        old.destroy(context.device());
        Ok(())
    }

    fn create(
        context: &VulkanContext,
        loader: SwapchainLoader,
        window_extent: vk::Extent2D,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let physical_device = context.physical_device();
        let surface = context.surface();
        let surface_loader = context.surface_loader();

        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(RenderError::Api)?
        };
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(RenderError::Api)?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(RenderError::Api)?
        };
        if formats.is_empty() {
            return Err(RenderError::InitializationFailed(
                "surface reports no formats".to_string(),
            ));
        }

        let format = formats
            .iter()
            .find(|sf| {
                sf.format == vk::Format::B8G8R8A8_SRGB
                    && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or(formats[0]);

        let present_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .copied()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: window_extent.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: window_extent.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(RenderError::Api)?
        };
        let images = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .map_err(RenderError::Api)?
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe {
                context
                    .device()
                    .create_image_view(&view_info, None)
                    .map_err(RenderError::Api)?
            };
            image_views.push(view);
        }

        info!(
            "swapchain: {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            images.len()
        );

        Ok(Self { loader, swapchain, images, image_views, format, extent })
    }

    /// Acquire the next image. `None` means the surface went stale and the
    /// swapchain must be rebuilt before drawing.
    pub fn acquire(&self, image_available: vk::Semaphore) -> RenderResult<Option<u32>> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("suboptimal swapchain image acquired");
                }
                Ok(Some(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(RenderError::Api(e)),
        }
    }

    /// Present an image; returns true when the swapchain should be rebuilt.
    pub fn present(
        &self,
        queue: vk::Queue,
        render_finished: vk::Semaphore,
        image_index: u32,
    ) -> RenderResult<bool> {
        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(RenderError::Api(e)),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroy views and the swapchain. Safe to call once only.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }
}
