//! Render passes and framebuffers
//!
//! Two pass shapes drive every frame: a depth pre-pass that clears and
//! stores the depth target, and a forward pass that clears color (resolving
//! MSAA to the swapchain image when samples > 1) while loading the depth the
//! pre-pass produced. Passes are cached by structural key; framebuffers are
//! cached per (pass, attachments, extent) and invalidated wholesale on
//! swapchain rebuild.

use std::collections::HashMap;

use ash::{vk, Device};

use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PassKey {
    DepthPrepass {
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    },
    Forward {
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    },
}

/// Caches render passes by structural key.
pub struct RenderPassRegistry {
    device: Device,
    passes: HashMap<PassKey, vk::RenderPass>,
}

impl RenderPassRegistry {
    pub fn new(device: Device) -> Self {
        Self { device, passes: HashMap::new() }
    }

    /// Depth-only pre-pass: clear, write, store for the forward pass. The
    /// sample count matches the forward pass so the two share one depth
    /// target.
    pub fn depth_prepass(
        &mut self,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> RenderResult<vk::RenderPass> {
        let key = PassKey::DepthPrepass { depth_format, samples };
        if let Some(&pass) = self.passes.get(&key) {
            return Ok(pass);
        }

        let attachments = [vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build()];

        let depth_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .depth_stencil_attachment(&depth_ref)
            .build()];

        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        }];

        let pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let pass = unsafe {
            self.device
                .create_render_pass(&pass_info, None)
                .map_err(RenderError::Api)?
        };
        self.passes.insert(key, pass);
        Ok(pass)
    }

    /// Forward shading pass. With samples > 1 the color attachment is the
    /// multisampled target and the swapchain image is the resolve target;
    /// with a single sample the swapchain image is rendered directly. Depth
    /// is loaded from the pre-pass, never cleared here.
    pub fn forward_pass(
        &mut self,
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> RenderResult<vk::RenderPass> {
        let key = PassKey::Forward { color_format, depth_format, samples };
        if let Some(&pass) = self.passes.get(&key) {
            return Ok(pass);
        }

        let multisampled = samples != vk::SampleCountFlags::TYPE_1;
        let mut attachments = vec![
            // Color: the MSAA target or the swapchain image itself.
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(if multisampled {
                    vk::AttachmentStoreOp::DONT_CARE
                } else {
                    vk::AttachmentStoreOp::STORE
                })
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(if multisampled {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::PRESENT_SRC_KHR
                })
                .build(),
            vk::AttachmentDescription::builder()
                .format(depth_format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        ];
        if multisampled {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
            );
        }

        let color_ref = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_ref = [vk::AttachmentReference {
            attachment: 2,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)
            .depth_stencil_attachment(&depth_ref);
        if multisampled {
            subpass = subpass.resolve_attachments(&resolve_ref);
        }
        let subpasses = [subpass.build()];

        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        }];

        let pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let pass = unsafe {
            self.device
                .create_render_pass(&pass_info, None)
                .map_err(RenderError::Api)?
        };
        self.passes.insert(key, pass);
        Ok(pass)
    }

    /// Destroy every cached pass.
    pub fn destroy(&mut self) {
        for (_, pass) in self.passes.drain() {
            unsafe { self.device.destroy_render_pass(pass, None) };
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    pass: vk::RenderPass,
    attachments: Vec<vk::ImageView>,
    width: u32,
    height: u32,
}

/// Caches framebuffers per (pass, attachments, extent).
pub struct FramebufferCache {
    device: Device,
    framebuffers: HashMap<FramebufferKey, vk::Framebuffer>,
}

impl FramebufferCache {
    pub fn new(device: Device) -> Self {
        Self { device, framebuffers: HashMap::new() }
    }

    pub fn get_or_create(
        &mut self,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer> {
        let key = FramebufferKey {
            pass,
            attachments: attachments.to_vec(),
            width: extent.width,
            height: extent.height,
        };
        if let Some(&framebuffer) = self.framebuffers.get(&key) {
            return Ok(framebuffer);
        }

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(RenderError::Api)?
        };
        self.framebuffers.insert(key, framebuffer);
        Ok(framebuffer)
    }

    /// Drop every cached framebuffer; called when the swapchain or its
    /// dependent targets are rebuilt.
    pub fn invalidate(&mut self) {
        for (_, framebuffer) in self.framebuffers.drain() {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}
