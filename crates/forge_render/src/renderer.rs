//! The renderer
//!
//! Owns the Vulkan context, device memory, every resource registry, the
//! swapchain and the frame slots, and exposes the build/destroy/draw/render
//! surface the application layer drives.
//!
//! `render()` is the per-tick entry point: wait the frame slot's fence (the
//! only blocking point), acquire a swapchain image, record the depth
//! pre-pass and the forward pass over the sorted draw list, submit and
//! present. A stale surface at acquire rebuilds the swapchain and skips the
//! tick without submitting a partial frame; a stale or suboptimal present
//! schedules a rebuild for the next tick. The draw list is cleared every
//! tick regardless.

use ash::vk;
use log::{debug, info, warn};

use crate::buffer::{BufferDesc, BufferRegistry};
use crate::context::{SurfaceProvider, VulkanContext};
use crate::descriptor::DescriptorAllocator;
use crate::draw::{DrawCommand, DrawList};
use crate::error::RenderResult;
use crate::frame::FrameContextList;
use crate::memory::MemoryPool;
use crate::mesh::{MeshDesc, MeshRegistry};
use crate::passes::{FramebufferCache, RenderPassRegistry};
use crate::pipeline::{PipelineDesc, PipelineRegistry};
use crate::registry::{
    BufferHandle, MeshHandle, PipelineHandle, ShaderHandle, TextureHandle, UniformGroupHandle,
    UniformHandle,
};
use crate::settings::RendererSettings;
use crate::shader::{ShaderDesc, ShaderRegistry};
use crate::swapchain::Swapchain;
use crate::texture::{TextureDesc, TextureRegistry, TextureUsage};
use crate::uniform::UniformRegistry;

/// Map a configured sample count to the Vulkan flag, falling back to a
/// single sample for counts the renderer does not drive.
pub fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        other => {
            warn!("unsupported MSAA count {other}, falling back to 1");
            vk::SampleCountFlags::TYPE_1
        }
    }
}

/// The top-level renderer.
pub struct Renderer {
    window: Box<dyn SurfaceProvider>,
    settings: RendererSettings,
    context: VulkanContext,
    memory: MemoryPool,
    buffers: BufferRegistry,
    textures: TextureRegistry,
    meshes: MeshRegistry,
    shaders: ShaderRegistry,
    pipelines: PipelineRegistry,
    descriptors: DescriptorAllocator,
    uniforms: UniformRegistry,
    passes: RenderPassRegistry,
    framebuffers: FramebufferCache,
    swapchain: Swapchain,
    frames: FrameContextList,
    draw_list: DrawList,
    samples: vk::SampleCountFlags,
    depth_format: vk::Format,
    depth_pass: vk::RenderPass,
    forward_pass: vk::RenderPass,
    depth_target: TextureHandle,
    color_target: Option<TextureHandle>,
    clear_color: [f32; 4],
    clear_depth: f32,
    clear_stencil: u32,
    rebuild_pending: bool,
}

impl Renderer {
    /// Bring up the device, swapchain, passes, offscreen targets and frame
    /// slots for the given window.
    pub fn new(window: Box<dyn SurfaceProvider>, settings: RendererSettings) -> RenderResult<Self> {
        let context = VulkanContext::new(window.as_ref(), "forge_render", settings.validation)?;
        let device = context.device().clone();

        let memory = MemoryPool::new(device.clone(), context.instance(), context.physical_device());
        let buffers = BufferRegistry::new(device.clone());
        let textures = TextureRegistry::new(device.clone());
        let meshes = MeshRegistry::new();
        let shaders = ShaderRegistry::new(device.clone())?;
        let pipelines = PipelineRegistry::new(device.clone(), &settings.pipeline_cache_path)?;
        let descriptors = DescriptorAllocator::new(device.clone());
        let uniforms = UniformRegistry::new(device.clone());
        let mut passes = RenderPassRegistry::new(device.clone());
        let framebuffers = FramebufferCache::new(device.clone());

        let samples = sample_count_flags(settings.msaa_samples);
        let depth_format = context.find_depth_format();

        let (width, height) = window.framebuffer_size();
        let swapchain = Swapchain::new(&context, vk::Extent2D { width, height }, settings.vsync)?;

        let depth_pass = passes.depth_prepass(depth_format, samples)?;
        let forward_pass = passes.forward_pass(swapchain.format(), depth_format, samples)?;

        let frames =
            FrameContextList::new(device.clone(), context.graphics_pool(), settings.frames_in_flight)?;

        let mut renderer = Self {
            window,
            settings,
            context,
            memory,
            buffers,
            textures,
            meshes,
            shaders,
            pipelines,
            descriptors,
            uniforms,
            passes,
            framebuffers,
            swapchain,
            frames,
            draw_list: DrawList::new(),
            samples,
            depth_format,
            depth_pass,
            forward_pass,
            depth_target: TextureHandle::default(),
            color_target: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            rebuild_pending: false,
        };
        renderer.create_targets()?;
        info!(
            "renderer up: {} frames in flight, {:?} samples",
            renderer.frames.len(),
            renderer.samples
        );
        Ok(renderer)
    }

    // --- resource façade -------------------------------------------------

    pub fn build_buffer(&mut self, desc: &BufferDesc<'_>) -> RenderResult<BufferHandle> {
        self.buffers.build(&mut self.memory, self.context.transfer_pool(), desc)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.buffers.destroy(&mut self.memory, handle);
    }

    pub fn build_texture(&mut self, desc: &TextureDesc<'_>) -> RenderResult<TextureHandle> {
        self.textures.build(&mut self.memory, self.context.transfer_pool(), desc)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.destroy(&mut self.memory, handle);
    }

    pub fn build_mesh(&mut self, desc: &MeshDesc<'_>) -> RenderResult<MeshHandle> {
        self.meshes.build(
            &mut self.buffers,
            &mut self.memory,
            self.context.transfer_pool(),
            desc,
        )
    }

    pub fn destroy_mesh(&mut self, handle: MeshHandle) {
        self.meshes.destroy(&mut self.buffers, &mut self.memory, handle);
    }

    pub fn build_shader(&mut self, desc: &ShaderDesc<'_>) -> RenderResult<ShaderHandle> {
        self.shaders.build(desc)
    }

    pub fn destroy_shader(&mut self, handle: ShaderHandle) {
        self.shaders.destroy(handle);
    }

    pub fn build_pipeline(&mut self, desc: &PipelineDesc<'_>) -> RenderResult<PipelineHandle> {
        let shader = self.shaders.get(desc.shader);
        self.pipelines
            .build(desc, shader, self.forward_pass, self.depth_pass, self.samples)
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle) {
        self.pipelines.destroy(handle);
    }

    pub fn build_uniform_group(
        &mut self,
        pipeline: PipelineHandle,
    ) -> RenderResult<UniformGroupHandle> {
        let instance = self.pipelines.get(pipeline);
        self.uniforms.build_group(
            pipeline,
            instance,
            &mut self.descriptors,
            &mut self.buffers,
            &mut self.memory,
            self.context.transfer_pool(),
        )
    }

    pub fn destroy_uniform_group(&mut self, handle: UniformGroupHandle) {
        self.uniforms
            .destroy_group(handle, &mut self.descriptors, &mut self.buffers, &mut self.memory);
    }

    /// Find a uniform in a group by its reflected name.
    pub fn get_uniform(&self, group: UniformGroupHandle, name: &str) -> Option<UniformHandle> {
        self.uniforms.get_uniform(group, name)
    }

    /// Write `count` elements starting at `index` into a uniform.
    pub fn write_uniform(&mut self, handle: UniformHandle, bytes: &[u8], index: u32, count: u32) {
        self.uniforms.write_uniform(&self.buffers, handle, bytes, index, count);
    }

    /// Point an image uniform slot at a texture.
    pub fn bind_texture(&self, handle: UniformHandle, texture: TextureHandle, slot: u32) {
        self.uniforms.bind_texture(handle, self.textures.get(texture), slot);
    }

    // --- per-tick surface ------------------------------------------------

    /// Queue a draw for this tick.
    pub fn draw(&mut self, command: DrawCommand) {
        self.draw_list.push(command);
    }

    /// Clear values applied at the start of the next frame.
    pub fn set_clear(&mut self, color: [f32; 4], depth: f32, stencil: u32) {
        self.clear_color = color;
        self.clear_depth = depth;
        self.clear_stencil = stencil;
    }

    /// Record and submit one frame.
    pub fn render(&mut self) -> RenderResult<()> {
        if self.rebuild_pending {
            self.rebuild_swapchain()?;
            self.rebuild_pending = false;
        }

        self.frames.wait_current()?;
        let commands = self.draw_list.sorted().to_vec();
        self.draw_list.clear();

        let image_available = self.frames.current().image_available;
        let image_index = match self.swapchain.acquire(image_available)? {
            Some(index) => index,
            None => {
                // Stale surface: rebuild, skip the tick, leave the slot
                // fence signaled so the next call can reuse it.
                self.rebuild_swapchain()?;
                return Ok(());
            }
        };

        self.frames.reset_current()?;
        self.record_frame(image_index, &commands)?;

        let frame = self.frames.current();
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.context
                .device()
                .queue_submit(
                    self.context.graphics_queue(),
                    &[submit_info.build()],
                    frame.in_flight,
                )
                .map_err(crate::error::RenderError::Api)?;
        }

        let needs_rebuild = self.swapchain.present(
            self.context.present_queue(),
            frame.render_finished,
            image_index,
        )?;
        if needs_rebuild {
            self.rebuild_pending = true;
        }

        self.frames.advance();
        Ok(())
    }

    // --- internals -------------------------------------------------------

    fn record_frame(&mut self, image_index: u32, commands: &[DrawCommand]) -> RenderResult<()> {
        let extent = self.swapchain.extent();
        let depth_view = self.textures.get(self.depth_target).view;
        let depth_framebuffer =
            self.framebuffers.get_or_create(self.depth_pass, &[depth_view], extent)?;

        let swapchain_view = self.swapchain.image_views()[image_index as usize];
        let forward_attachments: Vec<vk::ImageView> = match self.color_target {
            Some(color) => vec![self.textures.get(color).view, depth_view, swapchain_view],
            None => vec![swapchain_view, depth_view],
        };
        let forward_framebuffer =
            self.framebuffers
                .get_or_create(self.forward_pass, &forward_attachments, extent)?;

        let device = self.context.device();
        let frame = self.frames.current();
        let cmd = frame.command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(crate::error::RenderError::Api)?;
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };

        // Depth pre-pass.
        let depth_clear = [vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: self.clear_depth,
                stencil: self.clear_stencil,
            },
        }];
        let depth_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.depth_pass)
            .framebuffer(depth_framebuffer)
            .render_area(scissor)
            .clear_values(&depth_clear);
        unsafe {
            device.cmd_begin_render_pass(cmd, &depth_begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        self.record_draws(cmd, commands, true);
        unsafe { device.cmd_end_render_pass(cmd) };

        // Forward pass. Depth is loaded, so only color clears matter; the
        // extra entries keep attachment indices aligned.
        let forward_clears = [
            vk::ClearValue { color: vk::ClearColorValue { float32: self.clear_color } },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: self.clear_stencil,
                },
            },
            vk::ClearValue { color: vk::ClearColorValue { float32: self.clear_color } },
        ];
        let forward_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.forward_pass)
            .framebuffer(forward_framebuffer)
            .render_area(scissor)
            .clear_values(&forward_clears[..forward_attachments.len()]);
        unsafe {
            device.cmd_begin_render_pass(cmd, &forward_begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        self.record_draws(cmd, commands, false);
        unsafe {
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .map_err(crate::error::RenderError::Api)?;
        }

        debug!("recorded {} draws", commands.len());
        Ok(())
    }

    /// Walk the sorted draw list, skipping redundant pipeline, descriptor
    /// and vertex-buffer rebinds between consecutive draws.
    fn record_draws(&self, cmd: vk::CommandBuffer, commands: &[DrawCommand], depth_only: bool) {
        let device = self.context.device();
        let mut last_pipeline: Option<PipelineHandle> = None;
        let mut last_mesh: Option<MeshHandle> = None;
        let mut last_group: Option<UniformGroupHandle> = None;

        for command in commands {
            let pipeline = self.pipelines.get(command.pipeline);

            if last_pipeline != Some(command.pipeline) {
                let bind = if depth_only { pipeline.depth_pipeline } else { pipeline.pipeline };
                unsafe {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, bind);
                }
                last_pipeline = Some(command.pipeline);
                // Descriptor sets are layout-compatible across the two
                // variants, but a pipeline switch invalidates the mesh/group
                // skip state conservatively.
                last_mesh = None;
                last_group = None;
            }

            if last_group != Some(command.uniforms) {
                let group = self.uniforms.get_group(command.uniforms);
                // One bind per contiguous run keeps sparse set indices at
                // their reflected slots.
                for (first_set, sets) in group.descriptor_set_runs() {
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.layout,
                            first_set,
                            &sets,
                            &[],
                        );
                    }
                }
                last_group = Some(command.uniforms);
            }

            // Push constants are pushed before every draw; groups sharing a
            // range may have diverged since the last bind.
            let group = self.uniforms.get_group(command.uniforms);
            for (stages, offset, data) in self.uniforms.push_ranges(group) {
                unsafe {
                    device.cmd_push_constants(cmd, pipeline.layout, stages, offset, data);
                }
            }

            let mesh = self.meshes.get(command.mesh);
            if last_mesh != Some(command.mesh) {
                let vertex_buffers: Vec<vk::Buffer> = mesh
                    .attribute_buffers
                    .iter()
                    .map(|&handle| self.buffers.get(handle).buffer)
                    .collect();
                let offsets = vec![0; vertex_buffers.len()];
                unsafe {
                    device.cmd_bind_vertex_buffers(cmd, 0, &vertex_buffers, &offsets);
                }
                if let Some((handle, index_type, _)) = mesh.index_buffer {
                    unsafe {
                        device.cmd_bind_index_buffer(
                            cmd,
                            self.buffers.get(handle).buffer,
                            0,
                            index_type,
                        );
                    }
                }
                last_mesh = Some(command.mesh);
            }

            unsafe {
                match mesh.index_buffer {
                    Some((_, _, index_count)) => {
                        device.cmd_draw_indexed(cmd, index_count, mesh.instance_count, 0, 0, 0);
                    }
                    None => {
                        device.cmd_draw(cmd, mesh.vertex_count, mesh.instance_count, 0, 0);
                    }
                }
            }
        }
    }

    /// Replace the swapchain and everything sized to it.
    fn rebuild_swapchain(&mut self) -> RenderResult<()> {
        self.context.wait_idle();
        self.framebuffers.invalidate();
        self.destroy_targets();

        let (width, height) = self.window.framebuffer_size();
        self.swapchain
            .rebuild(&self.context, vk::Extent2D { width, height }, self.settings.vsync)?;

        // Pass shapes depend on the surface format, which can change across
        // rebuilds on some platforms.
        self.depth_pass = self.passes.depth_prepass(self.depth_format, self.samples)?;
        self.forward_pass =
            self.passes
                .forward_pass(self.swapchain.format(), self.depth_format, self.samples)?;

        self.create_targets()?;
        debug!("swapchain rebuilt");
        Ok(())
    }

    fn create_targets(&mut self) -> RenderResult<()> {
        let extent = self.swapchain.extent();
        self.depth_target = self.textures.build(
            &mut self.memory,
            self.context.transfer_pool(),
            &TextureDesc {
                width: extent.width,
                height: extent.height,
                format: self.depth_format,
                mip_levels: 1,
                samples: self.samples,
                usage: TextureUsage::DepthAttachment,
                texels: None,
            },
        )?;
        self.color_target = if self.samples != vk::SampleCountFlags::TYPE_1 {
            Some(self.textures.build(
                &mut self.memory,
                self.context.transfer_pool(),
                &TextureDesc {
                    width: extent.width,
                    height: extent.height,
                    format: self.swapchain.format(),
                    mip_levels: 1,
                    samples: self.samples,
                    usage: TextureUsage::ColorAttachment,
                    texels: None,
                },
            )?)
        } else {
            None
        };
        Ok(())
    }

    fn destroy_targets(&mut self) {
        if self.textures.contains(self.depth_target) {
            self.textures.destroy(&mut self.memory, self.depth_target);
        }
        if let Some(color) = self.color_target.take() {
            self.textures.destroy(&mut self.memory, color);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.context.wait_idle();
        self.frames.destroy();
        self.framebuffers.invalidate();
        self.destroy_targets();
        self.swapchain.destroy(self.context.device());
        self.passes.destroy();
        self.uniforms
            .destroy_all(&mut self.descriptors, &mut self.buffers, &mut self.memory);
        self.descriptors.destroy();
        // Saves the pipeline cache blob before tearing the objects down.
        self.pipelines.destroy_all();
        self.shaders.destroy_all();
        self.meshes.destroy_all(&mut self.buffers, &mut self.memory);
        self.textures.destroy_all(&mut self.memory);
        self.buffers.destroy_all(&mut self.memory);
        self.memory.destroy();
        info!("renderer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_counts_map_to_flags() {
        assert_eq!(sample_count_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count_flags(8), vk::SampleCountFlags::TYPE_8);
    }

    #[test]
    fn unsupported_sample_counts_fall_back_to_one() {
        assert_eq!(sample_count_flags(0), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(64), vk::SampleCountFlags::TYPE_1);
    }
}
