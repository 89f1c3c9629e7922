//! Frames-in-flight pacing
//!
//! K pre-allocated frame slots rotate round-robin. Each slot owns a fence
//! (created signaled), an image-available and a render-finished semaphore,
//! and one primary command buffer. Waiting on the slot fence before reuse is
//! the only backpressure in the renderer: at most K frames are ever in
//! flight.

use ash::{vk, Device};

use crate::commands::CommandPool;
use crate::error::{RenderError, RenderResult};

/// Per-slot synchronization and recording state.
pub struct FrameContext {
    /// Signaled when the GPU has finished this slot's last submission
    pub in_flight: vk::Fence,
    /// Signaled by swapchain acquisition
    pub image_available: vk::Semaphore,
    /// Signaled by the slot's submission, waited on by present
    pub render_finished: vk::Semaphore,
    /// Primary command buffer, re-recorded every time the slot comes around
    pub command_buffer: vk::CommandBuffer,
}

/// Round-robin list of [`FrameContext`] slots.
pub struct FrameContextList {
    device: Device,
    frames: Vec<FrameContext>,
    current: usize,
}

impl FrameContextList {
    /// Pre-allocate `frames_in_flight` slots.
    pub fn new(
        device: Device,
        graphics_pool: &CommandPool,
        frames_in_flight: usize,
    ) -> RenderResult<Self> {
        assert!(frames_in_flight > 0, "frames_in_flight must be at least 1");

        let command_buffers =
            graphics_pool.allocate_command_buffers(frames_in_flight as u32)?;

        let mut frames = Vec::with_capacity(frames_in_flight);
        for command_buffer in command_buffers {
            // Fences start signaled so the first wait on each slot passes.
            let fence_info =
                vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
            let semaphore_info = vk::SemaphoreCreateInfo::builder();
            unsafe {
                let in_flight =
                    device.create_fence(&fence_info, None).map_err(RenderError::Api)?;
                let image_available = device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(RenderError::Api)?;
                let render_finished = device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(RenderError::Api)?;
                frames.push(FrameContext {
                    in_flight,
                    image_available,
                    render_finished,
                    command_buffer,
                });
            }
        }

        Ok(Self { device, frames, current: 0 })
    }

    /// The slot for the frame being prepared.
    pub fn current(&self) -> &FrameContext {
        &self.frames[self.current]
    }

    /// Rotate to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Block until the current slot's previous submission has retired. The
    /// fence stays signaled; it is reset only once this frame is sure to
    /// submit, so a skipped frame leaves the slot reusable.
    pub fn wait_current(&self) -> RenderResult<()> {
        let fences = [self.current().in_flight];
        unsafe {
            self.device
                .wait_for_fences(&fences, true, u64::MAX)
                .map_err(RenderError::Api)?;
        }
        Ok(())
    }

    /// Unsignal the current slot's fence ahead of a submission.
    pub fn reset_current(&self) -> RenderResult<()> {
        let fences = [self.current().in_flight];
        unsafe {
            self.device.reset_fences(&fences).map_err(RenderError::Api)?;
        }
        Ok(())
    }

    /// Destroy all slot synchronization objects.
    pub fn destroy(&mut self) {
        for frame in self.frames.drain(..) {
            unsafe {
                self.device.destroy_fence(frame.in_flight, None);
                self.device.destroy_semaphore(frame.image_available, None);
                self.device.destroy_semaphore(frame.render_finished, None);
            }
        }
    }
}
