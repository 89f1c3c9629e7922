//! Command pool and one-shot submission helpers
//!
//! Resource builds record transfer work into transient command buffers and
//! wait for the queue to idle before returning; the steady-state frame loop
//! uses the per-slot command buffers owned by the frame contexts instead.

use ash::{vk, Device};

use crate::error::{RenderError, RenderResult};

/// Command pool wrapper with RAII cleanup.
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
}

impl CommandPool {
    /// Create a command pool for the given queue family.
    pub fn new(device: Device, queue_family_index: u32, queue: vk::Queue) -> RenderResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device.create_command_pool(&pool_create_info, None).map_err(RenderError::Api)?
        };

        Ok(Self { device, command_pool, queue })
    }

    /// Allocate primary command buffers.
    pub fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device.allocate_command_buffers(&alloc_info).map_err(RenderError::Api)
        }
    }

    /// Get the command pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Get the queue this pool submits to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Record and synchronously execute a one-shot command buffer.
    ///
    /// Blocks until the queue is idle, so builds never race the GPU; this is
    /// acceptable because builds happen outside the per-frame path.
    pub fn submit_one_shot<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let command_buffer = self.allocate_command_buffers(1)?[0];
        // The buffer is freed on the error paths too; after the idle wait
        // (or a failed begin/submit) it is never pending.
        let result = self.record_and_submit(command_buffer, record);
        unsafe {
            self.device.free_command_buffers(self.command_pool, &[command_buffer]);
        }
        result
    }

    fn record_and_submit<F>(&self, command_buffer: vk::CommandBuffer, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(RenderError::Api)?;
        }

        record(command_buffer);

        unsafe {
            self.device.end_command_buffer(command_buffer).map_err(RenderError::Api)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                .map_err(RenderError::Api)?;
            self.device.queue_wait_idle(self.queue).map_err(RenderError::Api)?;
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // All command buffers must be idle; callers wait the device
            // before dropping the pool at teardown.
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
