//! Buffer registry
//!
//! Handle→buffer map suballocating out of the device-memory pool. Buffers
//! are classified by (usage, memory properties); device-local initial
//! content goes through a transient staging buffer and a one-shot transfer
//! submission that blocks until the copy completes.

use ash::{vk, Device};

use crate::commands::CommandPool;
use crate::error::{RenderError, RenderResult};
use crate::memory::{MemoryPool, SubMemory};
use crate::registry::{BufferHandle, Registry};

/// Description of a buffer to build.
pub struct BufferDesc<'a> {
    /// Byte size (ignored when `contents` is set; the content length wins)
    pub size: vk::DeviceSize,
    /// Buffer usage flags
    pub usage: vk::BufferUsageFlags,
    /// Requested memory property bits
    pub properties: vk::MemoryPropertyFlags,
    /// Optional initial contents, uploaded synchronously
    pub contents: Option<&'a [u8]>,
}

/// A live buffer and its backing suballocation.
pub struct BufferInstance {
    /// Vulkan buffer handle
    pub buffer: vk::Buffer,
    /// Backing pool suballocation
    pub memory: SubMemory,
    /// Byte size
    pub size: vk::DeviceSize,
    /// Usage the buffer was built with
    pub usage: vk::BufferUsageFlags,
}

impl BufferInstance {
    /// Write bytes through the persistent mapping at `offset`.
    ///
    /// Panics if the buffer is not host-visible; only mapped buffers reach
    /// this path (uniform storage, staging).
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(
            !self.memory.mapped.is_null(),
            "write_bytes on a buffer without a host mapping"
        );
        assert!(offset + bytes.len() <= self.size as usize, "mapped write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.memory.mapped.add(offset), bytes.len());
        }
    }
}

/// Handle-based buffer registry.
pub struct BufferRegistry {
    device: Device,
    buffers: Registry<BufferHandle, BufferInstance>,
}

impl BufferRegistry {
    /// Create an empty registry.
    pub fn new(device: Device) -> Self {
        Self { device, buffers: Registry::new("buffer") }
    }

    /// Build a buffer, binding pool memory and uploading initial contents.
    pub fn build(
        &mut self,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
        desc: &BufferDesc<'_>,
    ) -> RenderResult<BufferHandle> {
        let size = desc.contents.map_or(desc.size, |c| c.len() as vk::DeviceSize);
        if size == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "zero-size buffer build".to_string(),
            });
        }

        let host_visible = desc.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        // Device-local contents arrive via a transfer copy.
        let usage = if desc.contents.is_some() && !host_visible {
            desc.usage | vk::BufferUsageFlags::TRANSFER_DST
        } else {
            desc.usage
        };

        let instance = self.create_bound_buffer(pool, size, usage, desc.properties)?;

        if let Some(contents) = desc.contents {
            if host_visible {
                instance.write_bytes(0, contents);
            } else {
                self.upload_via_staging(pool, transfer, &instance, contents)?;
            }
        }

        Ok(self.buffers.insert(instance))
    }

    /// Destroy a buffer, releasing its suballocation and invalidating the
    /// handle. Reuse of the handle afterwards panics.
    pub fn destroy(&mut self, pool: &mut MemoryPool, handle: BufferHandle) {
        let instance = self.buffers.remove(handle);
        unsafe {
            self.device.destroy_buffer(instance.buffer, None);
        }
        pool.free(instance.memory);
    }

    /// Look up a buffer instance.
    pub fn get(&self, handle: BufferHandle) -> &BufferInstance {
        self.buffers.get(handle)
    }

    /// Whether the handle is live.
    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains(handle)
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Tear down every remaining buffer (renderer shutdown).
    pub fn destroy_all(&mut self, pool: &mut MemoryPool) {
        for instance in self.buffers.drain() {
            unsafe {
                self.device.destroy_buffer(instance.buffer, None);
            }
            pool.free(instance.memory);
        }
    }

    fn create_bound_buffer(
        &self,
        pool: &mut MemoryPool,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<BufferInstance> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device.create_buffer(&buffer_info, None).map_err(RenderError::Api)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = match pool.allocate(requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory.memory, memory.offset)
                .map_err(RenderError::Api)?;
        }

        Ok(BufferInstance { buffer, memory, size, usage })
    }

    fn upload_via_staging(
        &self,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
        dst: &BufferInstance,
        contents: &[u8],
    ) -> RenderResult<()> {
        let staging = self.create_bound_buffer(
            pool,
            contents.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write_bytes(0, contents);

        let region = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(contents.len() as vk::DeviceSize)
            .build();
        transfer.submit_one_shot(|cmd| unsafe {
            self.device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
        })?;

        unsafe {
            self.device.destroy_buffer(staging.buffer, None);
        }
        pool.free(staging.memory);
        Ok(())
    }
}
