//! Growable device-memory pool
//!
//! Suballocates buffers and images out of large primary blocks, one set of
//! blocks per memory-type index. Host-visible blocks keep a persistent
//! mapped pointer so uniform writes are a plain memcpy.

use std::collections::HashMap;

use ash::{vk, Device, Instance};

use crate::error::{RenderError, RenderResult};
use crate::memory::free_list::{FreeListAllocator, Region};

/// Minimum primary block size; requests larger than this get a dedicated
/// block of exactly their size.
pub const MIN_BLOCK_SIZE: vk::DeviceSize = 64 * 1024 * 1024;

/// A suballocation handed out by the pool.
///
/// `mapped` points at the allocation's first byte for host-visible memory
/// and is null otherwise.
#[derive(Debug, Clone, Copy)]
pub struct SubMemory {
    /// The backing primary allocation (bind target)
    pub memory: vk::DeviceMemory,
    /// Byte offset of this suballocation within the block
    pub offset: vk::DeviceSize,
    /// Byte size of this suballocation
    pub size: vk::DeviceSize,
    /// Persistent mapping at `offset`, null for device-local memory
    pub mapped: *mut u8,
    memory_type_index: u32,
    block_index: usize,
}

struct MemoryBlock {
    memory: vk::DeviceMemory,
    allocator: FreeListAllocator,
    mapped: *mut u8,
}

/// Suballocating device-memory manager.
pub struct MemoryPool {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    blocks: HashMap<u32, Vec<MemoryBlock>>,
}

impl MemoryPool {
    /// Create a pool for the given device.
    pub fn new(device: Device, instance: &Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Self { device, memory_properties, blocks: HashMap::new() }
    }

    /// Suballocate memory satisfying `requirements` with the given property
    /// bits. Scans existing blocks of the matching type class first-fit; on
    /// failure allocates a new block of `max(size, MIN_BLOCK_SIZE)` and
    /// places the allocation at its start.
    pub fn allocate(
        &mut self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<SubMemory> {
        if requirements.size == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "zero-size memory allocation".to_string(),
            });
        }

        let type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let host_visible = properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        // First-fit over existing blocks of this type class.
        if let Some(blocks) = self.blocks.get_mut(&type_index) {
            for (block_index, block) in blocks.iter_mut().enumerate() {
                if let Some(region) =
                    block.allocator.allocate(requirements.size, requirements.alignment)
                {
                    return Ok(Self::sub_memory(block, region, type_index, block_index));
                }
            }
        }

        // Grow: new primary block, allocation placed at its start.
        let block_size = requirements.size.max(MIN_BLOCK_SIZE);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(block_size)
            .memory_type_index(type_index);

        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(RenderError::Api)?
        };

        let mapped = if host_visible {
            unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(RenderError::Api)? as *mut u8
            }
        } else {
            std::ptr::null_mut()
        };

        log::debug!(
            "memory pool: new {} MiB block for type {} (host_visible={})",
            block_size / (1024 * 1024),
            type_index,
            host_visible
        );

        let mut block = MemoryBlock { memory, allocator: FreeListAllocator::new(block_size), mapped };
        let region = block
            .allocator
            .allocate(requirements.size, requirements.alignment)
            .expect("fresh block must satisfy the allocation that sized it");

        let blocks = self.blocks.entry(type_index).or_default();
        let block_index = blocks.len();
        let sub = Self::sub_memory(&block, region, type_index, block_index);
        blocks.push(block);
        Ok(sub)
    }

    /// Return a suballocation to its block's free list.
    pub fn free(&mut self, sub: SubMemory) {
        let blocks = self
            .blocks
            .get_mut(&sub.memory_type_index)
            .expect("free of suballocation from unknown type class");
        let block = &mut blocks[sub.block_index];
        debug_assert_eq!(block.memory, sub.memory);
        block.allocator.free(Region { offset: sub.offset, size: sub.size });
    }

    /// Release every primary block. All suballocations must already be freed
    /// logically; called once at renderer teardown after a device-idle wait.
    pub fn destroy(&mut self) {
        for (_, blocks) in self.blocks.drain() {
            for block in blocks {
                unsafe {
                    if !block.mapped.is_null() {
                        self.device.unmap_memory(block.memory);
                    }
                    self.device.free_memory(block.memory, None);
                }
            }
        }
    }

    fn sub_memory(
        block: &MemoryBlock,
        region: Region,
        memory_type_index: u32,
        block_index: usize,
    ) -> SubMemory {
        let mapped = if block.mapped.is_null() {
            std::ptr::null_mut()
        } else {
            // Persistent mapping covers the whole block; offset into it.
            unsafe { block.mapped.add(region.offset as usize) }
        };
        SubMemory {
            memory: block.memory,
            offset: region.offset,
            size: region.size,
            mapped,
            memory_type_index,
            block_index,
        }
    }

    /// Find a memory type matching the filter with the required properties.
    ///
    /// No satisfying type is fatal: the device cannot back the resource at
    /// all, and every subsequent frame would be broken.
    fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if (type_filter & (1 << i)) != 0
                && (self.memory_properties.memory_types[i as usize].property_flags & properties)
                    == properties
            {
                return Ok(i);
            }
        }
        Err(RenderError::NoSuitableMemoryType)
    }
}
