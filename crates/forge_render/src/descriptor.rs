//! Descriptor set allocation
//!
//! A growing allocator over a chain of `vk::DescriptorPool`s. Freed sets go
//! onto a per-layout recycle list and are handed back on the next allocation
//! for the same layout; pools are only destroyed wholesale at shutdown.

use std::collections::HashMap;

use ash::{vk, Device};
use log::debug;

use crate::error::{RenderError, RenderResult};

const SETS_PER_POOL: u32 = 512;

/// Allocates descriptor sets, growing a new pool when the current one fills.
pub struct DescriptorAllocator {
    device: Device,
    pools: Vec<vk::DescriptorPool>,
    recycled: HashMap<vk::DescriptorSetLayout, Vec<vk::DescriptorSet>>,
}

impl DescriptorAllocator {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            pools: Vec::new(),
            recycled: HashMap::new(),
        }
    }

    /// Allocate a set for `layout`, preferring a recycled one.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> RenderResult<vk::DescriptorSet> {
        if let Some(set) = self.recycled.get_mut(&layout).and_then(Vec::pop) {
            return Ok(set);
        }
        let pool = match self.pools.last() {
            Some(&pool) => pool,
            None => self.grow()?,
        };
        match self.try_allocate(pool, layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                let pool = self.grow()?;
                self.try_allocate(pool, layout).map_err(RenderError::Api)
            }
            Err(e) => Err(RenderError::Api(e)),
        }
    }

    /// Return a set to the recycle list for its layout.
    pub fn free(&mut self, layout: vk::DescriptorSetLayout, set: vk::DescriptorSet) {
        self.recycled.entry(layout).or_default().push(set);
    }

    /// Destroy every pool. All sets become invalid.
    pub fn destroy(&mut self) {
        self.recycled.clear();
        for pool in self.pools.drain(..) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn try_allocate(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        Ok(sets[0])
    }

    fn grow(&mut self) -> RenderResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: SETS_PER_POOL * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: SETS_PER_POOL * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: SETS_PER_POOL * 2,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            self.device
                .create_descriptor_pool(&pool_info, None)
                .map_err(RenderError::Api)?
        };
        self.pools.push(pool);
        debug!("descriptor pool {} created", self.pools.len());
        Ok(pool)
    }
}
