//! Uniform groups and shared uniform storage
//!
//! A uniform group instantiates the descriptor interface of one pipeline:
//! one descriptor set per reflected set layout, a host-visible uniform
//! buffer per buffer binding, CPU staging per push-constant range, and a
//! slot per image binding filled in later by `bind_texture`.
//!
//! Bindings the pipeline flags as shared are backed by a process-wide
//! [`SharedUniformTable`]: the first group to build seeds the storage,
//! later groups check the same storage out under their own handles, and it
//! is freed when the last group checks it back in. Every group holds a
//! distinct `UniformHandle`, but a write through any of them is observed by
//! all of them.

use std::collections::HashMap;

use ash::{vk, Device};
use log::debug;

use crate::buffer::{BufferDesc, BufferRegistry};
use crate::commands::CommandPool;
use crate::descriptor::DescriptorAllocator;
use crate::error::RenderResult;
use crate::memory::MemoryPool;
use crate::pipeline::PipelineInstance;
use crate::registry::{BufferHandle, PipelineHandle, Registry, UniformGroupHandle, UniformHandle};
use crate::shader::BindingKind;
use crate::texture::TextureInstance;

/// Storage aliased across groups under one uniform name.
#[derive(Debug)]
pub(crate) enum SharedStorage {
    /// Host-visible buffer; groups copy the handle, the table owns it
    Buffer(BufferHandle),
    /// Push-constant bytes; groups read and write them through the table
    Push(Vec<u8>),
}

struct SharedEntry {
    storage: SharedStorage,
    refs: u32,
}

/// Explicit checkout/checkin table for uniforms shared across groups.
///
/// Owns the canonical storage per name. Groups check storage out when they
/// build and back in when they are destroyed; `checkin` hands the storage
/// back to the last caller for freeing.
#[derive(Default)]
pub struct SharedUniformTable {
    entries: HashMap<String, SharedEntry>,
}

impl SharedUniformTable {
    /// Check out an existing entry, incrementing its reference count.
    pub(crate) fn checkout(&mut self, name: &str) -> Option<&SharedStorage> {
        let entry = self.entries.get_mut(name)?;
        entry.refs += 1;
        Some(&entry.storage)
    }

    /// Seed a new entry with one reference. Panics if the name is taken;
    /// callers must try `checkout` first.
    pub(crate) fn seed(&mut self, name: &str, storage: SharedStorage) {
        let previous = self.entries.insert(name.to_string(), SharedEntry { storage, refs: 1 });
        assert!(previous.is_none(), "shared uniform '{name}' seeded twice");
    }

    /// Check a reference back in. Returns the storage when it was the last
    /// one; the caller frees it.
    pub(crate) fn checkin(&mut self, name: &str) -> Option<SharedStorage> {
        let entry = match self.entries.get_mut(name) {
            Some(entry) => entry,
            None => panic!("checkin of unknown shared uniform '{name}'"),
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            self.entries.remove(name).map(|entry| entry.storage)
        } else {
            None
        }
    }

    /// Shared push-constant bytes for a name.
    pub(crate) fn push_data(&self, name: &str) -> &[u8] {
        match self.entries.get(name).map(|entry| &entry.storage) {
            Some(SharedStorage::Push(data)) => data,
            _ => panic!("shared uniform '{name}' has no push storage"),
        }
    }

    /// Mutable shared push-constant bytes for a name.
    pub(crate) fn push_data_mut(&mut self, name: &str) -> &mut [u8] {
        match self.entries.get_mut(name).map(|entry| &mut entry.storage) {
            Some(SharedStorage::Push(data)) => data,
            _ => panic!("shared uniform '{name}' has no push storage"),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

enum UniformBacking {
    /// Host-visible uniform/storage buffer; shared uniforms copy the handle
    /// while the table owns the storage
    Buffer { buffer: BufferHandle },
    /// CPU staging owned by this uniform, pushed before each draw
    PushConstant {
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    /// Push range whose bytes live in the shared table under this name
    SharedPush {
        stages: vk::ShaderStageFlags,
        offset: u32,
    },
    /// Image/sampler slot written through `bind_texture`
    Image {
        set: vk::DescriptorSet,
        binding: u32,
        kind: BindingKind,
        count: u32,
    },
}

/// One named uniform: a buffer slice, a push range or an image slot.
pub struct UniformInstance {
    /// Binding or push-range name from reflection
    pub name: String,
    /// Byte stride between elements
    pub element_size: u32,
    /// Element count
    pub count: u32,
    backing: UniformBacking,
}

/// The instantiated descriptor state for one pipeline.
pub struct UniformGroupInstance {
    pub(crate) sets: Vec<(u32, vk::DescriptorSet, vk::DescriptorSetLayout)>,
    /// (name, handle, shared) per uniform, in reflection order
    uniforms: Vec<(String, UniformHandle, bool)>,
    /// The pipeline this group was built for
    pub pipeline: PipelineHandle,
}

impl UniformGroupInstance {
    /// Contiguous runs of `(first set index, sets)` for binding at draw
    /// time. Sparse set indices split into separate bind calls so every set
    /// lands at its reflected index.
    pub(crate) fn descriptor_set_runs(&self) -> Vec<(u32, Vec<vk::DescriptorSet>)> {
        let mut runs: Vec<(u32, Vec<vk::DescriptorSet>)> = Vec::new();
        for &(index, set, _) in &self.sets {
            match runs.last_mut() {
                Some((first, sets)) if *first + sets.len() as u32 == index => sets.push(set),
                _ => runs.push((index, vec![set])),
            }
        }
        runs
    }
}

/// Owns uniform groups, their storage and the shared table.
pub struct UniformRegistry {
    device: Device,
    uniforms: Registry<UniformHandle, UniformInstance>,
    groups: Registry<UniformGroupHandle, UniformGroupInstance>,
    shared: SharedUniformTable,
}

impl UniformRegistry {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            uniforms: Registry::new("uniform"),
            groups: Registry::new("uniform group"),
            shared: SharedUniformTable::default(),
        }
    }

    /// Instantiate the descriptor interface of `pipeline` as a new group.
    pub fn build_group(
        &mut self,
        handle: PipelineHandle,
        pipeline: &PipelineInstance,
        descriptors: &mut DescriptorAllocator,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
    ) -> RenderResult<UniformGroupHandle> {
        let mut sets = Vec::new();
        for (&set_index, &layout) in &pipeline.set_layouts {
            let set = descriptors.allocate(layout)?;
            sets.push((set_index, set, layout));
        }

        let mut uniforms = Vec::new();
        for (&set_index, bindings) in &pipeline.interface.sets {
            let set = sets
                .iter()
                .find(|&&(index, ..)| index == set_index)
                .map(|&(_, set, _)| set)
                .unwrap_or_else(|| panic!("descriptor set {set_index} missing from group"));

            for binding in bindings {
                match binding.kind {
                    BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                        let (uniform, buffer) = self.buffer_uniform(
                            binding.shared,
                            &binding.name,
                            binding.size,
                            binding.count,
                            binding.kind,
                            buffers,
                            pool,
                            transfer,
                        )?;
                        self.write_buffer_descriptors(set, binding, buffers, buffer);
                        uniforms.push((binding.name.clone(), uniform, binding.shared));
                    }
                    BindingKind::CombinedImageSampler
                    | BindingKind::SampledImage
                    | BindingKind::Sampler => {
                        let uniform = self.uniforms.insert(UniformInstance {
                            name: binding.name.clone(),
                            element_size: 0,
                            count: binding.count,
                            backing: UniformBacking::Image {
                                set,
                                binding: binding.binding,
                                kind: binding.kind,
                                count: binding.count,
                            },
                        });
                        // Image slots are per-set, so sharing never applies.
                        uniforms.push((binding.name.clone(), uniform, false));
                    }
                }
            }
        }

        for range in &pipeline.interface.push_constants {
            let backing = if range.shared {
                match self.shared.checkout(&range.name) {
                    Some(SharedStorage::Push(_)) => {}
                    Some(_) => panic!("shared uniform '{}' is not push-backed", range.name),
                    None => self
                        .shared
                        .seed(&range.name, SharedStorage::Push(vec![0; range.size as usize])),
                }
                UniformBacking::SharedPush { stages: range.stages, offset: range.offset }
            } else {
                UniformBacking::PushConstant {
                    stages: range.stages,
                    offset: range.offset,
                    data: vec![0; range.size as usize],
                }
            };
            let uniform = self.uniforms.insert(UniformInstance {
                name: range.name.clone(),
                element_size: range.size,
                count: 1,
                backing,
            });
            uniforms.push((range.name.clone(), uniform, range.shared));
        }

        debug!("uniform group built: {} sets, {} uniforms", sets.len(), uniforms.len());
        Ok(self.groups.insert(UniformGroupInstance {
            sets,
            uniforms,
            pipeline: handle,
        }))
    }

    /// Look up a group. Panics on a dead handle.
    pub fn get_group(&self, handle: UniformGroupHandle) -> &UniformGroupInstance {
        self.groups.get(handle)
    }

    pub fn contains_group(&self, handle: UniformGroupHandle) -> bool {
        self.groups.contains(handle)
    }

    /// Find a uniform in a group by its reflected name.
    pub fn get_uniform(&self, group: UniformGroupHandle, name: &str) -> Option<UniformHandle> {
        self.groups
            .get(group)
            .uniforms
            .iter()
            .find(|(uniform_name, ..)| uniform_name == name)
            .map(|&(_, handle, _)| handle)
    }

    /// Write `count` elements starting at `index`.
    ///
    /// `bytes` must be exactly `count * element_size` long; writes past the
    /// uniform's storage are a programmer error and panic.
    pub fn write_uniform(
        &mut self,
        buffers: &BufferRegistry,
        handle: UniformHandle,
        bytes: &[u8],
        index: u32,
        count: u32,
    ) {
        let uniform = self.uniforms.get_mut(handle);
        let stride = uniform.element_size as usize;
        assert_eq!(
            bytes.len(),
            stride * count as usize,
            "uniform '{}' write length mismatch",
            uniform.name
        );
        assert!(
            index + count <= uniform.count,
            "uniform '{}' write out of range: {}..{} of {}",
            uniform.name,
            index,
            index + count,
            uniform.count
        );
        let offset = index as usize * stride;
        match &mut uniform.backing {
            UniformBacking::Buffer { buffer } => {
                buffers.get(*buffer).write_bytes(offset, bytes);
            }
            UniformBacking::PushConstant { data, .. } => {
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            UniformBacking::SharedPush { .. } => {
                let data = self.shared.push_data_mut(&uniform.name);
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            UniformBacking::Image { .. } => {
                panic!("uniform '{}' is an image slot, use bind_texture", uniform.name)
            }
        }
    }

    /// Point an image slot at a texture.
    pub fn bind_texture(&self, handle: UniformHandle, texture: &TextureInstance, slot: u32) {
        let uniform = self.uniforms.get(handle);
        let (set, binding, kind, count) = match &uniform.backing {
            UniformBacking::Image { set, binding, kind, count } => {
                (*set, *binding, *kind, *count)
            }
            _ => panic!("uniform '{}' is not an image slot", uniform.name),
        };
        assert!(slot < count, "texture slot {slot} out of range for '{}'", uniform.name);

        let image_info = [vk::DescriptorImageInfo::builder()
            .sampler(texture.sampler)
            .image_view(texture.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build()];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(kind.descriptor_type())
            .image_info(&image_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Push-constant ranges of a group, for recording draws.
    pub(crate) fn push_ranges(
        &self,
        group: &UniformGroupInstance,
    ) -> Vec<(vk::ShaderStageFlags, u32, &[u8])> {
        group
            .uniforms
            .iter()
            .filter_map(|&(_, handle, _)| {
                let uniform = self.uniforms.get(handle);
                match &uniform.backing {
                    UniformBacking::PushConstant { stages, offset, data } => {
                        Some((*stages, *offset, data.as_slice()))
                    }
                    UniformBacking::SharedPush { stages, offset } => {
                        Some((*stages, *offset, self.shared.push_data(&uniform.name)))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Tear down a group: shared storage is checked back in and freed only
    /// on the last reference, owned storage is freed immediately, descriptor
    /// sets go back to the recycle list.
    pub fn destroy_group(
        &mut self,
        handle: UniformGroupHandle,
        descriptors: &mut DescriptorAllocator,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
    ) {
        let group = self.groups.remove(handle);
        for (name, uniform, shared) in group.uniforms {
            let instance = self.uniforms.remove(uniform);
            if shared {
                if let Some(SharedStorage::Buffer(buffer)) = self.shared.checkin(&name) {
                    buffers.destroy(pool, buffer);
                }
            } else if let UniformBacking::Buffer { buffer } = instance.backing {
                buffers.destroy(pool, buffer);
            }
        }
        for (_, set, layout) in group.sets {
            descriptors.free(layout, set);
        }
    }

    /// Destroy every remaining group.
    pub fn destroy_all(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
    ) {
        let handles: Vec<_> = self.groups.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            self.destroy_group(handle, descriptors, buffers, pool);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn buffer_uniform(
        &mut self,
        shared: bool,
        name: &str,
        size: u32,
        count: u32,
        kind: BindingKind,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
    ) -> RenderResult<(UniformHandle, BufferHandle)> {
        let existing = if shared {
            match self.shared.checkout(name) {
                Some(SharedStorage::Buffer(buffer)) => Some(*buffer),
                Some(_) => panic!("shared uniform '{name}' is not buffer-backed"),
                None => None,
            }
        } else {
            None
        };

        let buffer = match existing {
            Some(buffer) => buffer,
            None => {
                let usage = match kind {
                    BindingKind::StorageBuffer => vk::BufferUsageFlags::STORAGE_BUFFER,
                    _ => vk::BufferUsageFlags::UNIFORM_BUFFER,
                };
                let buffer = buffers.build(
                    pool,
                    transfer,
                    &BufferDesc {
                        size: u64::from(size) * u64::from(count),
                        usage,
                        properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                            | vk::MemoryPropertyFlags::HOST_COHERENT,
                        contents: None,
                    },
                )?;
                if shared {
                    self.shared.seed(name, SharedStorage::Buffer(buffer));
                }
                buffer
            }
        };

        // Each group holds its own instance; aliasing happens through the
        // buffer memory, not through handle identity.
        let uniform = self.uniforms.insert(UniformInstance {
            name: name.to_string(),
            element_size: size,
            count,
            backing: UniformBacking::Buffer { buffer },
        });
        Ok((uniform, buffer))
    }

    fn write_buffer_descriptors(
        &self,
        set: vk::DescriptorSet,
        binding: &crate::pipeline::MergedBinding,
        buffers: &BufferRegistry,
        buffer: BufferHandle,
    ) {
        let instance = buffers.get(buffer);
        let buffer_infos: Vec<_> = (0..binding.count)
            .map(|element| {
                vk::DescriptorBufferInfo::builder()
                    .buffer(instance.buffer)
                    .offset(u64::from(element) * u64::from(binding.size))
                    .range(u64::from(binding.size))
                    .build()
            })
            .collect();
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding.binding)
            .descriptor_type(binding.kind.descriptor_type())
            .buffer_info(&buffer_infos)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn checkout_of_unknown_name_returns_none() {
        let mut table = SharedUniformTable::default();
        assert!(table.checkout("u_camera").is_none());
    }

    #[test]
    fn seeded_storage_is_checked_out_until_last_checkin() {
        let mut table = SharedUniformTable::default();
        table.seed("u_time", SharedStorage::Push(vec![0; 16]));
        assert!(matches!(table.checkout("u_time"), Some(SharedStorage::Push(_))));
        assert!(matches!(table.checkout("u_time"), Some(SharedStorage::Push(_))));

        assert!(table.checkin("u_time").is_none());
        assert!(table.checkin("u_time").is_none());
        // Third checkin matches the seed reference and hands the storage back.
        assert!(matches!(table.checkin("u_time"), Some(SharedStorage::Push(_))));
        assert!(!table.contains("u_time"));
        assert!(table.checkout("u_time").is_none());
    }

    #[test]
    fn writes_through_one_checkout_are_observed_by_all() {
        // Two holders of the same name see one storage: a write through the
        // table is visible to every reader, independent of which group's
        // handle reached it.
        let mut table = SharedUniformTable::default();
        table.seed("u_push", SharedStorage::Push(vec![0; 4]));
        table.checkout("u_push");

        table.push_data_mut("u_push").copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(table.push_data("u_push"), &[1, 2, 3, 4]);

        table.push_data_mut("u_push")[0] = 9;
        assert_eq!(table.push_data("u_push"), &[9, 2, 3, 4]);
    }

    #[test]
    fn reseeding_after_removal_is_allowed() {
        let mut table = SharedUniformTable::default();
        table.seed("u_time", SharedStorage::Push(vec![0; 4]));
        assert!(table.checkin("u_time").is_some());
        table.seed("u_time", SharedStorage::Push(vec![0; 8]));
        assert_eq!(table.push_data("u_time").len(), 8);
    }

    #[test]
    #[should_panic(expected = "seeded twice")]
    fn double_seed_panics() {
        let mut table = SharedUniformTable::default();
        table.seed("u_camera", SharedStorage::Push(vec![0; 4]));
        table.seed("u_camera", SharedStorage::Push(vec![0; 4]));
    }

    fn group_with_sets(indices: &[u32]) -> UniformGroupInstance {
        UniformGroupInstance {
            sets: indices
                .iter()
                .map(|&index| {
                    (
                        index,
                        vk::DescriptorSet::from_raw(u64::from(index) + 1),
                        vk::DescriptorSetLayout::null(),
                    )
                })
                .collect(),
            uniforms: Vec::new(),
            pipeline: PipelineHandle::default(),
        }
    }

    #[test]
    fn contiguous_sets_bind_as_one_run() {
        let runs = group_with_sets(&[0, 1, 2]).descriptor_set_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, 0);
        assert_eq!(runs[0].1.len(), 3);
    }

    #[test]
    fn sparse_set_indices_split_into_runs_at_their_own_index() {
        // A shader using sets {0, 2} must get set 2 bound at index 2, not
        // packed down to index 1.
        let runs = group_with_sets(&[0, 2]).descriptor_set_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (0, vec![vk::DescriptorSet::from_raw(1)]));
        assert_eq!(runs[1], (2, vec![vk::DescriptorSet::from_raw(3)]));
    }

    #[test]
    fn runs_can_start_past_set_zero() {
        let runs = group_with_sets(&[1, 2]).descriptor_set_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, 1);
        assert_eq!(runs[0].1.len(), 2);
    }
}
