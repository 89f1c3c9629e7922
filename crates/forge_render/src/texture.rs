//! Texture registry
//!
//! Images suballocated from the device-memory pool, with synchronous
//! staging uploads of tightly packed mip chains and layout transitions
//! driven by the texture's declared usage class.

use ash::{vk, Device};

use crate::commands::CommandPool;
use crate::error::{RenderError, RenderResult};
use crate::memory::{MemoryPool, SubMemory};
use crate::registry::{Registry, TextureHandle};

/// How a texture will be consumed; determines usage flags, aspect, and the
/// layout it is transitioned into after upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// Sampled in shaders (gets a sampler and SHADER_READ_ONLY layout)
    Sampled,
    /// Color render target (MSAA color, offscreen)
    ColorAttachment,
    /// Depth/stencil render target
    DepthAttachment,
}

/// Description of a texture to build.
pub struct TextureDesc<'a> {
    /// Base level width in texels
    pub width: u32,
    /// Base level height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Number of mip levels (1 for attachments)
    pub mip_levels: u32,
    /// Sample count (attachments only; sampled textures are single-sample)
    pub samples: vk::SampleCountFlags,
    /// Consumption class
    pub usage: TextureUsage,
    /// Optional tightly packed mip chain, level 0 first
    pub texels: Option<&'a [u8]>,
}

/// A live texture: image, view, optional sampler, backing memory.
pub struct TextureInstance {
    /// Vulkan image handle
    pub image: vk::Image,
    /// Full-chain image view
    pub view: vk::ImageView,
    /// Sampler for sampled textures, null otherwise
    pub sampler: vk::Sampler,
    /// Backing pool suballocation
    pub memory: SubMemory,
    /// Texel format
    pub format: vk::Format,
    /// Base extent
    pub extent: vk::Extent2D,
    /// Mip level count
    pub mip_levels: u32,
    /// Consumption class
    pub usage: TextureUsage,
}

/// Total byte size of a tightly packed mip chain.
///
/// Level n has dimensions `max(1, base >> n)`; `bytes_per_texel` is the
/// format's texel stride.
pub fn mip_chain_size(width: u32, height: u32, mip_levels: u32, bytes_per_texel: u64) -> u64 {
    (0..mip_levels)
        .map(|level| {
            // Shifts past bit 31 would overflow; levels beyond the chain
            // bottom stay clamped at 1x1.
            let shift = level.min(31);
            let w = (width >> shift).max(1) as u64;
            let h = (height >> shift).max(1) as u64;
            w * h * bytes_per_texel
        })
        .sum()
}

/// Number of levels in a full mip chain from the base extent down to 1x1.
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Byte stride of one texel for the formats the upload path accepts.
pub fn bytes_per_texel(format: vk::Format) -> RenderResult<u64> {
    match format {
        vk::Format::R8_UNORM => Ok(1),
        vk::Format::R8G8_UNORM => Ok(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Ok(4),
        vk::Format::R16G16B16A16_SFLOAT => Ok(8),
        vk::Format::R32G32B32A32_SFLOAT => Ok(16),
        _ => Err(RenderError::InvalidOperation {
            reason: format!("unsupported upload format {format:?}"),
        }),
    }
}

/// Handle-based texture registry.
pub struct TextureRegistry {
    device: Device,
    textures: Registry<TextureHandle, TextureInstance>,
}

impl TextureRegistry {
    /// Create an empty registry.
    pub fn new(device: Device) -> Self {
        Self { device, textures: Registry::new("texture") }
    }

    /// Build a texture, binding pool memory and uploading texels if given.
    ///
    /// The build blocks until the upload's transfer submission completes;
    /// builds happen outside the steady-state per-frame path.
    pub fn build(
        &mut self,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
        desc: &TextureDesc<'_>,
    ) -> RenderResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "texture extent and mip count must be non-zero".to_string(),
            });
        }
        let max_levels = max_mip_levels(desc.width, desc.height);
        if desc.mip_levels > max_levels {
            return Err(RenderError::InvalidOperation {
                reason: format!(
                    "{} mip levels requested but a {}x{} chain bottoms out at {}",
                    desc.mip_levels, desc.width, desc.height, max_levels
                ),
            });
        }

        let usage_flags = match desc.usage {
            TextureUsage::Sampled => {
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
            }
            TextureUsage::ColorAttachment => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
            }
            TextureUsage::DepthAttachment => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            }
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage_flags)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            self.device.create_image(&image_info, None).map_err(RenderError::Api)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = match pool.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };
        unsafe {
            self.device
                .bind_image_memory(image, memory.memory, memory.offset)
                .map_err(RenderError::Api)?;
        }

        if let Some(texels) = desc.texels {
            if desc.usage != TextureUsage::Sampled {
                return Err(RenderError::InvalidOperation {
                    reason: "initial texels are only valid for sampled textures".to_string(),
                });
            }
            self.upload_mip_chain(pool, transfer, image, desc, texels)?;
        } else {
            // Attachments are transitioned by their render passes; sampled
            // textures without content still need a defined layout.
            if desc.usage == TextureUsage::Sampled {
                self.transition_all_levels(
                    transfer,
                    image,
                    desc,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )?;
            }
        }

        let aspect = match desc.usage {
            TextureUsage::DepthAttachment => vk::ImageAspectFlags::DEPTH,
            _ => vk::ImageAspectFlags::COLOR,
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            self.device.create_image_view(&view_info, None).map_err(RenderError::Api)?
        };

        let sampler = if desc.usage == TextureUsage::Sampled {
            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .anisotropy_enable(true)
                .max_anisotropy(16.0)
                .min_lod(0.0)
                .max_lod(desc.mip_levels as f32);
            unsafe {
                self.device.create_sampler(&sampler_info, None).map_err(RenderError::Api)?
            }
        } else {
            vk::Sampler::null()
        };

        Ok(self.textures.insert(TextureInstance {
            image,
            view,
            sampler,
            memory,
            format: desc.format,
            extent: vk::Extent2D { width: desc.width, height: desc.height },
            mip_levels: desc.mip_levels,
            usage: desc.usage,
        }))
    }

    /// Destroy a texture, releasing image, view, sampler and memory.
    pub fn destroy(&mut self, pool: &mut MemoryPool, handle: TextureHandle) {
        let instance = self.textures.remove(handle);
        self.destroy_instance(pool, instance);
    }

    /// Look up a texture instance.
    pub fn get(&self, handle: TextureHandle) -> &TextureInstance {
        self.textures.get(handle)
    }

    /// Whether the handle is live.
    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.textures.contains(handle)
    }

    /// Tear down every remaining texture (renderer shutdown).
    pub fn destroy_all(&mut self, pool: &mut MemoryPool) {
        for instance in self.textures.drain() {
            self.destroy_instance(pool, instance);
        }
    }

    fn destroy_instance(&self, pool: &mut MemoryPool, instance: TextureInstance) {
        unsafe {
            if instance.sampler != vk::Sampler::null() {
                self.device.destroy_sampler(instance.sampler, None);
            }
            self.device.destroy_image_view(instance.view, None);
            self.device.destroy_image(instance.image, None);
        }
        pool.free(instance.memory);
    }

    /// Upload a tightly packed mip chain through a staging buffer.
    ///
    /// The source length must match the computed chain size exactly; a
    /// mismatch is rejected rather than trusted.
    fn upload_mip_chain(
        &self,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
        image: vk::Image,
        desc: &TextureDesc<'_>,
        texels: &[u8],
    ) -> RenderResult<()> {
        let texel_stride = bytes_per_texel(desc.format)?;
        let expected = mip_chain_size(desc.width, desc.height, desc.mip_levels, texel_stride);
        if texels.len() as u64 != expected {
            return Err(RenderError::InvalidOperation {
                reason: format!(
                    "mip chain is {} bytes, expected {} for {}x{} with {} levels",
                    texels.len(),
                    expected,
                    desc.width,
                    desc.height,
                    desc.mip_levels
                ),
            });
        }

        // Transient staging buffer holding the whole chain.
        let staging_info = vk::BufferCreateInfo::builder()
            .size(texels.len() as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let staging = unsafe {
            self.device.create_buffer(&staging_info, None).map_err(RenderError::Api)?
        };
        let staging_req = unsafe { self.device.get_buffer_memory_requirements(staging) };
        let staging_mem = pool.allocate(
            staging_req,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        unsafe {
            self.device
                .bind_buffer_memory(staging, staging_mem.memory, staging_mem.offset)
                .map_err(RenderError::Api)?;
            std::ptr::copy_nonoverlapping(texels.as_ptr(), staging_mem.mapped, texels.len());
        }

        // One level at a time from the packed source chain.
        let mut regions = Vec::with_capacity(desc.mip_levels as usize);
        let mut src_offset: u64 = 0;
        for level in 0..desc.mip_levels {
            let w = (desc.width >> level).max(1);
            let h = (desc.height >> level).max(1);
            regions.push(
                vk::BufferImageCopy::builder()
                    .buffer_offset(src_offset)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                    .image_extent(vk::Extent3D { width: w, height: h, depth: 1 })
                    .build(),
            );
            src_offset += u64::from(w) * u64::from(h) * texel_stride;
        }

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: desc.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };

        transfer.submit_one_shot(|cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .build();
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );

            let to_sampled = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .build();
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        })?;

        unsafe {
            self.device.destroy_buffer(staging, None);
        }
        pool.free(staging_mem);
        Ok(())
    }

    fn transition_all_levels(
        &self,
        transfer: &CommandPool,
        image: vk::Image,
        desc: &TextureDesc<'_>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> RenderResult<()> {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: desc.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        transfer.submit_one_shot(|cmd| unsafe {
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .build();
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_size_full_chain_256() {
        // 256x256 base, 9 levels, 4 bytes per texel: sum of (256>>n)^2 * 4.
        let expected: u64 = (0..9u32).map(|n| {
            let d = (256u64 >> n).max(1);
            d * d * 4
        }).sum();
        assert_eq!(mip_chain_size(256, 256, 9, 4), expected);
    }

    #[test]
    fn mip_chain_size_clamps_to_one() {
        // A 4x1 base keeps height clamped at 1 while width halves.
        assert_eq!(mip_chain_size(4, 1, 3, 1), 4 + 2 + 1);
    }

    #[test]
    fn mip_chain_size_single_level() {
        assert_eq!(mip_chain_size(16, 8, 1, 4), 16 * 8 * 4);
    }

    #[test]
    fn full_chain_level_counts() {
        assert_eq!(max_mip_levels(256, 256), 9);
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(640, 480), 10);
        assert_eq!(max_mip_levels(u32::MAX, 1), 32);
    }

    #[test]
    fn mip_chain_size_survives_over_long_chains() {
        // A level count past the chain bottom must not shift out of range;
        // the extra levels stay at one texel each.
        let full = mip_chain_size(256, 256, 9, 4);
        assert_eq!(mip_chain_size(256, 256, 33, 4), full + 24 * 4);
    }

    #[test]
    fn texel_strides() {
        assert_eq!(bytes_per_texel(vk::Format::R8G8B8A8_SRGB).unwrap(), 4);
        assert_eq!(bytes_per_texel(vk::Format::R16G16B16A16_SFLOAT).unwrap(), 8);
        assert!(bytes_per_texel(vk::Format::BC7_UNORM_BLOCK).is_err());
    }
}
