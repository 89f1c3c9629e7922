//! Mesh registry
//!
//! Uploads vertex-attribute and index arrays into device-local buffer
//! suballocations. Each attribute owns its own buffer allocation; indices
//! are optional (vertex-count-only draws) and can be narrowed from the
//! caller's `u32` arrays to `u16` on request.

use ash::vk;

use crate::buffer::{BufferDesc, BufferRegistry};
use crate::commands::CommandPool;
use crate::error::{RenderError, RenderResult};
use crate::memory::MemoryPool;
use crate::registry::{BufferHandle, MeshHandle, Registry};

/// Requested index width for a mesh build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    /// 16-bit indices; source values must fit in `u16`
    U16,
    /// 32-bit indices
    U32,
}

/// One vertex attribute stream.
pub struct VertexAttribute<'a> {
    /// Raw attribute bytes, tightly packed
    pub data: &'a [u8],
    /// Byte stride of one element
    pub stride: u32,
}

/// Description of a mesh to build.
pub struct MeshDesc<'a> {
    /// Attribute streams in shader-location order
    pub attributes: Vec<VertexAttribute<'a>>,
    /// Optional index array with requested storage width
    pub indices: Option<(&'a [u32], IndexWidth)>,
    /// Number of vertices (drawn directly when no indices are given)
    pub vertex_count: u32,
    /// Number of instances to draw (usually 1)
    pub instance_count: u32,
}

/// A live mesh: per-attribute buffers plus optional index buffer.
pub struct MeshInstance {
    /// One buffer allocation per vertex attribute, in location order
    pub attribute_buffers: Vec<BufferHandle>,
    /// Index buffer, its Vulkan index type, and index count
    pub index_buffer: Option<(BufferHandle, vk::IndexType, u32)>,
    /// Vertex count for index-free draws
    pub vertex_count: u32,
    /// Instance count
    pub instance_count: u32,
}

/// Narrow `u32` indices to the requested width, validating the value range.
pub fn narrow_indices(indices: &[u32], width: IndexWidth) -> RenderResult<Vec<u8>> {
    match width {
        IndexWidth::U32 => Ok(bytemuck::cast_slice(indices).to_vec()),
        IndexWidth::U16 => {
            let mut narrowed = Vec::with_capacity(indices.len());
            for &index in indices {
                let narrow = u16::try_from(index).map_err(|_| RenderError::InvalidOperation {
                    reason: format!("index {index} does not fit in u16"),
                })?;
                narrowed.push(narrow);
            }
            Ok(bytemuck::cast_slice(&narrowed).to_vec())
        }
    }
}

/// Handle-based mesh registry.
pub struct MeshRegistry {
    meshes: Registry<MeshHandle, MeshInstance>,
}

impl MeshRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { meshes: Registry::new("mesh") }
    }

    /// Build a mesh, uploading every attribute and the index array.
    pub fn build(
        &mut self,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
        transfer: &CommandPool,
        desc: &MeshDesc<'_>,
    ) -> RenderResult<MeshHandle> {
        if desc.attributes.is_empty() {
            return Err(RenderError::InvalidOperation {
                reason: "mesh build with no vertex attributes".to_string(),
            });
        }
        if desc.vertex_count == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "mesh build with zero vertices".to_string(),
            });
        }

        let mut attribute_buffers = Vec::with_capacity(desc.attributes.len());
        for attribute in &desc.attributes {
            let expected = desc.vertex_count as usize * attribute.stride as usize;
            if attribute.data.len() != expected {
                return Err(RenderError::InvalidOperation {
                    reason: format!(
                        "attribute stream is {} bytes, expected {} ({} vertices, stride {})",
                        attribute.data.len(),
                        expected,
                        desc.vertex_count,
                        attribute.stride
                    ),
                });
            }
            let handle = buffers.build(
                pool,
                transfer,
                &BufferDesc {
                    size: 0,
                    usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                    properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    contents: Some(attribute.data),
                },
            )?;
            attribute_buffers.push(handle);
        }

        let index_buffer = match desc.indices {
            Some((indices, width)) => {
                let bytes = narrow_indices(indices, width)?;
                let handle = buffers.build(
                    pool,
                    transfer,
                    &BufferDesc {
                        size: 0,
                        usage: vk::BufferUsageFlags::INDEX_BUFFER,
                        properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                        contents: Some(&bytes),
                    },
                )?;
                let index_type = match width {
                    IndexWidth::U16 => vk::IndexType::UINT16,
                    IndexWidth::U32 => vk::IndexType::UINT32,
                };
                Some((handle, index_type, indices.len() as u32))
            }
            None => None,
        };

        Ok(self.meshes.insert(MeshInstance {
            attribute_buffers,
            index_buffer,
            vertex_count: desc.vertex_count,
            instance_count: desc.instance_count.max(1),
        }))
    }

    /// Destroy a mesh and the buffer suballocations it owns.
    pub fn destroy(
        &mut self,
        buffers: &mut BufferRegistry,
        pool: &mut MemoryPool,
        handle: MeshHandle,
    ) {
        let instance = self.meshes.remove(handle);
        for buffer in instance.attribute_buffers {
            buffers.destroy(pool, buffer);
        }
        if let Some((buffer, _, _)) = instance.index_buffer {
            buffers.destroy(pool, buffer);
        }
    }

    /// Look up a mesh instance.
    pub fn get(&self, handle: MeshHandle) -> &MeshInstance {
        self.meshes.get(handle)
    }

    /// Whether the handle is live.
    pub fn contains(&self, handle: MeshHandle) -> bool {
        self.meshes.contains(handle)
    }

    /// Drain every mesh, destroying owned buffers (renderer shutdown).
    pub fn destroy_all(&mut self, buffers: &mut BufferRegistry, pool: &mut MemoryPool) {
        for instance in self.meshes.drain() {
            for buffer in instance.attribute_buffers {
                buffers.destroy(pool, buffer);
            }
            if let Some((buffer, _, _)) = instance.index_buffer {
                buffers.destroy(pool, buffer);
            }
        }
    }
}

impl Default for MeshRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_to_u16_preserves_values() {
        let bytes = narrow_indices(&[0, 1, 2, 2, 3, 0], IndexWidth::U16).unwrap();
        let narrowed: &[u16] = bytemuck::cast_slice(&bytes);
        assert_eq!(narrowed, &[0u16, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn narrowing_rejects_out_of_range() {
        let err = narrow_indices(&[0, 70_000], IndexWidth::U16);
        assert!(err.is_err());
    }

    #[test]
    fn u32_width_is_a_byte_copy() {
        let indices = [0u32, 1, u32::MAX];
        let bytes = narrow_indices(&indices, IndexWidth::U32).unwrap();
        assert_eq!(bytes.len(), 12);
        let roundtrip: &[u32] = bytemuck::cast_slice(&bytes);
        assert_eq!(roundtrip, &indices);
    }
}
