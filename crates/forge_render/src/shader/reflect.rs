//! SPIR-V reflection
//!
//! Walks the SPIR-V word stream of an unoptimized module and extracts the
//! interface the pipeline layer needs: vertex inputs (location, format,
//! input rate), descriptor bindings grouped by set (name, type, count, byte
//! size) and push-constant blocks (name, offset, size). Buffer block sizes
//! come from the `Offset`/`MatrixStride`/`ArrayStride` decorations the
//! compiler emits, so no std140 layout rules are re-derived here.
//!
//! Only the instructions reflection cares about are decoded; everything
//! else is skipped by word count.

use std::collections::HashMap;

use ash::vk;

use crate::error::{RenderError, RenderResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

// Opcodes
const OP_NAME: u32 = 5;
const OP_TYPE_BOOL: u32 = 20;
const OP_TYPE_INT: u32 = 21;
const OP_TYPE_FLOAT: u32 = 22;
const OP_TYPE_VECTOR: u32 = 23;
const OP_TYPE_MATRIX: u32 = 24;
const OP_TYPE_IMAGE: u32 = 25;
const OP_TYPE_SAMPLER: u32 = 26;
const OP_TYPE_SAMPLED_IMAGE: u32 = 27;
const OP_TYPE_ARRAY: u32 = 28;
const OP_TYPE_RUNTIME_ARRAY: u32 = 29;
const OP_TYPE_STRUCT: u32 = 30;
const OP_TYPE_POINTER: u32 = 32;
const OP_CONSTANT: u32 = 43;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;
const OP_MEMBER_DECORATE: u32 = 72;

// Decorations
const DEC_BLOCK: u32 = 2;
const DEC_BUFFER_BLOCK: u32 = 3;
const DEC_ARRAY_STRIDE: u32 = 6;
const DEC_MATRIX_STRIDE: u32 = 7;
const DEC_BUILT_IN: u32 = 11;
const DEC_LOCATION: u32 = 30;
const DEC_BINDING: u32 = 33;
const DEC_DESCRIPTOR_SET: u32 = 34;
const DEC_OFFSET: u32 = 35;

// Storage classes
const SC_UNIFORM_CONSTANT: u32 = 0;
const SC_INPUT: u32 = 1;
const SC_UNIFORM: u32 = 2;
const SC_PUSH_CONSTANT: u32 = 9;
const SC_STORAGE_BUFFER: u32 = 12;

/// Shader stage a module was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
}

impl ShaderStage {
    /// The Vulkan stage flag bit.
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Descriptor kind of a reflected binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform buffer block
    UniformBuffer,
    /// Storage buffer block
    StorageBuffer,
    /// Combined image + sampler
    CombinedImageSampler,
    /// Sampled image without sampler
    SampledImage,
    /// Standalone sampler
    Sampler,
}

impl BindingKind {
    /// The matching Vulkan descriptor type.
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
        }
    }
}

/// A reflected descriptor binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReflectedBinding {
    /// Descriptor set index
    pub set: u32,
    /// Binding index within the set
    pub binding: u32,
    /// Instance name (falls back to the block type name)
    pub name: String,
    /// Descriptor kind
    pub kind: BindingKind,
    /// Array element count (1 for scalars)
    pub count: u32,
    /// Byte size for buffer blocks, 0 for images/samplers
    pub size: u32,
}

/// A reflected vertex input attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedVertexInput {
    /// Shader location
    pub location: u32,
    /// Attribute name
    pub name: String,
    /// Attribute format
    pub format: vk::Format,
    /// Per-vertex or per-instance; names prefixed `inst_` are per-instance
    pub rate: vk::VertexInputRate,
}

/// A reflected push-constant block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReflectedPushConstant {
    /// Instance name (falls back to the block type name)
    pub name: String,
    /// Byte offset of the block's first member
    pub offset: u32,
    /// Byte size from the first member to the end of the block
    pub size: u32,
}

/// The reflected interface of one shader module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Vertex inputs, sorted by location (vertex stage only)
    pub vertex_inputs: Vec<ReflectedVertexInput>,
    /// Descriptor bindings, sorted by (set, binding)
    pub bindings: Vec<ReflectedBinding>,
    /// Push-constant blocks
    pub push_constants: Vec<ReflectedPushConstant>,
}

#[derive(Debug, Clone)]
enum Ty {
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, cols: u32 },
    Image,
    Sampler,
    SampledImage,
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct { members: Vec<u32> },
    Pointer { storage: u32, pointee: u32 },
}

#[derive(Debug, Default, Clone)]
struct Decorations {
    location: Option<u32>,
    binding: Option<u32>,
    set: Option<u32>,
    array_stride: Option<u32>,
    builtin: bool,
    block: bool,
    buffer_block: bool,
}

#[derive(Default)]
struct Module {
    names: HashMap<u32, String>,
    types: HashMap<u32, Ty>,
    constants: HashMap<u32, u32>,
    decorations: HashMap<u32, Decorations>,
    member_offsets: HashMap<u32, Vec<(u32, u32)>>,
    member_matrix_strides: HashMap<(u32, u32), u32>,
    member_builtins: HashMap<u32, bool>,
    variables: Vec<(u32, u32, u32)>, // (id, pointer type id, storage class)
}

/// Reflect the interface of a SPIR-V module.
pub fn reflect(words: &[u32], stage: ShaderStage) -> RenderResult<ShaderReflection> {
    let module = parse(words)?;

    let mut reflection = ShaderReflection::default();

    for &(var_id, type_id, storage) in &module.variables {
        let var_dec = module.decorations.get(&var_id).cloned().unwrap_or_default();
        let pointee = match module.types.get(&type_id) {
            Some(Ty::Pointer { pointee, .. }) => *pointee,
            _ => continue,
        };

        match storage {
            SC_INPUT if stage == ShaderStage::Vertex => {
                if var_dec.builtin || module.is_builtin_struct(pointee) {
                    continue;
                }
                let location = match var_dec.location {
                    Some(location) => location,
                    None => continue,
                };
                let name = module.variable_name(var_id, pointee);
                let rate = if name.starts_with("inst_") {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                };
                // A matrix input occupies one location per column.
                for (column, format) in module.input_formats(pointee)?.into_iter().enumerate() {
                    reflection.vertex_inputs.push(ReflectedVertexInput {
                        location: location + column as u32,
                        name: name.clone(),
                        format,
                        rate,
                    });
                }
            }
            SC_UNIFORM | SC_STORAGE_BUFFER | SC_UNIFORM_CONSTANT => {
                let (element, count) = module.unwrap_array(pointee);
                let kind = match module.classify_binding(element, storage) {
                    Some(kind) => kind,
                    None => continue,
                };
                let size = match kind {
                    BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                        module.block_size(element)
                    }
                    _ => 0,
                };
                reflection.bindings.push(ReflectedBinding {
                    set: var_dec.set.unwrap_or(0),
                    binding: var_dec.binding.unwrap_or(0),
                    name: module.variable_name(var_id, element),
                    kind,
                    count,
                    size,
                });
            }
            SC_PUSH_CONSTANT => {
                let offset = module.block_base_offset(pointee);
                let size = module.block_size(pointee);
                reflection.push_constants.push(ReflectedPushConstant {
                    name: module.variable_name(var_id, pointee),
                    offset,
                    size: size - offset,
                });
            }
            _ => {}
        }
    }

    reflection.vertex_inputs.sort_by_key(|input| input.location);
    reflection.bindings.sort_by_key(|binding| (binding.set, binding.binding));
    reflection.push_constants.sort_by_key(|range| range.offset);
    Ok(reflection)
}

fn parse(words: &[u32]) -> RenderResult<Module> {
    if words.len() < 5 || words[0] != SPIRV_MAGIC {
        return Err(RenderError::InvalidOperation {
            reason: "not a SPIR-V module".to_string(),
        });
    }

    let mut module = Module::default();
    let mut cursor = 5;

    while cursor < words.len() {
        let word = words[cursor];
        let word_count = (word >> 16) as usize;
        let opcode = word & 0xffff;
        if word_count == 0 || cursor + word_count > words.len() {
            return Err(RenderError::InvalidOperation {
                reason: "malformed SPIR-V instruction stream".to_string(),
            });
        }
        let operands = &words[cursor + 1..cursor + word_count];

        match opcode {
            OP_NAME => {
                if let Some((&target, string_words)) = operands.split_first() {
                    module.names.insert(target, decode_string(string_words));
                }
            }
            OP_TYPE_BOOL => {
                module.types.insert(operands[0], Ty::Bool);
            }
            OP_TYPE_INT => {
                module
                    .types
                    .insert(operands[0], Ty::Int { width: operands[1], signed: operands[2] != 0 });
            }
            OP_TYPE_FLOAT => {
                module.types.insert(operands[0], Ty::Float { width: operands[1] });
            }
            OP_TYPE_VECTOR => {
                module
                    .types
                    .insert(operands[0], Ty::Vector { component: operands[1], count: operands[2] });
            }
            OP_TYPE_MATRIX => {
                module
                    .types
                    .insert(operands[0], Ty::Matrix { column: operands[1], cols: operands[2] });
            }
            OP_TYPE_IMAGE => {
                module.types.insert(operands[0], Ty::Image);
            }
            OP_TYPE_SAMPLER => {
                module.types.insert(operands[0], Ty::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                module.types.insert(operands[0], Ty::SampledImage);
            }
            OP_TYPE_ARRAY => {
                module
                    .types
                    .insert(operands[0], Ty::Array { element: operands[1], length_id: operands[2] });
            }
            OP_TYPE_RUNTIME_ARRAY => {
                module.types.insert(operands[0], Ty::RuntimeArray { element: operands[1] });
            }
            OP_TYPE_STRUCT => {
                module
                    .types
                    .insert(operands[0], Ty::Struct { members: operands[1..].to_vec() });
            }
            OP_TYPE_POINTER => {
                module
                    .types
                    .insert(operands[0], Ty::Pointer { storage: operands[1], pointee: operands[2] });
            }
            OP_CONSTANT => {
                // [result type, result id, value words...]; the low word is
                // enough for the array lengths reflection reads.
                if operands.len() >= 3 {
                    module.constants.insert(operands[1], operands[2]);
                }
            }
            OP_VARIABLE => {
                // [result type, result id, storage class, (initializer)]
                module.variables.push((operands[1], operands[0], operands[2]));
            }
            OP_DECORATE => {
                let target = operands[0];
                let entry = module.decorations.entry(target).or_default();
                match operands[1] {
                    DEC_BLOCK => entry.block = true,
                    DEC_BUFFER_BLOCK => entry.buffer_block = true,
                    DEC_BUILT_IN => entry.builtin = true,
                    DEC_LOCATION => entry.location = Some(operands[2]),
                    DEC_BINDING => entry.binding = Some(operands[2]),
                    DEC_DESCRIPTOR_SET => entry.set = Some(operands[2]),
                    DEC_ARRAY_STRIDE => entry.array_stride = Some(operands[2]),
                    _ => {}
                }
            }
            OP_MEMBER_DECORATE => {
                let (target, member) = (operands[0], operands[1]);
                match operands[2] {
                    DEC_OFFSET => {
                        module.member_offsets.entry(target).or_default().push((member, operands[3]));
                    }
                    DEC_MATRIX_STRIDE => {
                        module.member_matrix_strides.insert((target, member), operands[3]);
                    }
                    DEC_BUILT_IN => {
                        module.member_builtins.insert(target, true);
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        cursor += word_count;
    }

    Ok(module)
}

fn decode_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Module {
    fn variable_name(&self, var_id: u32, type_id: u32) -> String {
        match self.names.get(&var_id) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.names.get(&type_id).cloned().unwrap_or_default(),
        }
    }

    fn is_builtin_struct(&self, type_id: u32) -> bool {
        self.member_builtins.get(&type_id).copied().unwrap_or(false)
    }

    /// Peel one array level off a binding type, resolving the element count.
    fn unwrap_array(&self, type_id: u32) -> (u32, u32) {
        match self.types.get(&type_id) {
            Some(Ty::Array { element, length_id }) => {
                let count = self.constants.get(length_id).copied().unwrap_or(1);
                (*element, count.max(1))
            }
            _ => (type_id, 1),
        }
    }

    fn classify_binding(&self, type_id: u32, storage: u32) -> Option<BindingKind> {
        let dec = self.decorations.get(&type_id).cloned().unwrap_or_default();
        match self.types.get(&type_id)? {
            Ty::Struct { .. } => match storage {
                SC_STORAGE_BUFFER => Some(BindingKind::StorageBuffer),
                // Pre-1.3 SPIR-V marks SSBOs as Uniform + BufferBlock.
                SC_UNIFORM if dec.buffer_block => Some(BindingKind::StorageBuffer),
                SC_UNIFORM if dec.block => Some(BindingKind::UniformBuffer),
                _ => None,
            },
            Ty::SampledImage => Some(BindingKind::CombinedImageSampler),
            Ty::Image => Some(BindingKind::SampledImage),
            Ty::Sampler => Some(BindingKind::Sampler),
            _ => None,
        }
    }

    /// Byte size of a block type from its offset decorations, rounded up to
    /// 16 so dynamic offsets and whole-block writes stay legal.
    fn block_size(&self, type_id: u32) -> u32 {
        let size = self.type_size(type_id, None);
        (size + 15) & !15
    }

    fn block_base_offset(&self, type_id: u32) -> u32 {
        self.member_offsets
            .get(&type_id)
            .and_then(|offsets| offsets.iter().map(|&(_, offset)| offset).min())
            .unwrap_or(0)
    }

    fn type_size(&self, type_id: u32, matrix_stride: Option<u32>) -> u32 {
        match self.types.get(&type_id) {
            Some(Ty::Bool) => 4,
            Some(Ty::Int { width, .. }) | Some(Ty::Float { width }) => width / 8,
            Some(Ty::Vector { component, count }) => count * self.type_size(*component, None),
            Some(Ty::Matrix { column, cols }) => {
                let stride = matrix_stride
                    .unwrap_or_else(|| {
                        // Fallback: columns padded to vec4 as std140 does.
                        ((self.type_size(*column, None) + 15) & !15).max(16)
                    });
                cols * stride
            }
            Some(Ty::Array { element, length_id }) => {
                let length = self.constants.get(length_id).copied().unwrap_or(1).max(1);
                let stride = self
                    .decorations
                    .get(&type_id)
                    .and_then(|d| d.array_stride)
                    .unwrap_or_else(|| self.type_size(*element, None));
                length * stride
            }
            Some(Ty::RuntimeArray { .. }) => 0,
            Some(Ty::Struct { members }) => {
                let offsets = self.member_offsets.get(&type_id);
                let mut size = 0;
                for (index, &member) in members.iter().enumerate() {
                    let offset = offsets
                        .and_then(|o| {
                            o.iter().find(|&&(m, _)| m == index as u32).map(|&(_, off)| off)
                        })
                        .unwrap_or(size);
                    let stride = self.member_matrix_strides.get(&(type_id, index as u32)).copied();
                    size = size.max(offset + self.type_size(member, stride));
                }
                size
            }
            _ => 0,
        }
    }

    /// Formats for a vertex input type: one per location consumed.
    fn input_formats(&self, type_id: u32) -> RenderResult<Vec<vk::Format>> {
        match self.types.get(&type_id) {
            Some(Ty::Matrix { column, cols }) => {
                let column_format = self.scalar_vector_format(*column)?;
                Ok(vec![column_format; *cols as usize])
            }
            _ => Ok(vec![self.scalar_vector_format(type_id)?]),
        }
    }

    fn scalar_vector_format(&self, type_id: u32) -> RenderResult<vk::Format> {
        let (component, count) = match self.types.get(&type_id) {
            Some(Ty::Vector { component, count }) => (*component, *count),
            _ => (type_id, 1),
        };

        let format = match (self.types.get(&component), count) {
            (Some(Ty::Float { width: 32 }), 1) => vk::Format::R32_SFLOAT,
            (Some(Ty::Float { width: 32 }), 2) => vk::Format::R32G32_SFLOAT,
            (Some(Ty::Float { width: 32 }), 3) => vk::Format::R32G32B32_SFLOAT,
            (Some(Ty::Float { width: 32 }), 4) => vk::Format::R32G32B32A32_SFLOAT,
            (Some(Ty::Int { width: 32, signed: true }), 1) => vk::Format::R32_SINT,
            (Some(Ty::Int { width: 32, signed: true }), 2) => vk::Format::R32G32_SINT,
            (Some(Ty::Int { width: 32, signed: true }), 3) => vk::Format::R32G32B32_SINT,
            (Some(Ty::Int { width: 32, signed: true }), 4) => vk::Format::R32G32B32A32_SINT,
            (Some(Ty::Int { width: 32, signed: false }), 1) => vk::Format::R32_UINT,
            (Some(Ty::Int { width: 32, signed: false }), 2) => vk::Format::R32G32_UINT,
            (Some(Ty::Int { width: 32, signed: false }), 3) => vk::Format::R32G32B32_UINT,
            (Some(Ty::Int { width: 32, signed: false }), 4) => vk::Format::R32G32B32A32_UINT,
            _ => {
                return Err(RenderError::InvalidOperation {
                    reason: "unsupported vertex input type".to_string(),
                })
            }
        };
        Ok(format)
    }
}
