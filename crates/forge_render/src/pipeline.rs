//! Graphics pipeline construction and deduplication
//!
//! Merges the vertex and fragment reflections of a shader program into one
//! pipeline interface, then builds descriptor-set layouts, the pipeline
//! layout and the pipelines through value-keyed dedup caches so identical
//! requests share one Vulkan object. Every pipeline gets two variants built
//! against one layout: the forward-pass pipeline and a vertex-only variant
//! for the depth pre-pass.
//!
//! A `vk::PipelineCache` is preloaded from disk at startup and written back
//! at shutdown; a missing or corrupt blob just means a cold cache.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};

use ash::{vk, Device};
use log::{debug, warn};

use crate::error::{RenderError, RenderResult};
use crate::registry::{PipelineHandle, Registry, ShaderHandle};
use crate::shader::{BindingKind, ShaderInstance, ShaderReflection};

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Depth test configuration for the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        // Pairs with the pre-pass: depth is already resolved, so the forward
        // pass only needs an equality test.
        Self {
            test: true,
            write: false,
            compare: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

/// Description of a pipeline to build.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    /// Name used in logs
    pub name: &'a str,
    /// Compiled shader program
    pub shader: ShaderHandle,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub color_write_mask: vk::ColorComponentFlags,
    pub depth: DepthState,
    /// Names of bindings backed by process-wide shared uniform storage
    pub shared_uniforms: &'a [&'a str],
}

impl Default for PipelineDesc<'_> {
    fn default() -> Self {
        Self {
            name: "",
            shader: ShaderHandle::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            depth: DepthState::default(),
            shared_uniforms: &[],
        }
    }
}

/// A binding merged across shader stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBinding {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub kind: BindingKind,
    pub count: u32,
    /// Byte size for buffer blocks
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
    /// Backed by the shared uniform table instead of per-group storage
    pub shared: bool,
}

/// A push-constant range merged across stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPushRange {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
    /// Backed by the shared uniform table instead of per-group staging
    pub shared: bool,
}

/// The merged resource interface of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineInterface {
    /// Bindings grouped by descriptor set index
    pub sets: BTreeMap<u32, Vec<MergedBinding>>,
    /// Push-constant ranges, ascending by offset
    pub push_constants: Vec<MergedPushRange>,
}

/// A built pipeline: forward and depth-only variants over one layout.
pub struct PipelineInstance {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) depth_pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) set_layouts: BTreeMap<u32, vk::DescriptorSetLayout>,
    /// Merged shader interface
    pub interface: PipelineInterface,
    /// The shader program this pipeline was built from
    pub shader: ShaderHandle,
    /// Name from the build description
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SetLayoutKey {
    bindings: Vec<(u32, vk::DescriptorType, u32, vk::ShaderStageFlags)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineLayoutKey {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_ranges: Vec<(vk::ShaderStageFlags, u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    layout: vk::PipelineLayout,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    render_pass: vk::RenderPass,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    color_write_mask: vk::ColorComponentFlags,
    samples: vk::SampleCountFlags,
    depth: DepthState,
    depth_only: bool,
}

/// Builds pipelines and owns the dedup caches behind them.
pub struct PipelineRegistry {
    device: Device,
    cache: vk::PipelineCache,
    cache_path: PathBuf,
    set_layouts: HashMap<SetLayoutKey, vk::DescriptorSetLayout>,
    layouts: HashMap<PipelineLayoutKey, vk::PipelineLayout>,
    built: HashMap<PipelineKey, vk::Pipeline>,
    pipelines: Registry<PipelineHandle, PipelineInstance>,
}

impl PipelineRegistry {
    pub fn new(device: Device, cache_path: &Path) -> RenderResult<Self> {
        let blob = load_cache_blob(cache_path);
        let cache_info = vk::PipelineCacheCreateInfo::builder().initial_data(&blob);
        let cache = unsafe {
            device
                .create_pipeline_cache(&cache_info, None)
                .map_err(RenderError::Api)?
        };
        Ok(Self {
            device,
            cache,
            cache_path: cache_path.to_path_buf(),
            set_layouts: HashMap::new(),
            layouts: HashMap::new(),
            built: HashMap::new(),
            pipelines: Registry::new("pipeline"),
        })
    }

    /// Build (or reuse) the pipelines for `desc` and register an instance.
    ///
    /// `render_pass`/`depth_pass` are the forward and pre-pass render passes
    /// the variants are compiled against; `samples` is the forward pass
    /// sample count.
    pub fn build(
        &mut self,
        desc: &PipelineDesc,
        shader: &ShaderInstance,
        render_pass: vk::RenderPass,
        depth_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
    ) -> RenderResult<PipelineHandle> {
        let interface = merge_interfaces(
            &shader.vertex_reflection,
            &shader.fragment_reflection,
            desc.shared_uniforms,
        )?;

        let set_layouts = self.get_or_create_set_layouts(&interface)?;
        let layout = self.get_or_create_layout(&set_layouts, &interface)?;

        let forward_key = PipelineKey {
            layout,
            vertex_module: shader.vertex_module,
            fragment_module: shader.fragment_module,
            render_pass,
            topology: desc.topology,
            polygon_mode: desc.polygon_mode,
            cull_mode: desc.cull_mode,
            color_write_mask: desc.color_write_mask,
            samples,
            depth: desc.depth,
            depth_only: false,
        };
        let depth_key = PipelineKey {
            render_pass: depth_pass,
            // The pre-pass is what populates depth, regardless of how the
            // forward pass tests it.
            depth: DepthState {
                test: true,
                write: true,
                compare: vk::CompareOp::LESS,
            },
            depth_only: true,
            ..forward_key.clone()
        };

        let pipeline = self.get_or_create_pipeline(&forward_key, shader)?;
        let depth_pipeline = self.get_or_create_pipeline(&depth_key, shader)?;

        debug!(
            "pipeline '{}': {} sets, {} push ranges",
            desc.name,
            interface.sets.len(),
            interface.push_constants.len()
        );

        Ok(self.pipelines.insert(PipelineInstance {
            pipeline,
            depth_pipeline,
            layout,
            set_layouts,
            interface,
            shader: desc.shader,
            name: desc.name.to_string(),
        }))
    }

    /// Look up a pipeline. Panics on a dead handle.
    pub fn get(&self, handle: PipelineHandle) -> &PipelineInstance {
        self.pipelines.get(handle)
    }

    pub fn contains(&self, handle: PipelineHandle) -> bool {
        self.pipelines.contains(handle)
    }

    /// Drop an instance. The underlying Vulkan objects stay in the dedup
    /// caches (other instances may share them) until shutdown.
    pub fn destroy(&mut self, handle: PipelineHandle) {
        self.pipelines.remove(handle);
    }

    /// Persist the pipeline cache and destroy every cached Vulkan object.
    pub fn destroy_all(&mut self) {
        self.save_cache();
        self.pipelines.drain();
        for (_, pipeline) in self.built.drain() {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
        for (_, layout) in self.layouts.drain() {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
        }
        for (_, layout) in self.set_layouts.drain() {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
        unsafe { self.device.destroy_pipeline_cache(self.cache, None) };
        self.cache = vk::PipelineCache::null();
    }

    fn save_cache(&self) {
        let blob = match unsafe { self.device.get_pipeline_cache_data(self.cache) } {
            Ok(blob) => blob,
            Err(e) => {
                warn!("failed to read pipeline cache: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.cache_path, &blob) {
            warn!("failed to write {}: {e}", self.cache_path.display());
        } else {
            debug!("pipeline cache saved ({} bytes)", blob.len());
        }
    }

    fn get_or_create_set_layouts(
        &mut self,
        interface: &PipelineInterface,
    ) -> RenderResult<BTreeMap<u32, vk::DescriptorSetLayout>> {
        let mut layouts = BTreeMap::new();
        for (&set, bindings) in &interface.sets {
            let key = SetLayoutKey {
                bindings: bindings
                    .iter()
                    .map(|b| (b.binding, b.kind.descriptor_type(), b.count, b.stages))
                    .collect(),
            };
            layouts.insert(set, self.get_or_create_set_layout(key)?);
        }
        Ok(layouts)
    }

    fn get_or_create_set_layout(
        &mut self,
        key: SetLayoutKey,
    ) -> RenderResult<vk::DescriptorSetLayout> {
        if let Some(&layout) = self.set_layouts.get(&key) {
            return Ok(layout);
        }
        let bindings: Vec<_> = key
            .bindings
            .iter()
            .map(|&(binding, ty, count, stages)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(count)
                    .stage_flags(stages)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(RenderError::Api)?
        };
        self.set_layouts.insert(key, layout);
        Ok(layout)
    }

    fn get_or_create_layout(
        &mut self,
        set_layouts: &BTreeMap<u32, vk::DescriptorSetLayout>,
        interface: &PipelineInterface,
    ) -> RenderResult<vk::PipelineLayout> {
        // Set indices may be sparse; gaps are filled with an empty layout.
        let max_set = set_layouts.keys().next_back().copied();
        let mut dense = Vec::new();
        if let Some(max_set) = max_set {
            let empty = self.get_or_create_set_layout(SetLayoutKey { bindings: Vec::new() })?;
            for set in 0..=max_set {
                dense.push(set_layouts.get(&set).copied().unwrap_or(empty));
            }
        }

        let push_ranges: Vec<_> = interface
            .push_constants
            .iter()
            .map(|range| (range.stages, range.offset, range.size))
            .collect();
        let key = PipelineLayoutKey {
            set_layouts: dense.clone(),
            push_ranges: push_ranges.clone(),
        };
        if let Some(&layout) = self.layouts.get(&key) {
            return Ok(layout);
        }

        let vk_ranges: Vec<_> = push_ranges
            .iter()
            .map(|&(stages, offset, size)| {
                vk::PushConstantRange::builder()
                    .stage_flags(stages)
                    .offset(offset)
                    .size(size)
                    .build()
            })
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&dense)
            .push_constant_ranges(&vk_ranges);
        let layout = unsafe {
            self.device
                .create_pipeline_layout(&layout_info, None)
                .map_err(RenderError::Api)?
        };
        self.layouts.insert(key, layout);
        Ok(layout)
    }

    fn get_or_create_pipeline(
        &mut self,
        key: &PipelineKey,
        shader: &ShaderInstance,
    ) -> RenderResult<vk::Pipeline> {
        if let Some(&pipeline) = self.built.get(key) {
            return Ok(pipeline);
        }

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(key.vertex_module)
            .name(ENTRY_POINT)
            .build()];
        if !key.depth_only {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(key.fragment_module)
                    .name(ENTRY_POINT)
                    .build(),
            );
        }

        let (binding_descriptions, attribute_descriptions) =
            vertex_input_state(&shader.vertex_reflection);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(key.topology);

        // Viewport and scissor are dynamic so swapchain resizes never touch
        // pipelines.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(key.polygon_mode)
            .cull_mode(key.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(key.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(key.depth.test)
            .depth_write_enable(key.depth.write)
            .depth_compare_op(key.depth.compare);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(false)
            .color_write_mask(key.color_write_mask)
            .build()];
        let attachments: &[vk::PipelineColorBlendAttachmentState] =
            if key.depth_only { &[] } else { &blend_attachments };
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(key.layout)
            .render_pass(key.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(self.cache, &[pipeline_info.build()], None)
                .map_err(|(_, e)| RenderError::Api(e))?
        };
        let pipeline = pipelines[0];
        self.built.insert(key.clone(), pipeline);
        Ok(pipeline)
    }
}

/// Merge the per-stage reflections of a shader program.
///
/// Bindings repeated across stages must agree on type, count and size and
/// get their stage flags OR-ed; the same goes for push ranges sharing an
/// offset. Bindings and push blocks named in `shared` are marked for the
/// shared uniform table.
pub fn merge_interfaces(
    vertex: &ShaderReflection,
    fragment: &ShaderReflection,
    shared: &[&str],
) -> RenderResult<PipelineInterface> {
    let mut interface = PipelineInterface::default();

    let stage_bindings = [
        (vk::ShaderStageFlags::VERTEX, &vertex.bindings),
        (vk::ShaderStageFlags::FRAGMENT, &fragment.bindings),
    ];
    for (stage, bindings) in stage_bindings {
        for binding in bindings {
            let set = interface.sets.entry(binding.set).or_default();
            if let Some(existing) = set.iter_mut().find(|b| b.binding == binding.binding) {
                if existing.kind != binding.kind
                    || existing.count != binding.count
                    || existing.size != binding.size
                {
                    return Err(RenderError::InvalidOperation {
                        reason: format!(
                            "binding (set {}, binding {}) differs between stages",
                            binding.set, binding.binding
                        ),
                    });
                }
                existing.stages |= stage;
            } else {
                set.push(MergedBinding {
                    set: binding.set,
                    binding: binding.binding,
                    name: binding.name.clone(),
                    kind: binding.kind,
                    count: binding.count,
                    size: binding.size,
                    stages: stage,
                    shared: shared.contains(&binding.name.as_str()),
                });
            }
        }
    }
    for bindings in interface.sets.values_mut() {
        bindings.sort_by_key(|b| b.binding);
    }

    let stage_ranges = [
        (vk::ShaderStageFlags::VERTEX, &vertex.push_constants),
        (vk::ShaderStageFlags::FRAGMENT, &fragment.push_constants),
    ];
    for (stage, ranges) in stage_ranges {
        for range in ranges {
            if let Some(existing) = interface
                .push_constants
                .iter_mut()
                .find(|r| r.offset == range.offset)
            {
                if existing.size != range.size {
                    return Err(RenderError::InvalidOperation {
                        reason: format!(
                            "push-constant range at offset {} differs between stages",
                            range.offset
                        ),
                    });
                }
                existing.stages |= stage;
            } else {
                interface.push_constants.push(MergedPushRange {
                    name: range.name.clone(),
                    offset: range.offset,
                    size: range.size,
                    stages: stage,
                    shared: shared.contains(&range.name.as_str()),
                });
            }
        }
    }
    interface.push_constants.sort_by_key(|r| r.offset);

    Ok(interface)
}

/// Vertex binding/attribute descriptions from a vertex reflection.
///
/// Meshes carry one vertex buffer per attribute, bound in location order, so
/// each input becomes its own binding with a stride of the format size.
pub fn vertex_input_state(
    reflection: &ShaderReflection,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut bindings = Vec::with_capacity(reflection.vertex_inputs.len());
    let mut attributes = Vec::with_capacity(reflection.vertex_inputs.len());
    for (index, input) in reflection.vertex_inputs.iter().enumerate() {
        let binding = index as u32;
        bindings.push(vk::VertexInputBindingDescription {
            binding,
            stride: format_size(input.format),
            input_rate: input.rate,
        });
        attributes.push(vk::VertexInputAttributeDescription {
            location: input.location,
            binding,
            format: input.format,
            offset: 0,
        });
    }
    (bindings, attributes)
}

/// Byte size of a vertex attribute format.
pub fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_SINT | vk::Format::R32_UINT => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R32G32_SINT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_SINT | vk::Format::R32G32B32_UINT => {
            12
        }
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R32G32B32A32_UINT => 16,
        _ => 0,
    }
}

fn load_cache_blob(path: &Path) -> Vec<u8> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("failed to read {}: {e}", path.display());
            return Vec::new();
        }
    };
    if !cache_blob_plausible(&blob) {
        warn!("{} is not a pipeline cache, starting cold", path.display());
        return Vec::new();
    }
    debug!("pipeline cache loaded ({} bytes)", blob.len());
    blob
}

/// Sanity-check the cache header before handing the blob to the driver;
/// drivers reject mismatched caches themselves, but not arbitrary garbage.
fn cache_blob_plausible(blob: &[u8]) -> bool {
    if blob.len() < 32 {
        return false;
    }
    let header_len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let header_version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    header_len >= 32 && (header_len as usize) <= blob.len() && header_version == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{ReflectedBinding, ReflectedPushConstant, ReflectedVertexInput};

    fn binding(set: u32, slot: u32, name: &str, kind: BindingKind, size: u32) -> ReflectedBinding {
        ReflectedBinding {
            set,
            binding: slot,
            name: name.to_string(),
            kind,
            count: 1,
            size,
        }
    }

    #[test]
    fn merge_ors_stage_flags_for_repeated_bindings() {
        let vertex = ShaderReflection {
            bindings: vec![binding(0, 0, "u_camera", BindingKind::UniformBuffer, 128)],
            ..Default::default()
        };
        let fragment = ShaderReflection {
            bindings: vec![
                binding(0, 0, "u_camera", BindingKind::UniformBuffer, 128),
                binding(1, 0, "u_albedo", BindingKind::CombinedImageSampler, 0),
            ],
            ..Default::default()
        };

        let interface = merge_interfaces(&vertex, &fragment, &[]).unwrap();
        assert_eq!(interface.sets.len(), 2);
        let camera = &interface.sets[&0][0];
        assert_eq!(
            camera.stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        let albedo = &interface.sets[&1][0];
        assert_eq!(albedo.stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn merge_flags_shared_bindings_by_name() {
        let vertex = ShaderReflection {
            bindings: vec![
                binding(0, 0, "u_camera", BindingKind::UniformBuffer, 128),
                binding(0, 1, "u_model", BindingKind::UniformBuffer, 64),
            ],
            ..Default::default()
        };
        let interface =
            merge_interfaces(&vertex, &ShaderReflection::default(), &["u_camera"]).unwrap();
        let bindings = &interface.sets[&0];
        assert!(bindings[0].shared);
        assert!(!bindings[1].shared);
    }

    #[test]
    fn merge_rejects_conflicting_binding_types() {
        let vertex = ShaderReflection {
            bindings: vec![binding(0, 0, "u_data", BindingKind::UniformBuffer, 64)],
            ..Default::default()
        };
        let fragment = ShaderReflection {
            bindings: vec![binding(0, 0, "u_data", BindingKind::StorageBuffer, 64)],
            ..Default::default()
        };
        assert!(merge_interfaces(&vertex, &fragment, &[]).is_err());
    }

    #[test]
    fn merge_combines_push_ranges_at_one_offset() {
        let push = ReflectedPushConstant {
            name: "u_push".to_string(),
            offset: 0,
            size: 80,
        };
        let vertex = ShaderReflection {
            push_constants: vec![push.clone()],
            ..Default::default()
        };
        let fragment = ShaderReflection {
            push_constants: vec![push],
            ..Default::default()
        };
        let interface = merge_interfaces(&vertex, &fragment, &[]).unwrap();
        assert_eq!(interface.push_constants.len(), 1);
        assert_eq!(
            interface.push_constants[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn vertex_inputs_become_one_binding_per_attribute() {
        let reflection = ShaderReflection {
            vertex_inputs: vec![
                ReflectedVertexInput {
                    location: 0,
                    name: "position".to_string(),
                    format: vk::Format::R32G32B32_SFLOAT,
                    rate: vk::VertexInputRate::VERTEX,
                },
                ReflectedVertexInput {
                    location: 1,
                    name: "inst_tint".to_string(),
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    rate: vk::VertexInputRate::INSTANCE,
                },
            ],
            ..Default::default()
        };
        let (bindings, attributes) = vertex_input_state(&reflection);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].stride, 12);
        assert_eq!(bindings[1].stride, 16);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(attributes[1].binding, 1);
        assert_eq!(attributes[1].offset, 0);
    }

    #[test]
    fn rejects_short_or_garbage_cache_blobs() {
        assert!(!cache_blob_plausible(&[0; 8]));
        assert!(!cache_blob_plausible(&[0xff; 64]));
        let mut plausible = vec![0u8; 64];
        plausible[0] = 32; // header length
        plausible[4] = 1; // header version
        assert!(cache_blob_plausible(&plausible));
    }
}
