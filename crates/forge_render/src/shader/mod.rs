//! Shader compilation and registry
//!
//! Compiles GLSL vertex/fragment pairs to SPIR-V with shaderc. Each stage is
//! compiled twice: once unoptimized so [`reflect`] can read names and layout
//! decorations, and once at full optimization for the module handed to the
//! device. Reflection data drives vertex input, descriptor layout and
//! push-constant setup in the pipeline layer.

pub mod reflect;

pub use reflect::{
    BindingKind, ReflectedBinding, ReflectedPushConstant, ReflectedVertexInput, ShaderReflection,
    ShaderStage,
};

use ash::{vk, Device};
use log::debug;

use crate::error::{RenderError, RenderResult};
use crate::registry::{Registry, ShaderHandle};

/// Description of a shader program to compile.
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    /// Name used in logs and compile diagnostics
    pub name: &'a str,
    /// GLSL vertex stage source
    pub vertex_source: &'a str,
    /// GLSL fragment stage source
    pub fragment_source: &'a str,
}

/// A compiled shader program with its reflected interface.
pub struct ShaderInstance {
    pub(crate) vertex_module: vk::ShaderModule,
    pub(crate) fragment_module: vk::ShaderModule,
    /// Reflection of the vertex stage
    pub vertex_reflection: ShaderReflection,
    /// Reflection of the fragment stage
    pub fragment_reflection: ShaderReflection,
    /// Name from the build description
    pub name: String,
}

impl ShaderInstance {
    /// The compiled module for a stage.
    pub fn module(&self, stage: ShaderStage) -> vk::ShaderModule {
        match stage {
            ShaderStage::Vertex => self.vertex_module,
            ShaderStage::Fragment => self.fragment_module,
        }
    }
}

/// Owns compiled shader modules and their reflection data.
pub struct ShaderRegistry {
    device: Device,
    compiler: shaderc::Compiler,
    shaders: Registry<ShaderHandle, ShaderInstance>,
}

impl ShaderRegistry {
    pub fn new(device: Device) -> RenderResult<Self> {
        let compiler = shaderc::Compiler::new().ok_or_else(|| {
            RenderError::InitializationFailed("shaderc compiler unavailable".to_string())
        })?;
        Ok(Self {
            device,
            compiler,
            shaders: Registry::new("shader"),
        })
    }

    /// Compile a vertex/fragment pair and register it.
    pub fn build(&mut self, desc: &ShaderDesc) -> RenderResult<ShaderHandle> {
        let vertex_reflection = self.reflect_stage(desc.name, desc.vertex_source, ShaderStage::Vertex)?;
        let fragment_reflection =
            self.reflect_stage(desc.name, desc.fragment_source, ShaderStage::Fragment)?;

        let vertex_words = self.compile_stage(
            desc.name,
            desc.vertex_source,
            ShaderStage::Vertex,
            shaderc::OptimizationLevel::Performance,
        )?;
        let fragment_words = self.compile_stage(
            desc.name,
            desc.fragment_source,
            ShaderStage::Fragment,
            shaderc::OptimizationLevel::Performance,
        )?;

        let vertex_module = self.create_module(&vertex_words)?;
        let fragment_module = match self.create_module(&fragment_words) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        debug!(
            "compiled shader '{}': {} vertex inputs, {} bindings",
            desc.name,
            vertex_reflection.vertex_inputs.len(),
            vertex_reflection.bindings.len() + fragment_reflection.bindings.len(),
        );

        Ok(self.shaders.insert(ShaderInstance {
            vertex_module,
            fragment_module,
            vertex_reflection,
            fragment_reflection,
            name: desc.name.to_string(),
        }))
    }

    /// Look up a shader. Panics on a dead handle.
    pub fn get(&self, handle: ShaderHandle) -> &ShaderInstance {
        self.shaders.get(handle)
    }

    pub fn contains(&self, handle: ShaderHandle) -> bool {
        self.shaders.contains(handle)
    }

    /// Destroy a shader's modules. Panics on double destroy.
    pub fn destroy(&mut self, handle: ShaderHandle) {
        let shader = self.shaders.remove(handle);
        unsafe {
            self.device.destroy_shader_module(shader.vertex_module, None);
            self.device.destroy_shader_module(shader.fragment_module, None);
        }
    }

    /// Destroy every remaining shader.
    pub fn destroy_all(&mut self) {
        for shader in self.shaders.drain() {
            unsafe {
                self.device.destroy_shader_module(shader.vertex_module, None);
                self.device.destroy_shader_module(shader.fragment_module, None);
            }
        }
    }

    /// Compile without optimization and reflect the result. The unoptimized
    /// module keeps OpName instructions, which reflection needs for input
    /// rates and binding names.
    fn reflect_stage(
        &mut self,
        name: &str,
        source: &str,
        stage: ShaderStage,
    ) -> RenderResult<ShaderReflection> {
        let words = self.compile_stage(name, source, stage, shaderc::OptimizationLevel::Zero)?;
        reflect::reflect(&words, stage)
    }

    fn compile_stage(
        &mut self,
        name: &str,
        source: &str,
        stage: ShaderStage,
        optimization: shaderc::OptimizationLevel,
    ) -> RenderResult<Vec<u32>> {
        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
        };
        let mut options = shaderc::CompileOptions::new().ok_or_else(|| {
            RenderError::InitializationFailed("shaderc compile options unavailable".to_string())
        })?;
        options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);
        options.set_optimization_level(optimization);

        let artifact = self
            .compiler
            .compile_into_spirv(source, kind, name, "main", Some(&options))
            .map_err(|e| RenderError::ShaderCompilation(format!("{name}: {e}")))?;
        Ok(artifact.as_binary().to_vec())
    }

    fn create_module(&self, words: &[u32]) -> RenderResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        unsafe {
            self.device
                .create_shader_module(&create_info, None)
                .map_err(RenderError::Api)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX_SOURCE: &str = r#"
        #version 450
        layout(location = 0) in vec3 position;
        layout(location = 1) in vec2 uv;
        layout(location = 2) in vec4 inst_tint;
        layout(set = 0, binding = 0) uniform Camera {
            mat4 view_proj;
            mat4 view;
        } u_camera;
        layout(push_constant) uniform Push {
            mat4 model;
            vec4 tint;
        } u_push;
        layout(location = 0) out vec2 v_uv;
        layout(location = 1) out vec4 v_tint;
        void main() {
            v_uv = uv;
            v_tint = inst_tint + u_camera.view[0] * 0.0 + u_push.tint * 0.0;
            gl_Position = u_camera.view_proj * u_push.model * vec4(position, 1.0);
        }
    "#;

    const FRAGMENT_SOURCE: &str = r#"
        #version 450
        layout(location = 0) in vec2 v_uv;
        layout(location = 1) in vec4 v_tint;
        layout(set = 1, binding = 0) uniform Material {
            vec4 base_color;
            float roughness;
        } u_material;
        layout(set = 1, binding = 1) uniform sampler2D u_albedo;
        layout(location = 0) out vec4 out_color;
        void main() {
            out_color = texture(u_albedo, v_uv) * u_material.base_color * v_tint
                + u_material.roughness * 0.0;
        }
    "#;

    fn compile(source: &str, stage: ShaderStage) -> Vec<u32> {
        let mut compiler = shaderc::Compiler::new().unwrap();
        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
        };
        let mut options = shaderc::CompileOptions::new().unwrap();
        options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);
        options.set_optimization_level(shaderc::OptimizationLevel::Zero);
        compiler
            .compile_into_spirv(source, kind, "test", "main", Some(&options))
            .unwrap()
            .as_binary()
            .to_vec()
    }

    #[test]
    fn vertex_inputs_reflect_location_format_and_rate() {
        let words = compile(VERTEX_SOURCE, ShaderStage::Vertex);
        let reflection = reflect::reflect(&words, ShaderStage::Vertex).unwrap();

        assert_eq!(reflection.vertex_inputs.len(), 3);
        let position = &reflection.vertex_inputs[0];
        assert_eq!(position.location, 0);
        assert_eq!(position.name, "position");
        assert_eq!(position.format, ash::vk::Format::R32G32B32_SFLOAT);
        assert_eq!(position.rate, ash::vk::VertexInputRate::VERTEX);

        let uv = &reflection.vertex_inputs[1];
        assert_eq!(uv.format, ash::vk::Format::R32G32_SFLOAT);

        let tint = &reflection.vertex_inputs[2];
        assert_eq!(tint.name, "inst_tint");
        assert_eq!(tint.format, ash::vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(tint.rate, ash::vk::VertexInputRate::INSTANCE);
    }

    #[test]
    fn uniform_block_size_covers_all_members() {
        let words = compile(VERTEX_SOURCE, ShaderStage::Vertex);
        let reflection = reflect::reflect(&words, ShaderStage::Vertex).unwrap();

        assert_eq!(reflection.bindings.len(), 1);
        let camera = &reflection.bindings[0];
        assert_eq!(camera.set, 0);
        assert_eq!(camera.binding, 0);
        assert_eq!(camera.name, "u_camera");
        assert_eq!(camera.kind, BindingKind::UniformBuffer);
        assert_eq!(camera.count, 1);
        // Two column-major mat4s at strides of 16.
        assert_eq!(camera.size, 128);
    }

    #[test]
    fn push_constant_block_reflects_offset_and_size() {
        let words = compile(VERTEX_SOURCE, ShaderStage::Vertex);
        let reflection = reflect::reflect(&words, ShaderStage::Vertex).unwrap();

        assert_eq!(reflection.push_constants.len(), 1);
        let push = &reflection.push_constants[0];
        assert_eq!(push.name, "u_push");
        assert_eq!(push.offset, 0);
        assert_eq!(push.size, 80);
    }

    #[test]
    fn fragment_bindings_include_sampler_and_padded_block() {
        let words = compile(FRAGMENT_SOURCE, ShaderStage::Fragment);
        let reflection = reflect::reflect(&words, ShaderStage::Fragment).unwrap();

        assert!(reflection.vertex_inputs.is_empty());
        assert_eq!(reflection.bindings.len(), 2);

        let material = &reflection.bindings[0];
        assert_eq!((material.set, material.binding), (1, 0));
        assert_eq!(material.kind, BindingKind::UniformBuffer);
        // vec4 + float rounds up to a 16-byte boundary.
        assert_eq!(material.size, 32);

        let albedo = &reflection.bindings[1];
        assert_eq!((albedo.set, albedo.binding), (1, 1));
        assert_eq!(albedo.name, "u_albedo");
        assert_eq!(albedo.kind, BindingKind::CombinedImageSampler);
        assert_eq!(albedo.count, 1);
        assert_eq!(albedo.size, 0);
    }

    #[test]
    fn reflected_camera_block_matches_host_layout() {
        #[repr(C)]
        #[allow(dead_code)]
        struct CameraBlock {
            view_proj: nalgebra::Matrix4<f32>,
            view: nalgebra::Matrix4<f32>,
        }

        let words = compile(VERTEX_SOURCE, ShaderStage::Vertex);
        let reflection = reflect::reflect(&words, ShaderStage::Vertex).unwrap();
        let camera = &reflection.bindings[0];
        assert_eq!(camera.size as usize, std::mem::size_of::<CameraBlock>());
    }

    #[test]
    fn rejects_non_spirv_words() {
        let err = reflect::reflect(&[0, 1, 2, 3, 4, 5], ShaderStage::Vertex);
        assert!(err.is_err());
    }
}
