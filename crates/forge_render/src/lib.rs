//! # Forge Render
//!
//! A Vulkan frame-submission and GPU-resource subsystem for real-time
//! rendering.
//!
//! ## Features
//!
//! - **Suballocated device memory**: large pool blocks carved by a free-list
//!   allocator, persistent mappings for host-visible memory
//! - **Handle-based registries**: buffers, textures, meshes, shaders,
//!   pipelines and uniform groups behind generation-checked handles
//! - **Reflection-driven pipelines**: GLSL compiled through shaderc, SPIR-V
//!   reflected for vertex inputs, descriptor layouts and push constants,
//!   with structural dedup of layouts and pipelines
//! - **Shared uniforms**: write camera or frame data once, observed by every
//!   material that declares the binding shared
//! - **Paced frames**: K frame slots in flight, a depth pre-pass and a
//!   forward MSAA pass per frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use forge_render::{Renderer, RendererSettings, SurfaceProvider};
//!
//! fn run(window: Box<dyn SurfaceProvider>) -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = RendererSettings::load("renderer.toml")?;
//!     let mut renderer = Renderer::new(window, settings)?;
//!     loop {
//!         // build resources, queue draws with renderer.draw(..)
//!         renderer.render()?;
//!     }
//! }
//! ```

pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptor;
pub mod draw;
pub mod error;
pub mod frame;
pub mod memory;
pub mod mesh;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod renderer;
pub mod settings;
pub mod shader;
pub mod swapchain;
pub mod texture;
pub mod uniform;

pub use ash::vk;

pub use buffer::BufferDesc;
pub use context::SurfaceProvider;
pub use draw::DrawCommand;
pub use error::{abort_on_error, RenderError, RenderResult};
pub use mesh::{IndexWidth, MeshDesc, VertexAttribute};
pub use pipeline::{DepthState, PipelineDesc};
pub use registry::{
    BufferHandle, MeshHandle, PipelineHandle, ShaderHandle, TextureHandle, UniformGroupHandle,
    UniformHandle,
};
pub use renderer::Renderer;
pub use settings::RendererSettings;
pub use shader::ShaderDesc;
pub use texture::{TextureDesc, TextureUsage};
