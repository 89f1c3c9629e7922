//! Error types for the rendering core
//!
//! All low-level Vulkan result codes are translated at the call site into
//! [`RenderError`] variants. Fatal conditions (no compatible memory type or
//! queue family, shader compile failure, unexpected API errors) propagate as
//! `Err` up to the application boundary, where [`abort_on_error`] provides
//! the single log-and-abort path. Stale-handle use is a programmer error and
//! panics loudly in the registries instead of flowing through here.

use ash::vk;
use thiserror::Error;

/// Rendering core error types
#[derive(Error, Debug)]
pub enum RenderError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// No memory type satisfies the requested property bits
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// The physical device lacks a required queue family
    #[error("No suitable queue family: {0}")]
    NoSuitableQueueFamily(&'static str),

    /// GLSL to SPIR-V compilation failed
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Context or resource initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Filesystem error (pipeline cache, settings)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Terminate the process on a fatal rendering error.
///
/// A broken GPU resource invalidates every subsequent frame, so the
/// application boundary fails fast: log the error, then abort. There is no
/// retry policy for fatal conditions.
pub fn abort_on_error<T>(result: RenderResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            log::error!("fatal renderer error: {err}");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_family_error_names_the_missing_capability() {
        let err = RenderError::NoSuitableQueueFamily("graphics + present");
        assert_eq!(err.to_string(), "No suitable queue family: graphics + present");
    }
}
