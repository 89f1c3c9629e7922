//! Renderer configuration
//!
//! Small TOML-backed settings block consumed once at renderer construction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

/// Renderer construction settings.
///
/// Loaded from a TOML file or built with [`Default`]. Read only when the
/// renderer (and swapchain) is created or rebuilt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Number of frames allowed in flight (round-robin frame slots)
    pub frames_in_flight: usize,
    /// MSAA sample count for the forward pass (1 disables the resolve)
    pub msaa_samples: u32,
    /// Prefer FIFO presentation (vsync) over MAILBOX
    pub vsync: bool,
    /// Where the driver pipeline cache blob is persisted
    pub pipeline_cache_path: PathBuf,
    /// Enable validation layers (debug builds only)
    pub validation: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            msaa_samples: 4,
            vsync: true,
            pipeline_cache_path: PathBuf::from("pipeline_cache.bin"),
            validation: cfg!(debug_assertions),
        }
    }
}

impl RendererSettings {
    /// Load settings from a TOML file.
    ///
    /// A missing file yields defaults; a present but malformed file is an
    /// error so a typo does not silently revert the configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> RenderResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| RenderError::InitializationFailed(format!(
            "failed to parse {}: {e}",
            path.display()
        )))
    }

    /// Save settings to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> RenderResult<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            RenderError::InvalidOperation { reason: format!("settings serialization: {e}") }
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = RendererSettings::default();
        assert_eq!(settings.frames_in_flight, 2);
        assert_eq!(settings.msaa_samples, 4);
        assert!(settings.vsync);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let settings: RendererSettings = toml::from_str("frames_in_flight = 3").unwrap();
        assert_eq!(settings.frames_in_flight, 3);
        assert_eq!(settings.msaa_samples, 4);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = RendererSettings::load("does/not/exist.toml").unwrap();
        assert_eq!(settings.frames_in_flight, 2);
    }
}
