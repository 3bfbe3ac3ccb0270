// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use crate::backend::blas::{BlasSettings, DEFAULT_BATCH_CEILING};
use crate::backend::swapchain::SurfaceSettings;
use crate::renderer::RendererSettings;
use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub acceleration: AccelerationConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "RT Frame Core".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Which frame recorder drives the swap images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    Raster,
    RayTracing,
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub renderer: RendererKind,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            renderer: RendererKind::Raster,
        }
    }
}

/// Acceleration structure build settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AccelerationConfig {
    pub batch_ceiling_bytes: u64,
    pub compaction: bool,
    pub prefer_fast_trace: bool,
    pub allow_update: bool,
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        Self {
            batch_ceiling_bytes: DEFAULT_BATCH_CEILING,
            compaction: true,
            prefer_fast_trace: true,
            allow_update: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "rt_frame_core.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if config.graphics.max_frames_in_flight == 0 {
            log::warn!("max_frames_in_flight must be at least 1; using 1");
            config.graphics.max_frames_in_flight = 1;
        }
        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            frames_in_flight: self.graphics.max_frames_in_flight.max(1),
            surface: SurfaceSettings {
                preferred_present_mode: self.get_present_mode(),
            },
            bottom_level: BlasSettings {
                batch_ceiling: self.acceleration.batch_ceiling_bytes,
                compaction: self.acceleration.compaction,
                prefer_fast_trace: self.acceleration.prefer_fast_trace,
            },
            allow_update: self.acceleration.allow_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.graphics.renderer, RendererKind::Raster);
        assert_eq!(config.acceleration.batch_ceiling_bytes, 256_000_000);
        assert!(config.acceleration.compaction);
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "FIFO"
            renderer = "ray_tracing"
            max_frames_in_flight = 3

            [acceleration]
            batch_ceiling_bytes = 1000
            allow_update = false
            "#,
        )
        .unwrap();

        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.renderer, RendererKind::RayTracing);

        let settings = config.renderer_settings();
        assert_eq!(settings.frames_in_flight, 3);
        assert_eq!(settings.bottom_level.batch_ceiling, 1000);
        assert!(settings.bottom_level.compaction);
        assert!(!settings.allow_update);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = Config::parse("[graphics]\nmax_frames_in_flight = 0\n").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 1);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"warp\"\n").unwrap();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[graphics\n").is_err());
        assert!(Config::parse("[graphics]\nrenderer = \"path_tracing\"\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.window.width, 1280);
    }
}
