// Renderer context
//
// The one object the frame-loop driver holds. Owns the frame synchronizer and
// the acceleration structures; everything else is reached through it.

use crate::backend::blas::{BlasSettings, BottomLevelSet};
use crate::backend::commands::CommandScratch;
use crate::backend::frame::VulkanFrameBackend;
use crate::backend::recorder::{write_top_level_descriptor, DescriptorTarget, FrameRecorder, PipelineBinding};
use crate::backend::swapchain::SurfaceSettings;
use crate::backend::sync::{FrameStatus, FrameSynchronizer};
use crate::backend::tlas::{choose_build_mode, TlasBuildMode, TopLevelStructure, TopologyKey};
use crate::backend::DeviceContext;
use crate::error::{RenderError, Result};
use crate::scene::{GeometryInstance, MeshGeometry};
use ash::vk;
use std::sync::Arc;

/// Construction parameters, normally derived from the config file
#[derive(Debug, Clone, Copy)]
pub struct RendererSettings {
    pub frames_in_flight: usize,
    pub surface: SurfaceSettings,
    pub bottom_level: BlasSettings,
    /// Refit the top-level structure on transform-only changes
    pub allow_update: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            surface: SurfaceSettings::default(),
            bottom_level: BlasSettings::default(),
            allow_update: true,
        }
    }
}

/// The live acceleration structures and the descriptor that tracks the top level
struct GeometrySlots<B, T> {
    top_level: Option<T>,
    bottom_level: Option<B>,
    top_level_target: Option<DescriptorTarget>,
}

impl<B, T> GeometrySlots<B, T> {
    fn new() -> Self {
        Self {
            top_level: None,
            bottom_level: None,
            top_level_target: None,
        }
    }

    /// Build the replacement set first. On failure the live structures stay
    /// untouched and `release` never runs.
    fn replace_bottom_level(
        &mut self,
        build: impl FnOnce() -> Result<B>,
        release: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let set = build()?;
        release()?;
        // The top level refers to the old set
        self.top_level = None;
        self.bottom_level = Some(set);
        Ok(())
    }

    /// Swap in a freshly built top level. Returns the descriptor that still
    /// names the old one, if any.
    fn install_top_level(&mut self, top_level: T) -> Option<DescriptorTarget> {
        self.top_level = Some(top_level);
        self.top_level_target
    }

    fn remember_target(&mut self, target: DescriptorTarget) {
        self.top_level_target = Some(target);
    }
}

pub struct Renderer {
    // Field order is drop order: frames stop using the structures first
    frames: FrameSynchronizer<VulkanFrameBackend>,
    geometry: GeometrySlots<BottomLevelSet, TopLevelStructure>,
    commands: Arc<CommandScratch>,
    settings: RendererSettings,
    device: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(
        device: Arc<DeviceContext>,
        recorder: Box<dyn FrameRecorder>,
        drawable: vk::Extent2D,
        settings: RendererSettings,
    ) -> Result<Self> {
        let commands = Arc::new(CommandScratch::new(&device)?);
        let backend = VulkanFrameBackend::new(
            &commands,
            recorder,
            settings.frames_in_flight,
            drawable,
            settings.surface,
        )?;
        let frames = FrameSynchronizer::new(backend, settings.frames_in_flight)?;

        log::info!("Renderer ready ({} frames in flight)", settings.frames_in_flight);

        Ok(Self {
            frames,
            geometry: GeometrySlots::new(),
            commands,
            settings,
            device,
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Render and present one frame. Only `Err` is fatal.
    pub fn acquire_and_present(&mut self) -> Result<FrameStatus> {
        self.frames.acquire_and_present()
    }

    /// The window was resized; the surface is rebuilt before the next frame
    pub fn set_drawable_extent(&mut self, width: u32, height: u32) {
        self.frames
            .backend_mut()
            .set_drawable(vk::Extent2D { width, height });
        self.frames.request_rebuild();
    }

    pub fn frame_counter(&self) -> u64 {
        self.frames.frame_counter()
    }

    pub fn surface_rebuilds(&self) -> u64 {
        self.frames.rebuilds()
    }

    pub fn bind_pipeline(&mut self, binding: PipelineBinding) -> Result<()> {
        self.device.wait_idle()?;
        self.frames.backend_mut().recorder_mut().bind_pipeline(binding)
    }

    pub fn update_uniforms(&mut self, bytes: &[u8]) -> Result<()> {
        self.frames.backend_mut().recorder_mut().update_uniforms(bytes)
    }

    /// Build one bottom-level structure per mesh, replacing any previous set.
    /// The top-level structure refers to the old set and is dropped with it.
    /// If the build fails the previous structures stay live.
    pub fn build_bottom_level(&mut self, meshes: &[MeshGeometry]) -> Result<()> {
        let commands = &self.commands;
        let settings = &self.settings.bottom_level;
        let device = &self.device;
        let frames = &mut self.frames;

        self.geometry.replace_bottom_level(
            || BottomLevelSet::build(commands, meshes, settings),
            || {
                device.wait_idle()?;
                frames.backend_mut().set_top_level(None);
                Ok(())
            },
        )
    }

    /// Free the structures that compaction replaced
    pub fn destroy_retired(&mut self) -> usize {
        self.geometry
            .bottom_level
            .as_mut()
            .map_or(0, BottomLevelSet::destroy_retired)
    }

    /// Bring the top-level structure in line with `instances`.
    ///
    /// Refits when only transforms changed, otherwise rebuilds. Waits for the
    /// device first since in-flight frames may still read the structure. A
    /// rebuild also rewrites the descriptor last passed to
    /// `write_top_level_descriptor`.
    pub fn rebuild_geometry(&mut self, instances: &[GeometryInstance]) -> Result<TlasBuildMode> {
        let blas = self.geometry.bottom_level.as_ref().ok_or_else(|| {
            RenderError::ProtocolViolation("top-level build before any bottom-level build".into())
        })?;

        let key = TopologyKey::for_instances(blas, instances)?;
        let mode = choose_build_mode(
            self.geometry
                .top_level
                .as_ref()
                .map(|t| (t.topology(), t.allows_update())),
            &key,
            self.settings.allow_update,
        );

        self.device.wait_idle()?;

        if mode == TlasBuildMode::Update {
            if let Some(top_level) = self.geometry.top_level.as_mut() {
                top_level.update(&self.commands, blas, instances)?;
                return Ok(mode);
            }
        }

        // The old structure stays bound until its replacement exists
        let top_level = TopLevelStructure::build(&self.commands, blas, instances, self.settings.allow_update)?;
        let handle = top_level.handle();
        self.frames.backend_mut().set_top_level(Some(handle));
        if let Some(target) = self.geometry.install_top_level(top_level) {
            write_top_level_descriptor(&self.device, target, handle);
        }
        Ok(TlasBuildMode::Build)
    }

    pub fn current_top_level_handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.geometry.top_level.as_ref().map(TopLevelStructure::handle)
    }

    /// Point a caller-owned descriptor at the current top-level structure.
    /// The target is kept and rewritten after every full rebuild.
    pub fn write_top_level_descriptor(&mut self, target: DescriptorTarget) -> Result<()> {
        let handle = self.current_top_level_handle().ok_or_else(|| {
            RenderError::ProtocolViolation("no top-level structure to bind".into())
        })?;
        self.device.wait_idle()?;
        write_top_level_descriptor(&self.device, target, handle);
        self.geometry.remember_target(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::validate_meshes;

    fn target(binding: u32) -> DescriptorTarget {
        DescriptorTarget {
            set: vk::DescriptorSet::null(),
            binding,
        }
    }

    fn live_scene() -> GeometrySlots<Vec<&'static str>, &'static str> {
        let mut slots = GeometrySlots::new();
        slots.bottom_level = Some(vec!["cube"]);
        slots.top_level = Some("scene");
        slots
    }

    #[test]
    fn empty_mesh_list_leaves_live_scene_intact() {
        let mut slots = live_scene();
        let mut released = false;

        let result = slots.replace_bottom_level(
            || validate_meshes(&[]).map(|()| vec!["never"]),
            || {
                released = true;
                Ok(())
            },
        );

        assert!(matches!(result, Err(RenderError::UnsupportedGeometry(_))));
        assert!(!released);
        assert_eq!(slots.bottom_level, Some(vec!["cube"]));
        assert_eq!(slots.top_level, Some("scene"));
    }

    #[test]
    fn failed_release_keeps_old_set() {
        let mut slots = live_scene();

        let result = slots.replace_bottom_level(
            || Ok(vec!["sphere"]),
            || {
                Err(RenderError::Device {
                    subsystem: "device",
                    call: "device_wait_idle",
                    result: vk::Result::ERROR_DEVICE_LOST,
                })
            },
        );

        assert!(result.is_err());
        assert_eq!(slots.bottom_level, Some(vec!["cube"]));
        assert_eq!(slots.top_level, Some("scene"));
    }

    #[test]
    fn new_bottom_level_drops_top_level() {
        let mut slots = live_scene();
        let mut released = false;

        slots
            .replace_bottom_level(
                || Ok(vec!["cube", "sphere"]),
                || {
                    released = true;
                    Ok(())
                },
            )
            .unwrap();

        assert!(released);
        assert_eq!(slots.bottom_level, Some(vec!["cube", "sphere"]));
        assert_eq!(slots.top_level, None);
    }

    #[test]
    fn rebuilt_top_level_rewrites_remembered_descriptor() {
        let mut slots = live_scene();
        assert_eq!(slots.install_top_level("first"), None);

        slots.remember_target(target(3));
        assert_eq!(slots.install_top_level("second"), Some(target(3)));
        assert_eq!(slots.top_level, Some("second"));

        // Only the latest target is tracked
        slots.remember_target(target(5));
        assert_eq!(slots.install_top_level("third"), Some(target(5)));
    }
}
