// Vulkan side of the frame protocol
//
// Owns the swap surface, the per-slot sync objects and the per-image command
// buffers, and implements `PresentBackend` on top of them.

use super::commands::CommandScratch;
use super::recorder::{FrameRecorder, FrameTarget};
use super::swapchain::{SurfaceSettings, SwapSurface};
use super::sync::{AcquireOutcome, FrameSlot, PresentBackend, PresentOutcome};
use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

const SUBSYSTEM: &str = "frame";

pub struct VulkanFrameBackend {
    // Field order is drop order: framebuffers go before the recorder's render pass
    surface: Option<SwapSurface>,
    recorder: Box<dyn FrameRecorder>,
    command_buffers: Vec<vk::CommandBuffer>,
    slots: Vec<FrameSlot>,
    top_level: Option<vk::AccelerationStructureKHR>,
    drawable: vk::Extent2D,
    settings: SurfaceSettings,
    commands: Arc<CommandScratch>,
    device: Arc<DeviceContext>,
}

impl VulkanFrameBackend {
    pub fn new(
        commands: &Arc<CommandScratch>,
        recorder: Box<dyn FrameRecorder>,
        depth: usize,
        drawable: vk::Extent2D,
        settings: SurfaceSettings,
    ) -> Result<Self> {
        let device = commands.device().clone();
        let slots = (0..depth)
            .map(|_| FrameSlot::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let mut backend = Self {
            surface: None,
            recorder,
            command_buffers: Vec::new(),
            slots,
            top_level: None,
            drawable,
            settings,
            commands: commands.clone(),
            device,
        };
        if drawable.width > 0 && drawable.height > 0 {
            backend.create_surface()?;
        }
        Ok(backend)
    }

    pub fn recorder_mut(&mut self) -> &mut dyn FrameRecorder {
        self.recorder.as_mut()
    }

    pub fn surface(&self) -> Option<&SwapSurface> {
        self.surface.as_ref()
    }

    /// Structure handed to the recorder for every following frame
    pub fn set_top_level(&mut self, top_level: Option<vk::AccelerationStructureKHR>) {
        self.top_level = top_level;
    }

    /// Window size used by the next surface rebuild
    pub fn set_drawable(&mut self, drawable: vk::Extent2D) {
        self.drawable = drawable;
    }

    fn create_surface(&mut self) -> Result<()> {
        let mut surface = SwapSurface::new(&self.device, self.drawable, self.settings)?;
        self.recorder.surface_rebuilt(&surface)?;
        if let Some(render_pass) = self.recorder.render_pass() {
            surface.attach_framebuffers(render_pass)?;
        }
        self.command_buffers = self.commands.allocate_primary(surface.image_count() as u32)?;
        self.surface = Some(surface);
        Ok(())
    }

    fn teardown_surface(&mut self) {
        self.commands.free(&self.command_buffers);
        self.command_buffers.clear();
        self.surface = None;
    }

    fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.slots.get(slot).ok_or_else(|| {
            RenderError::ProtocolViolation(format!(
                "frame slot {} out of range ({} slots)",
                slot,
                self.slots.len()
            ))
        })
    }
}

impl PresentBackend for VulkanFrameBackend {
    fn image_count(&self) -> usize {
        self.surface.as_ref().map_or(0, SwapSurface::image_count)
    }

    fn is_ready(&self) -> bool {
        self.surface.is_some()
    }

    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.wait()
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.slot(slot)?.image_available;
        match &self.surface {
            Some(surface) => surface.acquire_next_image(semaphore),
            None => Ok(AcquireOutcome::Stale),
        }
    }

    fn record_and_submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| RenderError::ProtocolViolation("submit without a swap surface".into()))?;
        let index = image as usize;
        let cmd = *self.command_buffers.get(index).ok_or_else(|| {
            RenderError::ProtocolViolation(format!("no command buffer for image {}", image))
        })?;

        let target = FrameTarget {
            image_index: image,
            image: surface.images[index],
            framebuffer: surface
                .framebuffers
                .get(index)
                .copied()
                .unwrap_or_else(vk::Framebuffer::null),
            extent: surface.extent,
            top_level: self.top_level,
        };

        let device = &self.device.device;
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .vk_context(SUBSYSTEM, "reset_command_buffer")?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .vk_context(SUBSYSTEM, "begin_command_buffer")?;
        }

        self.recorder.record_frame(cmd, &target)?;

        unsafe { device.end_command_buffer(cmd) }.vk_context(SUBSYSTEM, "end_command_buffer")?;

        let frame = self.slot(slot)?;
        let wait_semaphores = [frame.image_available];
        let wait_stages = [self.recorder.wait_stage()];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // The fence is reset only now so an aborted frame leaves it signaled
        frame.reset()?;
        unsafe { device.queue_submit(self.device.graphics_queue, &[submit_info], frame.in_flight_fence) }
            .vk_context(SUBSYSTEM, "queue_submit")
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome> {
        let wait = [self.slot(slot)?.render_finished];
        match &self.surface {
            Some(surface) => surface.present(self.device.present_queue, image, &wait),
            None => Ok(PresentOutcome::Stale),
        }
    }

    fn rebuild_surface(&mut self) -> Result<()> {
        if self.drawable.width == 0 || self.drawable.height == 0 {
            if self.surface.is_some() {
                self.device.wait_idle()?;
                self.teardown_surface();
            }
            log::debug!("Drawable area is empty; surface rebuild deferred");
            return Ok(());
        }

        self.device.wait_idle()?;
        self.teardown_surface();
        self.create_surface()
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device wait failed during frame teardown: {}", e);
        }
        self.teardown_surface();
    }
}
