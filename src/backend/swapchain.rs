// Swapchain - Presentable surface manager
//
// Owns the swap images and everything derived from them (views, depth buffer,
// framebuffers). The whole set is created and destroyed as one unit; a stale
// surface is replaced by dropping this struct and building a new one.

use super::buffer::GpuImage;
use super::sync::{AcquireOutcome, PresentOutcome};
use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

const SUBSYSTEM: &str = "swapchain";

/// Preferred surface format; anything else falls back to the first reported
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Creation-time preferences, taken from the config file
#[derive(Debug, Clone, Copy)]
pub struct SurfaceSettings {
    pub preferred_present_mode: vk::PresentModeKHR,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

/// Pick the preferred format/color-space pair, else the first reported one
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .or_else(|| formats.first().copied())
        .ok_or(RenderError::NoCompatibleFormat)
}

/// Use the preferred mode when offered. FIFO is supported everywhere and
/// is the fallback.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `u32::MAX` in the current extent means the window manager lets us pick:
/// clamp the drawable size into the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: drawable
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: drawable
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub struct SwapSurface {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    depth: Option<GpuImage>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<DeviceContext>,
}

impl SwapSurface {
    pub fn new(device: &Arc<DeviceContext>, drawable: vk::Extent2D, settings: SurfaceSettings) -> Result<Self> {
        let surface_loader = &device.capabilities.surface;
        let surface = device.surface;
        let physical_device = device.physical_device;

        let surface_lost = |call: &'static str| move |result| RenderError::SurfaceLost { call, result };

        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface) }
            .map_err(surface_lost("get_physical_device_surface_capabilities"))?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }
            .map_err(surface_lost("get_physical_device_surface_formats"))?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface) }
                .map_err(surface_lost("get_physical_device_surface_present_modes"))?;

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, settings.preferred_present_mode);
        let extent = choose_extent(&caps, drawable);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swap surface: {}x{}, {:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let families = [device.queue_families.graphics, device.queue_families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        create_info = if device.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let swapchain_loader = &device.capabilities.swapchain;
        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .vk_context(SUBSYSTEM, "create_swapchain")?;

        // Drop takes over from here, so partial failures still tear down
        let mut surface = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            depth: None,
            format: surface_format.format,
            extent,
            present_mode,
            device: device.clone(),
        };

        surface.images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .vk_context(SUBSYSTEM, "get_swapchain_images")?;

        for &image in &surface.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(color_subresource_range());

            let view = unsafe { device.device.create_image_view(&view_info, None) }
                .vk_context(SUBSYSTEM, "create_image_view")?;
            surface.image_views.push(view);
        }

        surface.depth = Some(GpuImage::depth(device, extent)?);

        log::info!("Created swap surface with {} images", surface.images.len());
        Ok(surface)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.as_ref().map_or(vk::ImageView::null(), |d| d.view)
    }

    /// Create one framebuffer per swap image (color + shared depth)
    pub fn attach_framebuffers(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        self.destroy_framebuffers();
        let depth_view = self.depth_view();

        for &view in &self.image_views {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                .vk_context(SUBSYSTEM, "create_framebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Acquire the next image, signalling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.device.capabilities.swapchain.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(e).vk_context(SUBSYSTEM, "acquire_next_image"),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.capabilities.swapchain.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e).vk_context(SUBSYSTEM, "queue_present"),
        }
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl Drop for SwapSurface {
    fn drop(&mut self) {
        // Everything derived from the swap images goes first
        self.destroy_framebuffers();
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
        }
        self.depth = None;
        unsafe {
            self.device
                .capabilities
                .swapchain
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn indeterminate_extent_uses_drawable_size() {
        let caps = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&caps, extent(800, 600)), extent(800, 600));
    }

    #[test]
    fn indeterminate_extent_is_clamped() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (1920, 1080));
        assert_eq!(choose_extent(&caps, extent(4000, 10)), extent(1920, 64));
    }

    #[test]
    fn reported_extent_is_used_verbatim() {
        let caps = caps((1280, 720), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&caps, extent(800, 600)), extent(1280, 720));
    }

    #[test]
    fn chosen_extent_stays_within_bounds() {
        let drawables = [(0, 0), (1, 1), (640, 480), (5000, 5000), (u32::MAX - 1, 3)];
        let bounds = [((1, 1), (4096, 4096)), ((16, 32), (1024, 768)), ((100, 100), (100, 100))];
        for &(min, max) in &bounds {
            let caps = caps((u32::MAX, u32::MAX), min, max);
            for &(w, h) in &drawables {
                let chosen = choose_extent(&caps, extent(w, h));
                assert!(chosen.width >= min.0 && chosen.width <= max.0);
                assert!(chosen.height >= min.1 && chosen.height <= max.1);
            }
        }
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        let mut caps = caps((800, 600), (1, 1), (4096, 4096));
        for min in 1..6 {
            for max in [0, 2, 3, 4, 8] {
                caps.min_image_count = min;
                caps.max_image_count = max;
                let chosen = choose_image_count(&caps);
                if max == 0 {
                    assert_eq!(chosen, min + 1);
                } else {
                    assert!(chosen <= max);
                    assert!(chosen >= min.min(max));
                }
            }
        }
    }

    #[test]
    fn image_count_respects_exact_cap() {
        let mut caps = caps((800, 600), (1, 1), (4096, 4096));
        caps.min_image_count = 3;
        caps.max_image_count = 3;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn preferred_format_wins() {
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[other, PREFERRED_FORMAT]).unwrap();
        assert_eq!(chosen.format, PREFERRED_FORMAT.format);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let second = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[first, second]).unwrap().format, first.format);
    }

    #[test]
    fn no_formats_is_an_error() {
        assert!(matches!(choose_surface_format(&[]), Err(RenderError::NoCompatibleFormat)));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&[], vk::PresentModeKHR::MAILBOX), vk::PresentModeKHR::FIFO);
    }
}
