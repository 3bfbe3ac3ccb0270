// Frame recorders
//
// One interface for filling a swap image's command buffer, whether the frame
// is rasterized or ray traced. Pipelines and descriptor sets are created by
// the caller and handed over as a `PipelineBinding`; the recorder owns only
// what depends on the swap surface (render pass, ray output image).

use super::buffer::{GpuImage, DEPTH_FORMAT};
use super::swapchain::{color_subresource_range, SwapSurface};
use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

const SUBSYSTEM: &str = "recorder";

/// Format of the ray output image; copied into the swap image every frame
pub const RAY_OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Stage at which ray-traced submissions wait for the acquired image
const RAY_TRACE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

/// First scope of the barrier ahead of the output copy. It must include the
/// acquire wait stage so the swap image transition chains after the acquire.
fn copy_barrier_src_stage() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | RAY_TRACE_WAIT_STAGE
}

/// A descriptor slot in a caller-owned set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTarget {
    pub set: vk::DescriptorSet,
    pub binding: u32,
}

/// Shader binding table regions for `vkCmdTraceRaysKHR`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderBindingRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// The work issued once the pipeline is bound
#[derive(Debug, Clone, Copy)]
pub enum DrawCommand {
    Draw {
        vertex_buffer: vk::Buffer,
        vertex_count: u32,
    },
    DrawIndexed {
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        index_count: u32,
    },
    TraceRays(ShaderBindingRegions),
}

/// An externally created pipeline plus what is needed to use it.
///
/// Graphics pipelines must declare viewport and scissor as dynamic state.
#[derive(Debug, Clone)]
pub struct PipelineBinding {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub draw: DrawCommand,
    /// Ray tracing only: where the recorder writes its output image view
    pub output_image: Option<DescriptorTarget>,
}

/// Everything a recorder needs to know about the image being rendered
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub image_index: u32,
    pub image: vk::Image,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub top_level: Option<vk::AccelerationStructureKHR>,
}

pub trait FrameRecorder {
    /// Use `binding` for every following frame
    fn bind_pipeline(&mut self, binding: PipelineBinding) -> Result<()>;

    /// Replace the push-constant bytes sent with every frame
    fn update_uniforms(&mut self, bytes: &[u8]) -> Result<()>;

    /// Record one frame into `cmd`, which is already in the recording state.
    /// The swap image must end up in PRESENT_SRC layout.
    fn record_frame(&mut self, cmd: vk::CommandBuffer, target: &FrameTarget) -> Result<()>;

    /// Stage at which the submission waits for the acquired image
    fn wait_stage(&self) -> vk::PipelineStageFlags;

    /// Render pass the swap surface's framebuffers are built against
    fn render_pass(&self) -> Option<vk::RenderPass>;

    /// Called after each swap surface (re)creation, before framebuffers exist
    fn surface_rebuilt(&mut self, surface: &SwapSurface) -> Result<()>;
}

fn check_push_constants(device: &DeviceContext, bytes: &[u8]) -> Result<()> {
    let limit = device.properties.limits.max_push_constants_size as usize;
    if bytes.len() > limit || bytes.len() % 4 != 0 {
        return Err(RenderError::ProtocolViolation(format!(
            "push constants must be a multiple of 4 bytes up to {}, got {}",
            limit,
            bytes.len()
        )));
    }
    Ok(())
}

fn push_constants(device: &DeviceContext, cmd: vk::CommandBuffer, binding: &PipelineBinding, bytes: &[u8]) {
    if bytes.is_empty() || binding.push_constant_stages.is_empty() {
        return;
    }
    unsafe {
        device
            .device
            .cmd_push_constants(cmd, binding.layout, binding.push_constant_stages, 0, bytes)
    };
}

fn bind_descriptor_sets(
    device: &DeviceContext,
    cmd: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    binding: &PipelineBinding,
) {
    if binding.descriptor_sets.is_empty() {
        return;
    }
    unsafe {
        device
            .device
            .cmd_bind_descriptor_sets(cmd, bind_point, binding.layout, 0, &binding.descriptor_sets, &[])
    };
}

// ---------------------------------------------------------------------------
// Raster
// ---------------------------------------------------------------------------

/// Clears the swap image and, when a graphics pipeline is bound, draws with it
pub struct RasterRecorder {
    render_pass: vk::RenderPass,
    format: vk::Format,
    clear_color: [f32; 4],
    binding: Option<PipelineBinding>,
    uniforms: Vec<u8>,
    device: Arc<DeviceContext>,
}

impl RasterRecorder {
    pub fn new(device: &Arc<DeviceContext>, clear_color: [f32; 4]) -> Self {
        Self {
            render_pass: vk::RenderPass::null(),
            format: vk::Format::UNDEFINED,
            clear_color,
            binding: None,
            uniforms: Vec::new(),
            device: device.clone(),
        }
    }

    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    fn destroy_render_pass(&mut self) {
        if self.render_pass != vk::RenderPass::null() {
            unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = vk::RenderPass::null();
        }
    }
}

impl FrameRecorder for RasterRecorder {
    fn bind_pipeline(&mut self, binding: PipelineBinding) -> Result<()> {
        if matches!(binding.draw, DrawCommand::TraceRays(_)) {
            return Err(RenderError::ProtocolViolation(
                "raster recorder cannot trace rays".into(),
            ));
        }
        self.binding = Some(binding);
        Ok(())
    }

    fn update_uniforms(&mut self, bytes: &[u8]) -> Result<()> {
        check_push_constants(&self.device, bytes)?;
        self.uniforms = bytes.to_vec();
        Ok(())
    }

    fn record_frame(&mut self, cmd: vk::CommandBuffer, target: &FrameTarget) -> Result<()> {
        let device = &self.device.device;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            if let Some(binding) = &self.binding {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, binding.pipeline);

                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: target.extent.width as f32,
                    height: target.extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[render_area]);

                bind_descriptor_sets(&self.device, cmd, vk::PipelineBindPoint::GRAPHICS, binding);
                push_constants(&self.device, cmd, binding, &self.uniforms);

                match binding.draw {
                    DrawCommand::Draw {
                        vertex_buffer,
                        vertex_count,
                    } => {
                        device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
                        device.cmd_draw(cmd, vertex_count, 1, 0, 0);
                    }
                    DrawCommand::DrawIndexed {
                        vertex_buffer,
                        index_buffer,
                        index_count,
                    } => {
                        device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
                        device.cmd_bind_index_buffer(cmd, index_buffer, 0, vk::IndexType::UINT32);
                        device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
                    }
                    DrawCommand::TraceRays(_) => {}
                }
            }

            device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    }

    fn render_pass(&self) -> Option<vk::RenderPass> {
        Some(self.render_pass)
    }

    fn surface_rebuilt(&mut self, surface: &SwapSurface) -> Result<()> {
        if surface.format == self.format && self.render_pass != vk::RenderPass::null() {
            return Ok(());
        }
        self.destroy_render_pass();
        self.render_pass = create_render_pass(&self.device, surface.format)?;
        self.format = surface.format;
        Ok(())
    }
}

impl Drop for RasterRecorder {
    fn drop(&mut self) {
        self.destroy_render_pass();
    }
}

/// Create a render pass for basic color attachment rendering with depth
fn create_render_pass(device: &DeviceContext, format: vk::Format) -> Result<vk::RenderPass> {
    // Color attachment (the swap image)
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let depth_attachment = vk::AttachmentDescription::default()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_attachment_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref);

    // Layout transitions wait for the acquire semaphore's stage
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .vk_context(SUBSYSTEM, "create_render_pass")
}

// ---------------------------------------------------------------------------
// Ray tracing
// ---------------------------------------------------------------------------

/// Traces into a storage image and copies it to the swap image.
/// Without a pipeline it only clears the swap image.
pub struct RayTraceRecorder {
    output: Option<GpuImage>,
    output_initialized: bool,
    clear_color: [f32; 4],
    binding: Option<PipelineBinding>,
    uniforms: Vec<u8>,
    device: Arc<DeviceContext>,
}

impl RayTraceRecorder {
    pub fn new(device: &Arc<DeviceContext>, clear_color: [f32; 4]) -> Result<Self> {
        device.ray_tracing()?;
        Ok(Self {
            output: None,
            output_initialized: false,
            clear_color,
            binding: None,
            uniforms: Vec::new(),
            device: device.clone(),
        })
    }

    /// View of the storage image ray generation writes to
    pub fn output_view(&self) -> Option<vk::ImageView> {
        self.output.as_ref().map(|image| image.view)
    }

    fn write_output_descriptor(&self) {
        let (Some(binding), Some(view)) = (&self.binding, self.output_view()) else {
            return;
        };
        if let Some(target) = binding.output_image {
            write_storage_image_descriptor(&self.device, target, view);
        }
    }

    fn record_clear(&self, cmd: vk::CommandBuffer, target: &FrameTarget) {
        let device = &self.device.device;
        let range = color_subresource_range();

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                RAY_TRACE_WAIT_STAGE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier(
                    target.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
            );
            device.cmd_clear_color_image(
                cmd,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: self.clear_color,
                },
                &[range],
            );
        }
        self.to_present(cmd, target.image);
    }

    fn to_present(&self, cmd: vk::CommandBuffer, image: vk::Image) {
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::empty(),
                )],
            );
        }
    }
}

impl FrameRecorder for RayTraceRecorder {
    fn bind_pipeline(&mut self, binding: PipelineBinding) -> Result<()> {
        if !matches!(binding.draw, DrawCommand::TraceRays(_)) {
            return Err(RenderError::ProtocolViolation(
                "ray trace recorder needs shader binding table regions".into(),
            ));
        }
        self.binding = Some(binding);
        self.write_output_descriptor();
        Ok(())
    }

    fn update_uniforms(&mut self, bytes: &[u8]) -> Result<()> {
        check_push_constants(&self.device, bytes)?;
        self.uniforms = bytes.to_vec();
        Ok(())
    }

    fn record_frame(&mut self, cmd: vk::CommandBuffer, target: &FrameTarget) -> Result<()> {
        let Some(binding) = &self.binding else {
            self.record_clear(cmd, target);
            return Ok(());
        };
        let DrawCommand::TraceRays(regions) = binding.draw else {
            return Err(RenderError::ProtocolViolation(
                "ray trace recorder bound to a raster draw".into(),
            ));
        };
        if target.top_level.is_none() {
            return Err(RenderError::ProtocolViolation(
                "ray tracing pipeline bound but no top-level structure is built".into(),
            ));
        }
        let output = self.output.as_ref().ok_or_else(|| {
            RenderError::ProtocolViolation("frame recorded before the surface was created".into())
        })?;

        let device = &self.device.device;
        let rt = self.device.ray_tracing()?;

        let old_layout = if self.output_initialized {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::UNDEFINED
        };

        unsafe {
            // Previous frame's copy must finish before rays overwrite the output
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier(
                    output.image,
                    old_layout,
                    vk::ImageLayout::GENERAL,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_WRITE,
                )],
            );

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, binding.pipeline);
            bind_descriptor_sets(&self.device, cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, binding);
            push_constants(&self.device, cmd, binding, &self.uniforms);

            rt.pipeline.cmd_trace_rays(
                cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                target.extent.width,
                target.extent.height,
                1,
            );

            device.cmd_pipeline_barrier(
                cmd,
                copy_barrier_src_stage(),
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    image_barrier(
                        output.image,
                        vk::ImageLayout::GENERAL,
                        vk::ImageLayout::GENERAL,
                        vk::AccessFlags::SHADER_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                    ),
                    image_barrier(
                        target.image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::AccessFlags::empty(),
                        vk::AccessFlags::TRANSFER_WRITE,
                    ),
                ],
            );

            let layers = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            };
            let region = vk::ImageCopy::default()
                .src_subresource(layers)
                .dst_subresource(layers)
                .extent(vk::Extent3D {
                    width: target.extent.width,
                    height: target.extent.height,
                    depth: 1,
                });
            device.cmd_copy_image(
                cmd,
                output.image,
                vk::ImageLayout::GENERAL,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.to_present(cmd, target.image);
        self.output_initialized = true;
        Ok(())
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        RAY_TRACE_WAIT_STAGE
    }

    fn render_pass(&self) -> Option<vk::RenderPass> {
        None
    }

    fn surface_rebuilt(&mut self, surface: &SwapSurface) -> Result<()> {
        self.output = None;
        self.output = Some(GpuImage::storage(&self.device, surface.extent, RAY_OUTPUT_FORMAT)?);
        self.output_initialized = false;
        self.write_output_descriptor();
        log::debug!(
            "Ray output image recreated at {}x{}",
            surface.extent.width,
            surface.extent.height
        );
        Ok(())
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
}

/// Point a caller-owned descriptor at the top-level acceleration structure.
/// The set must not be in use by a pending submission.
pub fn write_top_level_descriptor(
    device: &DeviceContext,
    target: DescriptorTarget,
    top_level: vk::AccelerationStructureKHR,
) {
    let structures = [top_level];
    let mut structure_info =
        vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(target.set)
        .dst_binding(target.binding)
        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        .descriptor_count(1)
        .push_next(&mut structure_info);

    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

fn write_storage_image_descriptor(device: &DeviceContext, target: DescriptorTarget, view: vk::ImageView) {
    let image_info = [vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::GENERAL)];

    let write = vk::WriteDescriptorSet::default()
        .dst_set(target.set)
        .dst_binding(target.binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(&image_info);

    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_image_transition_chains_after_acquire() {
        let src = copy_barrier_src_stage();
        assert!(src.contains(RAY_TRACE_WAIT_STAGE));
        assert!(src.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }
}
