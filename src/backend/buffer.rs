// Buffer and image utilities
//
// RAII wrappers over gpu-allocator allocations. Each owner holds an Arc to the
// device so it can release itself from Drop, leaf before root.

use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

const SUBSYSTEM: &str = "buffer";

/// Depth attachment format used by every swap surface
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Device buffer with its memory. Destroyed on drop.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    address: Option<vk::DeviceAddress>,
    device: Arc<DeviceContext>,
}

impl GpuBuffer {
    /// Create a buffer and bind freshly allocated memory to it
    pub fn new(
        device: &Arc<DeviceContext>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RenderError::ProtocolViolation(format!(
                "zero-sized buffer requested for {}",
                name
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .vk_context(SUBSYSTEM, "create_buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(RenderError::allocation(name, e));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(result) = bound {
            unsafe { device.device.destroy_buffer(buffer, None) };
            let _ = device.allocator().free(allocation);
            return Err(result).vk_context(SUBSYSTEM, "bind_buffer_memory");
        }

        let address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| device.buffer_address(buffer));

        log::debug!("Allocated buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            address,
            device: device.clone(),
        })
    }

    /// Create a host-visible buffer and fill it with data
    pub fn with_data<T: Copy>(
        device: &Arc<DeviceContext>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer = Self::new(device, name, size, usage, MemoryLocation::CpuToGpu)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Copy data into a host-visible buffer
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        if bytes as vk::DeviceSize > self.size {
            return Err(RenderError::ProtocolViolation(format!(
                "write of {} bytes into a {} byte buffer",
                bytes, self.size
            )));
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| RenderError::ProtocolViolation("buffer is not host visible".into()))?;

        // Safety: T is Copy (plain data) and the destination was bounds-checked above
        let src = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, bytes) };
        mapped[..bytes].copy_from_slice(src);
        Ok(())
    }

    /// Device address; requires SHADER_DEVICE_ADDRESS usage
    pub fn device_address(&self) -> Result<vk::DeviceAddress> {
        self.address.ok_or_else(|| {
            RenderError::ProtocolViolation(
                "buffer was created without SHADER_DEVICE_ADDRESS usage".into(),
            )
        })
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// 2D image with memory and a single view. Destroyed on drop.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
    device: Arc<DeviceContext>,
}

impl GpuImage {
    /// Depth attachment matching a swap surface extent
    pub fn depth(device: &Arc<DeviceContext>, extent: vk::Extent2D) -> Result<Self> {
        Self::new(
            device,
            "depth",
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
    }

    /// Storage image written by ray generation and copied to the swap image
    pub fn storage(device: &Arc<DeviceContext>, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        Self::new(
            device,
            "ray_output",
            extent,
            format,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
        )
    }

    fn new(
        device: &Arc<DeviceContext>,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .vk_context(SUBSYSTEM, "create_image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(RenderError::allocation(name, e));
            }
        };

        // From here on Drop owns cleanup
        let mut owned = Self {
            image,
            view: vk::ImageView::null(),
            format,
            extent,
            allocation: Some(allocation),
            device: device.clone(),
        };

        if let Some(allocation) = owned.allocation.as_ref() {
            unsafe {
                device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            }
            .vk_context(SUBSYSTEM, "bind_image_memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        owned.view = unsafe { device.device.create_image_view(&view_info, None) }
            .vk_context(SUBSYSTEM, "create_image_view")?;

        Ok(owned)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free image memory: {}", e);
            }
        }
    }
}

/// Round `value` up to a power-of-two `alignment` (0 and 1 mean unaligned)
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
