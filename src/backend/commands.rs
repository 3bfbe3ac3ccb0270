// Command scratch allocator
//
// Short-lived command buffers (one-time submit, blocking on a fence) and
// transient scratch buffers for acceleration structure builds. The per-image
// primary command buffers used by the frame loop are also issued here.

use super::buffer::{align_up, GpuBuffer};
use super::DeviceContext;
use crate::error::{Result, VkResultExt};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

const SUBSYSTEM: &str = "commands";

pub struct CommandScratch {
    fence: vk::Fence,
    device: Arc<DeviceContext>,
}

impl CommandScratch {
    pub fn new(device: &Arc<DeviceContext>) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .vk_context(SUBSYSTEM, "create_fence")?;
        Ok(Self {
            fence,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Record `record` into a fresh command buffer, submit it to the graphics
    /// queue and block until the device has executed it.
    ///
    /// Only for setup, build and copy work. Never call from the frame loop.
    pub fn run_once<R>(
        &self,
        label: &str,
        record: impl FnOnce(&DeviceContext, vk::CommandBuffer) -> Result<R>,
    ) -> Result<R> {
        let device = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .vk_context(SUBSYSTEM, "allocate_command_buffers")?[0];

        let result = self.record_and_wait(cmd, record);

        unsafe { device.free_command_buffers(self.device.command_pool, &[cmd]) };
        log::debug!("One-time commands '{}' completed", label);
        result
    }

    fn record_and_wait<R>(
        &self,
        cmd: vk::CommandBuffer,
        record: impl FnOnce(&DeviceContext, vk::CommandBuffer) -> Result<R>,
    ) -> Result<R> {
        let device = &self.device.device;

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .vk_context(SUBSYSTEM, "begin_command_buffer")?;

        let value = record(&self.device, cmd)?;

        unsafe { device.end_command_buffer(cmd) }.vk_context(SUBSYSTEM, "end_command_buffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            device
                .reset_fences(&[self.fence])
                .vk_context(SUBSYSTEM, "reset_fences")?;
            device
                .queue_submit(self.device.graphics_queue, &[submit_info], self.fence)
                .vk_context(SUBSYSTEM, "queue_submit")?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .vk_context(SUBSYSTEM, "wait_for_fences")?;
        }

        Ok(value)
    }

    /// Allocate `count` resettable primary command buffers
    pub fn allocate_primary(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .vk_context(SUBSYSTEM, "allocate_command_buffers")
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, command_buffers)
        };
    }

    /// Transient device-local scratch memory for acceleration structure builds.
    /// The returned address honours the device's scratch offset alignment.
    pub fn scratch(&self, name: &str, size: vk::DeviceSize) -> Result<ScratchBuffer> {
        let alignment = self
            .device
            .capabilities
            .ray_tracing
            .as_ref()
            .map_or(1, |rt| rt.min_scratch_alignment);

        // Over-allocate so the aligned address still has `size` bytes behind it
        let buffer = GpuBuffer::new(
            &self.device,
            name,
            size + alignment.saturating_sub(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let address = align_up(buffer.device_address()?, alignment);

        Ok(ScratchBuffer {
            address,
            size,
            _buffer: buffer,
        })
    }
}

impl Drop for CommandScratch {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.fence, None) };
    }
}

/// Scratch memory owned by one build batch
pub struct ScratchBuffer {
    pub address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
    _buffer: GpuBuffer,
}
