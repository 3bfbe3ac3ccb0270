// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with RAII ownership
// Every resource owner holds an Arc<DeviceContext> and frees itself on drop

pub mod blas;
pub mod buffer;
pub mod commands;
pub mod device;
pub mod frame;
pub mod recorder;
pub mod swapchain;
pub mod sync;
pub mod tlas;

pub use device::{DeviceContext, DeviceDesc};
pub use recorder::{FrameRecorder, RasterRecorder, RayTraceRecorder};
pub use sync::{FrameStatus, PresentBackend};
