// Error taxonomy for the GPU core
//
// Every failing device call is tagged with the subsystem and the call name so
// a fatal error can be traced back without a debugger.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

/// Coarse classification used by the frame-loop driver to decide what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resize / mode switch. Recovered by rebuilding the swap surface.
    TransientSurfaceInvalidation,
    /// Device memory or handle allocation failed.
    ResourceExhaustion,
    /// Missing format, feature or extension. Reported before the first frame.
    UnsupportedConfiguration,
    /// The caller asked for something the current state does not allow.
    ProtocolViolation,
    /// Any other failed device call.
    DeviceFailure,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("swap surface is out of date")]
    SurfaceStale,

    #[error("surface lost during {call}: {result}")]
    SurfaceLost {
        call: &'static str,
        result: vk::Result,
    },

    #[error("device exposes no surface format")]
    NoCompatibleFormat,

    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("top-level build requested with zero instances")]
    EmptyScene,

    #[error("allocation failed for {what}: {source}")]
    AllocationFailure {
        what: String,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    #[error("[{subsystem}] {call} ran out of memory: {result}")]
    ResourceExhaustion {
        subsystem: &'static str,
        call: &'static str,
        result: vk::Result,
    },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("[{subsystem}] {call} failed: {result}")]
    Device {
        subsystem: &'static str,
        call: &'static str,
        result: vk::Result,
    },
}

impl RenderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RenderError::SurfaceStale => ErrorCategory::TransientSurfaceInvalidation,
            RenderError::AllocationFailure { .. } | RenderError::ResourceExhaustion { .. } => {
                ErrorCategory::ResourceExhaustion
            }
            RenderError::NoCompatibleFormat | RenderError::UnsupportedConfiguration(_) => {
                ErrorCategory::UnsupportedConfiguration
            }
            RenderError::UnsupportedGeometry(_)
            | RenderError::EmptyScene
            | RenderError::ProtocolViolation(_) => ErrorCategory::ProtocolViolation,
            RenderError::SurfaceLost { .. } | RenderError::Device { .. } => {
                ErrorCategory::DeviceFailure
            }
        }
    }

    pub fn allocation(what: impl Into<String>, source: gpu_allocator::AllocationError) -> Self {
        RenderError::AllocationFailure {
            what: what.into(),
            source,
        }
    }
}

/// Attach subsystem/call context to a raw `VkResult`.
pub trait VkResultExt<T> {
    fn vk_context(self, subsystem: &'static str, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn vk_context(self, subsystem: &'static str, call: &'static str) -> Result<T> {
        self.map_err(|result| match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => RenderError::ResourceExhaustion {
                subsystem,
                call,
                result,
            },
            vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SurfaceStale,
            vk::Result::ERROR_SURFACE_LOST_KHR => RenderError::SurfaceLost { call, result },
            result => RenderError::Device {
                subsystem,
                call,
                result,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_resource_exhaustion() {
        let err = Err::<(), _>(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            .vk_context("blas", "create_buffer")
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn device_error_names_subsystem_and_call() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .vk_context("frame", "queue_submit")
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::DeviceFailure);
        let message = err.to_string();
        assert!(message.contains("frame"));
        assert!(message.contains("queue_submit"));
    }

    #[test]
    fn out_of_date_is_transient() {
        let err = Err::<(), _>(vk::Result::ERROR_OUT_OF_DATE_KHR)
            .vk_context("swapchain", "acquire_next_image")
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TransientSurfaceInvalidation);
    }

    #[test]
    fn empty_scene_is_a_protocol_violation() {
        assert_eq!(RenderError::EmptyScene.category(), ErrorCategory::ProtocolViolation);
    }
}
