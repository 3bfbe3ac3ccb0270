// GPU resource and frame-orchestration core for a ray-tracing renderer
//
// backend  - device, swap surface, frame protocol, acceleration structures
// scene    - mesh and instance inputs
// renderer - the context object the frame loop drives
// config   - config.toml loading
// logging  - env_logger setup with an optional log file

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod renderer;
pub mod scene;

pub use error::{ErrorCategory, RenderError, Result};
pub use renderer::{Renderer, RendererSettings};
