// =============================================================================
// RT FRAME CORE - Demo frame-loop driver
// =============================================================================
//
// Opens a window, builds a small instanced cube scene into acceleration
// structures (when the GPU supports ray tracing) and drives the renderer's
// frame protocol until the window closes.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (events, input, FPS)                                 │
// │    └── Renderer (explicit context object)                       │
// │          ├── FrameSynchronizer ── swap surface + recorder       │
// │          ├── Top-level structure (instances)                    │
// │          └── Bottom-level structures (one per mesh)             │
// │                └── DeviceContext (instance, device, allocator)  │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (inside Renderer::acquire_and_present):
// 1. Wait on the slot fence
// 2. Acquire swap image (stale -> rebuild surface, skip frame)
// 3. Wait for the fence guarding that image, if another slot owns it
// 4. Record + submit
// 5. Present (stale/suboptimal -> rebuild surface)
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3};
use rt_frame_core::backend::{DeviceContext, DeviceDesc, FrameRecorder, FrameStatus, RasterRecorder, RayTraceRecorder};
use rt_frame_core::config::{Config, RendererKind};
use rt_frame_core::scene::{self, GeometryInstance, MeshBuffers};
use rt_frame_core::{logging, Renderer};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Logging first so config loading can report problems
    let log_sink = logging::init();

    // Load configuration from config.toml
    let config = Config::load();
    if config.debug.log_to_file {
        match log_sink.attach(&config.debug.log_file) {
            Ok(()) => log::info!("Logging to {}", config.debug.log_file),
            Err(e) => log::warn!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    log::info!("Starting RT frame core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, renderer: {:?}",
        config.graphics.present_mode,
        config.graphics.renderer
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// DEMO SCENE
// =============================================================================

/// Cubes placed on a ring, all sharing one mesh
struct DemoScene {
    instances: Vec<GeometryInstance>,
    angle: f32,
    // Kept alive while the structures built from them exist
    _meshes: Vec<MeshBuffers>,
}

impl DemoScene {
    const CUBES: usize = 5;
    const RADIUS: f32 = 3.0;

    fn new(meshes: Vec<MeshBuffers>) -> Self {
        let instances = (0..Self::CUBES)
            .map(|i| GeometryInstance::new(0, Mat4::IDENTITY).with_material_offset(i as u32))
            .collect();
        let mut scene = Self {
            instances,
            angle: 0.0,
            _meshes: meshes,
        };
        scene.place();
        scene
    }

    /// Spin the ring. Only transforms change, so the top level can be refit.
    fn nudge(&mut self) {
        self.angle += 0.25;
        self.place();
    }

    fn place(&mut self) {
        let step = std::f32::consts::TAU / Self::CUBES as f32;
        for (i, instance) in self.instances.iter_mut().enumerate() {
            let theta = self.angle + step * i as f32;
            let position = Vec3::new(theta.cos() * Self::RADIUS, 0.0, theta.sin() * Self::RADIUS);
            instance.set_transform(Mat4::from_rotation_translation(
                Quat::from_rotation_y(theta),
                position,
            ));
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct.
///
/// Field order matters for Drop: the renderer (and every GPU resource behind
/// it) goes before the mesh buffers and the window.
pub struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer>,
    scene: Option<DemoScene>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Set to true when window is minimized (size = 0) - skip rendering
    is_minimized: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            scene: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Create the device, the renderer and (with ray tracing) the scene.
    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

        log::info!("Initializing Vulkan...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Enable validation layers based on config (and debug build)
        let desc = DeviceDesc {
            app_name: &self.config.window.title,
            enable_validation: cfg!(debug_assertions) && self.config.debug.validation_layers,
            require_ray_tracing: self.config.graphics.renderer == RendererKind::RayTracing,
        };
        let device = DeviceContext::new(&desc, display, handle)?;

        let clear_color = self.config.graphics.clear_color;
        let recorder: Box<dyn FrameRecorder> = match self.config.graphics.renderer {
            RendererKind::Raster => Box::new(RasterRecorder::new(&device, clear_color)),
            RendererKind::RayTracing => Box::new(RayTraceRecorder::new(&device, clear_color)?),
        };

        let size = window.inner_size();
        let drawable = ash::vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let mut renderer = Renderer::new(device.clone(), recorder, drawable, self.config.renderer_settings())?;

        if device.capabilities.ray_tracing.is_some() {
            let (vertices, indices) = scene::cube();
            let cube = MeshBuffers::upload(&device, "cube", &vertices, &indices)?;
            renderer.build_bottom_level(&[cube.geometry])?;

            let scene = DemoScene::new(vec![cube]);
            renderer.rebuild_geometry(&scene.instances)?;
            let freed = renderer.destroy_retired();
            log::info!(
                "Scene ready: {} instances, top level {:?} ({} retired structures freed)",
                scene.instances.len(),
                renderer.current_top_level_handle(),
                freed
            );
            self.scene = Some(scene);
        } else {
            log::info!("No ray tracing support; presenting clears only");
        }

        self.renderer = Some(renderer);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render one frame. Ok(true) means an image reached the screen.
    pub fn render_frame(&mut self) -> Result<bool> {
        // Skip rendering if minimized
        if self.is_minimized {
            return Ok(false);
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        match renderer.acquire_and_present()? {
            FrameStatus::Presented => Ok(true),
            FrameStatus::Stale { submitted } => {
                log::debug!(
                    "Frame {} hit a stale surface (submitted: {})",
                    renderer.frame_counter(),
                    submitted
                );
                Ok(submitted)
            }
        }
    }

    /// Move the instances and bring the top-level structure up to date
    fn advance_scene(&mut self) -> Result<()> {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_mut()) else {
            return Ok(());
        };
        scene.nudge();
        let mode = renderer.rebuild_geometry(&scene.instances)?;
        log::info!("Top level {:?} after transform change", mode);
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let rebuilds = self.renderer.as_ref().map_or(0, Renderer::surface_rebuilds);
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{} surface rebuilds]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    rebuilds
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.set_drawable_extent(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    // Everything the renderer cannot absorb itself is fatal
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::Space => {
                                if let Err(e) = self.advance_scene() {
                                    log::error!("Scene update failed: {:#}", e);
                                    event_loop.exit();
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Renderer first: it waits for the device before releasing anything
        self.renderer = None;
        self.scene = None;
        log::info!("Cleanup complete");
    }
}
