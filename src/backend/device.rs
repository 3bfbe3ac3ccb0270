// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the target window
// - Physical device selection (graphics + present queues, ray tracing support)
// - Logical device, queues and command pool
// - Memory-type table, memory allocator and the extension capability table
//
// Built once at startup, destroyed last. Everything else holds an Arc to it.

use crate::error::{RenderError, Result, VkResultExt};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const SUBSYSTEM: &str = "device";

/// Parameters for device creation
#[derive(Debug, Clone)]
pub struct DeviceDesc<'a> {
    pub app_name: &'a str,
    pub enable_validation: bool,
    /// Refuse devices without KHR acceleration structure + ray tracing pipeline
    pub require_ray_tracing: bool,
}

/// Queue family indices. Graphics and present may coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Pick the first graphics family and the first present-capable family.
    /// Prefers a single family that can do both.
    pub fn select(graphics_flags: &[bool], present_support: &[bool]) -> Option<Self> {
        let shared = graphics_flags
            .iter()
            .zip(present_support)
            .position(|(&g, &p)| g && p);
        if let Some(index) = shared {
            return Some(Self {
                graphics: index as u32,
                present: index as u32,
            });
        }

        let graphics = graphics_flags.iter().position(|&g| g)?;
        let present = present_support.iter().position(|&p| p)?;
        Some(Self {
            graphics: graphics as u32,
            present: present as u32,
        })
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Snapshot of the device memory types, queried once at device creation.
#[derive(Debug, Clone, Default)]
pub struct MemoryTypeTable {
    types: Vec<(vk::MemoryPropertyFlags, u32)>,
    heap_sizes: Vec<vk::DeviceSize>,
}

impl MemoryTypeTable {
    pub fn from_properties(props: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|t| (t.property_flags, t.heap_index))
            .collect();
        let heap_sizes = props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|h| h.size)
            .collect();
        Self { types, heap_sizes }
    }

    /// Find a memory type allowed by `type_bits` that has all `flags`
    pub fn find(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(i, (props, _))| (type_bits & (1 << i)) != 0 && props.contains(flags))
            .map(|(i, _)| i as u32)
    }

    /// Total size of all heaps backing at least one device-local type
    pub fn device_local_bytes(&self) -> vk::DeviceSize {
        let mut seen = vec![false; self.heap_sizes.len()];
        for &(flags, heap) in &self.types {
            if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                if let Some(slot) = seen.get_mut(heap as usize) {
                    *slot = true;
                }
            }
        }
        self.heap_sizes
            .iter()
            .zip(seen)
            .filter(|(_, used)| *used)
            .map(|(size, _)| *size)
            .sum()
    }
}

/// Ray tracing extension loaders and the limits the builder needs
pub struct RayTracingCapabilities {
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub min_scratch_alignment: vk::DeviceSize,
    pub shader_group_handle_size: u32,
    pub max_ray_recursion_depth: u32,
}

/// Extension function tables, loaded once and passed by reference
pub struct DeviceCapabilities {
    pub surface: ash::khr::surface::Instance,
    pub swapchain: ash::khr::swapchain::Device,
    pub ray_tracing: Option<RayTracingCapabilities>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct DeviceContext {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub capabilities: DeviceCapabilities,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub instance: ash::Instance,
    _entry: Entry,

    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub command_pool: vk::CommandPool,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_types: MemoryTypeTable,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    ray_tracing: bool,
    score: u32,
}

impl DeviceContext {
    /// Create the device for a window.
    ///
    /// Fails with `UnsupportedConfiguration` when no GPU can present to the
    /// surface (or, with `require_ray_tracing`, lacks the KHR ray tracing set).
    pub fn new(
        desc: &DeviceDesc<'_>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        let entry = unsafe { Entry::load() }.map_err(|e| {
            RenderError::UnsupportedConfiguration(format!("Vulkan loader unavailable: {}", e))
        })?;

        let instance = Self::create_instance(&entry, desc, display)?;

        let debug_utils = if desc.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
            .vk_context(SUBSYSTEM, "create_surface")?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let candidate = Self::pick_physical_device(&instance, &surface_loader, surface, desc)?;
        let physical_device = candidate.physical_device;
        let families = candidate.families;

        let device = Self::create_logical_device(&instance, physical_device, families, candidate.ray_tracing)?;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_types = MemoryTypeTable::from_properties(&unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        });

        if memory_types
            .find(u32::MAX, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .is_none()
        {
            return Err(RenderError::UnsupportedConfiguration(
                "device exposes no device-local memory type".into(),
            ));
        }

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queues: graphics={} present={}{}; device-local memory {} MiB",
            families.graphics,
            families.present,
            if families.is_shared() { " (shared)" } else { "" },
            memory_types.device_local_bytes() / (1024 * 1024)
        );

        let ray_tracing = if candidate.ray_tracing {
            Some(Self::load_ray_tracing(&instance, &device, physical_device))
        } else {
            log::warn!("Ray tracing extensions unavailable; acceleration structures disabled");
            None
        };

        let capabilities = DeviceCapabilities {
            surface: surface_loader,
            swapchain: ash::khr::swapchain::Device::new(&instance, &device),
            ray_tracing,
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(families.graphics)
            // TRANSIENT: one-time buffers are short-lived
            // RESET: per-image buffers are re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .vk_context(SUBSYSTEM, "create_command_pool")?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: candidate.ray_tracing,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::allocation("memory allocator", e))?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            capabilities,
            device,
            physical_device,
            surface,
            instance,
            _entry: entry,
            queue_families: families,
            graphics_queue,
            present_queue,
            command_pool,
            debug_utils,
            properties,
            memory_types,
        }))
    }

    fn create_instance(
        entry: &Entry,
        desc: &DeviceDesc<'_>,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(desc.app_name).map_err(|_| {
            RenderError::UnsupportedConfiguration("application name contains NUL".into())
        })?;
        let engine_name = c"rt-frame-core";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions come from the display handle
        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
            .vk_context(SUBSYSTEM, "enumerate_required_extensions")?
            .to_vec();
        if desc.enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if desc.enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.vk_context(SUBSYSTEM, "create_instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .vk_context(SUBSYSTEM, "create_debug_utils_messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        desc: &DeviceDesc<'_>,
    ) -> Result<Candidate> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .vk_context(SUBSYSTEM, "enumerate_physical_devices")?;

        if devices.is_empty() {
            return Err(RenderError::UnsupportedConfiguration(
                "no Vulkan-capable GPU found".into(),
            ));
        }

        let mut best: Option<Candidate> = None;

        for physical_device in devices {
            let props = unsafe { instance.get_physical_device_properties(physical_device) };
            let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .vk_context(SUBSYSTEM, "enumerate_device_extension_properties")?;

            if !has_extensions(&extensions, &[ash::khr::swapchain::NAME]) {
                continue;
            }
            let ray_tracing = has_extensions(&extensions, RAY_TRACING_EXTENSIONS);
            if desc.require_ray_tracing && !ray_tracing {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            let graphics: Vec<bool> = queue_families
                .iter()
                .map(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .collect();
            let mut present = Vec::with_capacity(queue_families.len());
            for index in 0..queue_families.len() as u32 {
                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(physical_device, index, surface)
                }
                .vk_context(SUBSYSTEM, "get_physical_device_surface_support")?;
                present.push(supported);
            }

            let Some(families) = QueueFamilies::select(&graphics, &present) else {
                continue;
            };

            // Prefer discrete GPUs, then anything that can trace rays
            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if ray_tracing {
                score += 500;
            }

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    physical_device,
                    families,
                    ray_tracing,
                    score,
                });
            }
        }

        best.ok_or_else(|| {
            RenderError::UnsupportedConfiguration(if desc.require_ray_tracing {
                "no GPU with presentation and KHR ray tracing support".into()
            } else {
                "no GPU with presentation support".into()
            })
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
        ray_tracing: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(families.graphics)
            .queue_priorities(&queue_priorities)];
        if !families.is_shared() {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(families.present)
                    .queue_priorities(&queue_priorities),
            );
        }

        let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
        if ray_tracing {
            extensions.extend(RAY_TRACING_EXTENSIONS.iter().map(|name| name.as_ptr()));
        }

        let mut buffer_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
            .buffer_device_address(true);
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let mut features = vk::PhysicalDeviceFeatures2::default();
        if ray_tracing {
            features = features
                .push_next(&mut buffer_address)
                .push_next(&mut acceleration)
                .push_next(&mut pipeline);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .vk_context(SUBSYSTEM, "create_device")
    }

    fn load_ray_tracing(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> RayTracingCapabilities {
        let mut acceleration_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut pipeline_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut acceleration_props)
            .push_next(&mut pipeline_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props) };

        log::info!(
            "Ray tracing: scratch alignment {}, handle size {}, max recursion {}",
            acceleration_props.min_acceleration_structure_scratch_offset_alignment,
            pipeline_props.shader_group_handle_size,
            pipeline_props.max_ray_recursion_depth
        );

        RayTracingCapabilities {
            acceleration_structure: ash::khr::acceleration_structure::Device::new(instance, device),
            pipeline: ash::khr::ray_tracing_pipeline::Device::new(instance, device),
            min_scratch_alignment: u64::from(
                acceleration_props.min_acceleration_structure_scratch_offset_alignment,
            ),
            shader_group_handle_size: pipeline_props.shader_group_handle_size,
            max_ray_recursion_depth: pipeline_props.max_ray_recursion_depth,
        }
    }

    /// Ray tracing loaders, or `UnsupportedConfiguration` if the device has none
    pub fn ray_tracing(&self) -> Result<&RayTracingCapabilities> {
        self.capabilities.ray_tracing.as_ref().ok_or_else(|| {
            RenderError::UnsupportedConfiguration(
                "device was created without ray tracing support".into(),
            )
        })
    }

    /// Lock the memory allocator
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Wait for device to be idle (e.g., before surface rebuild or cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_context(SUBSYSTEM, "device_wait_idle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Leaf to root: allocator blocks, pool, device, surface, instance
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.capabilities.surface.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

const RAY_TRACING_EXTENSIONS: &[&CStr] = &[
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

fn has_extensions(available: &[vk::ExtensionProperties], required: &[&CStr]) -> bool {
    required.iter().all(|name| {
        available
            .iter()
            .any(|ext| ext.extension_name_as_c_str().map_or(false, |n| n == *name))
    })
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[(vk::MemoryPropertyFlags, u32)], heaps: &[u64]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
            props.memory_types[i].heap_index = heap;
        }
        props.memory_heap_count = heaps.len() as u32;
        for (i, &size) in heaps.iter().enumerate() {
            props.memory_heaps[i].size = size;
        }
        props
    }

    #[test]
    fn memory_type_lookup_respects_filter_bits() {
        let table = MemoryTypeTable::from_properties(&memory_properties(
            &[
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            ],
            &[1024, 512],
        ));

        assert_eq!(table.find(0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(table.find(0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
        assert_eq!(table.find(0b001, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
        assert_eq!(table.device_local_bytes(), 1024);
    }

    #[test]
    fn queue_families_prefer_shared_family() {
        let families = QueueFamilies::select(&[true, true], &[false, true]).unwrap();
        assert_eq!(families, QueueFamilies { graphics: 1, present: 1 });
        assert!(families.is_shared());
    }

    #[test]
    fn queue_families_may_be_distinct() {
        let families = QueueFamilies::select(&[true, false], &[false, true]).unwrap();
        assert_eq!(families, QueueFamilies { graphics: 0, present: 1 });
        assert!(!families.is_shared());
    }

    #[test]
    fn queue_families_require_both() {
        assert!(QueueFamilies::select(&[false, false], &[true, true]).is_none());
        assert!(QueueFamilies::select(&[true], &[false]).is_none());
    }
}
