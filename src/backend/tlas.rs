// Top-level acceleration structure
//
// Packs scene instances into the device instance layout, uploads them through
// a staging buffer and builds (or refits) one structure over all of them.

use super::blas::{AccelerationStructure, BottomLevelSet};
use super::buffer::GpuBuffer;
use super::commands::CommandScratch;
use crate::error::{RenderError, Result};
use crate::scene::GeometryInstance;
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;

/// Largest value the 24-bit custom index can hold
pub const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// Row-major 3x4 from a column-major 4x4. The bottom row is dropped.
pub fn pack_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let rows = transform.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Inverse of `pack_transform` for affine transforms
pub fn unpack_transform(packed: &vk::TransformMatrixKHR) -> Mat4 {
    let m = &packed.matrix;
    Mat4::from_cols_array(&[
        m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8], m[9], m[10], m[11], 0.0, 0.0, 0.0, 1.0,
    ])
    .transpose()
}

/// Device record for one instance
pub fn pack_instance(
    instance: &GeometryInstance,
    blas_address: vk::DeviceAddress,
) -> Result<vk::AccelerationStructureInstanceKHR> {
    if instance.material_offset > MAX_CUSTOM_INDEX {
        return Err(RenderError::ProtocolViolation(format!(
            "material offset {} does not fit the 24-bit custom index",
            instance.material_offset
        )));
    }
    Ok(vk::AccelerationStructureInstanceKHR {
        transform: pack_transform(&instance.transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(instance.material_offset, instance.mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            instance.flags.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    })
}

/// Resolves a mesh index to the device address of its bottom-level structure
pub trait BottomLevelLookup {
    fn structure_address(&self, mesh_index: usize) -> Option<vk::DeviceAddress>;
}

impl BottomLevelLookup for BottomLevelSet {
    fn structure_address(&self, mesh_index: usize) -> Option<vk::DeviceAddress> {
        self.address(mesh_index)
    }
}

/// Pack every instance, resolving mesh indices against `blas`
pub fn pack_instances<L: BottomLevelLookup + ?Sized>(
    blas: &L,
    instances: &[GeometryInstance],
) -> Result<Vec<vk::AccelerationStructureInstanceKHR>> {
    if instances.is_empty() {
        return Err(RenderError::EmptyScene);
    }
    instances
        .iter()
        .map(|instance| {
            let address = blas
                .structure_address(instance.mesh_index as usize)
                .ok_or_else(|| {
                    RenderError::ProtocolViolation(format!(
                        "instance refers to mesh {} which has no bottom-level structure",
                        instance.mesh_index
                    ))
                })?;
            pack_instance(instance, address)
        })
        .collect()
}

/// Everything about an instance set except the transforms.
/// Equal keys mean the structure can be refit instead of rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyKey(Vec<(vk::DeviceAddress, u32, u8, u8)>);

impl TopologyKey {
    pub fn of(packed: &[vk::AccelerationStructureInstanceKHR]) -> Self {
        Self(
            packed
                .iter()
                .map(|instance| {
                    // Safety: every record is written through `device_handle`
                    let address = unsafe { instance.acceleration_structure_reference.device_handle };
                    (
                        address,
                        instance.instance_custom_index_and_mask.low_24(),
                        instance.instance_custom_index_and_mask.high_8(),
                        instance
                            .instance_shader_binding_table_record_offset_and_flags
                            .high_8(),
                    )
                })
                .collect(),
        )
    }

    /// Key of the structure `instances` would produce over `blas`
    pub fn for_instances<L: BottomLevelLookup + ?Sized>(
        blas: &L,
        instances: &[GeometryInstance],
    ) -> Result<Self> {
        Ok(Self::of(&pack_instances(blas, instances)?))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasBuildMode {
    Build,
    Update,
}

/// Refit when only transforms changed and the existing structure allows it.
/// `current` is the live structure's topology and whether it was built with
/// ALLOW_UPDATE.
pub fn choose_build_mode(
    current: Option<(&TopologyKey, bool)>,
    next: &TopologyKey,
    allow_update: bool,
) -> TlasBuildMode {
    match current {
        Some((topology, updatable)) if allow_update && updatable && topology == next => TlasBuildMode::Update,
        _ => TlasBuildMode::Build,
    }
}

pub struct TopLevelStructure {
    structure: AccelerationStructure,
    instance_buffer: GpuBuffer,
    topology: TopologyKey,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    update_scratch_size: vk::DeviceSize,
}

impl TopLevelStructure {
    /// Full build over `instances`
    pub fn build(
        commands: &CommandScratch,
        blas: &BottomLevelSet,
        instances: &[GeometryInstance],
        allow_update: bool,
    ) -> Result<Self> {
        let packed = pack_instances(blas, instances)?;
        let device = commands.device();
        let rt = device.ray_tracing()?;

        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if allow_update {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        }

        let instance_bytes = std::mem::size_of_val(packed.as_slice()) as vk::DeviceSize;
        let instance_buffer = GpuBuffer::new(
            device,
            "tlas_instances",
            instance_bytes,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let geometry = [instances_geometry(instance_buffer.device_address()?)];
        let count = packed.len() as u32;

        let size_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometry);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            rt.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &size_info,
                &[count],
                &mut sizes,
            );
        }

        let structure = AccelerationStructure::new(
            device,
            "tlas",
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
        )?;

        let tlas = Self {
            structure,
            instance_buffer,
            topology: TopologyKey::of(&packed),
            flags,
            update_scratch_size: sizes.update_scratch_size,
        };
        tlas.record_build(commands, &packed, TlasBuildMode::Build, sizes.build_scratch_size)?;

        log::info!(
            "Top-level structure built: {} instances, {} bytes",
            count,
            sizes.acceleration_structure_size
        );
        Ok(tlas)
    }

    /// Refit in place after a transform-only change.
    ///
    /// Refused with `ProtocolViolation` when the structure was built without
    /// ALLOW_UPDATE or the instance topology differs.
    pub fn update(
        &mut self,
        commands: &CommandScratch,
        blas: &BottomLevelSet,
        instances: &[GeometryInstance],
    ) -> Result<()> {
        if !self.allows_update() {
            return Err(RenderError::ProtocolViolation(
                "top-level structure was built without ALLOW_UPDATE".into(),
            ));
        }
        let packed = pack_instances(blas, instances)?;
        if TopologyKey::of(&packed) != self.topology {
            return Err(RenderError::ProtocolViolation(
                "instance topology changed; a full top-level build is required".into(),
            ));
        }

        self.record_build(commands, &packed, TlasBuildMode::Update, self.update_scratch_size)?;
        log::debug!("Top-level structure refit ({} instances)", packed.len());
        Ok(())
    }

    fn record_build(
        &self,
        commands: &CommandScratch,
        packed: &[vk::AccelerationStructureInstanceKHR],
        mode: TlasBuildMode,
        scratch_size: vk::DeviceSize,
    ) -> Result<()> {
        let device = commands.device();
        let staging = GpuBuffer::with_data(device, "tlas_staging", vk::BufferUsageFlags::TRANSFER_SRC, packed)?;
        let scratch = commands.scratch("tlas_scratch", scratch_size.max(1))?;

        let geometry = [instances_geometry(self.instance_buffer.device_address()?)];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .dst_acceleration_structure(self.structure.handle)
            .geometries(&geometry)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.address,
            });
        build_info = match mode {
            TlasBuildMode::Build => build_info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
            TlasBuildMode::Update => build_info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(self.structure.handle),
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(packed.len() as u32);
        let copy = vk::BufferCopy::default().size(staging.size);

        commands.run_once("tlas build", |ctx, cmd| {
            let rt = ctx.ray_tracing()?;

            // Instance upload and bottom-level builds must land before the build reads them
            let upload_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                );
            let blas_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);

            unsafe {
                ctx.device
                    .cmd_copy_buffer(cmd, staging.buffer, self.instance_buffer.buffer, &[copy]);
                ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[upload_barrier],
                    &[],
                    &[],
                );
                ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[blas_barrier],
                    &[],
                    &[],
                );
                rt.acceleration_structure.cmd_build_acceleration_structures(
                    cmd,
                    &[build_info],
                    &[std::slice::from_ref(&range)],
                );
            }
            Ok(())
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.handle
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.structure.address
    }

    pub fn instance_count(&self) -> usize {
        self.topology.len()
    }

    pub fn allows_update(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    pub fn topology(&self) -> &TopologyKey {
        &self.topology
    }
}

fn instances_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    struct FakeBottomLevel(Vec<Option<vk::DeviceAddress>>);

    impl BottomLevelLookup for FakeBottomLevel {
        fn structure_address(&self, mesh_index: usize) -> Option<vk::DeviceAddress> {
            self.0.get(mesh_index).copied().flatten()
        }
    }

    fn address_of(instance: &vk::AccelerationStructureInstanceKHR) -> vk::DeviceAddress {
        unsafe { instance.acceleration_structure_reference.device_handle }
    }

    #[test]
    fn translation_lands_in_last_column() {
        let packed = pack_transform(&Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(
            packed.matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn unpack_restores_affine_transform() {
        let transforms = [
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(-4.0, 0.5, 9.0)),
            Mat4::from_scale_rotation_translation(
                Vec3::new(2.0, 1.0, 0.5),
                Quat::from_rotation_y(0.7),
                Vec3::new(3.0, -1.0, 2.0),
            ),
        ];
        for transform in transforms {
            let restored = unpack_transform(&pack_transform(&transform));
            assert!(restored.abs_diff_eq(transform, 1e-6));
        }
    }

    #[test]
    fn packing_uses_instance_fields() {
        let instance = GeometryInstance::new(3, Mat4::IDENTITY)
            .with_material_offset(42)
            .with_mask(0x0F);
        let packed = pack_instance(&instance, 0xDEAD_0000).unwrap();

        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0x0F);
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
        );
        assert_eq!(address_of(&packed), 0xDEAD_0000);
    }

    #[test]
    fn consecutive_full_builds_reference_same_structures() {
        let blas = FakeBottomLevel(vec![Some(0x1000), Some(0x2000)]);
        let instances = [
            GeometryInstance::new(1, Mat4::from_rotation_x(1.2)),
            GeometryInstance::new(0, Mat4::from_translation(Vec3::Z)),
            GeometryInstance::new(1, Mat4::IDENTITY).with_material_offset(7),
        ];

        let first = pack_instances(&blas, &instances).unwrap();
        let key = TopologyKey::of(&first);
        let next = TopologyKey::for_instances(&blas, &instances).unwrap();
        assert_eq!(choose_build_mode(Some((&key, false)), &next, false), TlasBuildMode::Build);

        let second = pack_instances(&blas, &instances).unwrap();
        let addresses: Vec<_> = first.iter().map(address_of).collect();
        assert_eq!(addresses, vec![0x2000, 0x1000, 0x2000]);
        assert_eq!(addresses, second.iter().map(address_of).collect::<Vec<_>>());
        assert_eq!(key, next);
    }

    #[test]
    fn empty_instance_list_is_rejected() {
        let blas = FakeBottomLevel(vec![Some(0x1000)]);
        assert!(matches!(pack_instances(&blas, &[]), Err(RenderError::EmptyScene)));
        assert!(matches!(
            TopologyKey::for_instances(&blas, &[]),
            Err(RenderError::EmptyScene)
        ));
    }

    #[test]
    fn instance_without_structure_is_rejected() {
        // Mesh 1 exists but was never built; mesh 2 is out of range
        let blas = FakeBottomLevel(vec![Some(0x1000), None]);
        for mesh_index in [1, 2] {
            let instances = [GeometryInstance::new(mesh_index, Mat4::IDENTITY)];
            assert!(matches!(
                pack_instances(&blas, &instances),
                Err(RenderError::ProtocolViolation(_))
            ));
        }
    }

    #[test]
    fn oversized_material_offset_is_rejected() {
        let instance = GeometryInstance::new(0, Mat4::IDENTITY).with_material_offset(MAX_CUSTOM_INDEX + 1);
        assert!(matches!(
            pack_instance(&instance, 0x1000),
            Err(RenderError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn topology_ignores_transforms() {
        let a = GeometryInstance::new(0, Mat4::IDENTITY);
        let mut b = a;
        b.set_transform(Mat4::from_translation(Vec3::X));

        let key_a = TopologyKey::of(&[pack_instance(&a, 0x1000).unwrap()]);
        let key_b = TopologyKey::of(&[pack_instance(&b, 0x1000).unwrap()]);
        assert_eq!(key_a, key_b);

        let masked = TopologyKey::of(&[pack_instance(&a.with_mask(0x01), 0x1000).unwrap()]);
        assert_ne!(key_a, masked);

        let other_mesh = TopologyKey::of(&[pack_instance(&a, 0x2000).unwrap()]);
        assert_ne!(key_a, other_mesh);
    }

    #[test]
    fn build_mode_policy() {
        let instance = GeometryInstance::new(0, Mat4::IDENTITY);
        let key = TopologyKey::of(&[pack_instance(&instance, 0x1000).unwrap()]);
        let grown = TopologyKey::of(&[
            pack_instance(&instance, 0x1000).unwrap(),
            pack_instance(&instance, 0x1000).unwrap(),
        ]);

        assert_eq!(choose_build_mode(None, &key, true), TlasBuildMode::Build);
        assert_eq!(choose_build_mode(Some((&key, true)), &key, true), TlasBuildMode::Update);
        assert_eq!(choose_build_mode(Some((&key, true)), &grown, true), TlasBuildMode::Build);
        assert_eq!(choose_build_mode(Some((&key, false)), &key, true), TlasBuildMode::Build);
        assert_eq!(choose_build_mode(Some((&key, true)), &key, false), TlasBuildMode::Build);
    }
}
