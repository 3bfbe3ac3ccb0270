// Bottom-level acceleration structures
//
// One structure per mesh. Builds are grouped into batches bounded by a byte
// ceiling, share a single scratch buffer, and can be compacted afterwards.

use super::buffer::GpuBuffer;
use super::commands::CommandScratch;
use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use crate::scene::{validate_meshes, MeshGeometry};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::ops::Range;
use std::sync::Arc;

const SUBSYSTEM: &str = "blas";

/// Default upper bound on structure bytes built in one submission
pub const DEFAULT_BATCH_CEILING: vk::DeviceSize = 256_000_000;

/// An acceleration structure and the buffer backing it. Destroyed on drop.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
    _buffer: GpuBuffer,
    device: Arc<DeviceContext>,
}

impl AccelerationStructure {
    pub fn new(
        device: &Arc<DeviceContext>,
        name: &str,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let rt = device.ray_tracing()?;
        let buffer = GpuBuffer::new(
            device,
            name,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(ty);
        let handle = unsafe { rt.acceleration_structure.create_acceleration_structure(&create_info, None) }
            .vk_context(SUBSYSTEM, "create_acceleration_structure")?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let address = unsafe {
            rt.acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(Self {
            handle,
            address,
            size,
            _buffer: buffer,
            device: device.clone(),
        })
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if let Some(rt) = self.device.capabilities.ray_tracing.as_ref() {
            unsafe {
                rt.acceleration_structure
                    .destroy_acceleration_structure(self.handle, None)
            };
        }
    }
}

/// Build preferences shared by every mesh in a set
#[derive(Debug, Clone, Copy)]
pub struct BlasSettings {
    pub batch_ceiling: vk::DeviceSize,
    pub compaction: bool,
    pub prefer_fast_trace: bool,
}

impl Default for BlasSettings {
    fn default() -> Self {
        Self {
            batch_ceiling: DEFAULT_BATCH_CEILING,
            compaction: true,
            prefer_fast_trace: true,
        }
    }
}

impl BlasSettings {
    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = if self.prefer_fast_trace {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        };
        if self.compaction {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        flags
    }
}

/// Split consecutive structures into batches whose summed size stays within
/// `ceiling`. A structure that alone exceeds the ceiling gets its own batch.
pub fn plan_batches(sizes: &[vk::DeviceSize], ceiling: vk::DeviceSize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut total: vk::DeviceSize = 0;

    for (i, &size) in sizes.iter().enumerate() {
        if i > start && total.saturating_add(size) > ceiling {
            batches.push(start..i);
            start = i;
            total = 0;
        }
        total = total.saturating_add(size);
    }
    if start < sizes.len() {
        batches.push(start..sizes.len());
    }
    batches
}

/// Sizes reported by the driver for one structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub structure: vk::DeviceSize,
    pub scratch: vk::DeviceSize,
}

/// Per-mesh build state
pub struct BlasRecord {
    pub mesh: MeshGeometry,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub sizes: BuildSizes,
    pub structure: Option<AccelerationStructure>,
    /// Pre-compaction structure, kept until `destroy_retired`
    pub retired: Option<AccelerationStructure>,
}

impl BlasRecord {
    /// The built structure. Missing means a build step was skipped.
    fn built(&self) -> Result<&AccelerationStructure> {
        self.structure.as_ref().ok_or_else(|| {
            RenderError::ProtocolViolation(format!(
                "bottom-level structure for a {}-triangle mesh was never created",
                self.mesh.triangle_count()
            ))
        })
    }

    fn triangles(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.mesh.vertex_address,
            })
            .vertex_stride(self.mesh.vertex_stride)
            .max_vertex(self.mesh.vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.mesh.index_address,
            });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
    }

    fn range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.mesh.triangle_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }

    fn compacts(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }
}

struct QueryPool {
    pool: vk::QueryPool,
    device: Arc<DeviceContext>,
}

impl QueryPool {
    fn compacted_sizes(device: &Arc<DeviceContext>, count: u32) -> Result<Self> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        let pool = unsafe { device.device.create_query_pool(&info, None) }
            .vk_context(SUBSYSTEM, "create_query_pool")?;
        Ok(Self {
            pool,
            device: device.clone(),
        })
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_query_pool(self.pool, None) };
    }
}

/// All bottom-level structures for one mesh set, indexed like the meshes
pub struct BottomLevelSet {
    records: Vec<BlasRecord>,
}

impl BottomLevelSet {
    /// Build one structure per mesh.
    ///
    /// Every mesh is validated before anything is allocated. With compaction
    /// enabled the returned handles are the compacted copies.
    pub fn build(commands: &CommandScratch, meshes: &[MeshGeometry], settings: &BlasSettings) -> Result<Self> {
        validate_meshes(meshes)?;

        let device = commands.device();
        let rt = device.ray_tracing()?;
        let flags = settings.build_flags();

        let mut records: Vec<BlasRecord> = meshes
            .iter()
            .map(|&mesh| BlasRecord {
                mesh,
                flags,
                sizes: BuildSizes::default(),
                structure: None,
                retired: None,
            })
            .collect();

        let mut total_size: vk::DeviceSize = 0;
        let mut max_scratch: vk::DeviceSize = 0;
        for record in &mut records {
            let geometry = [record.triangles()];
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(record.flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(&geometry);

            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                rt.acceleration_structure.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[record.mesh.triangle_count()],
                    &mut sizes,
                );
            }
            record.sizes = BuildSizes {
                structure: sizes.acceleration_structure_size,
                scratch: sizes.build_scratch_size,
            };
            total_size += sizes.acceleration_structure_size;
            max_scratch = max_scratch.max(sizes.build_scratch_size);
        }

        let structure_sizes: Vec<_> = records.iter().map(|r| r.sizes.structure).collect();
        let batches = plan_batches(&structure_sizes, settings.batch_ceiling);
        log::info!(
            "Building {} bottom-level structures ({} bytes, {} batches, scratch {} bytes)",
            records.len(),
            total_size,
            batches.len(),
            max_scratch
        );

        let scratch = commands.scratch("blas_scratch", max_scratch)?;

        let compacting: Vec<usize> = (0..records.len()).filter(|&i| records[i].compacts()).collect();
        let queries = if compacting.is_empty() {
            None
        } else {
            Some(QueryPool::compacted_sizes(device, records.len() as u32)?)
        };

        for (batch_index, batch) in batches.iter().enumerate() {
            for i in batch.clone() {
                records[i].structure = Some(AccelerationStructure::new(
                    device,
                    "blas",
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    records[i].sizes.structure,
                )?);
            }

            let batch_records = &records[batch.clone()];
            commands.run_once("blas batch", |ctx, cmd| {
                Self::record_batch(ctx, cmd, batch_records, batch.start as u32, scratch.address, queries.as_ref())
            })?;
            log::debug!("Bottom-level batch {} built ({} structures)", batch_index, batch.len());
        }

        if let Some(queries) = &queries {
            Self::compact(commands, &mut records, &compacting, queries)?;
        }

        Ok(Self { records })
    }

    fn record_batch(
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        records: &[BlasRecord],
        first_query: u32,
        scratch_address: vk::DeviceAddress,
        queries: Option<&QueryPool>,
    ) -> Result<()> {
        let rt = ctx.ray_tracing()?;

        if let Some(queries) = queries {
            unsafe {
                ctx.device
                    .cmd_reset_query_pool(cmd, queries.pool, first_query, records.len() as u32)
            };
        }

        // Builds share the scratch buffer, so each must finish before the next
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            );

        for (offset, record) in records.iter().enumerate() {
            let structure = record.built()?;

            let geometry = [record.triangles()];
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(record.flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(structure.handle)
                .geometries(&geometry)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                });
            let range = record.range();

            unsafe {
                rt.acceleration_structure
                    .cmd_build_acceleration_structures(cmd, &[build_info], &[std::slice::from_ref(&range)]);
                ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                if let Some(queries) = queries.filter(|_| record.compacts()) {
                    rt.acceleration_structure.cmd_write_acceleration_structures_properties(
                        cmd,
                        &[structure.handle],
                        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                        queries.pool,
                        first_query + offset as u32,
                    );
                }
            }
        }
        Ok(())
    }

    fn compact(
        commands: &CommandScratch,
        records: &mut [BlasRecord],
        compacting: &[usize],
        queries: &QueryPool,
    ) -> Result<()> {
        let device = commands.device();

        let mut compacted = vec![0u64; records.len()];
        unsafe {
            device.device.get_query_pool_results(
                queries.pool,
                0,
                &mut compacted,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )
        }
        .vk_context(SUBSYSTEM, "get_query_pool_results")?;

        let mut copies = Vec::with_capacity(compacting.len());
        for &i in compacting {
            // Checked before any allocation so no uncopied structure is swapped in
            let source = records[i].built()?.handle;
            let size = compacted[i];
            if size == 0 {
                return Err(RenderError::Device {
                    subsystem: SUBSYSTEM,
                    call: "get_query_pool_results",
                    result: vk::Result::ERROR_UNKNOWN,
                });
            }
            let structure = AccelerationStructure::new(
                device,
                "blas_compacted",
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                size,
            )?;
            copies.push((i, source, structure));
        }

        commands.run_once("blas compaction", |ctx, cmd| {
            let rt = ctx.ray_tracing()?;
            for (_, source, compact) in &copies {
                let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                    .src(*source)
                    .dst(compact.handle)
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                unsafe { rt.acceleration_structure.cmd_copy_acceleration_structure(cmd, &copy_info) };
            }
            Ok(())
        })?;

        let before: vk::DeviceSize = compacting.iter().map(|&i| records[i].sizes.structure).sum();
        let after: vk::DeviceSize = copies.iter().map(|(_, _, s)| s.size).sum();

        for (i, _, compact) in copies {
            let record = &mut records[i];
            record.retired = record.structure.replace(compact);
        }

        log::info!(
            "Compacted {} bottom-level structures: {} -> {} bytes",
            compacting.len(),
            before,
            after
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[BlasRecord] {
        &self.records
    }

    /// Device address of the structure built for `mesh_index`
    pub fn address(&self, mesh_index: usize) -> Option<vk::DeviceAddress> {
        self.records
            .get(mesh_index)?
            .structure
            .as_ref()
            .map(|s| s.address)
    }

    pub fn handle(&self, mesh_index: usize) -> Option<vk::AccelerationStructureKHR> {
        self.records
            .get(mesh_index)?
            .structure
            .as_ref()
            .map(|s| s.handle)
    }

    /// Release the pre-compaction structures. Returns how many were freed.
    pub fn destroy_retired(&mut self) -> usize {
        let freed = self
            .records
            .iter_mut()
            .filter_map(|record| record.retired.take())
            .count();
        if freed > 0 {
            log::debug!("Destroyed {} retired bottom-level structures", freed);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: vk::DeviceSize = 1_000_000;

    #[test]
    fn three_large_meshes_split_in_two_batches() {
        let batches = plan_batches(&[100 * M, 100 * M, 100 * M], DEFAULT_BATCH_CEILING);
        assert_eq!(batches, vec![0..2, 2..3]);
    }

    #[test]
    fn oversize_structure_gets_its_own_batch() {
        let batches = plan_batches(&[10 * M, 300 * M, 10 * M], DEFAULT_BATCH_CEILING);
        assert_eq!(batches, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn exact_fit_stays_in_one_batch() {
        let batches = plan_batches(&[128 * M, 128 * M], 256 * M);
        assert_eq!(batches, vec![0..2]);
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(plan_batches(&[], DEFAULT_BATCH_CEILING).is_empty());
    }

    #[test]
    fn batches_cover_every_structure_once_and_respect_ceiling() {
        let sizes: Vec<vk::DeviceSize> = (0..40).map(|i| (i * 37 % 11 + 1) * 9 * M).collect();
        let ceiling = 50 * M;
        let batches = plan_batches(&sizes, ceiling);

        let mut next = 0;
        for batch in &batches {
            assert_eq!(batch.start, next);
            assert!(!batch.is_empty());
            let total: vk::DeviceSize = sizes[batch.clone()].iter().sum();
            assert!(total <= ceiling || batch.len() == 1);
            next = batch.end;
        }
        assert_eq!(next, sizes.len());
    }

    #[test]
    fn build_flags_follow_settings() {
        let settings = BlasSettings::default();
        let flags = settings.build_flags();
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));

        let fast_build = BlasSettings {
            compaction: false,
            prefer_fast_trace: false,
            ..settings
        };
        let flags = fast_build.build_flags();
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD));
        assert!(!flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
    }

    #[test]
    fn unbuilt_record_is_a_protocol_violation() {
        let record = BlasRecord {
            mesh: MeshGeometry {
                vertex_address: 0x1000,
                index_address: 0x2000,
                vertex_count: 3,
                index_count: 3,
                vertex_stride: 12,
            },
            flags: BlasSettings::default().build_flags(),
            sizes: BuildSizes::default(),
            structure: None,
            retired: None,
        };
        assert!(matches!(record.built(), Err(RenderError::ProtocolViolation(_))));
    }
}
