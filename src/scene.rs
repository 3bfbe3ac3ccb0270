// Scene inputs for the acceleration structure builder
//
// Meshes arrive as device addresses plus counts; instances place a mesh in the
// world with a transform and the per-instance shading data.

use crate::backend::buffer::GpuBuffer;
use crate::backend::DeviceContext;
use crate::error::{RenderError, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use std::sync::Arc;

/// Size of one R32G32B32_SFLOAT position
pub const POSITION_BYTES: vk::DeviceSize = 12;

/// Triangle geometry already resident on the device.
///
/// Positions are R32G32B32_SFLOAT at the start of each vertex; indices are u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertex_stride: vk::DeviceSize,
}

impl MeshGeometry {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.vertex_count == 0 {
            return Err(RenderError::UnsupportedGeometry("mesh has no vertices".into()));
        }
        if self.triangle_count() == 0 {
            return Err(RenderError::UnsupportedGeometry("mesh has no triangles".into()));
        }
        if self.index_count % 3 != 0 {
            return Err(RenderError::UnsupportedGeometry(format!(
                "index count {} is not a multiple of 3",
                self.index_count
            )));
        }
        if self.vertex_stride < POSITION_BYTES {
            return Err(RenderError::UnsupportedGeometry(format!(
                "vertex stride {} is smaller than a position",
                self.vertex_stride
            )));
        }
        if self.vertex_address == 0 || self.index_address == 0 {
            return Err(RenderError::UnsupportedGeometry(
                "mesh buffers have no device address".into(),
            ));
        }
        Ok(())
    }
}

/// Check a whole mesh set before anything is allocated for it
pub fn validate_meshes(meshes: &[MeshGeometry]) -> Result<()> {
    if meshes.is_empty() {
        return Err(RenderError::UnsupportedGeometry("no meshes to build".into()));
    }
    for (index, mesh) in meshes.iter().enumerate() {
        mesh.validate().map_err(|e| match e {
            RenderError::UnsupportedGeometry(reason) => {
                RenderError::UnsupportedGeometry(format!("mesh {}: {}", index, reason))
            }
            other => other,
        })?;
    }
    Ok(())
}

/// One placement of a mesh in the world
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryInstance {
    pub mesh_index: u32,
    pub transform: Mat4,
    /// Inverse-transpose of `transform`, for normals
    pub transform_it: Mat4,
    /// Offset into the material/texture tables; becomes the custom index
    pub material_offset: u32,
    pub mask: u8,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl GeometryInstance {
    pub fn new(mesh_index: u32, transform: Mat4) -> Self {
        Self {
            mesh_index,
            transform,
            transform_it: transform.inverse().transpose(),
            material_offset: 0,
            mask: 0xFF,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    pub fn with_material_offset(mut self, material_offset: u32) -> Self {
        self.material_offset = material_offset;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Move the instance; the inverse-transpose follows
    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.transform_it = transform.inverse().transpose();
    }
}

/// Host mesh data uploaded into buffers the builder can read
pub struct MeshBuffers {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub geometry: MeshGeometry,
}

impl MeshBuffers {
    pub fn upload<V: Copy>(
        device: &Arc<DeviceContext>,
        name: &str,
        vertices: &[V],
        indices: &[u32],
    ) -> Result<Self> {
        let stride = std::mem::size_of::<V>() as vk::DeviceSize;

        let mut usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        if device.capabilities.ray_tracing.is_some() {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let vertex_buffer = GpuBuffer::with_data(
            device,
            &format!("{}_vertices", name),
            usage | vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
        )?;
        let index_buffer = GpuBuffer::with_data(
            device,
            &format!("{}_indices", name),
            usage | vk::BufferUsageFlags::INDEX_BUFFER,
            indices,
        )?;

        let (vertex_address, index_address) = build_input_addresses(
            device.capabilities.ray_tracing.is_some(),
            vertex_buffer.device_address(),
            index_buffer.device_address(),
        )?;
        let geometry = MeshGeometry {
            vertex_address,
            index_address,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
            vertex_stride: stride,
        };

        log::debug!(
            "Uploaded mesh '{}': {} vertices, {} triangles",
            name,
            geometry.vertex_count,
            geometry.triangle_count()
        );

        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            geometry,
        })
    }
}

/// Device addresses the bottom-level builder reads. Without ray tracing the
/// buffers carry no address and the geometry is never built, so both are zero.
fn build_input_addresses(
    ray_tracing: bool,
    vertex: Result<vk::DeviceAddress>,
    index: Result<vk::DeviceAddress>,
) -> Result<(vk::DeviceAddress, vk::DeviceAddress)> {
    if ray_tracing {
        Ok((vertex?, index?))
    } else {
        Ok((0, 0))
    }
}

/// Unit cube centred on the origin, 24 vertices so faces keep flat normals
pub fn cube() -> (Vec<[f32; 3]>, Vec<u32>) {
    let faces = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        for (u, v) in [(-1.0_f32, -1.0_f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = (normal + right * u + up * v) * 0.5;
            vertices.push(p.to_array());
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(vertex_count: u32, index_count: u32) -> MeshGeometry {
        MeshGeometry {
            vertex_address: 0x1000,
            index_address: 0x2000,
            vertex_count,
            index_count,
            vertex_stride: 12,
        }
    }

    #[test]
    fn empty_mesh_set_is_rejected() {
        assert!(matches!(validate_meshes(&[]), Err(RenderError::UnsupportedGeometry(_))));
    }

    #[test]
    fn degenerate_meshes_are_rejected() {
        for bad in [mesh(0, 3), mesh(3, 0), mesh(3, 2), mesh(3, 4)] {
            let err = validate_meshes(&[mesh(8, 36), bad]).unwrap_err();
            match err {
                RenderError::UnsupportedGeometry(reason) => assert!(reason.starts_with("mesh 1")),
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn narrow_stride_is_rejected() {
        let mut narrow = mesh(3, 3);
        narrow.vertex_stride = 8;
        assert!(narrow.validate().is_err());
    }

    #[test]
    fn valid_mesh_passes() {
        assert!(validate_meshes(&[mesh(3, 3), mesh(24, 36)]).is_ok());
        assert_eq!(mesh(24, 36).triangle_count(), 12);
    }

    #[test]
    fn instance_defaults_match_packed_layout() {
        let instance = GeometryInstance::new(2, Mat4::IDENTITY);
        assert_eq!(instance.mask, 0xFF);
        assert_eq!(
            instance.flags,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(instance.transform_it, Mat4::IDENTITY);
    }

    #[test]
    fn set_transform_updates_inverse_transpose() {
        let mut instance = GeometryInstance::new(0, Mat4::IDENTITY);
        let scale = Mat4::from_scale(Vec3::new(2.0, 4.0, 8.0));
        instance.set_transform(scale);
        let expected = Mat4::from_scale(Vec3::new(0.5, 0.25, 0.125));
        assert!(instance.transform_it.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn cube_has_twelve_triangles_within_bounds() {
        let (vertices, indices) = cube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
        for v in vertices {
            assert!(v.iter().all(|c| c.abs() <= 0.5 + 1e-6));
        }
    }

    #[test]
    fn missing_build_input_address_fails_upload() {
        let missing = || -> Result<vk::DeviceAddress> {
            Err(RenderError::ProtocolViolation(
                "buffer was created without SHADER_DEVICE_ADDRESS usage".into(),
            ))
        };

        assert!(matches!(
            build_input_addresses(true, Ok(0x1000), missing()),
            Err(RenderError::ProtocolViolation(_))
        ));
        assert!(matches!(
            build_input_addresses(true, missing(), Ok(0x2000)),
            Err(RenderError::ProtocolViolation(_))
        ));
        assert_eq!(
            build_input_addresses(true, Ok(0x1000), Ok(0x2000)).unwrap(),
            (0x1000, 0x2000)
        );
        // Raster-only devices never build from these buffers
        assert_eq!(build_input_addresses(false, missing(), missing()).unwrap(), (0, 0));
    }
}
