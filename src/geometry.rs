//! Caller-facing geometry and instance descriptors.
//!
//! Descriptors carry raw device addresses, never buffer handles: the built
//! index stores addresses and does not copy source data. The caller must keep
//! every referenced buffer alive for the entire lifetime of the index built
//! from it. This is a contract, not an implementation detail.

use ash::vk;
use glam::Affine3A;

use crate::{
    accel::BlasId,
    error::{Error, Result},
    utils::glam_to_vk_transform,
};

/// An indexed triangle mesh to be built into a bottom-level index.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    /// Format of the position attribute, e.g. `R32G32B32_SFLOAT`.
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    /// `OPAQUE` and `NO_DUPLICATE_ANY_HIT_INVOCATION` go here.
    pub flags: vk::GeometryFlagsKHR,
}

/// Axis-aligned bounding boxes for procedural geometry.
///
/// The buffer holds `count` entries of `vk::AabbPositionsKHR` spaced
/// `stride` bytes apart.
#[derive(Clone, Copy, Debug)]
pub struct AabbGeometry {
    pub address: vk::DeviceAddress,
    pub stride: vk::DeviceSize,
    pub count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

/// One geometry within a bottom-level build. A single index may be built from
/// several, but all of them must be of the same class on real drivers.
#[derive(Clone, Copy, Debug)]
pub enum BlasGeometry {
    Triangles(TriangleGeometry),
    Aabbs(AabbGeometry),
}

impl BlasGeometry {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            BlasGeometry::Triangles(tri) => {
                if tri.vertex_address == 0 || tri.index_address == 0 {
                    return Err(Error::configuration(
                        "triangle geometry with null vertex or index address",
                    ));
                }
                if tri.vertex_stride == 0 {
                    return Err(Error::configuration(
                        "triangle geometry with zero vertex stride",
                    ));
                }
                if tri.vertex_count == 0 || tri.index_count == 0 {
                    return Err(Error::configuration(
                        "triangle geometry with no vertices or indices",
                    ));
                }
                if tri.index_count % 3 != 0 {
                    return Err(Error::configuration(format!(
                        "triangle geometry index count {} is not a multiple of 3",
                        tri.index_count
                    )));
                }
                Ok(())
            }
            BlasGeometry::Aabbs(aabbs) => {
                if aabbs.address == 0 {
                    return Err(Error::configuration("AABB geometry with null address"));
                }
                if aabbs.count == 0 {
                    return Err(Error::configuration("AABB geometry with no boxes"));
                }
                if aabbs.stride < std::mem::size_of::<vk::AabbPositionsKHR>() as u64 {
                    return Err(Error::configuration(format!(
                        "AABB stride {} smaller than one AABB record",
                        aabbs.stride
                    )));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn primitive_count(&self) -> u32 {
        match self {
            BlasGeometry::Triangles(tri) => tri.index_count / 3,
            BlasGeometry::Aabbs(aabbs) => aabbs.count,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match *self {
            BlasGeometry::Triangles(tri) => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                        vertex_format: tri.vertex_format,
                        vertex_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: tri.vertex_address,
                        },
                        vertex_stride: tri.vertex_stride,
                        max_vertex: tri.vertex_count.saturating_sub(1),
                        index_type: tri.index_type,
                        index_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: tri.index_address,
                        },
                        ..Default::default()
                    },
                },
                flags: tri.flags,
                ..Default::default()
            },
            BlasGeometry::Aabbs(aabbs) => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::AABBS,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR {
                        data: vk::DeviceOrHostAddressConstKHR {
                            device_address: aabbs.address,
                        },
                        stride: aabbs.stride,
                        ..Default::default()
                    },
                },
                flags: aabbs.flags,
                ..Default::default()
            },
        }
    }

    pub(crate) fn range_info(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: self.primitive_count(),
            ..Default::default()
        }
    }
}

/// One scene object inside a top-level index: a transform plus a reference to
/// a bottom-level index.
///
/// Produced fresh for every top-level build or update; the engine packs these
/// into `vk::AccelerationStructureInstanceKHR` records and does not keep them
/// beyond the build call's input buffer.
#[derive(Clone, Copy, Debug)]
pub struct InstanceDesc {
    pub transform: Affine3A,
    pub blas: BlasId,
    /// 24-bit value surfaced to shaders as the instance custom index.
    pub custom_index: u32,
    /// Visibility mask tested against each ray's cull mask.
    pub mask: u8,
    /// 24-bit offset into the hit region of the shader binding table.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl InstanceDesc {
    pub fn new(blas: BlasId) -> Self {
        Self {
            transform: Affine3A::IDENTITY,
            blas,
            custom_index: 0,
            mask: u8::MAX,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.custom_index >= 1 << 24 {
            return Err(Error::configuration(format!(
                "instance custom index {} exceeds 24 bits",
                self.custom_index
            )));
        }
        if self.sbt_record_offset >= 1 << 24 {
            return Err(Error::configuration(format!(
                "instance SBT record offset {} exceeds 24 bits",
                self.sbt_record_offset
            )));
        }
        Ok(())
    }

    /// Packs the descriptor into the wire-format instance record, with the
    /// bottom-level address already resolved by the caller.
    pub(crate) fn packed(
        &self,
        blas_address: vk::DeviceAddress,
    ) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: glam_to_vk_transform(self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.sbt_record_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        }
    }
}

// The instance record layout is consumed verbatim by the device.
const _: () = assert!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() == 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_packing_roundtrip() {
        let mut desc = InstanceDesc::new(BlasId(0));
        desc.custom_index = 0x00AB_CDEF;
        desc.mask = 0x7F;
        desc.sbt_record_offset = 3;
        desc.flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;

        let packed = desc.packed(0xDEAD_BEEF);
        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 0x00AB_CDEF);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0x7F);
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            3
        );
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { packed.acceleration_structure_reference.device_handle },
            0xDEAD_BEEF
        );
    }

    #[test]
    fn test_instance_custom_index_overflow_rejected() {
        let mut desc = InstanceDesc::new(BlasId(0));
        desc.custom_index = 1 << 24;
        assert!(matches!(
            desc.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_triangle_index_count_must_be_multiple_of_three() {
        let geometry = BlasGeometry::Triangles(TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count: 3,
            index_address: 0x2000,
            index_type: vk::IndexType::UINT32,
            index_count: 4,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        });
        assert!(matches!(
            geometry.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_degenerate_descriptors_rejected() {
        let tri = TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count: 3,
            index_address: 0x2000,
            index_type: vk::IndexType::UINT32,
            index_count: 3,
            flags: vk::GeometryFlagsKHR::empty(),
        };
        assert!(BlasGeometry::Triangles(tri).validate().is_ok());

        let zero_stride = TriangleGeometry {
            vertex_stride: 0,
            ..tri
        };
        assert!(matches!(
            BlasGeometry::Triangles(zero_stride).validate(),
            Err(Error::Configuration(_))
        ));

        let no_vertices = TriangleGeometry {
            vertex_count: 0,
            ..tri
        };
        assert!(BlasGeometry::Triangles(no_vertices).validate().is_err());

        let no_indices = TriangleGeometry {
            index_count: 0,
            ..tri
        };
        assert!(BlasGeometry::Triangles(no_indices).validate().is_err());

        let no_boxes = BlasGeometry::Aabbs(AabbGeometry {
            address: 0x3000,
            stride: std::mem::size_of::<vk::AabbPositionsKHR>() as u64,
            count: 0,
            flags: vk::GeometryFlagsKHR::empty(),
        });
        assert!(matches!(
            no_boxes.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_primitive_counts() {
        let tri = BlasGeometry::Triangles(TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count: 4,
            index_address: 0x2000,
            index_type: vk::IndexType::UINT16,
            index_count: 6,
            flags: vk::GeometryFlagsKHR::empty(),
        });
        assert_eq!(tri.primitive_count(), 2);

        let aabbs = BlasGeometry::Aabbs(AabbGeometry {
            address: 0x3000,
            stride: std::mem::size_of::<vk::AabbPositionsKHR>() as u64,
            count: 7,
            flags: vk::GeometryFlagsKHR::empty(),
        });
        assert_eq!(aabbs.primitive_count(), 7);
    }
}
