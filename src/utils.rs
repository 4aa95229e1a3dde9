use ash::vk;
use glam::Affine3A;

/// A type with an underlying raw Vulkan handle.
pub trait AsVkHandle {
    type Handle;
    fn vk_handle(&self) -> Self::Handle;
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two, which holds for every Vulkan alignment
/// this crate consumes (scratch offset, shader group handle, base alignment).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn glam_to_vk_transform(affine: Affine3A) -> vk::TransformMatrixKHR {
    let x = &affine.matrix3.x_axis;
    let y = &affine.matrix3.y_axis;
    let z = &affine.matrix3.z_axis;
    let w = &affine.translation;
    vk::TransformMatrixKHR {
        // row major
        matrix: [
            x.x, y.x, z.x, w.x, x.y, y.y, z.y, w.y, x.z, y.z, z.z, w.z,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 32), 32);
    }

    #[test]
    fn test_transform_is_row_major() {
        let affine = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let transform = glam_to_vk_transform(affine);
        // Identity rotation, translation in the last column of each row.
        assert_eq!(
            transform.matrix,
            [
                1.0, 0.0, 0.0, 1.0, //
                0.0, 1.0, 0.0, 2.0, //
                0.0, 0.0, 1.0, 3.0,
            ]
        );
    }
}
