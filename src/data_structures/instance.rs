//! Local transforms and their packed per-instance form.
//!
//! A [`Instance`] holds position, Euler rotation (radians) and scale. The
//! same type is the local transform of a scene-graph node and the source of
//! the per-instance `instanceOffset` stream of instanced geometry.

use cgmath::{Matrix, Matrix3, Matrix4, Rad, SquareMatrix, Vector3};

/// Position, rotation (Euler angles in radians, applied X then Y then Z in
/// matrix order) and scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub position: Vector3<f32>,
    pub rotation: Vector3<f32>,
    pub scale: Vector3<f32>,
}

impl Instance {
    /// Create a new instance with identity transformation (no move, rotate, or scale).
    pub fn new() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 0.0),
            rotation: Vector3::new(0.0, 0.0, 0.0),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    /// `T * Rx * Ry * Rz * S`
    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.position)
            * Matrix4::from_angle_x(Rad(self.rotation.x))
            * Matrix4::from_angle_y(Rad(self.rotation.y))
            * Matrix4::from_angle_z(Rad(self.rotation.z))
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    pub fn to_raw(&self) -> InstanceRaw {
        InstanceRaw {
            model: self.to_matrix().into(),
        }
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vector3<f32>> for Instance {
    fn from(position: Vector3<f32>) -> Self {
        Instance {
            position,
            ..Default::default()
        }
    }
}

/// Inverse-transpose of the upper 3x3 of `world`. Singular matrices fall back
/// to identity.
pub fn normal_matrix(world: &Matrix4<f32>) -> Matrix3<f32> {
    let upper = Matrix3::from_cols(
        world.x.truncate(),
        world.y.truncate(),
        world.z.truncate(),
    );
    upper
        .invert()
        .map(|inverse| inverse.transpose())
        .unwrap_or_else(Matrix3::identity)
}

/**
 * The raw instance is the actual data stored on the GPU: one column-major
 * model matrix read as four vec4 vertex inputs.
 */
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRaw {
    pub model: [[f32; 4]; 4],
}

/// Flattens instances into the float layout of the `instanceOffset` stream.
pub fn instance_offsets(instances: &[Instance]) -> Vec<f32> {
    let raw: Vec<InstanceRaw> = instances.iter().map(Instance::to_raw).collect();
    bytemuck::cast_slice(&raw).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{InnerSpace, Vector4};

    #[test]
    fn identity_instance_is_identity_matrix() {
        assert_eq!(Instance::new().to_matrix(), Matrix4::identity());
    }

    #[test]
    fn scale_applies_before_translation() {
        let instance = Instance {
            position: Vector3::new(1.0, 2.0, 3.0),
            scale: Vector3::new(2.0, 2.0, 2.0),
            ..Instance::new()
        };
        let p = instance.to_matrix() * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert_eq!(p, Vector4::new(3.0, 2.0, 3.0, 1.0));
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let instance = Instance {
            scale: Vector3::new(2.0, 1.0, 1.0),
            ..Instance::new()
        };
        let normal = normal_matrix(&instance.to_matrix()) * Vector3::new(1.0, 1.0, 0.0);
        let expected = Vector3::new(0.5, 1.0, 0.0);
        assert!((normal - expected).magnitude() < 1e-6);
    }

    #[test]
    fn singular_matrix_gives_identity_normal_matrix() {
        let instance = Instance {
            scale: Vector3::new(0.0, 1.0, 1.0),
            ..Instance::new()
        };
        assert_eq!(normal_matrix(&instance.to_matrix()), Matrix3::identity());
    }

    #[test]
    fn offsets_are_sixteen_floats_per_instance() {
        let offsets = instance_offsets(&[Instance::new(), Vector3::new(4.0, 5.0, 6.0).into()]);
        assert_eq!(offsets.len(), 32);
        assert_eq!(&offsets[28..31], &[4.0, 5.0, 6.0]);
    }
}
