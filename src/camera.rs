//! Camera and projection.
//!
//! The camera is a yaw/pitch look-around camera placed in world space; the
//! projection is a right-handed perspective mapped into wgpu's 0..1 depth
//! range. Input handling lives with the host application.

use cgmath::{InnerSpace, Matrix4, Point3, Rad, Vector3, perspective};

#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Point3<f32>,
    pub yaw: Rad<f32>,
    pub pitch: Rad<f32>,
}

impl Camera {
    pub fn new<V: Into<Point3<f32>>, Y: Into<Rad<f32>>, P: Into<Rad<f32>>>(
        position: V,
        yaw: Y,
        pitch: P,
    ) -> Self {
        Self {
            position: position.into(),
            yaw: yaw.into(),
            pitch: pitch.into(),
        }
    }

    /// Unit vector the camera looks along.
    pub fn forward(&self) -> Vector3<f32> {
        let (sin_pitch, cos_pitch) = self.pitch.0.sin_cos();
        let (sin_yaw, cos_yaw) = self.yaw.0.sin_cos();
        Vector3::new(cos_pitch * cos_yaw, sin_pitch, cos_pitch * sin_yaw).normalize()
    }

    pub fn calc_matrix(&self) -> Matrix4<f32> {
        Matrix4::look_to_rh(self.position, self.forward(), Vector3::unit_y())
    }

    /// Distance from the camera to `point` along the view direction.
    pub fn view_depth(&self, point: Point3<f32>) -> f32 {
        (point - self.position).dot(self.forward())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    aspect: f32,
    height: u32,
    fovy: Rad<f32>,
    znear: f32,
    zfar: f32,
}

impl Projection {
    pub fn new<F: Into<Rad<f32>>>(width: u32, height: u32, fovy: F, znear: f32, zfar: f32) -> Self {
        Self {
            aspect: width as f32 / height.max(1) as f32,
            height: height.max(1),
            fovy: fovy.into(),
            znear,
            zfar,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.aspect = width as f32 / height.max(1) as f32;
        self.height = height.max(1);
    }

    pub fn calc_matrix(&self) -> Matrix4<f32> {
        OPENGL_TO_WGPU_MATRIX * perspective(self.fovy, self.aspect, self.znear, self.zfar)
    }

    /// Size in world units of one pixel at `depth` in front of the camera.
    pub fn world_units_per_pixel(&self, depth: f32) -> f32 {
        2.0 * depth.max(self.znear) * (self.fovy.0 / 2.0).tan() / self.height as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Deg, Vector4};

    #[test]
    fn camera_looking_down_negative_z_keeps_origin_centered() {
        let camera = Camera::new((0.0, 0.0, 5.0), Deg(-90.0), Deg(0.0));
        let projection = Projection::new(100, 100, Deg(45.0), 0.1, 100.0);
        let view_proj = projection.calc_matrix() * camera.calc_matrix();
        let clip = view_proj * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert!((clip.x / clip.w).abs() < 1e-5);
        assert!((clip.y / clip.w).abs() < 1e-5);
        let depth = clip.z / clip.w;
        assert!(depth > 0.0 && depth < 1.0);
        assert!((camera.view_depth(Point3::new(0.0, 0.0, 0.0)) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn pixel_size_grows_with_distance() {
        let projection = Projection::new(100, 100, Deg(90.0), 0.1, 100.0);
        // tan(45deg) = 1: the viewport spans 2 * depth world units
        assert!((projection.world_units_per_pixel(50.0) - 1.0).abs() < 1e-4);
        assert!(projection.world_units_per_pixel(10.0) < projection.world_units_per_pixel(20.0));
    }
}
