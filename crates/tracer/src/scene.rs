//! Per-frame inputs handed to the kernel: camera pose, lens and light.
//!
//! These are plain snapshots. Whoever owns the camera or light (an input
//! handler, a config file, a test) builds one per frame and passes it to
//! [`crate::Tracer::render`]; nothing here lives on the GPU.

use glam::{Mat3, Vec3};

/// An orientation plus a position. Columns of `basis` are the local X, Y and
/// Z axes expressed in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub basis: Mat3,
    pub origin: Vec3,
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        basis: Mat3::IDENTITY,
        origin: Vec3::ZERO,
    };

    pub fn new(basis: Mat3, origin: Vec3) -> Self {
        Self { basis, origin }
    }

    /// Builds a transform from yaw (about world Y) then pitch (about local X),
    /// both in degrees.
    pub fn from_yaw_pitch(origin: Vec3, yaw_degrees: f32, pitch_degrees: f32) -> Self {
        let basis = Mat3::from_rotation_y(yaw_degrees.to_radians())
            * Mat3::from_rotation_x(pitch_degrees.to_radians());
        Self { basis, origin }
    }

    /// Rotates about an axis given in the parent (world) frame. The origin
    /// stays where it is.
    pub fn rotate_global(&mut self, axis: Vec3, radians: f32) {
        self.basis = Mat3::from_axis_angle(axis.normalize_or_zero(), radians) * self.basis;
    }

    /// Rotates about an axis given in this transform's own frame.
    pub fn rotate_local(&mut self, axis: Vec3, radians: f32) {
        self.basis *= Mat3::from_axis_angle(axis.normalize_or_zero(), radians);
    }

    pub fn translate_global(&mut self, offset: Vec3) {
        self.origin += offset;
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Projection parameters appended to the camera matrix in slot 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraLens {
    pub fov_degrees: f32,
    pub far: f32,
    pub near: f32,
}

impl Default for CameraLens {
    fn default() -> Self {
        Self {
            fov_degrees: 70.0,
            far: 4000.0,
            near: 0.05,
        }
    }
}

/// Everything slot 0 needs for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraSnapshot {
    pub transform: RigidTransform,
    pub lens: CameraLens,
}

/// A directional light: where it points and how bright it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub intensity: f32,
}

impl DirectionalLight {
    pub fn new(direction: Vec3, intensity: f32) -> Self {
        Self {
            direction,
            intensity,
        }
    }

    /// A light shines down its negative local Z axis.
    pub fn from_transform(transform: &RigidTransform, intensity: f32) -> Self {
        Self {
            direction: (-transform.basis.z_axis).normalize_or_zero(),
            intensity,
        }
    }
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.3).normalize(),
            intensity: 1.0,
        }
    }
}

/// The camera and light observed for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInputs {
    pub camera: CameraSnapshot,
    pub light: DirectionalLight,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn light_from_transform_points_down_negative_z() {
        let light = DirectionalLight::from_transform(&RigidTransform::IDENTITY, 2.0);
        assert!(approx(light.direction, Vec3::NEG_Z));
        assert_eq!(light.intensity, 2.0);
    }

    #[test]
    fn global_rotation_keeps_origin() {
        let mut transform = RigidTransform::new(Mat3::IDENTITY, Vec3::new(1.0, 2.0, 3.0));
        transform.rotate_global(Vec3::Y, std::f32::consts::FRAC_PI_2);
        assert!(approx(transform.origin, Vec3::new(1.0, 2.0, 3.0)));
        assert!(approx(transform.basis.x_axis, Vec3::NEG_Z));
    }

    #[test]
    fn local_rotation_uses_own_axes() {
        let mut transform = RigidTransform::IDENTITY;
        transform.rotate_global(Vec3::Y, std::f32::consts::FRAC_PI_2);
        transform.rotate_local(Vec3::X, std::f32::consts::FRAC_PI_2);
        // Local X is now world -Z; pitching about it tilts local Y towards world X.
        assert!(approx(transform.basis.x_axis, Vec3::NEG_Z));
        assert!(approx(transform.basis.y_axis, Vec3::X));
    }
}
