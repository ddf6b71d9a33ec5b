//! Mouse-look and WASD-style movement for the camera transform.
//!
//! The model is input-agnostic: the front end feeds mouse deltas and an axis
//! vector and reads back a [`CameraSnapshot`] each frame.

use glam::Vec3;

use crate::scene::{CameraLens, CameraSnapshot, RigidTransform};

/// Movement request for one frame, each axis in `-1.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveInput {
    /// Positive moves right.
    pub right: f32,
    /// Positive moves up.
    pub up: f32,
    /// Positive moves backward, matching the camera's +Z.
    pub backward: f32,
}

impl MoveInput {
    pub fn as_vec3(&self) -> Vec3 {
        Vec3::new(self.right, self.up, self.backward)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreeLookCamera {
    pub transform: RigidTransform,
    pub lens: CameraLens,
    /// Degrees of rotation per unit of mouse motion.
    pub mouse_sensitivity: f32,
    /// World units per frame at full input.
    pub move_speed: f32,
}

impl FreeLookCamera {
    pub fn new(transform: RigidTransform, lens: CameraLens) -> Self {
        Self {
            transform,
            lens,
            mouse_sensitivity: 1.0,
            move_speed: 0.1,
        }
    }

    pub fn with_controls(mut self, mouse_sensitivity: f32, move_speed: f32) -> Self {
        self.mouse_sensitivity = mouse_sensitivity;
        self.move_speed = move_speed;
        self
    }

    /// Yaw about world Y by `-dx`, then pitch about the camera's own X by `dy`.
    pub fn look(&mut self, dx: f32, dy: f32) {
        self.transform
            .rotate_global(Vec3::Y, (-dx * self.mouse_sensitivity).to_radians());
        self.transform
            .rotate_local(Vec3::X, (dy * self.mouse_sensitivity).to_radians());
    }

    /// Moves along the camera's own axes. Diagonal input is not faster than
    /// straight input.
    pub fn step(&mut self, input: MoveInput) {
        let mut axes = input.as_vec3();
        if axes.length() > 1.0 {
            axes = axes.normalize();
        }
        let basis = self.transform.basis;
        let offset = (basis.z_axis * axes.z + basis.x_axis * axes.x + basis.y_axis * axes.y)
            * self.move_speed;
        self.transform.translate_global(offset);
    }

    pub fn snapshot(&self) -> CameraSnapshot {
        CameraSnapshot {
            transform: self.transform,
            lens: self.lens,
        }
    }
}

impl Default for FreeLookCamera {
    fn default() -> Self {
        Self::new(RigidTransform::IDENTITY, CameraLens::default())
    }
}
