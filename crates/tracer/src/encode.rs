//! Byte layouts handed to the kernel's storage buffers.
//!
//! The kernel reads these buffers as raw structs, so the layouts here are an
//! ABI: fields are tightly packed native-endian `f32`s with no implicit
//! padding. Adding, removing or reordering a field breaks the kernel without
//! any error being raised on either side.
//!
//! ```text
//!   slot 0  camera   [x.xyz 1][y.xyz 1][z.xyz 1][origin.xyz 1][fov far near]   76 bytes
//!   slot 1  light    [dir.xyz intensity]                                       16 bytes
//!   slot 3  params   [time]                                                      4 bytes
//! ```

use bytemuck::{Pod, Zeroable};

use crate::scene::{CameraLens, CameraSnapshot, DirectionalLight, RigidTransform};

pub const TRANSFORM_BYTES: usize = std::mem::size_of::<TransformBlock>();
pub const CAMERA_BYTES: usize = std::mem::size_of::<CameraBlock>();
pub const LIGHT_BYTES: usize = std::mem::size_of::<LightBlock>();
pub const PARAMS_BYTES: usize = std::mem::size_of::<f32>();

/// Three basis columns then the origin, each widened to four floats with a
/// trailing `1.0`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformBlock {
    pub columns: [[f32; 4]; 4],
}

impl TransformBlock {
    pub fn from_transform(transform: &RigidTransform) -> Self {
        let basis = &transform.basis;
        Self {
            columns: [
                basis.x_axis.extend(1.0).to_array(),
                basis.y_axis.extend(1.0).to_array(),
                basis.z_axis.extend(1.0).to_array(),
                transform.origin.extend(1.0).to_array(),
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraBlock {
    pub transform: TransformBlock,
    pub lens: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightBlock {
    pub direction: [f32; 3],
    pub intensity: f32,
}

/// 64 bytes: the rigid transform alone.
pub fn encode_transform(transform: &RigidTransform) -> [u8; TRANSFORM_BYTES] {
    bytemuck::cast(TransformBlock::from_transform(transform))
}

/// 76 bytes: the transform followed by the lens parameters.
pub fn encode_camera(camera: &CameraSnapshot) -> Vec<u8> {
    let CameraLens {
        fov_degrees,
        far,
        near,
    } = camera.lens;
    let block = CameraBlock {
        transform: TransformBlock::from_transform(&camera.transform),
        lens: [fov_degrees, far, near],
    };
    bytemuck::bytes_of(&block).to_vec()
}

/// 16 bytes. The direction is normalised again here; a zero vector stays zero.
pub fn encode_light(light: &DirectionalLight) -> [u8; LIGHT_BYTES] {
    let block = LightBlock {
        direction: light.direction.normalize_or_zero().to_array(),
        intensity: light.intensity,
    };
    bytemuck::cast(block)
}

/// `values.len() * 4` bytes, no header.
pub fn encode_scalars(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Global parameters bound at slot 3.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameParams {
    pub time: f32,
}

impl FrameParams {
    pub fn encode(&self) -> Vec<u8> {
        encode_scalars(&[self.time])
    }
}
