//! Frame loop for a compute-shader ray tracer.
//!
//! A [`Tracer`] owns a compiled kernel, its pipeline and the four binding
//! slots the kernel reads and writes. Each call to [`Tracer::render`] encodes
//! the camera and time into fresh buffers, dispatches the kernel over the
//! output image, waits for the GPU, reads the image back and hands the bytes
//! to an [`OutputSink`].

mod camera;
mod context;
mod encode;
mod error;
mod frame;
mod kernel;
mod orchestrator;
mod resources;
mod scene;
mod sink;
mod slots;

pub use camera::{FreeLookCamera, MoveInput};
pub use context::{create_instance, ContextOptions, GpuContext};
pub use encode::{
    encode_camera, encode_light, encode_scalars, encode_transform, CameraBlock, FrameParams,
    LightBlock, TransformBlock, CAMERA_BYTES, LIGHT_BYTES, PARAMS_BYTES, TRANSFORM_BYTES,
};
pub use error::{ContractViolation, Result, TracerError};
pub use frame::{
    dispatch_grid, uncovered_strip, FrameClock, FramePhase, FrameStats, GridRounding,
};
pub use kernel::{
    ComputeKernel, KernelContract, KernelSource, ShaderFormat, DEFAULT_ENTRY_POINT,
    WORKGROUP_SIZE,
};
pub use orchestrator::{FrameReport, Tracer, TracerOptions};
pub use resources::{ResourceManager, OUTPUT_BYTES_PER_PIXEL, OUTPUT_FORMAT};
pub use scene::{CameraLens, CameraSnapshot, DirectionalLight, FrameInputs, RigidTransform};
pub use sink::{CapturedFrame, FileSink, MemorySink, NullSink, OutputFrame, OutputSink};
pub use slots::{BindingSlot, SlotAccess, SlotGenerations, SlotKind, BIND_GROUP_INDEX, SLOT_COUNT};
