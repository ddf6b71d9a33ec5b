use std::path::PathBuf;

use crate::slots::BindingSlot;

/// Every failure the tracer can report.
///
/// Setup-time variants (`Adapter`, `Device`, `ShaderParse`, `Contract`,
/// `Resource` raised from [`crate::Tracer::new`]) are fatal: the caller should
/// abort before entering the frame loop. The same `Resource` variant raised
/// from a frame means that frame was not published.
#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("failed to find a suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("failed to read shader at {path}: {source}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse shader '{label}': {message}")]
    ShaderParse { label: String, message: String },
    #[error("shader '{label}' does not match the binding contract: {violation}")]
    Contract {
        label: String,
        violation: ContractViolation,
    },
    #[error("failed to create {label}: {message}")]
    Resource { label: &'static str, message: String },
    #[error("viewport {width}x{height} is invalid: {reason}")]
    Viewport {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("GPU device was lost: {0}")]
    DeviceLost(String),
    #[error("failed waiting for GPU work to complete: {0}")]
    Sync(#[from] wgpu::PollError),
    #[error("failed to map output image for readback: {0}")]
    Readback(String),
    #[error("output sink failed: {0:#}")]
    Sink(anyhow::Error),
    #[error("tracer resources were already released")]
    TornDown,
}

/// A disagreement between the kernel's declared interface and the fixed
/// binding/workgroup layout the frame loop drives it with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("no compute entry point named '{0}'")]
    MissingEntryPoint(String),
    #[error("workgroup size is {found:?}, expected {expected:?}")]
    WorkgroupSize { found: [u32; 3], expected: [u32; 3] },
    #[error("binding {binding} ({slot}) is declared as {found}, expected {expected}")]
    BindingKind {
        binding: u32,
        slot: BindingSlot,
        found: String,
        expected: &'static str,
    },
    #[error("binding {binding} in group {group} has no slot in the frame layout")]
    UnknownBinding { group: u32, binding: u32 },
    #[error("{slot} is declared as {found} bytes, but only {encoded} bytes are written to it")]
    BufferSize {
        slot: BindingSlot,
        found: u64,
        encoded: u64,
    },
    #[error("output image format is {0}, expected rgba32float")]
    ImageFormat(String),
}

pub type Result<T, E = TracerError> = std::result::Result<T, E>;
