//! Loading the compute kernel and checking it against the frame layout.
//!
//! The kernel is opaque to the frame loop, but its interface is not: it must
//! expose a compute entry point with an 8×8×1 workgroup and declare group 0
//! bindings that agree with [`BindingSlot`]. A mismatch would otherwise show
//! up only as wrong pixels, so the module is reflected with naga before it is
//! handed to wgpu and any disagreement becomes a [`ContractViolation`].

use std::borrow::Cow;
use std::path::Path;

use tracing::debug;
use wgpu::naga;

use crate::context::capture;
use crate::error::{ContractViolation, Result, TracerError};
use crate::slots::{BindingSlot, SlotAccess, SlotKind, BIND_GROUP_INDEX, SLOT_COUNT};

/// Local size the kernel must declare. Dispatch sizes are derived from it.
pub const WORKGROUP_SIZE: [u32; 3] = [8, 8, 1];

pub const DEFAULT_ENTRY_POINT: &str = "main";

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Largest alignment a std430 or WGSL storage struct can round its span to.
const BUFFER_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderFormat {
    SpirV,
    Wgsl,
    Glsl,
}

impl ShaderFormat {
    /// SPIR-V is recognised by its magic word; text formats by extension.
    pub fn detect(path: &Path, bytes: &[u8]) -> Option<Self> {
        if is_spirv(bytes) {
            return Some(ShaderFormat::SpirV);
        }
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("wgsl") => Some(ShaderFormat::Wgsl),
            Some("comp") | Some("glsl") => Some(ShaderFormat::Glsl),
            _ => None,
        }
    }
}

fn is_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && bytes.len() % 4 == 0
        && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC
}

/// A kernel as read from disk or embedded in the binary.
#[derive(Debug, Clone)]
pub struct KernelSource {
    label: String,
    format: ShaderFormat,
    bytes: Vec<u8>,
    entry_point: String,
}

impl KernelSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_path_as(path, None)
    }

    /// Reads `path`, trusting `format` over detection when given.
    pub fn from_path_as(path: &Path, format: Option<ShaderFormat>) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| TracerError::ShaderRead {
            path: path.to_path_buf(),
            source,
        })?;
        let label = path.display().to_string();
        let format = format
            .or_else(|| ShaderFormat::detect(path, &bytes))
            .ok_or_else(|| TracerError::ShaderParse {
                label: label.clone(),
                message: "unrecognised shader format; expected SPIR-V, .wgsl, .comp or .glsl"
                    .into(),
            })?;
        Ok(Self {
            label,
            format,
            bytes,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        })
    }

    pub fn wgsl(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self::text(label, ShaderFormat::Wgsl, source)
    }

    pub fn glsl(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self::text(label, ShaderFormat::Glsl, source)
    }

    pub fn spirv(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            format: ShaderFormat::SpirV,
            bytes,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        }
    }

    fn text(label: impl Into<String>, format: ShaderFormat, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            format,
            bytes: source.into().into_bytes(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> ShaderFormat {
        self.format
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn parse_error(&self, message: impl Into<String>) -> TracerError {
        TracerError::ShaderParse {
            label: self.label.clone(),
            message: message.into(),
        }
    }

    fn source_text(&self) -> Result<Cow<'_, str>> {
        let text = std::str::from_utf8(&self.bytes)
            .map_err(|err| self.parse_error(format!("shader source is not UTF-8: {err}")))?;
        Ok(match self.format {
            ShaderFormat::Glsl => Cow::Owned(strip_glsl_annotations(text)),
            _ => Cow::Borrowed(text),
        })
    }

    /// Parses the kernel into naga IR for reflection.
    pub fn reflect(&self) -> Result<naga::Module> {
        match self.format {
            ShaderFormat::SpirV => {
                if !is_spirv(&self.bytes) {
                    return Err(self.parse_error("missing SPIR-V magic number"));
                }
                let options = naga::front::spv::Options::default();
                naga::front::spv::parse_u8_slice(&self.bytes, &options)
                    .map_err(|err| self.parse_error(err.to_string()))
            }
            ShaderFormat::Wgsl => {
                let text = self.source_text()?;
                naga::front::wgsl::parse_str(&text)
                    .map_err(|err| self.parse_error(err.emit_to_string(&text)))
            }
            ShaderFormat::Glsl => {
                let text = self.source_text()?;
                let options = naga::front::glsl::Options::from(naga::ShaderStage::Compute);
                naga::front::glsl::Frontend::default()
                    .parse(&options, &text)
                    .map_err(|err| self.parse_error(format!("{err:?}")))
            }
        }
    }

    fn shader_source(&self) -> Result<wgpu::ShaderSource<'_>> {
        Ok(match self.format {
            ShaderFormat::SpirV => wgpu::util::make_spirv(&self.bytes),
            ShaderFormat::Wgsl => wgpu::ShaderSource::Wgsl(self.source_text()?),
            ShaderFormat::Glsl => wgpu::ShaderSource::Glsl {
                shader: self.source_text()?,
                stage: naga::ShaderStage::Compute,
                defines: &[],
            },
        })
    }
}

/// Drops the `#[compute]` section marker Godot-style GLSL files carry ahead of
/// `#version`; naga rejects it.
fn strip_glsl_annotations(source: &str) -> String {
    let mut stripped = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[") && trimmed.trim_end().ends_with(']') {
            continue;
        }
        stripped.push_str(line);
        stripped.push('\n');
    }
    stripped
}

/// What a kernel declared, as checked against the frame layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelContract {
    entry_point: String,
    workgroup_size: [u32; 3],
    declared: [Option<SlotAccess>; SLOT_COUNT],
    buffer_sizes: [u64; SLOT_COUNT],
}

impl KernelContract {
    pub fn check(
        module: &naga::Module,
        entry_point: &str,
    ) -> std::result::Result<Self, ContractViolation> {
        let entry = module
            .entry_points
            .iter()
            .find(|entry| entry.name == entry_point && entry.stage == naga::ShaderStage::Compute)
            .ok_or_else(|| ContractViolation::MissingEntryPoint(entry_point.to_string()))?;
        if entry.workgroup_size != WORKGROUP_SIZE {
            return Err(ContractViolation::WorkgroupSize {
                found: entry.workgroup_size,
                expected: WORKGROUP_SIZE,
            });
        }

        let mut declared = [None; SLOT_COUNT];
        let mut buffer_sizes = [0; SLOT_COUNT];
        for (_, global) in module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            let unknown = ContractViolation::UnknownBinding {
                group: binding.group,
                binding: binding.binding,
            };
            if binding.group != BIND_GROUP_INDEX {
                return Err(unknown);
            }
            let slot = BindingSlot::from_index(binding.binding).ok_or(unknown)?;
            declared[slot.index() as usize] = Some(declared_access(module, global, slot)?);
            if slot.kind() == SlotKind::StorageBuffer {
                buffer_sizes[slot.index() as usize] = declared_size(module, global, slot)?;
            }
        }

        Ok(Self {
            entry_point: entry_point.to_string(),
            workgroup_size: entry.workgroup_size,
            declared,
            buffer_sizes,
        })
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn is_declared(&self, slot: BindingSlot) -> bool {
        self.declared[slot.index() as usize].is_some()
    }

    /// Size to allocate for a buffer slot: the encoded payload, grown to the
    /// span the kernel declares. The tail past the payload stays zero.
    pub fn binding_size(&self, slot: BindingSlot) -> u64 {
        self.buffer_sizes[slot.index() as usize].max(slot.payload_bytes())
    }

    /// Access mode for the layout entry. Slots the kernel ignores still get
    /// an entry so the bind group stays complete.
    pub fn access(&self, slot: BindingSlot) -> SlotAccess {
        self.declared[slot.index() as usize].unwrap_or(match slot.kind() {
            SlotKind::StorageBuffer => SlotAccess::ReadOnly,
            SlotKind::StorageImage => SlotAccess::WriteOnly,
        })
    }
}

fn declared_access(
    module: &naga::Module,
    global: &naga::GlobalVariable,
    slot: BindingSlot,
) -> std::result::Result<SlotAccess, ContractViolation> {
    let mismatch = |expected: &'static str| ContractViolation::BindingKind {
        binding: slot.index(),
        slot,
        found: describe_global(module, global),
        expected,
    };
    match slot.kind() {
        SlotKind::StorageBuffer => match global.space {
            naga::AddressSpace::Storage { access } => {
                Ok(if access.contains(naga::StorageAccess::STORE) {
                    SlotAccess::ReadWrite
                } else {
                    SlotAccess::ReadOnly
                })
            }
            _ => Err(mismatch("storage buffer")),
        },
        SlotKind::StorageImage => match &module.types[global.ty].inner {
            naga::TypeInner::Image {
                dim: naga::ImageDimension::D2,
                arrayed: false,
                class: naga::ImageClass::Storage { format, access },
            } => {
                if *format != naga::StorageFormat::Rgba32Float {
                    return Err(ContractViolation::ImageFormat(
                        format!("{format:?}").to_ascii_lowercase(),
                    ));
                }
                let load = access.contains(naga::StorageAccess::LOAD);
                let store = access.contains(naga::StorageAccess::STORE);
                Ok(match (load, store) {
                    (true, true) => SlotAccess::ReadWrite,
                    (true, false) => SlotAccess::ReadOnly,
                    _ => SlotAccess::WriteOnly,
                })
            }
            _ => Err(mismatch("2D storage image")),
        },
    }
}

/// Minimum binding size of a buffer slot. Struct spans round up to their
/// alignment, so a kernel may declare up to one vec4 past the payload; any
/// more would be read from bytes the frame loop never writes.
fn declared_size(
    module: &naga::Module,
    global: &naga::GlobalVariable,
    slot: BindingSlot,
) -> std::result::Result<u64, ContractViolation> {
    let found = u64::from(module.types[global.ty].inner.size(module.to_ctx()));
    let encoded = slot.payload_bytes();
    if found > encoded.next_multiple_of(BUFFER_ALIGNMENT) {
        return Err(ContractViolation::BufferSize {
            slot,
            found,
            encoded,
        });
    }
    Ok(found)
}

fn describe_global(module: &naga::Module, global: &naga::GlobalVariable) -> String {
    match global.space {
        naga::AddressSpace::Uniform => "uniform buffer".into(),
        naga::AddressSpace::Storage { .. } => "storage buffer".into(),
        naga::AddressSpace::Handle => match &module.types[global.ty].inner {
            naga::TypeInner::Image {
                class: naga::ImageClass::Storage { .. },
                ..
            } => "storage image".into(),
            naga::TypeInner::Image { .. } => "sampled image".into(),
            naga::TypeInner::Sampler { .. } => "sampler".into(),
            _ => "resource handle".into(),
        },
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

/// A compiled kernel plus the interface it was checked against.
pub struct ComputeKernel {
    module: wgpu::ShaderModule,
    contract: KernelContract,
    label: String,
}

impl ComputeKernel {
    pub fn compile(device: &wgpu::Device, source: &KernelSource) -> Result<Self> {
        let reflected = source.reflect()?;
        let contract = KernelContract::check(&reflected, source.entry_point()).map_err(
            |violation| TracerError::Contract {
                label: source.label().to_string(),
                violation,
            },
        )?;
        for slot in BindingSlot::ALL {
            if !contract.is_declared(slot) {
                debug!(kernel = %source.label(), %slot, "kernel does not declare slot");
            }
        }

        let shader_source = source.shader_source()?;
        let module = capture(device, "compute kernel", || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source.label()),
                source: shader_source,
            })
        })?;
        debug!(
            kernel = %source.label(),
            format = ?source.format(),
            entry_point = source.entry_point(),
            "compiled compute kernel"
        );

        Ok(Self {
            module,
            contract,
            label: source.label().to_string(),
        })
    }

    pub fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }

    pub fn contract(&self) -> &KernelContract {
        &self.contract
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
