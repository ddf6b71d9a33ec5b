//! GPU objects that live across frames and the rules for replacing them.

use std::borrow::Cow;

use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::context::{capture, GpuContext};
use crate::encode::{encode_camera, encode_light, FrameParams};
use crate::error::Result;
use crate::kernel::{ComputeKernel, KernelContract};
use crate::scene::{CameraSnapshot, DirectionalLight};
use crate::slots::{
    layout_entry, BindingSlot, SlotGenerations, SlotResource, SlotTable, BIND_GROUP_INDEX,
};

pub const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const OUTPUT_BYTES_PER_PIXEL: u32 = 16;

/// Owns the kernel, pipeline, slot resources and binding set.
pub struct ResourceManager {
    device: wgpu::Device,
    kernel: ComputeKernel,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipeline: wgpu::ComputePipeline,
    output: wgpu::Texture,
    readback: OutputReadback,
    slots: SlotTable,
    bind_group: wgpu::BindGroup,
    light: DirectionalLight,
    width: u32,
    height: u32,
}

impl ResourceManager {
    /// Builds every GPU object the frame loop needs. Any failure here is fatal.
    pub fn initialize(
        context: &GpuContext,
        kernel: ComputeKernel,
        width: u32,
        height: u32,
        camera: &CameraSnapshot,
        light: &DirectionalLight,
    ) -> Result<Self> {
        context.check_viewport(width, height)?;
        let device = context.device().clone();

        let contract = kernel.contract();
        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = BindingSlot::ALL
            .into_iter()
            .map(|slot| layout_entry(slot, contract.access(slot), OUTPUT_FORMAT))
            .collect();
        let layout = capture(&device, "binding layout", || {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tracer slots layout"),
                entries: &layout_entries,
            })
        })?;
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tracer pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = capture(&device, "compute pipeline", || {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("tracer pipeline"),
                layout: Some(&pipeline_layout),
                module: kernel.module(),
                entry_point: Some(contract.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        // wgpu zero-initialises textures, so pixels the grid never reaches read as 0.
        let output = capture(&device, "output image", || {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("tracer output image"),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: OUTPUT_FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        })?;
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let readback = OutputReadback::new(&device, width, height)?;

        let camera_buffer =
            storage_buffer(&device, contract, BindingSlot::Camera, &encode_camera(camera))?;
        let light_buffer =
            storage_buffer(&device, contract, BindingSlot::Light, &encode_light(light))?;
        let params_buffer = storage_buffer(
            &device,
            contract,
            BindingSlot::Params,
            &FrameParams::default().encode(),
        )?;
        let slots = SlotTable::new(camera_buffer, light_buffer, output_view, params_buffer);
        let bind_group = create_bind_group(&device, &layout, &slots, &[])?;

        debug!(
            width,
            height,
            kernel = kernel.label(),
            "initialised compute resources"
        );

        Ok(Self {
            device,
            kernel,
            layout,
            pipeline_layout,
            pipeline,
            output,
            readback,
            slots,
            bind_group,
            light: *light,
            width,
            height,
        })
    }

    /// Fresh camera and params buffers for this frame. Slots 1 and 2 keep
    /// their handles; the binding set is recreated around all four.
    pub fn rebuild_dynamic_bindings(
        &mut self,
        camera: &CameraSnapshot,
        params: FrameParams,
    ) -> Result<()> {
        let contract = self.kernel.contract();
        let camera_buffer =
            storage_buffer(&self.device, contract, BindingSlot::Camera, &encode_camera(camera))?;
        let params_buffer =
            storage_buffer(&self.device, contract, BindingSlot::Params, &params.encode())?;
        self.replace_slots(vec![
            (BindingSlot::Camera, SlotResource::Buffer(camera_buffer)),
            (BindingSlot::Params, SlotResource::Buffer(params_buffer)),
        ])?;
        trace!(time = params.time, "rebuilt dynamic bindings");
        Ok(())
    }

    /// Re-points slot 1 at a buffer holding `light`.
    pub fn update_light(&mut self, light: &DirectionalLight) -> Result<()> {
        let contract = self.kernel.contract();
        let light_buffer =
            storage_buffer(&self.device, contract, BindingSlot::Light, &encode_light(light))?;
        self.replace_slots(vec![(
            BindingSlot::Light,
            SlotResource::Buffer(light_buffer),
        )])?;
        self.light = *light;
        debug!(direction = ?light.direction, intensity = light.intensity, "light changed");
        Ok(())
    }

    /// Creates the new binding set first; the slot table only changes once it
    /// exists, so a failure leaves the previous frame's bindings in place.
    fn replace_slots(&mut self, staged: Vec<(BindingSlot, SlotResource)>) -> Result<()> {
        let created = create_bind_group(&self.device, &self.layout, &self.slots, &staged);
        let bind_group = match created {
            Ok(bind_group) => bind_group,
            Err(err) => {
                for (_, resource) in staged {
                    resource.release();
                }
                return Err(err);
            }
        };
        self.bind_group = bind_group;
        for (slot, resource) in staged {
            self.slots.replace(slot, resource).release();
        }
        Ok(())
    }

    /// Binds the pipeline and slots at group 0 and launches `grid` workgroups.
    pub fn record_dispatch(&self, encoder: &mut wgpu::CommandEncoder, grid: [u32; 3]) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("tracer dispatch"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(BIND_GROUP_INDEX, &self.bind_group, &[]);
        if grid.iter().all(|&groups| groups > 0) {
            pass.dispatch_workgroups(grid[0], grid[1], grid[2]);
        }
    }

    pub(crate) fn readback(&self) -> &OutputReadback {
        &self.readback
    }

    pub fn record_readback(&self, encoder: &mut wgpu::CommandEncoder) {
        self.readback.record_copy(encoder, &self.output);
    }

    pub fn slot_generations(&self) -> SlotGenerations {
        self.slots.generations()
    }

    pub fn bound_light(&self) -> &DirectionalLight {
        &self.light
    }

    pub fn output_image(&self) -> &wgpu::Texture {
        &self.output
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Releases everything, dependents first: binding set, slot buffers,
    /// output image, pipeline, layouts, kernel.
    pub fn teardown(self) {
        let Self {
            device: _device,
            kernel,
            layout,
            pipeline_layout,
            pipeline,
            output,
            readback,
            slots,
            bind_group,
            ..
        } = self;
        drop(bind_group);
        slots.release();
        readback.release();
        output.destroy();
        drop(pipeline);
        drop(pipeline_layout);
        drop(layout);
        drop(kernel);
        debug!("released compute resources");
    }
}

/// Uploads `contents` into a new buffer sized for what the kernel declared
/// at `slot`, zero-filling any tail past the payload.
fn storage_buffer(
    device: &wgpu::Device,
    contract: &KernelContract,
    slot: BindingSlot,
    contents: &[u8],
) -> Result<wgpu::Buffer> {
    let label = slot.label();
    let contents = pad_to(contents, contract.binding_size(slot));
    capture(device, label, || {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &contents,
            usage: wgpu::BufferUsages::STORAGE,
        })
    })
}

fn pad_to(contents: &[u8], size: u64) -> Cow<'_, [u8]> {
    let size = size as usize;
    if contents.len() >= size {
        return Cow::Borrowed(contents);
    }
    let mut padded = contents.to_vec();
    padded.resize(size, 0);
    Cow::Owned(padded)
}

fn create_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    slots: &SlotTable,
    staged: &[(BindingSlot, SlotResource)],
) -> Result<wgpu::BindGroup> {
    let entries = slots.entries_with(staged);
    capture(device, "binding set", || {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tracer slots"),
            layout,
            entries: &entries,
        })
    })
}

/// Mappable copy target for the output image. Rows are padded to
/// `COPY_BYTES_PER_ROW_ALIGNMENT`; [`Self::unpad_into`] strips the padding.
pub(crate) struct OutputReadback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
}

impl OutputReadback {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Result<Self> {
        let padded_bytes_per_row = padded_bytes_per_row(width);
        let buffer = capture(device, "readback buffer", || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("tracer readback"),
                size: u64::from(padded_bytes_per_row) * u64::from(height),
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(Self {
            buffer,
            width,
            height,
            padded_bytes_per_row,
        })
    }

    fn record_copy(&self, encoder: &mut wgpu::CommandEncoder, output: &wgpu::Texture) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: output,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Drops a pending or completed map so the next frame can copy into the
    /// buffer again. Harmless when the map already failed.
    pub(crate) fn cancel_map(&self, device: &wgpu::Device) {
        if let Err(err) = capture(device, "readback unmap", || self.buffer.unmap()) {
            trace!(error = %err, "readback buffer was not mapped");
        }
    }

    /// Copies the mapped rows into `pixels` without padding.
    pub(crate) fn unpad_into(&self, mapped: &[u8], pixels: &mut Vec<u8>) {
        unpad_rows(mapped, self.width, self.height, self.padded_bytes_per_row, pixels);
    }

    fn release(self) {
        self.buffer.destroy();
    }
}

fn unpad_rows(
    mapped: &[u8],
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
    pixels: &mut Vec<u8>,
) {
    let row_bytes = (width * OUTPUT_BYTES_PER_PIXEL) as usize;
    pixels.clear();
    pixels.reserve(row_bytes * height as usize);
    for row in mapped
        .chunks(padded_bytes_per_row as usize)
        .take(height as usize)
    {
        pixels.extend_from_slice(&row[..row_bytes]);
    }
}

pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * OUTPUT_BYTES_PER_PIXEL;
    unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::error::TracerError;
    use crate::kernel::KernelSource;

    const STRUCT_CAMERA_KERNEL: &str = r"
struct Camera { to_world: mat4x4<f32>, fov: f32, far: f32, near: f32 }
struct Params { time: f32 }

@group(0) @binding(0) var<storage, read> camera: Camera;
@group(0) @binding(2) var output: texture_storage_2d<rgba32float, write>;
@group(0) @binding(3) var<storage, read> params: Params;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(camera.fov, params.time, 0.0, 1.0));
}
";

    fn manager() -> Option<(GpuContext, ResourceManager)> {
        let context = match GpuContext::headless(ContextOptions::default()) {
            Ok(context) => context,
            Err(err) => {
                eprintln!("skipping GPU test: {err}");
                return None;
            }
        };
        let source = KernelSource::wgsl("resources test", STRUCT_CAMERA_KERNEL);
        let kernel = ComputeKernel::compile(context.device(), &source).expect("kernel");
        let resources = ResourceManager::initialize(
            &context,
            kernel,
            8,
            8,
            &CameraSnapshot::default(),
            &DirectionalLight::default(),
        )
        .expect("resources");
        Some((context, resources))
    }

    #[test]
    fn short_payloads_are_zero_padded() {
        assert_eq!(pad_to(&[1, 2, 3, 4], 8).as_ref(), &[1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(matches!(pad_to(&[1, 2, 3, 4], 4), Cow::Borrowed(_)));
        assert!(matches!(pad_to(&[1, 2, 3, 4], 0), Cow::Borrowed(_)));
    }

    #[test]
    fn failed_replacement_keeps_previous_bindings() {
        let Some((context, mut resources)) = manager() else { return };
        let before = resources.slot_generations();

        // Uniform-only buffers cannot back a storage binding.
        let unusable = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("unusable camera"),
            size: 80,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let err = resources
            .replace_slots(vec![(BindingSlot::Camera, SlotResource::Buffer(unusable))])
            .unwrap_err();
        assert!(matches!(err, TracerError::Resource { label: "binding set", .. }));
        assert_eq!(resources.slot_generations(), before);

        resources
            .rebuild_dynamic_bindings(&CameraSnapshot::default(), FrameParams { time: 1.0 })
            .expect("rebuild after failure");
        let after = resources.slot_generations();
        assert_eq!(after.get(BindingSlot::Camera), before.get(BindingSlot::Camera) + 1);
        assert_eq!(after.get(BindingSlot::Light), before.get(BindingSlot::Light));
        resources.teardown();
    }

    #[test]
    fn cancelled_map_frees_the_readback_buffer() {
        let Some((context, resources)) = manager() else { return };
        let device = context.device();

        resources
            .readback()
            .buffer()
            .slice(..)
            .map_async(wgpu::MapMode::Read, |_| {});
        resources.readback().cancel_map(device);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("copy after cancel"),
        });
        resources.record_readback(&mut encoder);
        capture(device, "frame commands", || {
            context.queue().submit(std::iter::once(encoder.finish()));
        })
        .expect("readback buffer is usable again");

        // Nothing is pending now; cancelling again only logs.
        resources.readback().cancel_map(device);
        resources.teardown();
    }

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(16), 256);
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(17), 512);
        assert_eq!(padded_bytes_per_row(1920), 1920 * 16);
    }

    #[test]
    fn unpadding_keeps_only_pixel_bytes() {
        let padded = padded_bytes_per_row(2) as usize;
        let mut mapped = vec![0xAAu8; padded * 3];
        for row in 0..3 {
            for byte in 0..32 {
                mapped[row * padded + byte] = row as u8;
            }
        }
        let mut pixels = vec![0xFF; 7];
        unpad_rows(&mapped, 2, 3, padded as u32, &mut pixels);
        assert_eq!(pixels.len(), 2 * 3 * 16);
        for (row, chunk) in pixels.chunks(32).enumerate() {
            assert!(chunk.iter().all(|&byte| byte == row as u8));
        }
    }
}
