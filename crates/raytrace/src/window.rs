use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracer::{
    create_instance, DirectionalLight, FrameInputs, FreeLookCamera, GpuContext, MoveInput,
    OutputFrame, OutputSink, Tracer, TracerError, OUTPUT_BYTES_PER_PIXEL, OUTPUT_FORMAT,
};
use tracing::{debug, error, info, warn};
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, ElementState, Event, KeyEvent, MouseButton, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Window, WindowBuilder};

use crate::session::Session;

const TITLE: &str = "raytrace";

/// Stretches the traced image over the surface. `textureLoad` because
/// rgba32float is not filterable everywhere.
const BLIT_SHADER: &str = r"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let corner = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(corner * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(corner.x, 1.0 - corner.y);
    return out;
}

@group(0) @binding(0) var frame: texture_2d<f32>;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let size = textureDimensions(frame);
    let texel = min(vec2<u32>(in.uv * vec2<f32>(size)), size - vec2<u32>(1u));
    return vec4<f32>(textureLoad(frame, texel, 0).rgb, 1.0);
}
";

pub fn run_window(session: Session) -> Result<()> {
    let event_loop = EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let window = WindowBuilder::new()
        .with_title(TITLE)
        .with_inner_size(PhysicalSize::new(session.width, session.height))
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create window: {err}"))?;
    let window = Arc::new(window);

    let options = session.context_options();
    let instance = create_instance(&options);
    let surface = instance
        .create_surface(Arc::clone(&window))
        .context("failed to create rendering surface")?;
    let context = GpuContext::for_surface(instance, &surface, options)
        .context("failed to initialise the GPU")?;
    let info = context.adapter_info();
    info!(adapter = %info.name, backend = ?info.backend, "using GPU adapter");

    let mut sink = SurfaceSink::new(&context, surface, window.inner_size())?;
    let source = session.kernel_source()?;
    let tracer = Tracer::new(
        context,
        &source,
        session.width,
        session.height,
        &session.inputs(),
        session.options,
    )
    .context("tracer setup failed")?;
    tracer.init_sink(&mut sink)?;

    let mut viewer = Viewer {
        window,
        tracer,
        sink,
        camera: session.camera.clone(),
        light: session.light,
        controls: Controls::default(),
        last_frame: Instant::now(),
        last_title: Instant::now(),
    };
    info!("window ready; hold the right mouse button to look, WASD/Space/Shift to move, Esc to quit");

    let failure: Rc<RefCell<Option<anyhow::Error>>> = Rc::new(RefCell::new(None));
    let loop_failure = Rc::clone(&failure);
    let run_result = event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { window_id, event } if window_id == viewer.window.id() => match event
        {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => elwt.exit(),
            WindowEvent::KeyboardInput { event, .. } => {
                if viewer.handle_key(&event) {
                    elwt.exit();
                }
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Right,
                ..
            } => viewer.set_looking(state == ElementState::Pressed),
            WindowEvent::Focused(false) => {
                viewer.controls = Controls::default();
                viewer.set_looking(false);
            }
            WindowEvent::Resized(size) => viewer.sink.resize(size),
            WindowEvent::RedrawRequested => {
                if let Err(err) = viewer.redraw() {
                    error!(error = %err, "stopping after unrecoverable frame error");
                    *loop_failure.borrow_mut() = Some(err.into());
                    elwt.exit();
                }
            }
            _ => {}
        },
        Event::DeviceEvent {
            event: DeviceEvent::MouseMotion { delta: (dx, dy) },
            ..
        } => {
            if viewer.controls.looking {
                viewer.camera.look(dx as f32, dy as f32);
            }
        }
        Event::AboutToWait => {
            viewer.window.request_redraw();
            elwt.set_control_flow(ControlFlow::Poll);
        }
        Event::LoopExiting => {
            viewer.tracer.teardown();
            if let Err(err) = viewer.sink.finish() {
                warn!(error = %err, "failed to finish presenting");
            }
        }
        _ => {}
    });

    if let Err(err) = run_result {
        return Err(anyhow!("window event loop error: {err}"));
    }
    let pending = failure.borrow_mut().take();
    match pending {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct Viewer {
    window: Arc<Window>,
    tracer: Tracer,
    sink: SurfaceSink,
    camera: FreeLookCamera,
    light: DirectionalLight,
    controls: Controls,
    last_frame: Instant,
    last_title: Instant,
}

impl Viewer {
    /// Returns true when the key asks to quit.
    fn handle_key(&mut self, event: &KeyEvent) -> bool {
        let PhysicalKey::Code(code) = event.physical_key else {
            return false;
        };
        let pressed = event.state == ElementState::Pressed;
        if code == KeyCode::Escape && pressed {
            return true;
        }
        self.controls.set_key(code, pressed);
        false
    }

    fn set_looking(&mut self, looking: bool) {
        if self.controls.looking == looking {
            return;
        }
        self.controls.looking = looking;
        if looking {
            let grabbed = self
                .window
                .set_cursor_grab(CursorGrabMode::Locked)
                .or_else(|_| self.window.set_cursor_grab(CursorGrabMode::Confined));
            if let Err(err) = grabbed {
                debug!(error = %err, "cursor grab unavailable");
            }
        } else if let Err(err) = self.window.set_cursor_grab(CursorGrabMode::None) {
            debug!(error = %err, "failed to release cursor");
        }
        self.window.set_cursor_visible(!looking);
    }

    /// Renders one frame. Only errors that end the session are returned.
    fn redraw(&mut self) -> Result<(), TracerError> {
        let now = Instant::now();
        let delta = now.saturating_duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.camera.step(self.controls.movement());
        let inputs = FrameInputs {
            camera: self.camera.snapshot(),
            light: self.light,
        };
        match self.tracer.render(delta, &inputs, &mut self.sink) {
            Ok(_) => {}
            Err(err @ (TracerError::DeviceLost(_) | TracerError::TornDown | TracerError::Sink(_))) => {
                return Err(err)
            }
            Err(_) => {}
        }

        if now.saturating_duration_since(self.last_title) >= Duration::from_secs(1) {
            self.last_title = now;
            self.window.set_title(&format!(
                "{TITLE} | {:.0} FPS",
                self.tracer.frames_per_second()
            ));
        }
        Ok(())
    }
}

/// Held movement keys plus whether mouse-look is active.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Controls {
    forward: bool,
    back: bool,
    left: bool,
    right: bool,
    up: bool,
    down: bool,
    looking: bool,
}

impl Controls {
    fn set_key(&mut self, code: KeyCode, pressed: bool) {
        let slot = match code {
            KeyCode::KeyW | KeyCode::ArrowUp => &mut self.forward,
            KeyCode::KeyS | KeyCode::ArrowDown => &mut self.back,
            KeyCode::KeyA | KeyCode::ArrowLeft => &mut self.left,
            KeyCode::KeyD | KeyCode::ArrowRight => &mut self.right,
            KeyCode::Space | KeyCode::KeyE => &mut self.up,
            KeyCode::ShiftLeft | KeyCode::KeyQ => &mut self.down,
            _ => return,
        };
        *slot = pressed;
    }

    fn movement(&self) -> MoveInput {
        MoveInput {
            right: axis(self.right, self.left),
            up: axis(self.up, self.down),
            backward: axis(self.back, self.forward),
        }
    }
}

fn axis(positive: bool, negative: bool) -> f32 {
    f32::from(u8::from(positive)) - f32::from(u8::from(negative))
}

struct FrameTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

/// Uploads each published frame to a texture and draws it to the window.
struct SurfaceSink {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::RenderPipeline,
    frame: Option<FrameTexture>,
}

impl SurfaceSink {
    fn new(
        context: &GpuContext,
        surface: wgpu::Surface<'static>,
        size: PhysicalSize<u32>,
    ) -> Result<Self> {
        let device = context.device().clone();
        let queue = context.queue().clone();

        let caps = surface.get_capabilities(context.adapter());
        // Traced values are linear; an sRGB surface encodes them on write.
        let format = caps
            .formats
            .iter()
            .copied()
            .find(wgpu::TextureFormat::is_srgb)
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no supported formats"))?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);
        debug!(?format, ?alpha_mode, "configuring surface");

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &config);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            }],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blit pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("blit pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            surface,
            config,
            layout,
            pipeline,
            frame: None,
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.config.width = size.width;
        self.config.height = size.height;
        self.surface.configure(&self.device, &self.config);
    }

    fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }
}

impl OutputSink for SurfaceSink {
    fn init(&mut self, width: u32, height: u32) -> Result<()> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("presented frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit bind group"),
            layout: &self.layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view),
            }],
        });
        if let Some(previous) = self.frame.replace(FrameTexture {
            texture,
            bind_group,
            width,
            height,
        }) {
            previous.texture.destroy();
        }
        Ok(())
    }

    fn present(&mut self, frame: &OutputFrame<'_>) -> Result<()> {
        let Some(target) = self.frame.as_ref() else {
            return Ok(());
        };
        if (frame.width, frame.height) != (target.width, target.height) {
            return Err(anyhow!(
                "frame is {}x{} but the window expects {}x{}",
                frame.width,
                frame.height,
                target.width,
                target.height
            ));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(target.width * OUTPUT_BYTES_PER_PIXEL),
                rows_per_image: Some(target.height),
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
        );

        let surface_texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("surface lost or outdated; reconfiguring");
                self.reconfigure();
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("surface timeout; retrying next frame");
                return Ok(());
            }
            Err(err) => return Err(anyhow!("surface error: {err}")),
        };
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("blit encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("blit pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &target.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        surface_texture.present();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(frame) = self.frame.take() {
            frame.texture.destroy();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_controls_do_not_move() {
        assert_eq!(Controls::default().movement(), MoveInput::default());
    }

    #[test]
    fn held_keys_map_to_camera_axes() {
        let mut controls = Controls::default();
        controls.set_key(KeyCode::KeyW, true);
        controls.set_key(KeyCode::KeyD, true);
        controls.set_key(KeyCode::Space, true);
        assert_eq!(
            controls.movement(),
            MoveInput {
                right: 1.0,
                up: 1.0,
                backward: -1.0,
            }
        );

        controls.set_key(KeyCode::KeyW, false);
        controls.set_key(KeyCode::ShiftLeft, true);
        assert_eq!(
            controls.movement(),
            MoveInput {
                right: 1.0,
                up: 0.0,
                backward: 0.0,
            }
        );
    }

    #[test]
    fn opposing_keys_cancel() {
        let mut controls = Controls::default();
        controls.set_key(KeyCode::KeyA, true);
        controls.set_key(KeyCode::KeyD, true);
        assert_eq!(controls.movement().right, 0.0);
    }

    #[test]
    fn unmapped_keys_are_ignored() {
        let mut controls = Controls::default();
        controls.set_key(KeyCode::KeyZ, true);
        assert_eq!(controls, Controls::default());
    }

    #[test]
    fn blit_shader_is_valid_wgsl() {
        let module = wgpu::naga::front::wgsl::parse_str(BLIT_SHADER).unwrap();
        assert_eq!(module.entry_points.len(), 2);
    }
}
