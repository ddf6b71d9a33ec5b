use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{info, trace, warn};

use crate::context::{capture, GpuContext};
use crate::encode::FrameParams;
use crate::error::{Result, TracerError};
use crate::frame::{
    dispatch_grid, log_stats, warn_if_uncovered, FrameClock, FramePhase, FrameStats, GridRounding,
};
use crate::kernel::{ComputeKernel, KernelSource};
use crate::resources::ResourceManager;
use crate::scene::FrameInputs;
use crate::sink::{OutputFrame, OutputSink};
use crate::slots::SlotGenerations;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TracerOptions {
    pub rounding: GridRounding,
    /// Waits for the GPU longer than this are logged.
    pub sync_budget: Option<Duration>,
}

/// What happened during one published frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub index: u64,
    pub time: f32,
    pub grid: [u32; 3],
    pub sync: Duration,
    pub light_changed: bool,
}

/// Drives one compute dispatch per frame and hands the result to a sink.
///
/// Construction performs setup; every error it returns is fatal. After that
/// each [`Tracer::render`] call runs one frame to completion before returning,
/// so no two frames are ever in flight.
///
/// Setup publishes nothing. Front ends that want a frame on screen before
/// time starts advancing call `render(0.0, ..)` first.
pub struct Tracer {
    context: GpuContext,
    resources: Option<ResourceManager>,
    options: TracerOptions,
    grid: [u32; 3],
    clock: FrameClock,
    phase: FramePhase,
    stats: FrameStats,
    pixels: Vec<u8>,
    published: u64,
    width: u32,
    height: u32,
}

impl Tracer {
    pub fn new(
        context: GpuContext,
        source: &KernelSource,
        width: u32,
        height: u32,
        inputs: &FrameInputs,
        options: TracerOptions,
    ) -> Result<Self> {
        let kernel = ComputeKernel::compile(context.device(), source)?;
        let resources = ResourceManager::initialize(
            &context,
            kernel,
            width,
            height,
            &inputs.camera,
            &inputs.light,
        )?;
        let grid = dispatch_grid(width, height, options.rounding);
        warn_if_uncovered(width, height, grid);
        info!(
            width,
            height,
            grid = ?grid,
            kernel = source.label(),
            rounding = ?options.rounding,
            "tracer ready"
        );

        Ok(Self {
            context,
            resources: Some(resources),
            options,
            grid,
            clock: FrameClock::default(),
            phase: FramePhase::Idle,
            stats: FrameStats::new(Instant::now()),
            pixels: Vec::new(),
            published: 0,
            width,
            height,
        })
    }

    /// Tells `sink` the image size. Call once before the first frame.
    pub fn init_sink<S: OutputSink + ?Sized>(&self, sink: &mut S) -> Result<()> {
        sink.init(self.width, self.height).map_err(TracerError::Sink)
    }

    /// Renders one frame: rebuild bindings, dispatch, wait, read back and
    /// publish. A failed frame is not published and the loop returns to idle.
    pub fn render<S: OutputSink + ?Sized>(
        &mut self,
        delta: f32,
        inputs: &FrameInputs,
        sink: &mut S,
    ) -> Result<FrameReport> {
        let result = self.run_frame(delta, inputs, sink);
        if let Err(err) = &result {
            warn!(phase = %self.phase, error = %err, "frame failed; not published");
        }
        self.phase = FramePhase::Idle;
        result
    }

    fn run_frame<S: OutputSink + ?Sized>(
        &mut self,
        delta: f32,
        inputs: &FrameInputs,
        sink: &mut S,
    ) -> Result<FrameReport> {
        self.context.ensure_alive()?;
        let resources = self.resources.as_mut().ok_or(TracerError::TornDown)?;

        let time = self.clock.advance(delta);
        let light_changed = inputs.light != *resources.bound_light();
        if light_changed {
            resources.update_light(&inputs.light)?;
        }
        resources.rebuild_dynamic_bindings(&inputs.camera, FrameParams { time })?;
        advance(&mut self.phase, FramePhase::BindingsUpdated);

        let device = self.context.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("tracer frame"),
        });
        resources.record_dispatch(&mut encoder, self.grid);
        resources.record_readback(&mut encoder);
        let queue = self.context.queue();
        capture(device, "frame commands", || {
            queue.submit(std::iter::once(encoder.finish()));
        })?;
        advance(&mut self.phase, FramePhase::Dispatched);

        let readback = resources.readback();
        let slice = readback.buffer().slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let sync_started = Instant::now();
        if let Err(err) = device.poll(wgpu::PollType::Wait) {
            readback.cancel_map(device);
            return Err(err.into());
        }
        let sync = sync_started.elapsed();
        if let Some(budget) = self.options.sync_budget {
            if sync > budget {
                warn!(
                    elapsed_ms = sync.as_secs_f64() * 1000.0,
                    budget_ms = budget.as_secs_f64() * 1000.0,
                    "waiting for the GPU took longer than the sync budget"
                );
            }
        }
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(TracerError::Readback(err.to_string())),
            Err(_) => {
                readback.cancel_map(device);
                return Err(TracerError::Readback(
                    "map callback was dropped before completing".into(),
                ));
            }
        }
        {
            let mapped = slice.get_mapped_range();
            readback.unpad_into(&mapped, &mut self.pixels);
        }
        readback.buffer().unmap();
        self.context.ensure_alive()?;
        advance(&mut self.phase, FramePhase::Synced);

        let frame = OutputFrame {
            width: self.width,
            height: self.height,
            index: self.published,
            time,
            bytes: &self.pixels,
        };
        sink.present(&frame).map_err(TracerError::Sink)?;
        advance(&mut self.phase, FramePhase::Published);

        let report = FrameReport {
            index: self.published,
            time,
            grid: self.grid,
            sync,
            light_changed,
        };
        self.published += 1;
        if let Some(fps) = self.stats.record(Instant::now()) {
            log_stats(fps, &self.clock, self.grid);
        }
        Ok(report)
    }

    /// Releases every GPU resource. Safe to call more than once; later frames
    /// fail with [`TracerError::TornDown`].
    pub fn teardown(&mut self) {
        let Some(resources) = self.resources.take() else {
            return;
        };
        if let Err(err) = self.context.device().poll(wgpu::PollType::Wait) {
            warn!(error = %err, "GPU did not go idle before teardown");
        }
        resources.teardown();
        info!(frames = self.published, time = self.clock.time(), "tracer torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.resources.is_none()
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn resources(&self) -> Option<&ResourceManager> {
        self.resources.as_ref()
    }

    pub fn slot_generations(&self) -> Option<SlotGenerations> {
        self.resources.as_ref().map(ResourceManager::slot_generations)
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn time(&self) -> f32 {
        self.clock.time()
    }

    pub fn frames_published(&self) -> u64 {
        self.published
    }

    pub fn grid(&self) -> [u32; 3] {
        self.grid
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_per_second(&self) -> f32 {
        self.stats.frames_per_second()
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn advance(phase: &mut FramePhase, to: FramePhase) {
    debug_assert_eq!(phase.next(), to, "frame phases must advance in order");
    trace!(from = %phase, to = %to, "frame phase");
    *phase = to;
}
