use std::path::Path;

use anyhow::{Context, Result};
use sceneconfig::SceneConfig;
use tracer::{FileSink, GpuContext, NullSink, OutputSink, Tracer};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::paths::AppPaths;
use crate::session::Session;
use crate::window;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let session = Session::resolve(&config, &cli);

    if cli.window {
        return window::run_window(session);
    }
    run_headless(&session, cli.frames, cli.output.as_deref())
}

/// `--config` wins; otherwise the scene file in the config directory, then
/// built-in defaults.
fn load_config(cli: &Cli) -> Result<SceneConfig> {
    if let Some(path) = &cli.config {
        return SceneConfig::load(path)
            .with_context(|| format!("failed to load scene config {}", path.display()));
    }

    let paths = AppPaths::discover()?;
    match paths.existing_scene_file()? {
        Some(path) => {
            info!(path = %path.display(), "using scene config");
            SceneConfig::load(&path)
                .with_context(|| format!("failed to load scene config {}", path.display()))
        }
        None => {
            debug!(dir = %paths.config_dir().display(), "no scene config found; using defaults");
            Ok(SceneConfig::default())
        }
    }
}

fn run_headless(session: &Session, frames: u32, output: Option<&Path>) -> Result<()> {
    let mut sink: Box<dyn OutputSink> = match output {
        Some(path) => Box::new(FileSink::new(path)?),
        None => Box::new(NullSink),
    };

    let source = session.kernel_source()?;
    let context = GpuContext::headless(session.context_options())
        .context("failed to initialise the GPU")?;
    let info = context.adapter_info();
    info!(adapter = %info.name, backend = ?info.backend, "using GPU adapter");

    let inputs = session.inputs();
    let mut tracer = Tracer::new(
        context,
        &source,
        session.width,
        session.height,
        &inputs,
        session.options,
    )
    .context("tracer setup failed")?;
    tracer.init_sink(sink.as_mut())?;

    let step = session.time_step.as_secs_f32();
    for index in 0..frames {
        let report = tracer.render(frame_delta(index, step), &inputs, sink.as_mut())?;
        debug!(
            frame = report.index,
            time = report.time,
            sync_ms = report.sync.as_secs_f64() * 1000.0,
            "frame published"
        );
    }

    tracer.teardown();
    sink.finish().context("failed to write output")?;
    info!(
        frames = tracer.frames_published(),
        time = tracer.time(),
        "headless render complete"
    );
    Ok(())
}

/// The first frame is rendered at time zero; every later one advances by `step`.
fn frame_delta(index: u32, step: f32) -> f32 {
    if index == 0 {
        0.0
    } else {
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_does_not_advance_time() {
        let times: Vec<f32> = (0..4)
            .scan(0.0, |time, index| {
                *time += frame_delta(index, 0.5);
                Some(*time)
            })
            .collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0, 1.5]);
    }
}
