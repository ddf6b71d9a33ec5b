//! Command-line flags layered over a scene config.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use glam::Vec3;
use sceneconfig::{RoundingSetting, SceneConfig, ShaderFormatSetting};
use tracer::{
    CameraLens, ContextOptions, DirectionalLight, FrameInputs, FreeLookCamera, GridRounding,
    KernelSource, RigidTransform, ShaderFormat, TracerOptions,
};

use crate::cli::Cli;

pub const DEMO_KERNEL: &str = include_str!("../shaders/demo.wgsl");

#[derive(Debug, Clone, PartialEq)]
pub enum KernelChoice {
    Demo,
    File {
        path: PathBuf,
        format: Option<ShaderFormat>,
    },
}

/// Everything needed to start a tracer, with flags taking precedence.
#[derive(Debug, Clone)]
pub struct Session {
    pub width: u32,
    pub height: u32,
    pub kernel: KernelChoice,
    pub entry_point: String,
    pub camera: FreeLookCamera,
    pub light: DirectionalLight,
    pub options: TracerOptions,
    pub time_step: Duration,
    pub low_power: bool,
}

impl Session {
    pub fn resolve(config: &SceneConfig, cli: &Cli) -> Self {
        let (width, height) = cli
            .size
            .unwrap_or((config.viewport.width, config.viewport.height));

        let format = cli
            .shader_format
            .or_else(|| config.shader.format.map(shader_format));
        let kernel = match cli.shader.as_ref().or(config.shader.path.as_ref()) {
            Some(path) => KernelChoice::File {
                path: path.clone(),
                format,
            },
            None => KernelChoice::Demo,
        };
        let entry_point = cli
            .entry_point
            .clone()
            .unwrap_or_else(|| config.shader.entry_point.clone());

        let section = &config.camera;
        let transform = RigidTransform::from_yaw_pitch(
            Vec3::from_array(section.position),
            section.yaw,
            section.pitch,
        );
        let lens = CameraLens {
            fov_degrees: section.fov,
            far: section.far,
            near: section.near,
        };
        let camera = FreeLookCamera::new(transform, lens)
            .with_controls(section.mouse_sensitivity, section.move_speed);

        let light = DirectionalLight::new(
            Vec3::from_array(config.light.direction).normalize_or_zero(),
            config.light.intensity,
        );

        let rounding = cli.rounding.unwrap_or(match config.dispatch.rounding {
            RoundingSetting::Truncate => GridRounding::Truncate,
            RoundingSetting::Ceil => GridRounding::Ceil,
        });
        let options = TracerOptions {
            rounding,
            sync_budget: cli.sync_budget.or(config.frame.sync_budget),
        };

        Self {
            width,
            height,
            kernel,
            entry_point,
            camera,
            light,
            options,
            time_step: cli.time_step.unwrap_or(config.frame.fixed_step),
            low_power: cli.low_power,
        }
    }

    pub fn kernel_source(&self) -> Result<KernelSource> {
        let source = match &self.kernel {
            KernelChoice::Demo => KernelSource::wgsl("demo.wgsl", DEMO_KERNEL),
            KernelChoice::File { path, format } => KernelSource::from_path_as(path, *format)
                .with_context(|| format!("failed to load kernel {}", path.display()))?,
        };
        Ok(source.with_entry_point(self.entry_point.clone()))
    }

    pub fn context_options(&self) -> ContextOptions {
        let power_preference = if self.low_power {
            wgpu::PowerPreference::LowPower
        } else {
            wgpu::PowerPreference::HighPerformance
        };
        ContextOptions {
            power_preference,
            ..ContextOptions::default()
        }
    }

    pub fn inputs(&self) -> FrameInputs {
        FrameInputs {
            camera: self.camera.snapshot(),
            light: self.light,
        }
    }
}

fn shader_format(setting: ShaderFormatSetting) -> ShaderFormat {
    match setting {
        ShaderFormatSetting::Spirv => ShaderFormat::SpirV,
        ShaderFormatSetting::Wgsl => ShaderFormat::Wgsl,
        ShaderFormatSetting::Glsl => ShaderFormat::Glsl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tracer::KernelContract;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["raytrace"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn config_values_apply_without_flags() {
        let config = SceneConfig::from_toml_str(
            r#"
version = 1

[viewport]
width = 320
height = 200

[shader]
path = "kernels/scene.comp"
entry_point = "trace"
format = "glsl"

[light]
direction = [0.0, -2.0, 0.0]
intensity = 3.0

[dispatch]
rounding = "ceil"

[frame]
fixed_step = "50ms"
"#,
        )
        .unwrap();

        let session = Session::resolve(&config, &cli(&[]));

        assert_eq!((session.width, session.height), (320, 200));
        assert_eq!(
            session.kernel,
            KernelChoice::File {
                path: PathBuf::from("kernels/scene.comp"),
                format: Some(ShaderFormat::Glsl),
            }
        );
        assert_eq!(session.entry_point, "trace");
        assert_eq!(session.light.direction, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(session.light.intensity, 3.0);
        assert_eq!(session.options.rounding, GridRounding::Ceil);
        assert_eq!(session.time_step, Duration::from_millis(50));
    }

    #[test]
    fn flags_override_config() {
        let config = SceneConfig::default();
        let session = Session::resolve(
            &config,
            &cli(&[
                "--size",
                "64x48",
                "--shader",
                "other.wgsl",
                "--entry-point",
                "render",
                "--rounding",
                "ceil",
                "--time-step",
                "0.25",
                "--sync-budget",
                "5ms",
            ]),
        );

        assert_eq!((session.width, session.height), (64, 48));
        assert_eq!(
            session.kernel,
            KernelChoice::File {
                path: PathBuf::from("other.wgsl"),
                format: None,
            }
        );
        assert_eq!(session.entry_point, "render");
        assert_eq!(session.options.rounding, GridRounding::Ceil);
        assert_eq!(session.options.sync_budget, Some(Duration::from_millis(5)));
        assert_eq!(session.time_step, Duration::from_millis(250));
    }

    #[test]
    fn camera_starts_at_configured_pose() {
        let config = SceneConfig::default();
        let session = Session::resolve(&config, &cli(&[]));
        let snapshot = session.inputs().camera;
        assert_eq!(
            snapshot.transform.origin,
            Vec3::from_array(config.camera.position)
        );
        assert_eq!(snapshot.lens.fov_degrees, config.camera.fov);
        assert_eq!(session.camera.move_speed, config.camera.move_speed);
    }

    #[test]
    fn demo_kernel_satisfies_the_binding_layout() {
        let session = Session::resolve(&SceneConfig::default(), &cli(&[]));
        assert_eq!(session.kernel, KernelChoice::Demo);
        let source = session.kernel_source().unwrap();
        let module = source.reflect().unwrap();
        let contract = KernelContract::check(&module, source.entry_point()).unwrap();
        assert_eq!(contract.workgroup_size(), [8, 8, 1]);
    }

    #[test]
    fn missing_kernel_file_is_reported_with_its_path() {
        let session = Session::resolve(
            &SceneConfig::default(),
            &cli(&["--shader", "/nonexistent/kernel.wgsl"]),
        );
        let err = session.kernel_source().unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/kernel.wgsl"));
    }

    #[test]
    fn low_power_flag_selects_low_power_adapter() {
        let session = Session::resolve(&SceneConfig::default(), &cli(&["--low-power"]));
        assert_eq!(
            session.context_options().power_preference,
            wgpu::PowerPreference::LowPower
        );
    }
}
