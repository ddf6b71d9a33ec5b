use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracer::{GridRounding, ShaderFormat};

#[derive(Parser, Debug)]
#[command(
    name = "raytrace",
    author,
    version,
    about = "Real-time compute-shader ray tracer",
    arg_required_else_help = false
)]
pub struct Cli {
    /// Scene configuration (TOML). Defaults to `scene.toml` in the config directory when present.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Compute kernel (SPIR-V, WGSL or GLSL). The built-in demo scene is used when omitted.
    #[arg(long, value_name = "FILE")]
    pub shader: Option<PathBuf>,

    /// Force the kernel format instead of detecting it: `spirv`, `wgsl`, or `glsl`.
    #[arg(long, value_name = "FORMAT", value_parser = parse_shader_format)]
    pub shader_format: Option<ShaderFormat>,

    /// Kernel entry point name.
    #[arg(long, value_name = "NAME")]
    pub entry_point: Option<String>,

    /// Output image size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Number of frames to render before exiting (headless only).
    #[arg(long, value_name = "N", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub frames: u32,

    /// Write the last frame to this path (`.exr` keeps full float precision, `.png` is 8-bit).
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Open an interactive window with mouse-look and WASD movement.
    #[arg(long, conflicts_with_all = ["frames", "output"])]
    pub window: bool,

    /// How the dispatch grid covers sizes that are not a multiple of 8: `truncate` or `ceil`.
    #[arg(long, value_name = "MODE", value_parser = parse_rounding)]
    pub rounding: Option<GridRounding>,

    /// Seconds added to the frame clock per headless frame (e.g. `0.0166` or `16ms`).
    #[arg(long, value_name = "SECONDS", value_parser = parse_seconds)]
    pub time_step: Option<Duration>,

    /// Warn when waiting for the GPU takes longer than this (e.g. `20ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_seconds)]
    pub sync_budget: Option<Duration>,

    /// Prefer an integrated or low-power adapter.
    #[arg(long)]
    pub low_power: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (w, h) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width '{}'", w.trim()))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height '{}'", h.trim()))?;
    if width == 0 || height == 0 {
        return Err("size must be greater than zero in both dimensions".into());
    }
    Ok((width, height))
}

pub fn parse_rounding(value: &str) -> Result<GridRounding, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "truncate" | "floor" => Ok(GridRounding::Truncate),
        "ceil" | "cover" => Ok(GridRounding::Ceil),
        "" => Err("rounding mode must not be empty".to_string()),
        other => Err(format!(
            "unknown rounding mode '{other}'; expected truncate or ceil"
        )),
    }
}

pub fn parse_shader_format(value: &str) -> Result<ShaderFormat, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "spirv" | "spv" => Ok(ShaderFormat::SpirV),
        "wgsl" => Ok(ShaderFormat::Wgsl),
        "glsl" | "comp" => Ok(ShaderFormat::Glsl),
        "" => Err("shader format must not be empty".to_string()),
        other => Err(format!(
            "unknown shader format '{other}'; expected spirv, wgsl, or glsl"
        )),
    }
}

/// Accepts plain seconds (`0.016`) or a humantime-style value (`16ms`).
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("duration '{trimmed}' must be a non-negative number"));
        }
        return Ok(Duration::from_secs_f64(seconds));
    }
    humantime::parse_duration(trimmed).map_err(|err| format!("invalid duration '{trimmed}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_size() {
        assert_eq!(parse_size("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_size(" 64 X 32 ").unwrap(), (64, 32));
        assert!(parse_size("1280").is_err());
        assert!(parse_size("0x720").is_err());
        assert!(parse_size("wide x tall").is_err());
    }

    #[test]
    fn parses_rounding() {
        assert_eq!(parse_rounding("Truncate").unwrap(), GridRounding::Truncate);
        assert_eq!(parse_rounding("ceil").unwrap(), GridRounding::Ceil);
        assert!(parse_rounding("round").is_err());
        assert!(parse_rounding("").is_err());
    }

    #[test]
    fn parses_shader_format() {
        assert_eq!(parse_shader_format("SPV").unwrap(), ShaderFormat::SpirV);
        assert_eq!(parse_shader_format("wgsl").unwrap(), ShaderFormat::Wgsl);
        assert_eq!(parse_shader_format("comp").unwrap(), ShaderFormat::Glsl);
        assert!(parse_shader_format("hlsl").is_err());
    }

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_seconds("16ms").unwrap(), Duration::from_millis(16));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn window_conflicts_with_headless_flags() {
        let result = Cli::try_parse_from(["raytrace", "--window", "--output", "frame.png"]);
        assert!(result.is_err());
        let cli = Cli::try_parse_from(["raytrace", "--window"]).unwrap();
        assert!(cli.window);
        assert_eq!(cli.frames, 1);
    }

    #[test]
    fn rejects_zero_frames() {
        assert!(Cli::try_parse_from(["raytrace", "--frames", "0"]).is_err());
    }
}
