use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A rendering session: what to trace, at what size, from where.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneConfig {
    pub version: u32,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub shader: ShaderSection,
    #[serde(default)]
    pub camera: CameraSection,
    #[serde(default)]
    pub light: LightSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub frame: FrameSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderFormatSetting {
    Spirv,
    Wgsl,
    Glsl,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShaderSection {
    /// Kernel file. Relative paths resolve against the config file's directory.
    pub path: Option<PathBuf>,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Overrides detection by magic number and extension.
    #[serde(default)]
    pub format: Option<ShaderFormatSetting>,
}

impl Default for ShaderSection {
    fn default() -> Self {
        Self {
            path: None,
            entry_point: default_entry_point(),
            format: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSection {
    pub position: [f32; 3],
    /// Degrees about world Y.
    pub yaw: f32,
    /// Degrees about the camera's X axis.
    pub pitch: f32,
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub move_speed: f32,
    pub mouse_sensitivity: f32,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            position: [0.0, 1.0, 6.0],
            yaw: 0.0,
            pitch: 0.0,
            fov: 70.0,
            near: 0.05,
            far: 4000.0,
            move_speed: 0.1,
            mouse_sensitivity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LightSection {
    /// Direction the light travels; normalised before use.
    pub direction: [f32; 3],
    pub intensity: f32,
}

impl Default for LightSection {
    fn default() -> Self {
        Self {
            direction: [-0.5, -1.0, -0.3],
            intensity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundingSetting {
    #[default]
    Truncate,
    Ceil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSection {
    pub rounding: RoundingSetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSection {
    /// Time added per frame in headless mode.
    #[serde(
        default = "default_fixed_step",
        deserialize_with = "deserialize_duration"
    )]
    pub fixed_step: Duration,
    /// Waits for the GPU longer than this are logged.
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub sync_budget: Option<Duration>,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            fixed_step: default_fixed_step(),
            sync_budget: None,
        }
    }
}

fn default_entry_point() -> String {
    "main".to_string()
}

fn default_fixed_step() -> Duration {
    Duration::from_secs_f64(1.0 / 60.0)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_fixed_step))
}

/// Seconds as a TOML number, or a humantime string such as `"16ms"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(seconds) => Duration::try_from_secs_f64(seconds)
                .map_err(|_| format!("duration must be a non-negative number, got {seconds}")),
            DurationValue::Text(text) => humantime::parse_duration(&text)
                .map_err(|err| format!("invalid duration '{text}': {err}")),
        }
    }
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<DurationValue>::deserialize(deserializer)?
        .map(DurationValue::into_duration)
        .transpose()
        .map_err(de::Error::custom)
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            version: 1,
            viewport: Viewport::default(),
            shader: ShaderSection::default(),
            camera: CameraSection::default(),
            light: LightSection::default(),
            dispatch: DispatchSection::default(),
            frame: FrameSection::default(),
        }
    }
}

impl SceneConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: SceneConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates `path`. A relative shader path is resolved against
    /// the directory the config lives in.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&input)?;
        if let (Some(shader), Some(base)) = (config.shader.path.as_mut(), path.parent()) {
            if shader.is_relative() {
                *shader = base.join(&*shader);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "viewport {}x{} must be non-zero in both dimensions",
                self.viewport.width, self.viewport.height
            )));
        }

        if self.shader.entry_point.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "shader.entry_point may not be empty".into(),
            ));
        }

        let camera = &self.camera;
        if camera
            .position
            .iter()
            .chain([camera.yaw, camera.pitch].iter())
            .any(|value| !value.is_finite())
        {
            return Err(ConfigError::Invalid(
                "camera position, yaw and pitch must be finite".into(),
            ));
        }
        if !(camera.fov > 0.0 && camera.fov < 180.0) {
            return Err(ConfigError::Invalid(format!(
                "camera.fov {} must be between 0 and 180 degrees",
                camera.fov
            )));
        }
        if !(camera.near > 0.0 && camera.far > camera.near) {
            return Err(ConfigError::Invalid(format!(
                "camera planes must satisfy 0 < near < far (near = {}, far = {})",
                camera.near, camera.far
            )));
        }
        if !(camera.move_speed >= 0.0 && camera.mouse_sensitivity >= 0.0) {
            return Err(ConfigError::Invalid(
                "camera.move_speed and camera.mouse_sensitivity must be >= 0".into(),
            ));
        }

        let light = &self.light;
        if light.direction.iter().any(|value| !value.is_finite())
            || light.direction.iter().all(|value| *value == 0.0)
        {
            return Err(ConfigError::Invalid(
                "light.direction must be a finite, non-zero vector".into(),
            ));
        }
        if !(light.intensity >= 0.0 && light.intensity.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "light.intensity {} must be a finite value >= 0",
                light.intensity
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[viewport]
width = 1920
height = 1080

[shader]
path = "kernels/tracer.spv"
entry_point = "trace"

[camera]
position = [0.0, 2.0, 10.0]
yaw = 45.0
pitch = -10.0
fov = 60.0

[light]
direction = [0.0, -1.0, 0.0]
intensity = 2.5

[dispatch]
rounding = "ceil"

[frame]
fixed_step = "20ms"
sync_budget = 0.1
"#;

    #[test]
    fn parses_sample_config() {
        let config = SceneConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(
            config.viewport,
            Viewport {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(config.shader.entry_point, "trace");
        assert_eq!(config.camera.fov, 60.0);
        assert_eq!(config.camera.far, 4000.0);
        assert_eq!(config.light.intensity, 2.5);
        assert_eq!(config.dispatch.rounding, RoundingSetting::Ceil);
        assert_eq!(config.frame.fixed_step, Duration::from_millis(20));
        assert_eq!(config.frame.sync_budget, Some(Duration::from_millis(100)));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = SceneConfig::from_toml_str("version = 1").expect("parse config");
        assert_eq!(config.viewport, Viewport::default());
        assert_eq!(config.shader, ShaderSection::default());
        assert_eq!(config.camera, CameraSection::default());
        assert_eq!(config.camera.near, 0.05);
        assert_eq!(config.camera.move_speed, 0.1);
        assert_eq!(config.light.intensity, 1.0);
        assert_eq!(config.dispatch.rounding, RoundingSetting::Truncate);
        assert_eq!(config.frame.sync_budget, None);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = SceneConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_viewport() {
        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[viewport]
width = 0
height = 720
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inverted_planes() {
        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[camera]
near = 10.0
far = 1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_light_direction() {
        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[light]
direction = [0.0, 0.0, 0.0]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_rounding_and_fields() {
        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[dispatch]
rounding = "floor"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[camera]
zoom = 2.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_negative_duration() {
        let err = SceneConfig::from_toml_str(
            r#"
version = 1

[frame]
fixed_step = -1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_resolves_shader_relative_to_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scene.toml");
        std::fs::write(&path, SAMPLE).expect("write config");

        let config = SceneConfig::load(&path).expect("load config");
        assert_eq!(
            config.shader.path.as_deref(),
            Some(dir.path().join("kernels/tracer.spv").as_path())
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SceneConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
