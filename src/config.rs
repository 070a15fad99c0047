use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/viewer.json";

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "WindowConfig::default_title")]
    pub title: String,
    #[serde(default = "WindowConfig::default_width")]
    pub width: u32,
    #[serde(default = "WindowConfig::default_height")]
    pub height: u32,
    #[serde(default = "WindowConfig::default_vsync")]
    pub vsync: bool,
    #[serde(default)]
    pub fullscreen: bool,
}

/// Display options an embedding host passes alongside the asset locator.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerOptions {
    #[serde(default)]
    pub auto_rotate: bool,
    #[serde(default = "ViewerOptions::default_show_controls")]
    pub show_controls: bool,
    #[serde(default = "ViewerOptions::default_background")]
    pub background_color: [f32; 4],
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub prevent_download: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_fov_degrees")]
    pub fov_degrees: f32,
    #[serde(default = "CameraConfig::default_near")]
    pub near: f32,
    #[serde(default = "CameraConfig::default_far")]
    pub far: f32,
    #[serde(default = "CameraConfig::default_azimuth_degrees")]
    pub default_azimuth_degrees: f32,
    #[serde(default = "CameraConfig::default_elevation_degrees")]
    pub default_elevation_degrees: f32,
    #[serde(default = "CameraConfig::default_radius")]
    pub default_radius: f32,
    #[serde(default = "CameraConfig::default_min_radius")]
    pub min_radius: f32,
    #[serde(default = "CameraConfig::default_max_radius")]
    pub max_radius: f32,
    #[serde(default = "CameraConfig::default_damping_enabled")]
    pub damping_enabled: bool,
    #[serde(default = "CameraConfig::default_damping_factor")]
    pub damping_factor: f32,
    #[serde(default = "CameraConfig::default_auto_rotate_speed_degrees")]
    pub auto_rotate_speed_degrees: f32,
    #[serde(default = "CameraConfig::default_rotate_speed")]
    pub rotate_speed: f32,
    #[serde(default = "CameraConfig::default_zoom_speed")]
    pub zoom_speed: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizeConfig {
    #[serde(default = "NormalizeConfig::default_target_size")]
    pub target_size: f32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub viewer: ViewerOptions,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
}

#[derive(Debug, Clone, Default)]
pub struct AppConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub auto_rotate: Option<bool>,
    pub show_controls: Option<bool>,
    pub background_color: Option<[f32; 4]>,
}

impl WindowConfig {
    fn default_title() -> String {
        "Asset Viewer".to_string()
    }

    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        720
    }

    const fn default_vsync() -> bool {
        true
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: Self::default_title(),
            width: Self::default_width(),
            height: Self::default_height(),
            vsync: Self::default_vsync(),
            fullscreen: false,
        }
    }
}

impl ViewerOptions {
    const fn default_show_controls() -> bool {
        true
    }

    const fn default_background() -> [f32; 4] {
        [0.05, 0.06, 0.1, 1.0]
    }
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            auto_rotate: false,
            show_controls: Self::default_show_controls(),
            background_color: Self::default_background(),
            width: None,
            height: None,
            prevent_download: false,
        }
    }
}

impl CameraConfig {
    const fn default_fov_degrees() -> f32 {
        45.0
    }

    const fn default_near() -> f32 {
        0.05
    }

    const fn default_far() -> f32 {
        500.0
    }

    const fn default_azimuth_degrees() -> f32 {
        35.0
    }

    const fn default_elevation_degrees() -> f32 {
        20.0
    }

    const fn default_radius() -> f32 {
        9.0
    }

    const fn default_min_radius() -> f32 {
        1.0
    }

    const fn default_max_radius() -> f32 {
        50.0
    }

    const fn default_damping_enabled() -> bool {
        true
    }

    const fn default_damping_factor() -> f32 {
        0.1
    }

    const fn default_auto_rotate_speed_degrees() -> f32 {
        0.5
    }

    const fn default_rotate_speed() -> f32 {
        0.005
    }

    const fn default_zoom_speed() -> f32 {
        0.1
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: Self::default_fov_degrees(),
            near: Self::default_near(),
            far: Self::default_far(),
            default_azimuth_degrees: Self::default_azimuth_degrees(),
            default_elevation_degrees: Self::default_elevation_degrees(),
            default_radius: Self::default_radius(),
            min_radius: Self::default_min_radius(),
            max_radius: Self::default_max_radius(),
            damping_enabled: Self::default_damping_enabled(),
            damping_factor: Self::default_damping_factor(),
            auto_rotate_speed_degrees: Self::default_auto_rotate_speed_degrees(),
            rotate_speed: Self::default_rotate_speed(),
            zoom_speed: Self::default_zoom_speed(),
        }
    }
}

impl NormalizeConfig {
    const fn default_target_size() -> f32 {
        5.0
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self { target_size: Self::default_target_size() }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_bytes(&bytes).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let cfg: AppConfig = serde_json::from_slice(bytes)?;
        Ok(cfg.sanitized())
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("[config] {err:#}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    /// Viewer-level size wins over the window section when present.
    pub fn surface_size(&self) -> (u32, u32) {
        (
            self.viewer.width.unwrap_or(self.window.width).max(1),
            self.viewer.height.unwrap_or(self.window.height).max(1),
        )
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(width) = overrides.width {
            self.window.width = width;
            self.viewer.width = None;
        }
        if let Some(height) = overrides.height {
            self.window.height = height;
            self.viewer.height = None;
        }
        if let Some(vsync) = overrides.vsync {
            self.window.vsync = vsync;
        }
        if let Some(auto_rotate) = overrides.auto_rotate {
            self.viewer.auto_rotate = auto_rotate;
        }
        if let Some(show_controls) = overrides.show_controls {
            self.viewer.show_controls = show_controls;
        }
        if let Some(color) = overrides.background_color {
            self.viewer.background_color = color;
        }
    }

    fn sanitized(mut self) -> Self {
        let camera = &mut self.camera;
        camera.min_radius = camera.min_radius.max(0.01);
        if camera.max_radius < camera.min_radius {
            log::warn!(
                "[config] camera.max_radius {} below min_radius {}; clamping",
                camera.max_radius,
                camera.min_radius
            );
            camera.max_radius = camera.min_radius;
        }
        camera.damping_factor = camera.damping_factor.clamp(0.0, 1.0);
        if !(self.normalize.target_size > 0.0) {
            log::warn!("[config] normalize.target_size must be positive; using default");
            self.normalize.target_size = NormalizeConfig::default_target_size();
        }
        self
    }
}

impl AppConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.vsync.is_some() {
            fields.push("vsync");
        }
        if self.auto_rotate.is_some() {
            fields.push("auto_rotate");
        }
        if self.show_controls.is_some() {
            fields.push("show_controls");
        }
        if self.background_color.is_some() {
            fields.push("background_color");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = AppConfig::from_json_bytes(b"{}").expect("empty config parses");
        assert_eq!(cfg.window.width, 1280);
        assert!(cfg.viewer.show_controls);
        assert!(!cfg.viewer.prevent_download);
        assert!((cfg.normalize.target_size - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn viewer_size_overrides_window_size() {
        let json = br#"{ "viewer": { "width": 640, "height": 480, "auto_rotate": true } }"#;
        let cfg = AppConfig::from_json_bytes(json).expect("config parses");
        assert_eq!(cfg.surface_size(), (640, 480));
        assert!(cfg.viewer.auto_rotate);
    }

    #[test]
    fn inverted_radius_range_is_clamped() {
        let json = br#"{ "camera": { "min_radius": 4.0, "max_radius": 2.0 }, "normalize": { "target_size": -1 } }"#;
        let cfg = AppConfig::from_json_bytes(json).expect("config parses");
        assert!(cfg.camera.max_radius >= cfg.camera.min_radius);
        assert!(cfg.normalize.target_size > 0.0);
    }

    #[test]
    fn overrides_apply_and_report_fields() {
        let mut cfg = AppConfig::default();
        cfg.viewer.width = Some(300);
        let overrides = AppConfigOverrides { width: Some(1600), auto_rotate: Some(true), ..Default::default() };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.surface_size().0, 1600);
        assert!(cfg.viewer.auto_rotate);
        assert_eq!(overrides.applied_fields(), vec!["width", "auto_rotate"]);
    }
}
