use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which kind of frame source feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Local capture device (or any ffmpeg input) decoded through ffmpeg.
    Device,
    /// HTTP multipart MJPEG stream.
    Mjpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_kind")]
    pub kind: CameraKind,
    /// `/dev/videoN`, a bare device index, or any other ffmpeg input.
    #[serde(default = "default_device")]
    pub device: String,
    /// Forces ffmpeg's input format (`-f`), e.g. `lavfi` for a synthetic test source.
    #[serde(default)]
    pub input_format: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_capture_width")]
    pub capture_width: u32,
    #[serde(default = "default_capture_height")]
    pub capture_height: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Upper bound on a single blocking read; one tick's worth of work.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Side of the square Gaussian kernel. Must be odd.
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: usize,
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,
    #[serde(default = "default_dilate_iterations")]
    pub dilate_iterations: u32,
    /// A region must be strictly larger than this many pixels to count as motion.
    #[serde(default = "default_min_area")]
    pub min_area: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Ticks recorded after the last motion before a segment closes.
    #[serde(default = "default_tail_frames")]
    pub tail_frames: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            kind: default_camera_kind(),
            device: default_device(),
            input_format: None,
            url: String::new(),
            capture_width: default_capture_width(),
            capture_height: default_capture_height(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            blur_kernel: default_blur_kernel(),
            diff_threshold: default_diff_threshold(),
            dilate_iterations: default_dilate_iterations(),
            min_area: default_min_area(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            tail_frames: default_tail_frames(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            autostart: default_autostart(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
            listen: default_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CameraConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.detector.blur_kernel == 0 || self.detector.blur_kernel % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "detector.blur_kernel must be odd and positive, got {}",
                self.detector.blur_kernel
            )));
        }
        if self.recording.tail_frames == 0 {
            return Err(ConfigError::Invalid(
                "recording.tail_frames must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.camera.kind == CameraKind::Mjpeg && self.camera.url.is_empty() {
            return Err(ConfigError::Invalid(
                "camera.url is required when camera.kind = \"mjpeg\"".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_camera_kind() -> CameraKind {
    CameraKind::Device
}
fn default_device() -> String {
    "/dev/video0".into()
}
fn default_capture_width() -> u32 {
    640
}
fn default_capture_height() -> u32 {
    480
}
fn default_open_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_blur_kernel() -> usize {
    21
}
fn default_diff_threshold() -> u8 {
    25
}
fn default_dilate_iterations() -> u32 {
    2
}
fn default_min_area() -> usize {
    500
}
fn default_save_dir() -> PathBuf {
    PathBuf::from("recordings")
}
fn default_tail_frames() -> u32 {
    100
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_autostart() -> bool {
    true
}
fn default_control_enabled() -> bool {
    true
}
fn default_listen() -> String {
    "127.0.0.1:8080".into()
}
fn default_log_level() -> String {
    "info".into()
}
