pub mod device;
pub mod mjpeg;

use motion_watch_common::config::{CameraConfig, CameraKind};
use motion_watch_common::frame::Frame;
use std::time::Duration;

pub use device::DeviceSource;
pub use mjpeg::MjpegSource;

/// A live video input owned exclusively by the pipeline between `open` and `close`.
pub trait FrameSource {
    async fn open(&mut self) -> Result<(), OpenError>;

    /// Next frame. Implementations must be cancel-safe: the pipeline bounds
    /// each call with a timeout and a dropped call must not lose stream sync.
    async fn read(&mut self) -> Result<Frame, ReadError>;

    /// Release the device. Safe to call when already closed.
    async fn close(&mut self);

    /// Short label for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("no frame from {input}: {reason}")]
    NoFrame { input: String, reason: String },
    #[error("camera did not respond within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("end of stream")]
    EndOfStream,
    #[error("source is not open")]
    NotOpen,
}

impl ReadError {
    /// Whether the source is gone for good rather than hiccuping.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::EndOfStream | ReadError::NotOpen)
    }
}

/// The configured camera, dispatched statically.
pub enum CameraSource {
    Device(DeviceSource),
    Mjpeg(MjpegSource),
}

impl CameraSource {
    /// Build the configured source. Device capture is throttled to one frame
    /// per `tick_interval`.
    pub fn from_config(config: &CameraConfig, tick_interval: Duration) -> Self {
        match config.kind {
            CameraKind::Device => CameraSource::Device(
                DeviceSource::new(
                    &config.device,
                    config.input_format.clone(),
                    config.capture_width,
                    config.capture_height,
                    config.open_timeout(),
                )
                .with_frame_rate(1.0 / tick_interval.as_secs_f64()),
            ),
            CameraKind::Mjpeg => {
                CameraSource::Mjpeg(MjpegSource::new(&config.url, config.open_timeout()))
            }
        }
    }
}

impl FrameSource for CameraSource {
    async fn open(&mut self) -> Result<(), OpenError> {
        match self {
            CameraSource::Device(s) => s.open().await,
            CameraSource::Mjpeg(s) => s.open().await,
        }
    }

    async fn read(&mut self) -> Result<Frame, ReadError> {
        match self {
            CameraSource::Device(s) => s.read().await,
            CameraSource::Mjpeg(s) => s.read().await,
        }
    }

    async fn close(&mut self) {
        match self {
            CameraSource::Device(s) => s.close().await,
            CameraSource::Mjpeg(s) => s.close().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            CameraSource::Device(s) => s.describe(),
            CameraSource::Mjpeg(s) => s.describe(),
        }
    }
}
