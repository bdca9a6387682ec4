pub mod encoder;
pub mod keys;

use motion_watch_common::frame::{Frame, ShapeMismatch};
use std::path::Path;

pub use encoder::FfmpegRecorder;

/// Output frame rate of every segment, independent of the capture rate.
pub const OUTPUT_FPS: f64 = 10.0;
/// Output geometry of every segment. Frames are scaled to this before append.
pub const OUTPUT_WIDTH: u32 = 640;
pub const OUTPUT_HEIGHT: u32 = 480;
/// Four-character codec tag written into the container.
pub const CODEC_TAG: &str = "XVID";

/// Opens recording sessions, one output file each.
pub trait SegmentRecorder {
    type Session: RecordingSession;

    async fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Self::Session, RecorderError>;
}

/// One open output segment.
pub trait RecordingSession {
    fn path(&self) -> &Path;

    fn frame_count(&self) -> u32;

    /// Encode one frame. The frame must match the session geometry exactly.
    async fn append(&mut self, frame: &Frame) -> Result<(), RecorderError>;

    /// Flush and close the file. Calling it again is a no-op.
    async fn finalize(&mut self) -> Result<(), RecorderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("segment {0} is already finalized")]
    Finalized(String),
    #[error(transparent)]
    FrameShape(#[from] ShapeMismatch),
}
