use motion_watch_common::frame::{Frame, ShapeMismatch};

/// Stateful motion test applied to consecutive frames.
///
/// Implementations keep their own reference of the scene and update it on
/// every call, so the answer depends on the order frames arrive in.
pub trait MotionFilter {
    /// Returns `true` if this frame shows motion relative to the reference.
    fn detect(&mut self, frame: &Frame) -> Result<bool, DetectError>;

    /// Forget the reference; the next frame bootstraps a new one.
    fn reset(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error(transparent)]
    FrameShape(#[from] ShapeMismatch),
}
