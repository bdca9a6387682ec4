pub mod diff;
pub mod grid;
pub mod traits;

pub use diff::FrameDiffDetector;
pub use traits::{DetectError, MotionFilter};
