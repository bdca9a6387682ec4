pub mod runner;
pub mod state;

pub use runner::{ControlError, PipelineHandle};
pub use state::{MotionPipeline, PipelineSettings};
