use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Coarse lifecycle state of the recording pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    /// Device closed, nothing scheduled.
    #[default]
    Idle,
    /// Device open, looking for motion.
    Watching,
    /// Device open and a segment is being written.
    Recording,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Watching => "Watching",
            PipelineState::Recording => "Recording",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PipelineState::Idle)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: PipelineState,
    /// Last failure surfaced to the operator. Cleared on the next successful start.
    pub error: Option<String>,
    /// Whether `error` ended the watch session (device gone, open failed).
    pub fatal: bool,
    pub save_dir: PathBuf,
    pub active_segment: Option<PathBuf>,
    pub segments_written: u64,
}

impl StatusReport {
    pub fn new(save_dir: PathBuf) -> Self {
        Self {
            save_dir,
            ..Self::default()
        }
    }

    /// Human-readable one-liner, e.g. `Recording` or `Idle (camera open failed: ...)`.
    pub fn text(&self) -> String {
        match &self.error {
            Some(e) => format!("{} ({e})", self.state),
            None => self.state.to_string(),
        }
    }
}
