use std::path::{Path, PathBuf};
use std::time::Duration;

use motion_watch_common::config::Config;
use motion_watch_common::frame::Frame;
use motion_watch_common::status::{PipelineState, StatusReport};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::detector::MotionFilter;
use crate::recorder::keys::segment_path;
use crate::recorder::{
    RecorderError, RecordingSession, SegmentRecorder, OUTPUT_FPS, OUTPUT_HEIGHT, OUTPUT_WIDTH,
};
use crate::source::{FrameSource, OpenError, ReadError};

enum Phase<T> {
    /// Device closed. Ticks are ignored.
    Idle,
    /// Device open, no segment.
    Watching,
    /// Device open, `session` receiving frames until `countdown` quiet ticks pass.
    Recording { session: T, countdown: u32 },
}

/// What one tick did, mostly for the scheduler's logs and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The pipeline is idle; nothing was read.
    NotRunning,
    /// The frame could not be read this tick; state unchanged.
    Skipped,
    /// A frame went through the detector.
    Observed { motion: bool },
    /// A fatal error stopped the pipeline.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub save_dir: PathBuf,
    /// Quiet ticks recorded after the last motion.
    pub tail_frames: u32,
    /// Bound on one capture read.
    pub read_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            save_dir: config.recording.save_dir.clone(),
            tail_frames: config.recording.tail_frames,
            read_timeout: config.camera.read_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("camera open failed: {0}")]
    Open(#[from] OpenError),
    #[error("failed to create save directory {0}: {1}")]
    SaveDir(String, std::io::Error),
}

/// Motion-triggered recorder driven one tick at a time.
///
/// The pipeline owns the camera, the detector and the recorder outright. It
/// has no clock of its own: the tail is counted in ticks, so a tail of 100
/// lasts ten seconds only when ticks arrive ten times a second.
pub struct MotionPipeline<S, D, R: SegmentRecorder> {
    source: S,
    detector: D,
    recorder: R,
    phase: Phase<R::Session>,
    save_dir: PathBuf,
    tail_frames: u32,
    read_timeout: Duration,
    last_error: Option<String>,
    fatal: bool,
    segments_written: u64,
    status: watch::Sender<StatusReport>,
}

impl<S, D, R> MotionPipeline<S, D, R>
where
    S: FrameSource,
    D: MotionFilter,
    R: SegmentRecorder,
{
    pub fn new(source: S, detector: D, recorder: R, settings: PipelineSettings) -> Self {
        let (status, _) = watch::channel(StatusReport::new(settings.save_dir.clone()));
        Self {
            source,
            detector,
            recorder,
            phase: Phase::Idle,
            save_dir: settings.save_dir,
            tail_frames: settings.tail_frames.max(1),
            read_timeout: settings.read_timeout,
            last_error: None,
            fatal: false,
            segments_written: 0,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> PipelineState {
        match self.phase {
            Phase::Idle => PipelineState::Idle,
            Phase::Watching => PipelineState::Watching,
            Phase::Recording { .. } => PipelineState::Recording,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Open the camera and begin watching. A no-op while already running.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        if !matches!(self.phase, Phase::Idle) {
            debug!(state = %self.state(), "start requested while running");
            return Ok(());
        }

        self.detector.reset();
        match self.source.open().await {
            Ok(()) => {
                info!(
                    source = self.source.describe(),
                    detector = self.detector.name(),
                    "IDLE→WATCHING: camera opened"
                );
                self.last_error = None;
                self.fatal = false;
                self.phase = Phase::Watching;
                self.publish();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, source = self.source.describe(), "failed to open camera");
                self.last_error = Some(format!("camera open failed: {e}"));
                self.fatal = true;
                self.publish();
                Err(PipelineError::Open(e))
            }
        }
    }

    /// Finalize any open segment and release the camera. Safe in any state.
    pub async fn stop(&mut self) {
        if matches!(self.phase, Phase::Idle) {
            return;
        }
        self.last_error = None;
        self.fatal = false;
        self.shutdown().await;
        info!("→IDLE: stopped on request");
        self.publish();
    }

    /// Change where future segments go. The directory is created if missing;
    /// a segment already being written stays where it is.
    pub fn set_save_dir(&mut self, dir: &Path) -> Result<(), PipelineError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| PipelineError::SaveDir(dir.display().to_string(), e))?;
        info!(save_dir = dir.display().to_string(), "save directory changed");
        self.save_dir = dir.to_path_buf();
        self.publish();
        Ok(())
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Process one tick: read a frame, run the detector, advance the state machine.
    pub async fn step(&mut self) -> StepOutcome {
        if matches!(self.phase, Phase::Idle) {
            return StepOutcome::NotRunning;
        }

        let frame = match tokio::time::timeout(self.read_timeout, self.source.read()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, source = self.source.describe(), "camera lost, stopping");
                self.fail(format!("camera lost: {e}")).await;
                return StepOutcome::Stopped;
            }
            Ok(Err(e)) => {
                warn!(error = %e, state = %self.state(), "capture failed, skipping tick");
                return StepOutcome::Skipped;
            }
            Err(_) => {
                let e = ReadError::Timeout(self.read_timeout);
                warn!(error = %e, state = %self.state(), "capture timed out, skipping tick");
                return StepOutcome::Skipped;
            }
        };

        let motion = match self.detector.detect(&frame) {
            Ok(motion) => motion,
            Err(e) => {
                error!(error = %e, seq = frame.seq, "detector rejected frame, stopping");
                self.fail(e.to_string()).await;
                return StepOutcome::Stopped;
            }
        };

        self.phase = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Watching => self.handle_watching(&frame, motion).await,
            Phase::Recording { session, countdown } => {
                self.handle_recording(session, countdown, &frame, motion)
                    .await
            }
            Phase::Idle => Phase::Idle,
        };
        self.publish();
        StepOutcome::Observed { motion }
    }

    async fn handle_watching(&mut self, frame: &Frame, motion: bool) -> Phase<R::Session> {
        if !motion {
            debug!(seq = frame.seq, "WATCHING: scene still");
            return Phase::Watching;
        }

        let path = segment_path(&self.save_dir, &chrono::Local::now());
        info!(
            seq = frame.seq,
            path = path.display().to_string(),
            "WATCHING→RECORDING: motion detected"
        );

        let mut session = match self
            .recorder
            .open(&path, OUTPUT_FPS, OUTPUT_WIDTH, OUTPUT_HEIGHT)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to open segment, staying in WATCHING");
                self.last_error = Some(format!("failed to open segment: {e}"));
                return Phase::Watching;
            }
        };

        if let Err(e) = append_fitted(&mut session, frame).await {
            error!(error = %e, "failed to push first frame to new segment");
            self.finish_segment(session).await;
            self.last_error = Some(format!("failed to write segment: {e}"));
            return Phase::Watching;
        }

        // A working segment supersedes an earlier recorder failure.
        self.last_error = None;
        Phase::Recording {
            session,
            countdown: self.tail_frames,
        }
    }

    async fn handle_recording(
        &mut self,
        mut session: R::Session,
        countdown: u32,
        frame: &Frame,
        motion: bool,
    ) -> Phase<R::Session> {
        // Motion keeps sliding the tail window; only quiet ticks count down.
        let countdown = if motion {
            self.tail_frames
        } else {
            countdown.saturating_sub(1)
        };

        if countdown == 0 {
            info!(
                frames = session.frame_count(),
                path = session.path().display().to_string(),
                "RECORDING→WATCHING: tail elapsed, finalizing segment"
            );
            self.finish_segment(session).await;
            return Phase::Watching;
        }

        if let Err(e) = append_fitted(&mut session, frame).await {
            error!(error = %e, "RECORDING: failed to push frame, finalizing broken segment");
            self.finish_segment(session).await;
            self.last_error = Some(format!("failed to write segment: {e}"));
            return Phase::Watching;
        }

        debug!(
            seq = frame.seq,
            motion,
            countdown,
            frames = session.frame_count(),
            "RECORDING: frame appended"
        );
        Phase::Recording { session, countdown }
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    async fn finish_segment(&mut self, mut session: R::Session) {
        let path = session.path().display().to_string();
        match session.finalize().await {
            Ok(()) => {
                self.segments_written += 1;
                if !self.fatal {
                    self.last_error = None;
                }
                info!(path, frames = session.frame_count(), "segment finalized");
            }
            Err(e) => {
                error!(error = %e, path, "segment finalize failed");
                self.last_error = Some(format!("failed to finalize {path}: {e}"));
            }
        }
    }

    /// Tear down after a fatal error and surface it to observers.
    async fn fail(&mut self, message: String) {
        self.shutdown().await;
        self.last_error = Some(message);
        self.fatal = true;
        self.publish();
    }

    async fn shutdown(&mut self) {
        if let Phase::Recording { session, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            info!("finalizing open segment before releasing camera");
            self.finish_segment(session).await;
        }
        self.source.close().await;
    }

    fn publish(&self) {
        let report = StatusReport {
            state: self.state(),
            error: self.last_error.clone(),
            fatal: self.fatal,
            save_dir: self.save_dir.clone(),
            active_segment: match &self.phase {
                Phase::Recording { session, .. } => Some(session.path().to_path_buf()),
                _ => None,
            },
            segments_written: self.segments_written,
        };
        self.status.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            *current = report;
            true
        });
    }
}

/// Append `frame`, scaling it to the segment geometry first if needed.
async fn append_fitted<T: RecordingSession>(
    session: &mut T,
    frame: &Frame,
) -> Result<(), RecorderError> {
    if frame.dimensions() == (OUTPUT_WIDTH, OUTPUT_HEIGHT) {
        session.append(frame).await
    } else {
        session.append(&frame.resized(OUTPUT_WIDTH, OUTPUT_HEIGHT)).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-ins for the camera, detector and encoder.

    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use image::{Rgb, RgbImage};
    use motion_watch_common::frame::{Frame, ShapeMismatch};

    use crate::detector::{DetectError, MotionFilter};
    use crate::recorder::{RecorderError, RecordingSession, SegmentRecorder};
    use crate::source::{FrameSource, OpenError, ReadError};

    pub enum Read {
        Frame,
        /// A frame filled with one gray level.
        Fill(u8),
        Error(ReadError),
        Stall(Duration),
    }

    /// Emits blank frames of a fixed size unless a scripted read is queued.
    pub struct FakeSource {
        pub width: u32,
        pub height: u32,
        pub fail_open: bool,
        pub script: Arc<Mutex<VecDeque<Read>>>,
        pub open: Arc<AtomicBool>,
        pub opens: Arc<AtomicU32>,
        seq: u64,
    }

    impl FakeSource {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                fail_open: false,
                script: Arc::default(),
                open: Arc::default(),
                opens: Arc::default(),
                seq: 0,
            }
        }
    }

    impl FrameSource for FakeSource {
        async fn open(&mut self) -> Result<(), OpenError> {
            if self.fail_open {
                return Err(OpenError::NoFrame {
                    input: "fake".into(),
                    reason: "unplugged".into(),
                });
            }
            self.open.store(true, Ordering::SeqCst);
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, ReadError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(ReadError::NotOpen);
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                None | Some(Read::Frame) => {
                    self.seq += 1;
                    Ok(Frame::new(RgbImage::new(self.width, self.height), 0, self.seq))
                }
                Some(Read::Fill(value)) => {
                    self.seq += 1;
                    let image = RgbImage::from_pixel(self.width, self.height, Rgb([value; 3]));
                    Ok(Frame::new(image, 0, self.seq))
                }
                Some(Read::Error(e)) => Err(e),
                Some(Read::Stall(d)) => {
                    tokio::time::sleep(d).await;
                    Err(ReadError::Capture("stalled".into()))
                }
            }
        }

        async fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub enum Verdict {
        Still,
        Motion,
        BadShape,
    }

    /// Answers from a queue; quiet once the queue runs dry.
    #[derive(Default)]
    pub struct ScriptedDetector {
        pub verdicts: Arc<Mutex<VecDeque<Verdict>>>,
        pub resets: Arc<AtomicU32>,
    }

    impl ScriptedDetector {
        pub fn push(&self, verdict: Verdict, times: usize) {
            let mut q = self.verdicts.lock().unwrap();
            for _ in 0..times {
                q.push_back(verdict);
            }
        }
    }

    impl MotionFilter for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> Result<bool, DetectError> {
            match self.verdicts.lock().unwrap().pop_front() {
                None | Some(Verdict::Still) => Ok(false),
                Some(Verdict::Motion) => Ok(true),
                Some(Verdict::BadShape) => Err(ShapeMismatch::check(
                    (frame.width() + 1, frame.height()),
                    frame.dimensions(),
                )
                .unwrap_err()
                .into()),
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct SessionLog {
        pub path: PathBuf,
        pub frames: u32,
        pub finalize_calls: u32,
        pub sizes: Vec<(u32, u32)>,
    }

    /// Records what would have been encoded.
    #[derive(Default)]
    pub struct FakeRecorder {
        pub sessions: Arc<Mutex<Vec<SessionLog>>>,
        pub fail_open: bool,
        /// Number of upcoming opens that fail before the encoder recovers.
        pub refuse_opens: AtomicU32,
        /// Appends beyond this many frames per session fail.
        pub fail_append_after: Option<u32>,
    }

    pub struct FakeSession {
        index: usize,
        sessions: Arc<Mutex<Vec<SessionLog>>>,
        path: PathBuf,
        width: u32,
        height: u32,
        frames: u32,
        finalized: bool,
        fail_append_after: Option<u32>,
    }

    impl SegmentRecorder for FakeRecorder {
        type Session = FakeSession;

        async fn open(
            &self,
            path: &Path,
            _fps: f64,
            width: u32,
            height: u32,
        ) -> Result<FakeSession, RecorderError> {
            let refused = self
                .refuse_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if self.fail_open || refused {
                return Err(RecorderError::Spawn("no encoder".into()));
            }
            std::fs::File::create(path).map_err(|e| RecorderError::Spawn(e.to_string()))?;
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(SessionLog {
                path: path.to_path_buf(),
                ..SessionLog::default()
            });
            Ok(FakeSession {
                index: sessions.len() - 1,
                sessions: Arc::clone(&self.sessions),
                path: path.to_path_buf(),
                width,
                height,
                frames: 0,
                finalized: false,
                fail_append_after: self.fail_append_after,
            })
        }
    }

    impl RecordingSession for FakeSession {
        fn path(&self) -> &Path {
            &self.path
        }

        fn frame_count(&self) -> u32 {
            self.frames
        }

        async fn append(&mut self, frame: &Frame) -> Result<(), RecorderError> {
            ShapeMismatch::check((self.width, self.height), frame.dimensions())?;
            if self.finalized {
                return Err(RecorderError::Finalized(self.path.display().to_string()));
            }
            if self.fail_append_after.is_some_and(|n| self.frames >= n) {
                return Err(RecorderError::Write("broken pipe".into()));
            }
            self.frames += 1;
            let mut sessions = self.sessions.lock().unwrap();
            sessions[self.index].frames = self.frames;
            sessions[self.index].sizes.push(frame.dimensions());
            Ok(())
        }

        async fn finalize(&mut self) -> Result<(), RecorderError> {
            if self.finalized {
                return Ok(());
            }
            self.finalized = true;
            self.sessions.lock().unwrap()[self.index].finalize_calls += 1;
            Ok(())
        }
    }

    pub fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "motion-watch-pipeline-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
