use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use motion_watch_common::status::StatusReport;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::state::{MotionPipeline, StepOutcome};
use crate::detector::MotionFilter;
use crate::recorder::SegmentRecorder;
use crate::source::FrameSource;

/// Requests delivered to the task that owns the pipeline.
#[derive(Debug)]
pub enum Command {
    Start(oneshot::Sender<Result<StatusReport, String>>),
    Stop(oneshot::Sender<StatusReport>),
    SetSaveDir(PathBuf, oneshot::Sender<Result<StatusReport, String>>),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("pipeline is no longer running")]
    Closed,
    #[error("{0}")]
    Rejected(String),
}

/// Cloneable front end for the pipeline task.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusReport>,
}

impl PipelineHandle {
    /// Create a handle and the command receiver to pass to [`run`].
    pub fn new(status: watch::Receiver<StatusReport>) -> (Self, mpsc::Receiver<Command>) {
        let (commands, rx) = mpsc::channel(16);
        (Self { commands, status }, rx)
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<StatusReport, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx)).await?;
        rx.await
            .map_err(|_| ControlError::Closed)?
            .map_err(ControlError::Rejected)
    }

    pub async fn stop(&self) -> Result<StatusReport, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx)).await?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    pub async fn set_save_dir(&self, dir: PathBuf) -> Result<StatusReport, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetSaveDir(dir, tx)).await?;
        rx.await
            .map_err(|_| ControlError::Closed)?
            .map_err(ControlError::Rejected)
    }

    async fn send(&self, command: Command) -> Result<(), ControlError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControlError::Closed)
    }
}

/// Drive the pipeline until `shutdown` resolves.
///
/// Ticks fire every `tick_interval` while the camera is open; a slow tick
/// delays the next one rather than bursting to catch up. Commands are
/// handled between ticks. On exit the pipeline is stopped, so an open
/// segment is always finalized.
pub async fn run<S, D, R>(
    mut pipeline: MotionPipeline<S, D, R>,
    mut commands: mpsc::Receiver<Command>,
    tick_interval: Duration,
    shutdown: impl Future<Output = ()>,
) where
    S: FrameSource,
    D: MotionFilter,
    R: SegmentRecorder,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;

    info!(
        tick_ms = tick_interval.as_millis() as u64,
        "pipeline runner started"
    );

    loop {
        let active = pipeline.state().is_active();
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            command = commands.recv(), if commands_open => match command {
                Some(command) => {
                    let was_active = active;
                    handle_command(&mut pipeline, command).await;
                    if !was_active && pipeline.state().is_active() {
                        ticker.reset();
                    }
                }
                None => {
                    debug!("all control handles dropped");
                    commands_open = false;
                }
            },
            _ = ticker.tick(), if active => {
                if pipeline.step().await == StepOutcome::Stopped {
                    warn!(status = pipeline.status().text(), "pipeline stopped itself");
                }
            }
        }
    }

    pipeline.stop().await;
    info!("pipeline runner exited");
}

async fn handle_command<S, D, R>(pipeline: &mut MotionPipeline<S, D, R>, command: Command)
where
    S: FrameSource,
    D: MotionFilter,
    R: SegmentRecorder,
{
    match command {
        Command::Start(reply) => {
            let result = match pipeline.start().await {
                Ok(()) => Ok(pipeline.status()),
                Err(e) => Err(e.to_string()),
            };
            let _ = reply.send(result);
        }
        Command::Stop(reply) => {
            pipeline.stop().await;
            let _ = reply.send(pipeline.status());
        }
        Command::SetSaveDir(dir, reply) => {
            let result = match pipeline.set_save_dir(&dir) {
                Ok(()) => Ok(pipeline.status()),
                Err(e) => Err(e.to_string()),
            };
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::testing::*;
    use crate::pipeline::state::PipelineSettings;
    use crate::recorder::{OUTPUT_HEIGHT, OUTPUT_WIDTH};
    use motion_watch_common::status::PipelineState;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(5);

    type Fixture = (
        MotionPipeline<FakeSource, ScriptedDetector, FakeRecorder>,
        ScriptedDetector,
        FakeRecorder,
        PathBuf,
    );

    fn fixture(name: &str, fail_open: bool) -> Fixture {
        let dir = scratch_dir(name);
        let mut source = FakeSource::new(OUTPUT_WIDTH, OUTPUT_HEIGHT);
        source.fail_open = fail_open;
        let detector = ScriptedDetector::default();
        let detector_handle = ScriptedDetector {
            verdicts: Arc::clone(&detector.verdicts),
            resets: Arc::clone(&detector.resets),
        };
        let recorder = FakeRecorder::default();
        let recorder_handle = FakeRecorder {
            sessions: Arc::clone(&recorder.sessions),
            ..FakeRecorder::default()
        };
        let pipeline = MotionPipeline::new(
            source,
            detector,
            recorder,
            PipelineSettings {
                save_dir: dir.clone(),
                tail_frames: 100,
                read_timeout: Duration::from_millis(50),
            },
        );
        (pipeline, detector_handle, recorder_handle, dir)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<StatusReport>, state: PipelineState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.borrow_and_update().state != state {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn commands_drive_the_pipeline() {
        let (pipeline, detector, recorder, dir) = fixture("runner-commands", false);
        let (handle, commands) = PipelineHandle::new(pipeline.subscribe());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let other = dir.join("elsewhere");

        let driver = async {
            let mut rx = handle.subscribe();
            assert_eq!(handle.status().state, PipelineState::Idle);

            let report = handle.start().await.unwrap();
            assert_eq!(report.state, PipelineState::Watching);

            detector.push(Verdict::Motion, 1);
            wait_for_state(&mut rx, PipelineState::Recording).await;

            let report = handle.stop().await.unwrap();
            assert_eq!(report.state, PipelineState::Idle);

            let report = handle.set_save_dir(other.clone()).await.unwrap();
            assert_eq!(report.save_dir, other);

            let _ = stop_tx.send(());
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };

        tokio::join!(run(pipeline, commands, TICK, shutdown), driver);

        let sessions = recorder.sessions.lock().unwrap().clone();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].frames >= 1);
        assert_eq!(sessions[0].finalize_calls, 1);
        assert!(other.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn shutdown_finalizes_open_segment() {
        let (pipeline, detector, recorder, dir) = fixture("runner-shutdown", false);
        let (handle, commands) = PipelineHandle::new(pipeline.subscribe());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let driver = async {
            let mut rx = handle.subscribe();
            handle.start().await.unwrap();
            detector.push(Verdict::Motion, 1);
            wait_for_state(&mut rx, PipelineState::Recording).await;
            let _ = stop_tx.send(());
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };

        tokio::join!(run(pipeline, commands, TICK, shutdown), driver);

        assert_eq!(handle.status().state, PipelineState::Idle);
        assert_eq!(recorder.sessions.lock().unwrap()[0].finalize_calls, 1);
        assert!(matches!(handle.start().await, Err(ControlError::Closed)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_start_is_reported_to_caller() {
        let (pipeline, _detector, _recorder, dir) = fixture("runner-open-fail", true);
        let (handle, commands) = PipelineHandle::new(pipeline.subscribe());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let driver = async {
            let err = handle.start().await.unwrap_err();
            assert!(matches!(err, ControlError::Rejected(ref m) if m.contains("unplugged")));
            let status = handle.status();
            assert_eq!(status.state, PipelineState::Idle);
            assert!(status.fatal);
            let _ = stop_tx.send(());
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };

        tokio::join!(run(pipeline, commands, TICK, shutdown), driver);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
