mod control;
mod detector;
mod pipeline;
mod recorder;
mod source;

use detector::FrameDiffDetector;
use motion_watch_common::config::Config;
use pipeline::{MotionPipeline, PipelineHandle, PipelineSettings};
use recorder::FfmpegRecorder;
use source::{CameraSource, FrameSource};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let source = CameraSource::from_config(&config.camera, config.scheduler.tick_interval());
    info!(
        source = source.describe(),
        save_dir = config.recording.save_dir.display().to_string(),
        tail_frames = config.recording.tail_frames,
        tick_ms = config.scheduler.tick_interval_ms,
        min_area = config.detector.min_area,
        "starting motion-watch"
    );

    // Recording always needs ffmpeg; device capture does too.
    recorder::encoder::check_ffmpeg_available().await;

    if let Err(e) = std::fs::create_dir_all(&config.recording.save_dir) {
        error!(
            error = %e,
            path = config.recording.save_dir.display().to_string(),
            "failed to create save directory"
        );
        std::process::exit(1);
    }

    let mut pipeline = MotionPipeline::new(
        source,
        FrameDiffDetector::new(config.detector.clone()),
        FfmpegRecorder::new(),
        PipelineSettings::from_config(&config),
    );
    let (handle, commands) = PipelineHandle::new(pipeline.subscribe());

    if config.control.enabled {
        let listen = config.control.listen.clone();
        let control_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(&listen, control_handle).await {
                error!(error = %e, listen, "control API failed");
            }
        });
    }

    // Status observer: one line per change.
    let mut status_rx = handle.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let report = status_rx.borrow_and_update().clone();
            debug!(status = report.text(), segments = report.segments_written, "status changed");
        }
    });

    if config.scheduler.autostart {
        if let Err(e) = pipeline.start().await {
            warn!(error = %e, "autostart failed; waiting for a start command");
        }
    }

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
    };

    pipeline::runner::run(
        pipeline,
        commands,
        config.scheduler.tick_interval(),
        shutdown,
    )
    .await;
    drop(handle);
    info!("motion-watch stopped");
}
