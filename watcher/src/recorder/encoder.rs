use motion_watch_common::frame::{Frame, ShapeMismatch};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::{RecorderError, RecordingSession, SegmentRecorder, CODEC_TAG};

const FFMPEG: &str = "ffmpeg";

/// Spawns one ffmpeg subprocess per segment, fed raw `rgb24` frames on stdin
/// and writing an MPEG-4/AVI file straight to the destination path.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRecorder;

impl FfmpegRecorder {
    pub fn new() -> Self {
        Self
    }
}

pub struct FfmpegSession {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output_path: PathBuf,
    width: u32,
    height: u32,
    frame_count: u32,
}

impl SegmentRecorder for FfmpegRecorder {
    type Session = FfmpegSession;

    async fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<FfmpegSession, RecorderError> {
        let size = format!("{width}x{height}");
        let fps_str = fps.to_string();

        let mut cmd = Command::new(FFMPEG);
        cmd.args([
            "-hide_banner",
            "-loglevel", "error",
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", &size,
            "-r", &fps_str,
            "-i", "pipe:0",
            "-an",
            "-c:v", "mpeg4",
            "-vtag", CODEC_TAG,
            "-q:v", "5",
            "-f", "avi",
            "-y",
        ])
        .arg(path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| RecorderError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecorderError::Spawn("could not get stdin handle".into()))?;

        debug!(
            codec_tag = CODEC_TAG,
            fps,
            size,
            output = path.display().to_string(),
            "ffmpeg encoder started"
        );

        Ok(FfmpegSession {
            child: Some(child),
            stdin: Some(stdin),
            output_path: path.to_path_buf(),
            width,
            height,
            frame_count: 0,
        })
    }
}

impl RecordingSession for FfmpegSession {
    fn path(&self) -> &Path {
        &self.output_path
    }

    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Write a single raw frame to ffmpeg's stdin pipe.
    async fn append(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        ShapeMismatch::check((self.width, self.height), frame.dimensions())?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RecorderError::Finalized(self.output_path.display().to_string()))?;
        stdin
            .write_all(frame.as_rgb24())
            .await
            .map_err(|e| RecorderError::Write(e.to_string()))?;
        self.frame_count += 1;
        debug!(frame_count = self.frame_count, "pushed frame to encoder");
        Ok(())
    }

    /// Close stdin so ffmpeg writes the index and exits, then wait for it.
    async fn finalize(&mut self) -> Result<(), RecorderError> {
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                warn!(error = %e, "failed to flush ffmpeg stdin");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RecorderError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            return Err(RecorderError::FfmpegFailed(stderr.into_owned()));
        }

        info!(
            frame_count = self.frame_count,
            path = self.output_path.display().to_string(),
            "segment encoding complete"
        );
        Ok(())
    }
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() -> bool {
    match Command::new(FFMPEG).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
            true
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; encoding may fail");
            false
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; device capture and segment encoding will fail. \
                 Install ffmpeg with the mpeg4 encoder."
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{OUTPUT_FPS, OUTPUT_HEIGHT, OUTPUT_WIDTH};
    use image::{Rgb, RgbImage};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "motion-watch-encoder-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn gray_frame(value: u8, seq: u64) -> Frame {
        Frame::new(
            RgbImage::from_pixel(OUTPUT_WIDTH, OUTPUT_HEIGHT, Rgb([value; 3])),
            0,
            seq,
        )
    }

    #[tokio::test]
    async fn writes_readable_avi_and_finalize_is_idempotent() {
        if !check_ffmpeg_available().await {
            return;
        }
        let dir = scratch_dir("avi");
        let path = dir.join("recording_test.avi");

        let mut session = FfmpegRecorder::new()
            .open(&path, OUTPUT_FPS, OUTPUT_WIDTH, OUTPUT_HEIGHT)
            .await
            .unwrap();
        for i in 0..5u8 {
            session.append(&gray_frame(i * 40, i as u64)).await.unwrap();
        }
        assert_eq!(session.frame_count(), 5);

        session.finalize().await.unwrap();
        session.finalize().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 12);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        assert!(bytes.windows(4).any(|w| w == CODEC_TAG.as_bytes()));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn append_rejects_wrong_geometry() {
        if !check_ffmpeg_available().await {
            return;
        }
        let dir = scratch_dir("shape");
        let path = dir.join("recording_shape.avi");

        let mut session = FfmpegRecorder::new()
            .open(&path, OUTPUT_FPS, OUTPUT_WIDTH, OUTPUT_HEIGHT)
            .await
            .unwrap();
        session.append(&gray_frame(10, 0)).await.unwrap();

        let small = Frame::new(RgbImage::new(320, 240), 0, 1);
        let err = session.append(&small).await.unwrap_err();
        assert!(matches!(err, RecorderError::FrameShape(_)));
        assert_eq!(session.frame_count(), 1);

        session.finalize().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn append_after_finalize_fails() {
        if !check_ffmpeg_available().await {
            return;
        }
        let dir = scratch_dir("closed");
        let path = dir.join("recording_closed.avi");

        let mut session = FfmpegRecorder::new()
            .open(&path, OUTPUT_FPS, OUTPUT_WIDTH, OUTPUT_HEIGHT)
            .await
            .unwrap();
        session.append(&gray_frame(0, 0)).await.unwrap();
        session.finalize().await.unwrap();

        let err = session.append(&gray_frame(0, 1)).await.unwrap_err();
        assert!(matches!(err, RecorderError::Finalized(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
