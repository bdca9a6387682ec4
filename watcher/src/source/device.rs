use motion_watch_common::frame::Frame;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{FrameSource, OpenError, ReadError};

/// Capture through an ffmpeg subprocess that decodes the input, scales it to
/// the capture geometry and writes packed `rgb24` frames to stdout.
pub struct DeviceSource {
    input: String,
    input_format: Option<String>,
    width: u32,
    height: u32,
    open_timeout: Duration,
    /// Output rate forced with ffmpeg's `fps` filter, matched to the tick rate.
    frame_rate: Option<f64>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// Partially received frame; survives a cancelled read.
    buf: Vec<u8>,
    filled: usize,
    /// First frame, read during `open` to prove the device delivers.
    pending: Option<Frame>,
    seq: u64,
}

/// Parse a `/dev/videoX` style input, or a bare index, into the device index.
pub(crate) fn parse_device_index(input: &str) -> Option<u32> {
    if let Ok(index) = input.parse::<u32>() {
        return Some(index);
    }
    let stripped = input.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse().ok();
    }
    None
}

impl DeviceSource {
    pub fn new(
        input: &str,
        input_format: Option<String>,
        width: u32,
        height: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            input: input.to_string(),
            input_format,
            width,
            height,
            open_timeout,
            frame_rate: None,
            child: None,
            stdout: None,
            buf: vec![0; width as usize * height as usize * 3],
            filled: 0,
            pending: None,
            seq: 0,
        }
    }

    /// Have ffmpeg drop frames down to `fps`, so a camera running faster than
    /// the pipeline does not queue up stale frames in the pipe.
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = (fps.is_finite() && fps > 0.0).then_some(fps);
        self
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let input = match parse_device_index(&self.input) {
            Some(index) => format!("/dev/video{index}"),
            None => self.input.clone(),
        };
        let format = match &self.input_format {
            Some(f) => Some(f.clone()),
            None if input.starts_with("/dev/video") => Some("video4linux2".to_string()),
            None => None,
        };
        if let Some(format) = format {
            args.push("-f".into());
            args.push(format);
        }

        let scale = format!("scale={}:{}", self.width, self.height);
        let filter = match self.frame_rate {
            Some(fps) => format!("fps={fps},{scale}"),
            None => scale,
        };

        args.push("-i".into());
        args.push(input);
        args.extend(
            [
                "-an".to_string(),
                "-vf".to_string(),
                filter,
                "-pix_fmt".to_string(),
                "rgb24".to_string(),
                "-f".to_string(),
                "rawvideo".to_string(),
                "-".to_string(),
            ],
        );
        args
    }

    async fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let stdout = self.stdout.as_mut().ok_or(ReadError::NotOpen)?;
        while self.filled < self.buf.len() {
            let n = stdout
                .read(&mut self.buf[self.filled..])
                .await
                .map_err(|e| ReadError::Capture(e.to_string()))?;
            if n == 0 {
                return Err(ReadError::EndOfStream);
            }
            self.filled += n;
        }
        self.filled = 0;
        self.seq += 1;

        let now_ms = chrono::Utc::now().timestamp_millis();
        Frame::from_rgb24(self.width, self.height, self.buf.clone(), now_ms, self.seq)
            .map_err(|e| ReadError::Capture(e.to_string()))
    }
}

impl FrameSource for DeviceSource {
    async fn open(&mut self) -> Result<(), OpenError> {
        if self.child.is_some() {
            return Ok(());
        }

        let args = self.ffmpeg_args();
        debug!(?args, "spawning ffmpeg capture");
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OpenError::Spawn(e.to_string()))?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.filled = 0;

        let first = tokio::time::timeout(self.open_timeout, self.read_frame()).await;
        match first {
            Ok(Ok(frame)) => {
                info!(
                    input = self.input,
                    width = self.width,
                    height = self.height,
                    "capture device opened"
                );
                self.pending = Some(frame);
                Ok(())
            }
            Ok(Err(e)) => {
                self.close().await;
                Err(OpenError::NoFrame {
                    input: self.input.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.close().await;
                Err(OpenError::Timeout(self.open_timeout))
            }
        }
    }

    async fn read(&mut self) -> Result<Frame, ReadError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_frame().await
    }

    async fn close(&mut self) {
        self.stdout = None;
        self.pending = None;
        self.filled = 0;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, input = self.input, "failed to stop ffmpeg capture");
            }
            info!(input = self.input, "capture device closed");
        }
    }

    fn describe(&self) -> String {
        format!("device:{}", self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::encoder::check_ffmpeg_available;

    #[test]
    fn device_index_forms() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn v4l2_format_only_for_devices() {
        let dev = DeviceSource::new("0", None, 640, 480, Duration::from_secs(1));
        let args = dev.ffmpeg_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/dev/video0");
        assert_eq!(args[i - 1], "video4linux2");
        assert!(args.contains(&"scale=640:480".to_string()));

        let file = DeviceSource::new("clip.mp4", None, 320, 240, Duration::from_secs(1));
        let args = file.ffmpeg_args();
        assert!(!args.contains(&"video4linux2".to_string()));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn frame_rate_limits_output() {
        let dev =
            DeviceSource::new("0", None, 640, 480, Duration::from_secs(1)).with_frame_rate(10.0);
        let args = dev.ffmpeg_args();
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "fps=10,scale=640:480");

        let unlimited =
            DeviceSource::new("0", None, 640, 480, Duration::from_secs(1)).with_frame_rate(0.0);
        assert!(unlimited.ffmpeg_args().contains(&"scale=640:480".to_string()));
    }

    #[tokio::test]
    async fn synthetic_input_reads_until_end_of_stream() {
        if !check_ffmpeg_available().await {
            return;
        }
        let mut source = DeviceSource::new(
            "testsrc=duration=1:size=64x48:rate=10",
            Some("lavfi".into()),
            32,
            24,
            Duration::from_secs(10),
        );
        source.open().await.unwrap();

        let mut frames = 0;
        loop {
            match source.read().await {
                Ok(frame) => {
                    assert_eq!(frame.dimensions(), (32, 24));
                    frames += 1;
                }
                Err(e) => {
                    assert!(matches!(e, ReadError::EndOfStream), "unexpected {e}");
                    break;
                }
            }
        }
        assert!(frames >= 1);

        source.close().await;
        source.close().await;
        assert!(matches!(source.read().await, Err(ReadError::NotOpen)));
    }

    #[tokio::test]
    async fn missing_input_fails_to_open() {
        if !check_ffmpeg_available().await {
            return;
        }
        let mut source = DeviceSource::new(
            "/nonexistent/motion-watch/input.mkv",
            None,
            32,
            24,
            Duration::from_secs(10),
        );
        let err = source.open().await.unwrap_err();
        assert!(matches!(err, OpenError::NoFrame { .. }));
    }
}
