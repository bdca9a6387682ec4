use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use motion_watch_common::frame::Frame;
use std::time::Duration;
use tracing::{debug, info};

use super::{FrameSource, OpenError, ReadError};

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

enum ParseState {
    /// Before the first `--frame` marker; anything here is preamble.
    SeekingBoundary,
    /// Inside a part's headers.
    SeekingHeaderEnd,
    /// Inside a part's body, which ends at the next marker.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` body.
///
/// A part is complete once the following boundary has been seen, so the most
/// recent JPEG is held back until the next one starts.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete JPEG, or `None` if more bytes are needed.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // A marker may straddle two chunks.
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.jpeg_start = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    else {
                        // Resume the scan where this one stopped.
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        return None;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // The CRLF before a marker belongs to the framing.
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let jpeg = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                    self.state = ParseState::SeekingHeaderEnd;

                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }
}

/// HTTP MJPEG camera (`multipart/x-mixed-replace; boundary=frame`).
pub struct MjpegSource {
    url: String,
    open_timeout: Duration,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MjpegParser,
    seq: u64,
}

impl MjpegSource {
    pub fn new(url: &str, open_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            open_timeout,
            stream: None,
            parser: MjpegParser::new(),
            seq: 0,
        }
    }

    /// Wait for one complete JPEG, then drain whatever else is already
    /// buffered so the pipeline always sees the newest picture.
    async fn next_latest_jpeg(&mut self) -> Result<Vec<u8>, ReadError> {
        let stream = self.stream.as_mut().ok_or(ReadError::NotOpen)?;

        let mut latest = self.parser.next_jpeg();
        while latest.is_none() {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    self.parser.push(&chunk);
                    latest = self.parser.next_jpeg();
                }
                Some(Err(e)) => return Err(ReadError::Capture(e.to_string())),
                None => return Err(ReadError::EndOfStream),
            }
        }

        let mut skipped = 0u32;
        while let Some(Some(Ok(chunk))) = stream.next().now_or_never() {
            self.parser.push(&chunk);
        }
        while let Some(newer) = self.parser.next_jpeg() {
            latest = Some(newer);
            skipped += 1;
        }
        if skipped > 0 {
            debug!(skipped, "dropped stale MJPEG frames");
        }

        latest.ok_or(ReadError::EndOfStream)
    }
}

impl FrameSource for MjpegSource {
    async fn open(&mut self) -> Result<(), OpenError> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!(url = self.url, "connecting to MJPEG stream");

        let client = reqwest::Client::builder()
            .connect_timeout(self.open_timeout)
            .build()
            .map_err(OpenError::HttpConnect)?;
        let response = tokio::time::timeout(self.open_timeout, client.get(&self.url).send())
            .await
            .map_err(|_| OpenError::Timeout(self.open_timeout))?
            .map_err(OpenError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(OpenError::HttpStatus(response.status().as_u16()));
        }

        info!(status = %response.status(), "connected to MJPEG stream");
        self.parser = MjpegParser::new();
        self.stream = Some(response.bytes_stream().fuse().boxed());
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, ReadError> {
        let jpeg = self.next_latest_jpeg().await?;
        let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| ReadError::Capture(format!("failed to decode JPEG: {e}")))?
            .to_rgb8();
        self.seq += 1;
        Ok(Frame::captured_now(image, self.seq))
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(url = self.url, "MJPEG stream closed");
        }
        self.parser = MjpegParser::new();
    }

    fn describe(&self) -> String {
        format!("mjpeg:{}", self.url)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
