use image::RgbImage;

/// A captured color frame with timestamp metadata.
///
/// The pixel grid is never mutated after capture. Consumers that need a
/// different geometry build a new frame with [`Frame::resized`].
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Wrap a packed `rgb24` buffer as read from a raw video pipe.
    pub fn from_rgb24(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(FrameError::BufferSize { got, expected })?;
        Ok(Self::new(image, captured_at_ms, seq))
    }

    /// Stamp a freshly captured image with the current wall-clock time.
    pub fn captured_now(image: RgbImage, seq: u64) -> Self {
        Self::new(image, chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Raw packed `rgb24` bytes, row-major.
    pub fn as_rgb24(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Returns a copy scaled to exactly `width`×`height`.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        let image = image::imageops::resize(
            &self.image,
            width,
            height,
            image::imageops::FilterType::Triangle,
        );
        Frame::new(image, self.captured_at_ms, self.seq)
    }
}

/// Two grids that must share a geometry do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame shape mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
pub struct ShapeMismatch {
    pub expected_width: u32,
    pub expected_height: u32,
    pub width: u32,
    pub height: u32,
}

impl ShapeMismatch {
    /// `Ok` when `got` equals `expected`, otherwise the mismatch.
    pub fn check(expected: (u32, u32), got: (u32, u32)) -> Result<(), ShapeMismatch> {
        if expected == got {
            return Ok(());
        }
        Err(ShapeMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            width: got.0,
            height: got.1,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("raw frame buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
}
