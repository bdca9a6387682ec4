use image::GrayImage;
use motion_watch_common::config::DetectorConfig;
use motion_watch_common::frame::Frame;
use tracing::debug;

use super::grid;
use super::traits::{DetectError, MotionFilter};

/// Frame-differencing motion detector.
///
/// Algorithm:
/// 1. Convert to grayscale and blur with a large Gaussian to drown sensor noise
/// 2. Diff against the previous blurred frame
/// 3. Threshold the diff into a binary mask and dilate it to merge fragments
/// 4. Report motion if any outer region of the mask is larger than `min_area`
///
/// The reference is always the immediately preceding frame, never an average,
/// so a slow lighting drift shows up as motion once it crosses the threshold
/// within a single tick.
pub struct FrameDiffDetector {
    config: DetectorConfig,
    reference: Option<GrayImage>,
}

impl FrameDiffDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            reference: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    fn prepare(&self, frame: &Frame) -> GrayImage {
        grid::gaussian_blur(&grid::to_gray(frame.image()), self.config.blur_kernel)
    }
}

impl MotionFilter for FrameDiffDetector {
    fn detect(&mut self, frame: &Frame) -> Result<bool, DetectError> {
        let current = self.prepare(frame);

        let Some(reference) = &self.reference else {
            debug!(seq = frame.seq, "first frame, storing reference");
            self.reference = Some(current);
            return Ok(false);
        };

        let diff = grid::abs_diff(reference, &current)?;
        let mask = grid::dilate(
            &grid::threshold(&diff, self.config.diff_threshold),
            self.config.dilate_iterations,
        );
        let areas = grid::external_region_areas(&mask);
        let largest = areas.iter().copied().max().unwrap_or(0);
        let motion = largest > self.config.min_area;

        debug!(
            seq = frame.seq,
            regions = areas.len(),
            largest,
            min_area = self.config.min_area,
            motion,
            "frame difference"
        );

        self.reference = Some(current);
        Ok(motion)
    }

    fn reset(&mut self) {
        self.reference = None;
    }

    fn name(&self) -> &str {
        "frame-diff"
    }
}
