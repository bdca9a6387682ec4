//! Grayscale grid operations behind frame-difference motion detection.
//!
//! Each step is a pure function from grid to grid so the detector can be read
//! as a straight pipeline: blur → diff → threshold → dilate → region areas.

use image::{GrayImage, Luma, RgbImage};
use motion_watch_common::frame::ShapeMismatch;

const FOREGROUND: u8 = 255;

/// Luma conversion of a color frame.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// Sigma picked for a kernel of side `ksize` when none is given explicitly.
pub fn auto_sigma(ksize: usize) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Normalized 1-D Gaussian weights of length `ksize`.
pub fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    let sigma = auto_sigma(ksize);
    let center = (ksize / 2) as f32;
    let weights: Vec<f32> = (0..ksize)
        .map(|i| {
            let x = i as f32 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Mirror an out-of-range index back into `0..len` without repeating the edge
/// pixel (`gfedcb|abcdefgh|gfedcba`).
fn reflect101(mut i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * (n - 1) - i;
        } else {
            return i as usize;
        }
    }
}

/// Separable Gaussian blur with a square `ksize`×`ksize` kernel.
pub fn gaussian_blur(src: &GrayImage, ksize: usize) -> GrayImage {
    let (width, height) = src.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 || ksize <= 1 {
        return src.clone();
    }
    let kernel = gaussian_kernel(ksize);
    let radius = (ksize / 2) as isize;
    let pixels = src.as_raw();

    let mut horizontal = vec![0f32; w * h];
    for y in 0..h {
        let row = &pixels[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect101(x as isize + k as isize - radius, w);
                acc += weight * row[sx] as f32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect101(y as isize + k as isize - radius, h);
                acc += weight * horizontal[sy * w + x];
            }
            out[y * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(width, height, out).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Per-pixel `|a - b|`.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> Result<GrayImage, ShapeMismatch> {
    ShapeMismatch::check(a.dimensions(), b.dimensions())?;
    let (width, height) = a.dimensions();
    Ok(GrayImage::from_fn(width, height, |x, y| {
        let pa = a.get_pixel(x, y).0[0];
        let pb = b.get_pixel(x, y).0[0];
        Luma([pa.abs_diff(pb)])
    }))
}

/// Binary mask: `value >= level` becomes 255, everything else 0.
pub fn threshold(src: &GrayImage, level: u8) -> GrayImage {
    let (width, height) = src.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        if src.get_pixel(x, y).0[0] >= level {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Morphological dilation with a 3×3 square, applied `iterations` times.
/// Pixels outside the grid never contribute.
pub fn dilate(mask: &GrayImage, iterations: u32) -> GrayImage {
    let mut current = mask.clone();
    let (width, height) = mask.dimensions();
    for _ in 0..iterations {
        let prev = current;
        current = GrayImage::from_fn(width, height, |x, y| {
            let x0 = x.saturating_sub(1);
            let y0 = y.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let y1 = (y + 1).min(height - 1);
            let mut max = 0u8;
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    max = max.max(prev.get_pixel(nx, ny).0[0]);
                }
            }
            Luma([max])
        });
    }
    current
}

/// Filled areas of the outermost connected regions of a binary mask.
///
/// Foreground is 8-connected. Holes count towards the area of the region that
/// encloses them and anything nested inside a hole is part of that region, so
/// only external outlines produce entries.
pub fn external_region_areas(mask: &GrayImage) -> Vec<usize> {
    let (width, height) = mask.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let fg: Vec<bool> = mask.as_raw().iter().map(|&p| p != 0).collect();

    // Background reachable from the border (4-connected) is outside every region.
    let mut outside = vec![false; w * h];
    let mut stack: Vec<usize> = Vec::new();
    for x in 0..w {
        stack.push(x);
        stack.push((h - 1) * w + x);
    }
    for y in 0..h {
        stack.push(y * w);
        stack.push(y * w + w - 1);
    }
    while let Some(idx) = stack.pop() {
        if fg[idx] || outside[idx] {
            continue;
        }
        outside[idx] = true;
        let (x, y) = (idx % w, idx / w);
        if x > 0 {
            stack.push(idx - 1);
        }
        if x + 1 < w {
            stack.push(idx + 1);
        }
        if y > 0 {
            stack.push(idx - w);
        }
        if y + 1 < h {
            stack.push(idx + w);
        }
    }

    let mut seen = outside;
    let mut areas = Vec::new();
    for start in 0..w * h {
        if seen[start] {
            continue;
        }
        let mut area = 0usize;
        seen[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            area += 1;
            let (x, y) = ((idx % w) as isize, (idx / w) as isize);
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        areas.push(area);
    }
    areas
}
