//! Frame differencing.
//! Grayscale, 5x5 Gaussian blur, absolute difference, binary threshold, then
//! the share of changed pixels in percent.

use image::{GrayImage, RgbImage};
use imageproc::filter::gaussian_blur_f32;

/// imageproc sizes the kernel as `2 * ceil(2 * sigma) + 1`, so 1.0 gives 5x5.
const BLUR_SIGMA: f32 = 1.0;
pub const DEFAULT_PIXEL_THRESHOLD: u8 = 25;

/// Percent (0-100) of pixels whose blurred intensity differs by more than
/// `pixel_threshold`. Empty or differently sized inputs compare as 0.
pub fn difference_percentage(frame: &RgbImage, reference: &RgbImage, pixel_threshold: u8) -> f64 {
    if frame.width() == 0 || frame.height() == 0 || frame.dimensions() != reference.dimensions() {
        return 0.0;
    }
    let a = prepare(frame);
    let b = prepare(reference);
    gray_difference(&a, &b, pixel_threshold)
}

/// Same metric when one side is missing: nothing to compare is no change.
pub fn difference_or_zero(frame: Option<&RgbImage>, reference: Option<&RgbImage>, pixel_threshold: u8) -> f64 {
    match (frame, reference) {
        (Some(f), Some(r)) => difference_percentage(f, r, pixel_threshold),
        _ => 0.0,
    }
}

fn prepare(frame: &RgbImage) -> GrayImage {
    let gray = image::imageops::grayscale(frame);
    gaussian_blur_f32(&gray, BLUR_SIGMA)
}

fn gray_difference(a: &GrayImage, b: &GrayImage, pixel_threshold: u8) -> f64 {
    let total = a.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let changed = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .filter(|(p, q)| p.abs_diff(**q) > pixel_threshold)
        .count();
    changed as f64 * 100.0 / total as f64
}
