//! Perimeter locator.
//! Finds the outer boundary of the board in a rectified frame:
//! grayscale, bilateral smoothing, adaptive mean threshold, outer contours,
//! area/circularity filter, ellipse fit.
//! The result is advisory; callers skip the crop or overlay on failure.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_line_segment_mut;
use imageproc::filter::{bilateral_filter, box_filter};
use imageproc::geometry::{arc_length, contour_area};
use imageproc::point::Point;
use nalgebra::{DMatrix, Matrix2, Point2, Vector2};

use crate::error::{Result, VisionError};

/// Window side of the edge-preserving smoothing.
const BILATERAL_WINDOW: u32 = 9;
const BILATERAL_SIGMA_COLOR: f32 = 100.0;
const BILATERAL_SIGMA_SPACE: f32 = 100.0;
const THRESHOLD_BLOCK: u32 = 11;
const THRESHOLD_C: i16 = 2;
const MIN_AREA: f64 = 1000.0;
const MAX_AREA_FRACTION: f64 = 0.9;
const MIN_CIRCULARITY: f64 = 0.5;
/// Fewest points an ellipse can be fitted through.
const MIN_FIT_POINTS: usize = 5;

/// Ellipse in image coordinates. `semi_axes` are half-lengths, `angle` is the
/// rotation of the first axis from +x in radians.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerimeterEllipse {
    pub center: Point2<f64>,
    pub semi_axes: Vector2<f64>,
    pub angle: f64,
}

impl PerimeterEllipse {
    pub fn mean_radius(&self) -> f64 {
        0.5 * (self.semi_axes.x + self.semi_axes.y)
    }

    /// Axis-aligned bounding box `(x0, y0, x1, y1)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let (a, b) = (self.semi_axes.x, self.semi_axes.y);
        let (s, c) = self.angle.sin_cos();
        let hx = ((a * c).powi(2) + (b * s).powi(2)).sqrt();
        let hy = ((a * s).powi(2) + (b * c).powi(2)).sqrt();
        (
            self.center.x - hx,
            self.center.y - hy,
            self.center.x + hx,
            self.center.y + hy,
        )
    }

    pub fn point_at(&self, t: f64) -> Point2<f64> {
        let (s, c) = self.angle.sin_cos();
        let (x, y) = (self.semi_axes.x * t.cos(), self.semi_axes.y * t.sin());
        Point2::new(self.center.x + x * c - y * s, self.center.y + x * s + y * c)
    }
}

pub fn detect_outer_boundary(image: &RgbImage) -> Result<PerimeterEllipse> {
    let gray = image::imageops::grayscale(image);
    detect_outer_boundary_gray(&gray)
}

pub fn detect_outer_boundary_gray(gray: &GrayImage) -> Result<PerimeterEllipse> {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return Err(VisionError::PerimeterNotFound);
    }

    let smoothed = bilateral_filter(
        gray,
        BILATERAL_WINDOW,
        BILATERAL_SIGMA_COLOR,
        BILATERAL_SIGMA_SPACE,
    );
    let binary = adaptive_mean_threshold(&smoothed, THRESHOLD_BLOCK, THRESHOLD_C);

    let contours: Vec<Vec<Point<i32>>> = find_contours::<i32>(&binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| c.points)
        .collect();
    if contours.is_empty() {
        return Err(VisionError::PerimeterNotFound);
    }

    let frame_area = w as f64 * h as f64;
    let area = |pts: &[Point<i32>]| contour_area(pts).abs();

    let best = contours
        .iter()
        .filter(|pts| {
            let a = area(pts.as_slice());
            if a < MIN_AREA || a > MAX_AREA_FRACTION * frame_area {
                return false;
            }
            let perimeter = arc_length(pts.as_slice(), true);
            perimeter > 0.0 && 4.0 * std::f64::consts::PI * a / (perimeter * perimeter) > MIN_CIRCULARITY
        })
        .max_by(|a, b| area(a.as_slice()).total_cmp(&area(b.as_slice())));

    let chosen = match best {
        Some(pts) if pts.len() >= MIN_FIT_POINTS => pts,
        _ => {
            log::debug!("no contour passed the shape filter, using largest raw contour");
            contours
                .iter()
                .max_by(|a, b| area(a.as_slice()).total_cmp(&area(b.as_slice())))
                .ok_or(VisionError::PerimeterNotFound)?
        }
    };
    if chosen.len() < MIN_FIT_POINTS {
        return Err(VisionError::PerimeterNotFound);
    }

    let pts: Vec<Point2<f64>> = chosen
        .iter()
        .map(|p| Point2::new(p.x as f64, p.y as f64))
        .collect();
    fit_ellipse(&pts).ok_or(VisionError::PerimeterNotFound)
}

/// Crops `image` to the ellipse's bounding box, clamped to the image. An empty
/// intersection returns the image unchanged.
pub fn crop_to_perimeter(image: &RgbImage, ellipse: &PerimeterEllipse) -> RgbImage {
    match crop_rect(image.width(), image.height(), ellipse) {
        Some((x, y, w, h)) => image::imageops::crop_imm(image, x, y, w, h).to_image(),
        None => image.clone(),
    }
}

/// Clamped integer crop rectangle `(x, y, width, height)`.
pub fn crop_rect(width: u32, height: u32, ellipse: &PerimeterEllipse) -> Option<(u32, u32, u32, u32)> {
    let (x0, y0, x1, y1) = ellipse.bounds();
    let x0 = x0.floor().clamp(0.0, width as f64) as u32;
    let y0 = y0.floor().clamp(0.0, height as f64) as u32;
    let x1 = x1.ceil().clamp(0.0, width as f64) as u32;
    let y1 = y1.ceil().clamp(0.0, height as f64) as u32;
    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

pub fn draw_perimeter(image: &mut RgbImage, ellipse: &PerimeterEllipse, color: Rgb<u8>) {
    const SEGMENTS: usize = 120;
    let step = std::f64::consts::TAU / SEGMENTS as f64;
    for i in 0..SEGMENTS {
        let a = ellipse.point_at(i as f64 * step);
        let b = ellipse.point_at((i + 1) as f64 * step);
        draw_line_segment_mut(
            image,
            (a.x as f32, a.y as f32),
            (b.x as f32, b.y as f32),
            color,
        );
    }
}

/// Binary threshold against the local `block`x`block` mean minus `c`.
fn adaptive_mean_threshold(gray: &GrayImage, block: u32, c: i16) -> GrayImage {
    let mean = box_filter(gray, block / 2, block / 2);
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, p) in gray.enumerate_pixels() {
        let m = mean.get_pixel(x, y)[0] as i16;
        let v = if p[0] as i16 > m - c { 255 } else { 0 };
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Least-squares conic fit, falling back to the second-moment ellipse when the
/// conic is not an ellipse.
fn fit_ellipse(pts: &[Point2<f64>]) -> Option<PerimeterEllipse> {
    if pts.len() < MIN_FIT_POINTS {
        return None;
    }
    fit_conic(pts).or_else(|| moment_ellipse(pts))
}

fn fit_conic(pts: &[Point2<f64>]) -> Option<PerimeterEllipse> {
    let n = pts.len() as f64;
    let (mx, my) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (mx / n, my / n);
    let scale = pts
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if scale < 1e-9 {
        return None;
    }

    // A x^2 + B xy + C y^2 + D x + E y + F = 0 on normalized points
    let mut design = DMatrix::<f64>::zeros(pts.len().max(6), 6);
    for (i, p) in pts.iter().enumerate() {
        let (x, y) = ((p.x - mx) / scale, (p.y - my) / scale);
        design[(i, 0)] = x * x;
        design[(i, 1)] = x * y;
        design[(i, 2)] = y * y;
        design[(i, 3)] = x;
        design[(i, 4)] = y;
        design[(i, 5)] = 1.0;
    }
    let svd = design.svd(false, true);
    let vt = svd.v_t?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &s)| if s < acc.1 { (i, s) } else { acc });
    let c = vt.row(idx);
    let (a, b, cc, d, e, f) = (c[0], c[1], c[2], c[3], c[4], c[5]);

    if b * b - 4.0 * a * cc >= 0.0 {
        return None;
    }
    let m = Matrix2::new(2.0 * a, b, b, 2.0 * cc);
    let center = m.try_inverse()? * Vector2::new(-d, -e);
    let (x0, y0) = (center.x, center.y);
    let f0 = a * x0 * x0 + b * x0 * y0 + cc * y0 * y0 + d * x0 + e * y0 + f;

    let q = Matrix2::new(a, b / 2.0, b / 2.0, cc);
    let eig = q.symmetric_eigen();
    let s0 = -f0 / eig.eigenvalues[0];
    let s1 = -f0 / eig.eigenvalues[1];
    if s0 <= 0.0 || s1 <= 0.0 {
        return None;
    }
    let v0 = eig.eigenvectors.column(0);
    let ellipse = PerimeterEllipse {
        center: Point2::new(x0 * scale + mx, y0 * scale + my),
        semi_axes: Vector2::new(s0.sqrt() * scale, s1.sqrt() * scale),
        angle: v0[1].atan2(v0[0]),
    };
    ellipse
        .semi_axes
        .iter()
        .all(|v| v.is_finite())
        .then_some(ellipse)
}

fn moment_ellipse(pts: &[Point2<f64>]) -> Option<PerimeterEllipse> {
    let n = pts.len() as f64;
    let (mx, my) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (mx / n, my / n);
    let mut cov = Matrix2::zeros();
    for p in pts {
        let d = Vector2::new(p.x - mx, p.y - my);
        cov += d * d.transpose();
    }
    cov /= n;
    let eig = cov.symmetric_eigen();
    // boundary points of an ellipse have variance a^2 / 2 along each axis
    let a = (2.0 * eig.eigenvalues[0].max(0.0)).sqrt();
    let b = (2.0 * eig.eigenvalues[1].max(0.0)).sqrt();
    if a <= 0.0 && b <= 0.0 {
        return None;
    }
    let v0 = eig.eigenvectors.column(0);
    Some(PerimeterEllipse {
        center: Point2::new(mx, my),
        semi_axes: Vector2::new(a, b),
        angle: v0[1].atan2(v0[0]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use imageproc::drawing::draw_filled_circle_mut;

    fn board_like(w: u32, h: u32, center: (i32, i32), radius: i32) -> RgbImage {
        let mut img = RgbImage::from_pixel(w, h, Rgb([250, 250, 250]));
        draw_filled_circle_mut(&mut img, center, radius, Rgb([30, 30, 30]));
        img
    }

    #[test]
    fn locates_clean_circle() {
        // area ~ 5000 px^2
        let radius = (5000.0 / std::f64::consts::PI).sqrt().round() as i32;
        let img = board_like(200, 200, (118, 87), radius);

        let e = detect_outer_boundary(&img).unwrap();
        assert!((e.center.x - 118.0).abs() < 3.0, "center {:?}", e.center);
        assert!((e.center.y - 87.0).abs() < 3.0, "center {:?}", e.center);
        // the threshold ring eats a few pixels of the disk edge
        assert!(e.mean_radius() > 25.0 && e.mean_radius() < 45.0, "radius {}", e.mean_radius());
    }

    #[test]
    fn tiny_image_is_not_found() {
        let img = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        assert!(matches!(
            detect_outer_boundary(&img),
            Err(VisionError::PerimeterNotFound)
        ));
    }

    #[test]
    fn conic_fit_recovers_rotated_ellipse() {
        let truth = PerimeterEllipse {
            center: Point2::new(52.0, -13.0),
            semi_axes: Vector2::new(40.0, 22.0),
            angle: 0.4,
        };
        let pts: Vec<_> = (0..60).map(|i| truth.point_at(i as f64 * 0.1047)).collect();
        let fit = fit_ellipse(&pts).unwrap();
        assert_relative_eq!(fit.center.x, 52.0, epsilon = 1e-6);
        assert_relative_eq!(fit.center.y, -13.0, epsilon = 1e-6);
        let (lo, hi) = if fit.semi_axes.x < fit.semi_axes.y {
            (fit.semi_axes.x, fit.semi_axes.y)
        } else {
            (fit.semi_axes.y, fit.semi_axes.x)
        };
        assert_relative_eq!(lo, 22.0, epsilon = 1e-6);
        assert_relative_eq!(hi, 40.0, epsilon = 1e-6);
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let img = RgbImage::new(100, 80);
        let e = PerimeterEllipse {
            center: Point2::new(90.0, 10.0),
            semi_axes: Vector2::new(20.0, 20.0),
            angle: 0.0,
        };
        let cropped = crop_to_perimeter(&img, &e);
        assert_eq!(cropped.dimensions(), (30, 30));
    }

    #[test]
    fn locates_circle_through_pixel_noise() {
        let mut img = board_like(200, 200, (100, 100), 40);
        for (x, y, p) in img.enumerate_pixels_mut() {
            let jitter: i16 = if (x + y) % 2 == 0 { 3 } else { -3 };
            for c in p.0.iter_mut() {
                *c = (*c as i16 + jitter).clamp(0, 255) as u8;
            }
        }

        let e = detect_outer_boundary(&img).unwrap();
        assert!((e.center.x - 100.0).abs() < 3.0, "center {:?}", e.center);
        assert!((e.center.y - 100.0).abs() < 3.0, "center {:?}", e.center);
    }
}
