//! Geometric rectifier.
//! Undistorts raw camera frames with the lens calibration and warps them into
//! the canonical board square with a four-point homography.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, warp_with, Interpolation, Projection};
use nalgebra::Point2;

use crate::camera::{CameraProfile, LensCalibration};
use crate::error::{Result, VisionError};
use crate::homography::{homography_from_4pt, Homography};
use crate::perimeter::{crop_rect, detect_outer_boundary};

const BORDER: Rgb<u8> = Rgb([0, 0, 0]);
const UNDISTORT_ITERS: u32 = 20;

/// How the canonical destination square is derived from picked points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CanonicalSquare {
    /// Four picked corners, clockwise from top-left.
    FromFourPoints([Point2<f64>; 4]),
    /// Top-left and opposite corner; expanded into an axis-aligned square
    /// whose side is the larger of the two extents.
    FromTwoPointsSquare(Point2<f64>, Point2<f64>),
}

impl CanonicalSquare {
    pub fn from_picks(points: &[Point2<f64>], square: bool) -> Result<Self> {
        match (square, points) {
            (false, [a, b, c, d]) => Ok(Self::FromFourPoints([*a, *b, *c, *d])),
            (false, pts) => Err(VisionError::point_count(4, pts.len())),
            (true, [a, b]) => Ok(Self::FromTwoPointsSquare(*a, *b)),
            (true, pts) => Err(VisionError::point_count(2, pts.len())),
        }
    }

    /// Corners clockwise from top-left.
    pub fn corners(&self) -> [Point2<f64>; 4] {
        match *self {
            Self::FromFourPoints(pts) => pts,
            Self::FromTwoPointsSquare(p0, p1) => {
                let side = (p1.x - p0.x).abs().max((p1.y - p0.y).abs());
                [
                    p0,
                    Point2::new(p0.x + side, p0.y),
                    Point2::new(p0.x + side, p0.y + side),
                    Point2::new(p0.x, p0.y + side),
                ]
            }
        }
    }
}

pub fn compute_homography(source: &[Point2<f64>], canonical: &[Point2<f64>]) -> Result<Homography> {
    let src: &[Point2<f64>; 4] = source
        .try_into()
        .map_err(|_| VisionError::point_count(4, source.len()))?;
    let dst: &[Point2<f64>; 4] = canonical
        .try_into()
        .map_err(|_| VisionError::point_count(4, canonical.len()))?;
    homography_from_4pt(src, dst)
}

/// Removes lens distortion. Without a calibration the frame passes through.
pub fn undistort(frame: &RgbImage, lens: Option<&LensCalibration>) -> RgbImage {
    let Some(lens) = lens.filter(|l| !l.distortion.is_identity()) else {
        log::debug!("no lens distortion to remove, passing frame through");
        return frame.clone();
    };
    let k = lens.intrinsics;
    let distortion = &lens.distortion;
    warp_with(
        frame,
        |x, y| {
            let n = k.unproject(Point2::new(x as f64, y as f64));
            let p = k.project(distortion.distort(n));
            (p.x as f32, p.y as f32)
        },
        Interpolation::Bilinear,
        BORDER,
    )
}

/// Warps `frame` through `homography` onto a `size`x`size` canvas. Pixels that
/// map outside the source are black.
pub fn warp(frame: &RgbImage, homography: &Homography, size: u32) -> Result<RgbImage> {
    let projection = Projection::from_matrix(homography.to_row_major_f32())
        .ok_or_else(|| VisionError::Numerical("homography is not invertible".to_string()))?;
    let mut out = RgbImage::new(size, size);
    warp_into(frame, &projection, Interpolation::Bilinear, BORDER, &mut out);
    Ok(out)
}

/// Maps a point in raw pixel space through undistortion and the homography.
pub fn rectify_point(p: Point2<f64>, lens: Option<&LensCalibration>, homography: &Homography) -> Point2<f64> {
    let p = match lens {
        Some(lens) => {
            let k = lens.intrinsics;
            k.project(lens.distortion.undistort(k.unproject(p), UNDISTORT_ITERS))
        }
        None => p,
    };
    homography.apply(p)
}

/// Immutable per-camera rectifier: lens plus homography plus canvas size.
#[derive(Clone, Debug)]
pub struct Rectifier {
    lens: Option<LensCalibration>,
    homography: Homography,
    size: u32,
}

impl Rectifier {
    pub fn new(lens: Option<LensCalibration>, homography: Homography, size: u32) -> Self {
        Self {
            lens,
            homography,
            size,
        }
    }

    /// Builds the rectifier for `profile`. A camera without source points gets
    /// an identity warp so frames still flow; the canvas is then the top-left
    /// corner of the raw frame.
    pub fn from_profile(
        profile: &CameraProfile,
        canonical: Option<&[Point2<f64>; 4]>,
        size: u32,
    ) -> Result<Self> {
        let homography = match (profile.source_points.as_ref(), canonical) {
            (Some(src), Some(dst)) => homography_from_4pt(src, dst)?,
            _ => {
                log::warn!(
                    "{}: no source/canonical points configured, frames are not perspective-corrected",
                    profile.id
                );
                Homography::identity()
            }
        };
        Ok(Self::new(profile.lens.clone(), homography, size))
    }

    pub fn homography(&self) -> &Homography {
        &self.homography
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn rectify(&self, frame: &RgbImage) -> Result<RgbImage> {
        let undistorted = undistort(frame, self.lens.as_ref());
        warp(&undistorted, &self.homography, self.size)
    }
}

/// Rectifier plus the optional perimeter crop. The crop rectangle is located
/// on the first rectified frame and reused for every later one.
#[derive(Clone, Debug)]
pub struct RectificationPipeline {
    rectifier: Rectifier,
    crop_enabled: bool,
    crop: Option<Option<(u32, u32, u32, u32)>>,
}

impl RectificationPipeline {
    pub fn new(rectifier: Rectifier, crop_to_perimeter: bool) -> Self {
        Self {
            rectifier,
            crop_enabled: crop_to_perimeter,
            crop: None,
        }
    }

    pub fn rectifier(&self) -> &Rectifier {
        &self.rectifier
    }

    /// Forgets the cached crop so the next frame locates the perimeter again.
    pub fn reset_crop(&mut self) {
        self.crop = None;
    }

    pub fn process(&mut self, frame: &RgbImage) -> Result<RgbImage> {
        let rectified = self.rectifier.rectify(frame)?;
        if !self.crop_enabled {
            return Ok(rectified);
        }

        let crop = *self.crop.get_or_insert_with(|| {
            match detect_outer_boundary(&rectified) {
                Ok(ellipse) => crop_rect(rectified.width(), rectified.height(), &ellipse),
                Err(e) => {
                    log::warn!("{e}; frames will not be cropped");
                    None
                }
            }
        });
        Ok(match crop {
            Some((x, y, w, h)) => image::imageops::crop_imm(&rectified, x, y, w, h).to_image(),
            None => rectified,
        })
    }
}
