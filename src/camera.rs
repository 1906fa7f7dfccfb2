//! Camera model: pinhole intrinsics, lens distortion and the per-camera profile
//! the rest of the pipeline consumes.

use nalgebra::{Matrix3, Point2, Vector2};

use crate::error::{Result, VisionError};

/// Pinhole intrinsics (focal lengths, principal point, skew) in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub skew: f64,
}

impl Intrinsics {
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
            return Err(VisionError::InvalidSettings(
                "CameraMatrix must be a 3x3 nested array".to_string(),
            ));
        }
        let k = Self {
            fx: rows[0][0],
            fy: rows[1][1],
            cx: rows[0][2],
            cy: rows[1][2],
            skew: rows[0][1],
        };
        if k.fx.abs() < f64::EPSILON || k.fy.abs() < f64::EPSILON {
            return Err(VisionError::InvalidSettings(
                "CameraMatrix has a zero focal length".to_string(),
            ));
        }
        Ok(k)
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        let m = self.matrix();
        (0..3).map(|r| (0..3).map(|c| m[(r, c)]).collect()).collect()
    }

    /// Pixel -> normalized image plane.
    #[inline]
    pub fn unproject(&self, p: Point2<f64>) -> Vector2<f64> {
        let y = (p.y - self.cy) / self.fy;
        let x = (p.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }

    /// Normalized image plane -> pixel.
    #[inline]
    pub fn project(&self, n: Vector2<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * n.x + self.skew * n.y + self.cx,
            self.fy * n.y + self.cy,
        )
    }
}

/// Brown-Conrady lens distortion in OpenCV coefficient order
/// `k1, k2, p1, p2[, k3[, k4, k5, k6]]`. When any of k4..k6 is non-zero the
/// radial term is the rational model.
#[derive(Clone, Debug, PartialEq)]
pub struct Distortion {
    coefficients: Vec<f64>,
}

impl Distortion {
    pub const MIN_COEFFICIENTS: usize = 4;
    pub const MAX_COEFFICIENTS: usize = 8;

    pub fn new(coefficients: Vec<f64>) -> Result<Self> {
        let n = coefficients.len();
        if !(Self::MIN_COEFFICIENTS..=Self::MAX_COEFFICIENTS).contains(&n) {
            return Err(VisionError::InvalidSettings(format!(
                "DistCoeffs must hold 4 to 8 values, got {n}"
            )));
        }
        Ok(Self { coefficients })
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    #[inline]
    fn coeff(&self, i: usize) -> f64 {
        self.coefficients.get(i).copied().unwrap_or(0.0)
    }

    pub fn is_identity(&self) -> bool {
        self.coefficients.iter().all(|c| *c == 0.0)
    }

    /// Applies distortion to an undistorted normalized point.
    pub fn distort(&self, n: Vector2<f64>) -> Vector2<f64> {
        let (k1, k2, p1, p2, k3) = (
            self.coeff(0),
            self.coeff(1),
            self.coeff(2),
            self.coeff(3),
            self.coeff(4),
        );
        let (k4, k5, k6) = (self.coeff(5), self.coeff(6), self.coeff(7));

        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let numerator = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        let denominator = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
        let radial = if denominator.abs() > 1e-12 {
            numerator / denominator
        } else {
            numerator
        };

        let xy = x * y;
        let x_tan = 2.0 * p1 * xy + p2 * (r2 + 2.0 * x * x);
        let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * xy;

        Vector2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Fixed-point inversion of [`Distortion::distort`].
    pub fn undistort(&self, n_dist: Vector2<f64>, iters: u32) -> Vector2<f64> {
        let mut n = n_dist;
        for _ in 0..iters.max(1) {
            let d = self.distort(n);
            n -= d - n_dist;
        }
        n
    }
}

/// Intrinsics and distortion always travel together; a profile either has
/// both or neither.
#[derive(Clone, Debug, PartialEq)]
pub struct LensCalibration {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
}

impl LensCalibration {
    /// Builds a calibration from the persisted document shape. Both parts must
    /// be present or both absent.
    pub fn from_parts(
        matrix: Option<&[Vec<f64>]>,
        coefficients: Option<&[f64]>,
    ) -> Result<Option<Self>> {
        match (matrix, coefficients) {
            (None, None) => Ok(None),
            (Some(m), Some(d)) => Ok(Some(Self {
                intrinsics: Intrinsics::from_rows(m)?,
                distortion: Distortion::new(d.to_vec())?,
            })),
            _ => Err(VisionError::InvalidSettings(
                "CameraMatrix and DistCoeffs must be set together".to_string(),
            )),
        }
    }
}

/// Everything the rectifier needs to know about one physical camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraProfile {
    pub id: String,
    pub lens: Option<LensCalibration>,
    /// Board corners in raw pixel space, clockwise from top-left.
    pub source_points: Option<[Point2<f64>; 4]>,
}

impl CameraProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            lens: None,
            source_points: None,
        }
    }

    pub fn with_lens(mut self, lens: LensCalibration) -> Self {
        self.lens = Some(lens);
        self
    }

    pub fn with_source_points(mut self, points: [Point2<f64>; 4]) -> Self {
        self.source_points = Some(points);
        self
    }
}

/// Accepts an empty list or exactly four points.
pub fn quad_from_slice(points: &[Point2<f64>]) -> Result<Option<[Point2<f64>; 4]>> {
    match points.len() {
        0 => Ok(None),
        4 => Ok(Some([points[0], points[1], points[2], points[3]])),
        n => Err(VisionError::point_count(4, n)),
    }
}
