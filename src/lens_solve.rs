//! Multi-view planar calibration solve.
//!
//! Per-view DLT homographies feed Zhang's closed-form intrinsics, each view's
//! pose is decomposed from its homography, a linear fit seeds the distortion,
//! and Levenberg-Marquardt refines everything jointly on reprojection error.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{
    storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point2, Rotation3, SVector, UnitQuaternion,
    Vector2, Vector3,
};

use crate::camera::{Distortion, Intrinsics, LensCalibration};
use crate::error::{Result, VisionError};
use crate::homography::estimate_homography;

/// Intrinsics (fx, fy, cx, cy) then distortion (k1, k2, p1, p2).
const CAMERA_PARAMS: usize = 8;
const POSE_PARAMS: usize = 6;

#[derive(Clone, Debug)]
pub struct LensSolution {
    pub lens: LensCalibration,
    /// Root-mean-square reprojection error over all points, in pixels.
    pub rms_error: f64,
    pub per_view_errors: Vec<f64>,
    pub converged: bool,
}

#[derive(Clone, Copy, Debug)]
struct Pose {
    rotation: Vector3<f64>,
    translation: Vector3<f64>,
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang's closed-form intrinsics from plane homographies.
pub fn zhang_intrinsics(homographies: &[Matrix3<f64>]) -> Result<Intrinsics> {
    if homographies.len() < 3 {
        return Err(VisionError::Numerical(
            "need at least 3 homographies for intrinsics".to_string(),
        ));
    }
    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| VisionError::Numerical("intrinsics SVD failed".to_string()))?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &s)| if s < acc.1 { (i, s) } else { acc });
    let b = v_t.row(idx);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    if denom_norm <= 0.0 || denom.abs() / denom_norm < 1e-9 {
        return Err(VisionError::Numerical(
            "degenerate views for intrinsics (boards nearly parallel?)".to_string(),
        ));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha2 = lambda / b11;
    let beta2 = lambda * b11 / denom;
    if alpha2 <= 0.0 || beta2 <= 0.0 {
        return Err(VisionError::Numerical(
            "intrinsics solution has imaginary focal length".to_string(),
        ));
    }
    let alpha = alpha2.sqrt();
    let beta = beta2.sqrt();
    let gamma = -b12 * alpha2 * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha2 / lambda;

    Ok(Intrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
        skew: gamma,
    })
}

/// Pose of the `Z = 0` board in camera coordinates from `H ~ K [r1 r2 t]`.
fn planar_pose(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let k_inv = k.try_inverse()?;
    let h1 = k_inv * h.column(0);
    let h2 = k_inv * h.column(1);
    let h3 = k_inv * h.column(2);

    let mut lambda = 2.0 / (h1.norm() + h2.norm());
    // board in front of the camera
    if (lambda * h3).z < 0.0 {
        lambda = -lambda;
    }
    let r1 = lambda * h1;
    let r2 = lambda * h2;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // nearest rotation
    let svd = r.svd(true, true);
    let (mut u, v_t) = (svd.u?, svd.v_t?);
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    let rot = Rotation3::from_matrix_unchecked(u * v_t);
    Some(Pose {
        rotation: UnitQuaternion::from_rotation_matrix(&rot).scaled_axis(),
        translation: lambda * h3,
    })
}

fn project(
    k: &Intrinsics,
    d: &[f64; 4],
    pose: &Pose,
    obj: Point2<f64>,
) -> Option<Point2<f64>> {
    let rot = Rotation3::new(pose.rotation);
    let pc = rot * Vector3::new(obj.x, obj.y, 0.0) + pose.translation;
    if pc.z <= 1e-9 {
        return None;
    }
    let (x, y) = (pc.x / pc.z, pc.y / pc.z);
    let [k1, k2, p1, p2] = *d;
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
    Some(k.project(Vector2::new(xd, yd)))
}

/// Linear least squares for (k1, k2, p1, p2) given intrinsics and poses.
fn fit_distortion(
    k: &Intrinsics,
    poses: &[Pose],
    object: &[Point2<f64>],
    views: &[Vec<Point2<f64>>],
) -> [f64; 4] {
    let rows = 2 * views.iter().map(Vec::len).sum::<usize>();
    let mut a = DMatrix::<f64>::zeros(rows, 4);
    let mut b = DVector::<f64>::zeros(rows);
    let mut row = 0;
    for (pose, observed) in poses.iter().zip(views) {
        let rot = Rotation3::new(pose.rotation);
        for (obj, obs) in object.iter().zip(observed) {
            let pc = rot * Vector3::new(obj.x, obj.y, 0.0) + pose.translation;
            let (x, y) = (pc.x / pc.z, pc.y / pc.z);
            let n_obs = k.unproject(*obs);
            let r2 = x * x + y * y;
            a.row_mut(row)
                .copy_from_slice(&[x * r2, x * r2 * r2, 2.0 * x * y, r2 + 2.0 * x * x]);
            b[row] = n_obs.x - x;
            a.row_mut(row + 1)
                .copy_from_slice(&[y * r2, y * r2 * r2, r2 + 2.0 * y * y, 2.0 * x * y]);
            b[row + 1] = n_obs.y - y;
            row += 2;
        }
    }
    match a.svd(true, true).solve(&b, 1e-12) {
        Ok(x) if x.iter().all(|v| v.is_finite()) => [x[0], x[1], x[2], x[3]],
        _ => [0.0; 4],
    }
}

struct ReprojectionProblem<'a> {
    object: &'a [Point2<f64>],
    views: &'a [Vec<Point2<f64>>],
    params: DVector<f64>,
}

impl ReprojectionProblem<'_> {
    fn unpack(x: &DVector<f64>) -> (Intrinsics, [f64; 4]) {
        (
            Intrinsics {
                fx: x[0],
                fy: x[1],
                cx: x[2],
                cy: x[3],
                skew: 0.0,
            },
            [x[4], x[5], x[6], x[7]],
        )
    }

    fn pose(x: &DVector<f64>, view: usize) -> Pose {
        let o = CAMERA_PARAMS + POSE_PARAMS * view;
        Pose {
            rotation: Vector3::new(x[o], x[o + 1], x[o + 2]),
            translation: Vector3::new(x[o + 3], x[o + 4], x[o + 5]),
        }
    }

    fn view_residuals(&self, x: &DVector<f64>, view: usize, out: &mut [f64]) {
        let (k, d) = Self::unpack(x);
        let pose = Self::pose(x, view);
        for (i, (obj, obs)) in self.object.iter().zip(&self.views[view]).enumerate() {
            // a point behind the camera gets a large constant penalty
            let (ex, ey) = match project(&k, &d, &pose, *obj) {
                Some(p) => (p.x - obs.x, p.y - obs.y),
                None => (1e6, 1e6),
            };
            out[2 * i] = ex;
            out[2 * i + 1] = ey;
        }
    }

    fn residuals_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let per_view = 2 * self.object.len();
        let mut r = DVector::zeros(per_view * self.views.len());
        for v in 0..self.views.len() {
            let block = &mut r.as_mut_slice()[v * per_view..(v + 1) * per_view];
            self.view_residuals(x, v, block);
        }
        r
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for ReprojectionProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    /// Central differences. Pose columns only touch their own view's rows.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let per_view = 2 * self.object.len();
        let n_res = per_view * self.views.len();
        let mut jac = DMatrix::zeros(n_res, self.params.len());
        let mut x = self.params.clone();
        let mut plus = vec![0.0; per_view];
        let mut minus = vec![0.0; per_view];

        for col in 0..self.params.len() {
            let orig = x[col];
            let h = 1e-6 * orig.abs().max(1.0);
            if col < CAMERA_PARAMS {
                x[col] = orig + h;
                let rp = self.residuals_at(&x);
                x[col] = orig - h;
                let rm = self.residuals_at(&x);
                for row in 0..n_res {
                    jac[(row, col)] = (rp[row] - rm[row]) / (2.0 * h);
                }
            } else {
                let view = (col - CAMERA_PARAMS) / POSE_PARAMS;
                x[col] = orig + h;
                self.view_residuals(&x, view, &mut plus);
                x[col] = orig - h;
                self.view_residuals(&x, view, &mut minus);
                for i in 0..per_view {
                    jac[(view * per_view + i, col)] = (plus[i] - minus[i]) / (2.0 * h);
                }
            }
            x[col] = orig;
        }
        Some(jac)
    }
}

/// Calibrates from per-view image points of the same planar `object` grid.
pub fn solve(
    object: &[Point2<f64>],
    views: &[Vec<Point2<f64>>],
    image_size: (u32, u32),
) -> Result<LensSolution> {
    if views.is_empty() || views.iter().any(|v| v.len() != object.len()) {
        return Err(VisionError::Numerical(
            "every view must observe the full grid".to_string(),
        ));
    }

    let homographies = views
        .iter()
        .map(|img| estimate_homography(object, img).map(|h| h.h))
        .collect::<Result<Vec<_>>>()?;

    let k0 = match zhang_intrinsics(&homographies) {
        Ok(k) if k.fx.is_finite() && k.fy.is_finite() => Intrinsics { skew: 0.0, ..k },
        _ => {
            let f = image_size.0.max(image_size.1) as f64;
            log::warn!("closed-form intrinsics failed, starting from f = {f}");
            Intrinsics {
                fx: f,
                fy: f,
                cx: image_size.0 as f64 / 2.0,
                cy: image_size.1 as f64 / 2.0,
                skew: 0.0,
            }
        }
    };
    log::debug!("initial intrinsics {k0:?}");

    let kmat = k0.matrix();
    let poses = homographies
        .iter()
        .map(|h| planar_pose(&kmat, h))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| VisionError::Numerical("pose decomposition failed".to_string()))?;
    let d0 = fit_distortion(&k0, &poses, object, views);
    log::debug!("initial distortion {d0:?}");

    let mut x0 = DVector::zeros(CAMERA_PARAMS + POSE_PARAMS * views.len());
    x0.as_mut_slice()[..CAMERA_PARAMS]
        .copy_from_slice(&[k0.fx, k0.fy, k0.cx, k0.cy, d0[0], d0[1], d0[2], d0[3]]);
    for (v, pose) in poses.iter().enumerate() {
        let o = CAMERA_PARAMS + POSE_PARAMS * v;
        x0.as_mut_slice()[o..o + 3].copy_from_slice(pose.rotation.as_slice());
        x0.as_mut_slice()[o + 3..o + 6].copy_from_slice(pose.translation.as_slice());
    }

    let problem = ReprojectionProblem {
        object,
        views,
        params: x0,
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(1e-12)
        .with_xtol(1e-12)
        .with_gtol(1e-12)
        .with_patience(100)
        .minimize(problem);
    let converged = report.termination.was_successful();
    log::debug!(
        "LM finished after {} evaluations, cost {:.6e}, {:?}",
        report.number_of_evaluations,
        report.objective_function,
        report.termination
    );

    let x = problem.params();
    let residuals = problem.residuals_at(&x);
    let per_view = 2 * object.len();
    let per_view_errors: Vec<f64> = residuals
        .as_slice()
        .chunks(per_view)
        .map(|c| (c.iter().map(|r| r * r).sum::<f64>() / object.len() as f64).sqrt())
        .collect();
    let total_points = (object.len() * views.len()) as f64;
    let rms_error = (residuals.norm_squared() / total_points).sqrt();
    if !rms_error.is_finite() {
        return Err(VisionError::Numerical("calibration diverged".to_string()));
    }

    let (k, d) = ReprojectionProblem::unpack(&x);
    Ok(LensSolution {
        lens: LensCalibration {
            intrinsics: k,
            distortion: Distortion::new(vec![d[0], d[1], d[2], d[3], 0.0])?,
        },
        rms_error,
        per_view_errors,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth_lens() -> (Intrinsics, [f64; 4]) {
        (
            Intrinsics {
                fx: 820.0,
                fy: 805.0,
                cx: 322.0,
                cy: 241.0,
                skew: 0.0,
            },
            [-0.18, 0.04, 0.0008, -0.0005],
        )
    }

    fn synthetic_views(object: &[Point2<f64>]) -> Vec<Vec<Point2<f64>>> {
        let (k, d) = truth_lens();
        let poses = [
            (Vector3::new(0.25, -0.1, 0.05), Vector3::new(-4.5, -3.0, 22.0)),
            (Vector3::new(-0.2, 0.3, -0.1), Vector3::new(-5.0, -2.5, 20.0)),
            (Vector3::new(0.1, 0.35, 0.2), Vector3::new(-3.5, -4.0, 24.0)),
            (Vector3::new(-0.3, -0.2, 0.0), Vector3::new(-4.0, -3.5, 21.0)),
            (Vector3::new(0.05, -0.3, -0.25), Vector3::new(-5.5, -2.0, 23.0)),
            (Vector3::new(0.35, 0.15, 0.1), Vector3::new(-4.5, -3.0, 19.0)),
        ];
        poses
            .iter()
            .map(|(r, t)| {
                let pose = Pose {
                    rotation: *r,
                    translation: *t,
                };
                object
                    .iter()
                    .map(|o| project(&k, &d, &pose, *o).unwrap())
                    .collect()
            })
            .collect()
    }

    fn grid() -> Vec<Point2<f64>> {
        (0..7)
            .flat_map(|i| (0..10).map(move |j| Point2::new(j as f64, i as f64)))
            .collect()
    }

    #[test]
    fn zhang_recovers_intrinsics_without_distortion() {
        let k = Intrinsics {
            fx: 900.0,
            fy: 880.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        };
        let hs: Vec<Matrix3<f64>> = [
            (Vector3::new(0.1, 0.0, 0.05), Vector3::new(0.1, -0.05, 1.0)),
            (Vector3::new(-0.05, 0.15, -0.1), Vector3::new(-0.05, 0.1, 1.2)),
            (Vector3::new(0.2, -0.1, 0.0), Vector3::new(0.0, 0.0, 0.9)),
        ]
        .iter()
        .map(|(r, t)| {
            let rot = Rotation3::new(*r);
            let m = rot.matrix();
            k.matrix() * Matrix3::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned(), *t])
        })
        .collect();

        let est = zhang_intrinsics(&hs).unwrap();
        assert!((est.fx - 900.0).abs() < 1.0, "fx {}", est.fx);
        assert!((est.fy - 880.0).abs() < 1.0, "fy {}", est.fy);
        assert!((est.cx - 640.0).abs() < 1.0, "cx {}", est.cx);
        assert!((est.cy - 360.0).abs() < 1.0, "cy {}", est.cy);
    }

    #[test]
    fn full_solve_recovers_lens() {
        let object = grid();
        let views = synthetic_views(&object);
        let sol = solve(&object, &views, (640, 480)).unwrap();

        let (k, d) = truth_lens();
        let est = sol.lens.intrinsics;
        assert!((est.fx - k.fx).abs() / k.fx < 0.01, "fx {}", est.fx);
        assert!((est.fy - k.fy).abs() / k.fy < 0.01, "fy {}", est.fy);
        assert!((est.cx - k.cx).abs() < 3.0, "cx {}", est.cx);
        assert!((est.cy - k.cy).abs() < 3.0, "cy {}", est.cy);
        let c = sol.lens.distortion.coefficients();
        assert_eq!(c.len(), 5);
        assert!((c[0] - d[0]).abs() < 0.02, "k1 {}", c[0]);
        assert!(sol.rms_error < 1e-3, "rms {}", sol.rms_error);
        assert_eq!(sol.per_view_errors.len(), views.len());
    }

    #[test]
    fn partial_views_are_rejected() {
        let object = grid();
        let mut views = synthetic_views(&object);
        views[2].pop();
        assert!(solve(&object, &views, (640, 480)).is_err());
    }
}
