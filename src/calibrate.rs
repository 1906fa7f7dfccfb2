//! Calibration module.
//! Offline, one-time per camera: scans a directory of checkerboard photos,
//! finds the interior corners in each, solves intrinsics + distortion and
//! writes the result to the calibration store.
//! Images that cannot be decoded or show no complete board are skipped with
//! a logged reason; at least five usable views are required.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::Point2;

use crate::camera::LensCalibration;
use crate::checkerboard::{find_corners, PatternSize};
use crate::error::{Result, VisionError};
use crate::lens_solve;
use crate::store::CalibrationStore;

pub const MIN_CALIBRATION_IMAGES: usize = 5;
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    Unreadable(String),
    CornersNotFound,
    SizeMismatch { expected: (u32, u32), found: (u32, u32) },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unreadable(e) => write!(f, "unreadable: {e}"),
            SkipReason::CornersNotFound => f.write_str("checkerboard corners not found"),
            SkipReason::SizeMismatch { expected, found } => write!(
                f,
                "size {}x{} differs from {}x{}",
                found.0, found.1, expected.0, expected.1
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CalibrationReport {
    pub lens: LensCalibration,
    /// RMS reprojection error in pixels. No pass/fail threshold is applied.
    pub rms_error: f64,
    pub per_view_errors: Vec<f64>,
    pub used_images: Vec<PathBuf>,
    pub skipped_images: Vec<(PathBuf, SkipReason)>,
    pub image_size: (u32, u32),
}

pub struct CalibrationEngine {
    store: Arc<dyn CalibrationStore>,
    /// Per-camera target; `None` writes the global calibration.
    camera: Option<String>,
}

impl CalibrationEngine {
    pub fn new(store: Arc<dyn CalibrationStore>) -> Self {
        Self {
            store,
            camera: None,
        }
    }

    pub fn for_camera(mut self, camera: impl Into<String>) -> Self {
        self.camera = Some(camera.into());
        self
    }

    /// Calibrates from every image in `dir` and persists the result.
    pub fn calibrate(&self, dir: &Path, pattern: PatternSize) -> Result<CalibrationReport> {
        let report = calibrate_directory(dir, pattern)?;
        self.store
            .save_lens(self.camera.as_deref(), &report.lens)
            .inspect_err(|e| log::warn!("calibration computed but not saved: {e}"))?;
        log::info!(
            "calibration saved ({} views, rms {:.3}px)",
            report.used_images.len(),
            report.rms_error
        );
        Ok(report)
    }
}

/// Image files in `dir` with a supported extension, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| VisionError::storage(dir, e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Detection and solve without touching the store.
pub fn calibrate_directory(dir: &Path, pattern: PatternSize) -> Result<CalibrationReport> {
    let files = list_images(dir)?;
    if files.len() < MIN_CALIBRATION_IMAGES {
        log::warn!(
            "{} images in {}, at least {MIN_CALIBRATION_IMAGES} required",
            files.len(),
            dir.display()
        );
        return Err(VisionError::CalibrationInsufficientData {
            found: files.len(),
            required: MIN_CALIBRATION_IMAGES,
        });
    }

    let mut image_size: Option<(u32, u32)> = None;
    let mut views: Vec<Vec<Point2<f64>>> = Vec::new();
    let mut used_images = Vec::new();
    let mut skipped_images = Vec::new();

    for path in files {
        match detect_view(&path, pattern, image_size) {
            Ok((size, corners)) => {
                log::debug!("{}: {} corners", path.display(), corners.len());
                image_size.get_or_insert(size);
                views.push(corners);
                used_images.push(path);
            }
            Err(reason) => {
                log::warn!("skipping {}: {reason}", path.display());
                skipped_images.push((path, reason));
            }
        }
    }

    let Some(image_size) = image_size.filter(|_| views.len() >= MIN_CALIBRATION_IMAGES) else {
        return Err(VisionError::CalibrationInsufficientData {
            found: views.len(),
            required: MIN_CALIBRATION_IMAGES,
        });
    };

    let solution = lens_solve::solve(&pattern.object_points(), &views, image_size)?;
    if !solution.converged {
        log::warn!("refinement stopped before convergence");
    }
    log::info!(
        "calibrated {:?} with rms {:.4}px",
        solution.lens.intrinsics,
        solution.rms_error
    );

    Ok(CalibrationReport {
        lens: solution.lens,
        rms_error: solution.rms_error,
        per_view_errors: solution.per_view_errors,
        used_images,
        skipped_images,
        image_size,
    })
}

fn detect_view(
    path: &Path,
    pattern: PatternSize,
    expected: Option<(u32, u32)>,
) -> std::result::Result<((u32, u32), Vec<Point2<f64>>), SkipReason> {
    let gray = image::open(path)
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?
        .to_luma8();
    let size = gray.dimensions();
    if let Some(expected) = expected.filter(|e| *e != size) {
        return Err(SkipReason::SizeMismatch {
            expected,
            found: size,
        });
    }
    let corners = find_corners(&gray, pattern).ok_or(SkipReason::CornersNotFound)?;
    Ok((size, corners))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkerboard::tests::render_board;
    use crate::store::JsonCalibrationStore;
    use image::{GrayImage, Luma};
    use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
    use nalgebra::{Matrix3, Rotation3, Vector3};
    use tempfile::tempdir;

    const SQ: u32 = 40;
    const MARGIN: u32 = 40;

    /// Renders the board as seen by a pinhole camera at `rotation`/`translation`.
    fn render_view(pattern: PatternSize, rotation: Vector3<f64>, translation: Vector3<f64>) -> GrayImage {
        let (board, _) = render_board(pattern, SQ, MARGIN);
        let k = Matrix3::new(760.0, 0.0, 320.0, 0.0, 760.0, 240.0, 0.0, 0.0, 1.0);
        let r = Rotation3::new(rotation);
        let m = r.matrix();
        let plane = k * Matrix3::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned(), translation]);
        // board pixel -> object units, corner (0, 0) at pixel MARGIN + SQ - 0.5
        let s = 1.0 / SQ as f64;
        let o = -((MARGIN + SQ) as f64 - 0.5) * s;
        let to_object = Matrix3::new(s, 0.0, o, 0.0, s, o, 0.0, 0.0, 1.0);
        let h = plane * to_object;

        let mut flat = [0f32; 9];
        for r in 0..3 {
            for c in 0..3 {
                flat[r * 3 + c] = h[(r, c)] as f32;
            }
        }
        let projection = Projection::from_matrix(flat).unwrap();
        let mut out = GrayImage::new(640, 480);
        warp_into(&board, &projection, Interpolation::Bilinear, Luma([235]), &mut out);
        out
    }

    #[test]
    fn too_few_images_is_insufficient_data() {
        let dir = tempdir().unwrap();
        let (board, _) = render_board(PatternSize::default(), 20, 30);
        for i in 0..3 {
            board.save(dir.path().join(format!("board{i}.png"))).unwrap();
        }
        match calibrate_directory(dir.path(), PatternSize::default()) {
            Err(VisionError::CalibrationInsufficientData { found, required }) => {
                assert_eq!((found, required), (3, 5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unusable_images_count_against_minimum() {
        let dir = tempdir().unwrap();
        let (board, _) = render_board(PatternSize::default(), 20, 30);
        for i in 0..3 {
            board.save(dir.path().join(format!("a{i}.png"))).unwrap();
        }
        GrayImage::from_pixel(200, 150, Luma([128]))
            .save(dir.path().join("blank.png"))
            .unwrap();
        fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        match calibrate_directory(dir.path(), PatternSize::default()) {
            Err(VisionError::CalibrationInsufficientData { found, .. }) => assert_eq!(found, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn image_filter_is_case_insensitive() {
        let dir = tempdir().unwrap();
        for name in ["b.JPG", "a.png", "c.jpeg", "d.bmp"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<_> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.png", "b.JPG", "c.jpeg"]);
    }

    #[test]
    fn calibrates_rendered_views_and_saves() {
        let pattern = PatternSize::new(5, 7);
        let poses = [
            (Vector3::new(0.2, -0.1, 0.0), Vector3::new(-3.0, -2.0, 14.0)),
            (Vector3::new(-0.2, 0.2, 0.05), Vector3::new(-3.5, -2.0, 13.0)),
            (Vector3::new(0.1, 0.25, -0.05), Vector3::new(-2.5, -2.5, 15.0)),
            (Vector3::new(-0.25, -0.15, 0.1), Vector3::new(-3.0, -1.5, 14.0)),
            (Vector3::new(0.15, -0.25, -0.1), Vector3::new(-3.5, -2.5, 13.5)),
            (Vector3::new(0.25, 0.1, 0.05), Vector3::new(-3.0, -2.0, 12.5)),
        ];
        let dir = tempdir().unwrap();
        for (i, (r, t)) in poses.iter().enumerate() {
            render_view(pattern, *r, *t)
                .save(dir.path().join(format!("view{i}.png")))
                .unwrap();
        }

        let settings = dir.path().join("appsettings.json");
        let store = Arc::new(JsonCalibrationStore::open(&settings).unwrap());
        let engine = CalibrationEngine::new(store.clone()).for_camera("Camera1");
        let report = engine.calibrate(dir.path(), pattern).unwrap();

        assert_eq!(report.used_images.len(), 6);
        assert_eq!(report.image_size, (640, 480));
        let k = report.lens.intrinsics;
        assert!((k.fx - 760.0).abs() < 40.0, "fx {}", k.fx);
        assert!((k.fy - 760.0).abs() < 40.0, "fy {}", k.fy);
        assert!(report.rms_error < 1.0, "rms {}", report.rms_error);

        let reopened = JsonCalibrationStore::open(&settings).unwrap();
        let profile = reopened.camera_profile("Camera1").unwrap();
        assert_eq!(profile.lens.map(|l| l.intrinsics), Some(k));
    }
}
