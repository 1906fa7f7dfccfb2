//! Calibration store: the one place lens calibration, per-camera source points
//! and the canonical reference square are read from and written to.
//! Loaded once at start-up and handed to the calibration engine, the
//! rectifier setup and the change-detection engine.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nalgebra::Point2;

use crate::camera::{CameraProfile, LensCalibration};
use crate::config::{load_settings, save_settings, AppSettings, DetectionSettings, PointData};
use crate::error::{Result, VisionError};

pub trait CalibrationStore: Send + Sync {
    fn camera_profile(&self, camera: &str) -> Result<CameraProfile>;
    fn canonical_points(&self) -> Result<Option<[Point2<f64>; 4]>>;
    /// Side length of the canonical canvas in pixels.
    fn canvas_size(&self) -> u32;
    fn detection(&self) -> DetectionSettings;

    fn save_lens(&self, camera: Option<&str>, lens: &LensCalibration) -> Result<()>;
    fn save_source_points(&self, camera: &str, points: &[Point2<f64>; 4]) -> Result<()>;
    fn save_canonical_points(&self, points: &[Point2<f64>; 4]) -> Result<()>;
    /// Drops the canonical square and every camera's source points.
    fn clear_points(&self) -> Result<()>;
}

/// JSON-file backed store. Every mutation is written through immediately; if
/// the write fails the in-memory copy still holds the new values.
#[derive(Debug)]
pub struct JsonCalibrationStore {
    path: PathBuf,
    settings: Mutex<AppSettings>,
}

impl JsonCalibrationStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = load_settings(&path)?;
        Ok(Self {
            path,
            settings: Mutex::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> AppSettings {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AppSettings> {
        // A poisoned lock only means another thread panicked mid-update; the
        // document itself is plain data.
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut AppSettings)) -> Result<()> {
        let mut guard = self.lock();
        f(&mut guard);
        save_settings(&self.path, &guard).inspect_err(|e| {
            log::warn!("settings write failed, keeping in-memory values: {e}");
        })
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn camera_profile(&self, camera: &str) -> Result<CameraProfile> {
        self.lock().camera_profile(camera)
    }

    fn canonical_points(&self) -> Result<Option<[Point2<f64>; 4]>> {
        self.lock().canonical_points()
    }

    fn canvas_size(&self) -> u32 {
        self.lock().polar_graph_base_size
    }

    fn detection(&self) -> DetectionSettings {
        self.lock().detection.clone()
    }

    fn save_lens(&self, camera: Option<&str>, lens: &LensCalibration) -> Result<()> {
        if lens.distortion.coefficients().is_empty() {
            return Err(VisionError::InvalidSettings(
                "refusing to save empty calibration".to_string(),
            ));
        }
        self.update(|s| match camera {
            Some(name) => {
                let cam = s.camera_mut_or_insert(name);
                cam.camera_matrix = Some(lens.intrinsics.to_rows());
                cam.dist_coeffs = Some(lens.distortion.coefficients().to_vec());
            }
            None => s.set_global_lens(lens),
        })
    }

    fn save_source_points(&self, camera: &str, points: &[Point2<f64>; 4]) -> Result<()> {
        self.update(|s| {
            s.camera_mut_or_insert(camera).transformation_points =
                points.iter().map(|&p| PointData::from(p)).collect();
        })
    }

    fn save_canonical_points(&self, points: &[Point2<f64>; 4]) -> Result<()> {
        self.update(|s| {
            s.polar_graph_points = points.iter().map(|&p| PointData::from(p)).collect();
        })
    }

    fn clear_points(&self) -> Result<()> {
        self.update(|s| {
            s.polar_graph_points.clear();
            for cam in &mut s.cameras {
                cam.transformation_points.clear();
            }
        })
    }
}
