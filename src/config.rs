//! Config module.
//! Manages I/O for appsettings.json (camera points, polar-grid reference,
//! lens calibration, detection thresholds).
//! Uses serde for JSON serialization; key names are PascalCase to stay
//! compatible with documents written by the desktop calibration tool.
//! A missing file loads as defaults.

use std::fs;
use std::path::Path;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::camera::{quad_from_slice, CameraProfile, LensCalibration};
use crate::error::{Result, VisionError};

pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PointData {
    pub x: f32,
    pub y: f32,
}

impl From<PointData> for Point2<f64> {
    fn from(p: PointData) -> Self {
        Point2::new(p.x as f64, p.y as f64)
    }
}

impl From<Point2<f64>> for PointData {
    fn from(p: Point2<f64>) -> Self {
        PointData {
            x: p.x as f32,
            y: p.y as f32,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CameraSettings {
    pub camera_name: String,
    #[serde(default)]
    pub transformation_points: Vec<PointData>,
    /// Per-camera override of the global lens calibration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_matrix: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_coeffs: Option<Vec<f64>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DetectionSettings {
    /// Percent of differing pixels the camera mean must exceed.
    pub global_threshold: f64,
    /// Per-camera thresholds; a missing entry falls back to `global_threshold`.
    pub camera_thresholds: Vec<f64>,
    pub sample_window_ms: u64,
    pub sample_interval_ms: u64,
    pub loop_interval_ms: u64,
    pub camera_stagger_ms: u64,
    pub max_cameras: usize,
    /// Intensity step (0-255) below which a pixel counts as unchanged.
    pub pixel_threshold: u8,
    pub crop_to_perimeter: bool,
    pub output_directory: String,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            global_threshold: 5.0,
            camera_thresholds: Vec::new(),
            sample_window_ms: 500,
            sample_interval_ms: 100,
            loop_interval_ms: 10,
            camera_stagger_ms: 50,
            max_cameras: 4,
            pixel_threshold: 25,
            crop_to_perimeter: true,
            output_directory: "CapturedImages".to_string(),
        }
    }
}

impl DetectionSettings {
    pub fn threshold_for(&self, camera_index: usize) -> f64 {
        self.camera_thresholds
            .get(camera_index)
            .copied()
            .unwrap_or(self.global_threshold)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClassifierSettings {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppSettings {
    pub polar_graph_image_path: String,
    pub polar_graph_default_zoom: f64,
    pub polar_graph_base_size: u32,
    /// Destination square in canonical board space (TL, TR, BR, BL).
    pub polar_graph_points: Vec<PointData>,
    pub cameras: Vec<CameraSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_matrix: Option<Vec<Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_coeffs: Option<Vec<f64>>,
    pub detection: DetectionSettings,
    pub classifier: ClassifierSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            polar_graph_image_path: "Polar_Graph_Paper.png".to_string(),
            polar_graph_default_zoom: 1.0,
            polar_graph_base_size: 400,
            polar_graph_points: Vec::new(),
            cameras: Vec::new(),
            camera_matrix: None,
            dist_coeffs: None,
            detection: DetectionSettings::default(),
            classifier: ClassifierSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn camera(&self, name: &str) -> Option<&CameraSettings> {
        self.cameras.iter().find(|c| c.camera_name == name)
    }

    pub fn camera_mut_or_insert(&mut self, name: &str) -> &mut CameraSettings {
        let idx = match self.cameras.iter().position(|c| c.camera_name == name) {
            Some(idx) => idx,
            None => {
                self.cameras.push(CameraSettings {
                    camera_name: name.to_string(),
                    ..Default::default()
                });
                self.cameras.len() - 1
            }
        };
        &mut self.cameras[idx]
    }

    pub fn global_lens(&self) -> Result<Option<LensCalibration>> {
        LensCalibration::from_parts(self.camera_matrix.as_deref(), self.dist_coeffs.as_deref())
    }

    pub fn set_global_lens(&mut self, lens: &LensCalibration) {
        self.camera_matrix = Some(lens.intrinsics.to_rows());
        self.dist_coeffs = Some(lens.distortion.coefficients().to_vec());
    }

    pub fn canonical_points(&self) -> Result<Option<[Point2<f64>; 4]>> {
        let pts: Vec<Point2<f64>> = self.polar_graph_points.iter().map(|&p| p.into()).collect();
        quad_from_slice(&pts)
    }

    /// Resolves the profile for `name`: per-camera lens overrides the global one.
    /// A camera without an entry gets the global lens and no source points.
    pub fn camera_profile(&self, name: &str) -> Result<CameraProfile> {
        let mut profile = CameraProfile::new(name);
        let entry = self.camera(name);

        let lens = match entry {
            Some(c) => LensCalibration::from_parts(c.camera_matrix.as_deref(), c.dist_coeffs.as_deref())?,
            None => None,
        };
        profile.lens = match lens {
            Some(lens) => Some(lens),
            None => self.global_lens()?,
        };

        if let Some(c) = entry {
            let pts: Vec<Point2<f64>> = c.transformation_points.iter().map(|&p| p.into()).collect();
            profile.source_points = quad_from_slice(&pts)?;
        }
        Ok(profile)
    }

    /// Checks the point-count invariants of every list in the document.
    pub fn validate(&self) -> Result<()> {
        self.canonical_points()?;
        self.global_lens()?;
        for c in &self.cameras {
            self.camera_profile(&c.camera_name)?;
        }
        if self.polar_graph_base_size == 0 {
            return Err(VisionError::InvalidSettings(
                "PolarGraphBaseSize must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads settings; a missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        log::info!("{} not found, using default settings", path.display());
        return Ok(AppSettings::default());
    }
    let json = fs::read_to_string(path).map_err(|e| VisionError::storage(path, e))?;
    let settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| VisionError::storage(dir, e))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).map_err(|e| VisionError::storage(path, e))?;
    Ok(())
}
