//! Baseline references.
//! In-memory running/calibrated baselines per camera plus the on-disk
//! repository for baseline files and confirmed captures.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{ImageError, RgbImage};

use crate::error::{Result, VisionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BaselineKind {
    Running,
    Calibrated,
}

impl BaselineKind {
    /// Directory and file-name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            BaselineKind::Running => "Baseline",
            BaselineKind::Calibrated => "CalibratedBaseline",
        }
    }
}

/// The two references one camera is compared against. Replacing a reference
/// swaps the `Arc`, so readers holding the old one keep a complete image.
#[derive(Clone, Debug, Default)]
pub struct CameraBaselines {
    running: Option<Arc<RgbImage>>,
    calibrated: Option<Arc<RgbImage>>,
}

impl CameraBaselines {
    pub fn get(&self, kind: BaselineKind) -> Option<Arc<RgbImage>> {
        match kind {
            BaselineKind::Running => self.running.clone(),
            BaselineKind::Calibrated => self.calibrated.clone(),
        }
    }

    pub fn replace(&mut self, kind: BaselineKind, frame: Arc<RgbImage>) {
        match kind {
            BaselineKind::Running => self.running = Some(frame),
            BaselineKind::Calibrated => self.calibrated = Some(frame),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_none() && self.calibrated.is_none()
    }
}

/// Files under the output directory:
/// `Baseline/Baseline_Camera{n}_{unique}.png`,
/// `CalibratedBaseline/CalibratedBaseline_Camera{n}_{unique}.png` and
/// `{category}/{name}_Camera{n}_{unique}.png` for confirmed saves.
#[derive(Debug)]
pub struct BaselineRepository {
    root: PathBuf,
    counter: AtomicU64,
}

impl BaselineRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the current baseline for camera `n` (1-based), deleting the
    /// previous file of the same kind first.
    pub fn persist(&self, kind: BaselineKind, camera: usize, frame: &RgbImage) -> Result<PathBuf> {
        let dir = self.root.join(kind.prefix());
        fs::create_dir_all(&dir).map_err(|e| VisionError::storage(&dir, e))?;

        let stem = format!("{}_Camera{camera}_", kind.prefix());
        for old in fs::read_dir(&dir).map_err(|e| VisionError::storage(&dir, e))? {
            let old = old.map_err(|e| VisionError::storage(&dir, e))?.path();
            let matches = old
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&stem));
            if matches {
                fs::remove_file(&old).map_err(|e| VisionError::storage(&old, e))?;
            }
        }

        let path = dir.join(format!("{stem}{}.png", self.unique()));
        save_png(frame, &path)?;
        log::debug!("camera {camera}: {} written to {}", kind.prefix(), path.display());
        Ok(path)
    }

    /// Writes a confirmed capture for camera `n` (1-based) into `category`.
    pub fn save_capture(&self, name: &str, category: &str, camera: usize, frame: &RgbImage) -> Result<PathBuf> {
        let dir = self.root.join(category);
        fs::create_dir_all(&dir).map_err(|e| VisionError::storage(&dir, e))?;
        let path = dir.join(format!("{name}_Camera{camera}_{}.png", self.unique()));
        save_png(frame, &path)?;
        Ok(path)
    }

    /// Milliseconds since the epoch plus a process-wide sequence number.
    fn unique(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{millis}_{seq:04}")
    }
}

fn save_png(frame: &RgbImage, path: &Path) -> Result<()> {
    frame.save(path).map_err(|e| match e {
        ImageError::IoError(io) => VisionError::storage(path, io),
        other => other.into(),
    })
}

/// Default capture category for the `n`th confirmed save of a cycle.
pub fn category_for(save_count: u8) -> &'static str {
    match save_count {
        0 | 1 => "1Dart",
        2 => "2Darts",
        _ => "3Darts",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn persist_keeps_one_file_per_camera_and_kind() {
        let tmp = tempdir().unwrap();
        let repo = BaselineRepository::new(tmp.path());
        let frame = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));

        repo.persist(BaselineKind::Running, 1, &frame).unwrap();
        let latest = repo.persist(BaselineKind::Running, 1, &frame).unwrap();
        repo.persist(BaselineKind::Running, 10, &frame).unwrap();
        repo.persist(BaselineKind::Calibrated, 1, &frame).unwrap();

        let running = files(&tmp.path().join("Baseline"));
        assert_eq!(running.len(), 2);
        assert!(running.iter().any(|n| n.starts_with("Baseline_Camera1_")));
        assert!(running.iter().any(|n| n.starts_with("Baseline_Camera10_")));
        assert!(latest.exists());

        let calibrated = files(&tmp.path().join("CalibratedBaseline"));
        assert_eq!(calibrated.len(), 1);
        assert!(calibrated[0].starts_with("CalibratedBaseline_Camera1_"));
    }

    #[test]
    fn captures_land_in_category_directory() {
        let tmp = tempdir().unwrap();
        let repo = BaselineRepository::new(tmp.path());
        let frame = RgbImage::new(4, 4);
        let a = repo.save_capture("throw", "2Darts", 2, &frame).unwrap();
        let b = repo.save_capture("throw", "2Darts", 2, &frame).unwrap();
        assert_ne!(a, b);
        assert_eq!(files(&tmp.path().join("2Darts")).len(), 2);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("throw_Camera2_"));
    }

    #[test]
    fn unwritable_root_is_storage_failure() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let repo = BaselineRepository::new(&blocker);
        let err = repo.persist(BaselineKind::Running, 1, &RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, VisionError::StorageFailure { .. }));
    }

    #[test]
    fn replacing_keeps_old_reference_alive_for_readers() {
        let mut b = CameraBaselines::default();
        assert!(b.is_empty());
        b.replace(BaselineKind::Running, Arc::new(RgbImage::from_pixel(2, 2, Rgb([1, 1, 1]))));
        let held = b.get(BaselineKind::Running).unwrap();
        b.replace(BaselineKind::Running, Arc::new(RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]))));
        assert_eq!(held.get_pixel(0, 0)[0], 1);
        assert_eq!(b.get(BaselineKind::Running).unwrap().get_pixel(0, 0)[0], 9);
        assert!(b.get(BaselineKind::Calibrated).is_none());
    }

    #[test]
    fn categories_follow_save_count() {
        assert_eq!(category_for(1), "1Dart");
        assert_eq!(category_for(2), "2Darts");
        assert_eq!(category_for(3), "3Darts");
    }
}
