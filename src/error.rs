//! Error taxonomy for the calibration and change-detection core.
//! Every failure is an explicit variant; nothing in the library aborts the process.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// Too few usable checkerboard views. Recoverable: retry with more images.
    #[error("not enough calibration data: {found} usable images, at least {required} required")]
    CalibrationInsufficientData { found: usize, required: usize },

    /// Wrong number of correspondence points.
    #[error("expected exactly {expected} points, got {found}")]
    InvalidPointCount { expected: usize, found: usize },

    /// Board perimeter could not be located. Callers skip the overlay.
    #[error("outer perimeter of the board not found")]
    PerimeterNotFound,

    #[error("camera {camera} unavailable: {reason}")]
    DeviceUnavailable { camera: String, reason: String },

    #[error("storage failure at {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("presence classifier failed: {0}")]
    Classifier(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] serde_json::Error),
}

impl VisionError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VisionError::StorageFailure {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn point_count(expected: usize, found: usize) -> Self {
        VisionError::InvalidPointCount { expected, found }
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_message_names_counts() {
        let err = VisionError::CalibrationInsufficientData {
            found: 3,
            required: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 usable"));
        assert!(msg.contains("at least 5"));
    }

    #[test]
    fn storage_failure_keeps_source() {
        let err = VisionError::storage(
            "CapturedImages/Baseline",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("CapturedImages/Baseline"));
    }
}
