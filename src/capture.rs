//! Frame capture module.
//! A `FrameSource` hands out raw camera frames; `ImageSequenceSource` replays a
//! directory of stills in name order and then keeps returning the last one,
//! which is how a fixed camera looking at an unchanged board behaves.
//! `CameraFeed` pairs a source with its rectification pipeline.

use std::path::{Path, PathBuf};
use std::time::Instant;

use image::RgbImage;

use crate::calibrate::list_images;
use crate::error::{Result, VisionError};
use crate::rectify::RectificationPipeline;

pub trait FrameSource: Send {
    fn label(&self) -> &str;
    /// Next raw frame. May block on device I/O.
    fn read(&mut self) -> Result<RgbImage>;
}

#[derive(Debug)]
pub struct ImageSequenceSource {
    label: String,
    frames: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    /// Fails with `DeviceUnavailable` when `dir` is missing or holds no images.
    pub fn open(label: impl Into<String>, dir: &Path) -> Result<Self> {
        let label = label.into();
        let frames = list_images(dir).map_err(|e| VisionError::DeviceUnavailable {
            camera: label.clone(),
            reason: e.to_string(),
        })?;
        if frames.is_empty() {
            return Err(VisionError::DeviceUnavailable {
                camera: label,
                reason: format!("no frames in {}", dir.display()),
            });
        }
        log::info!("{label}: replaying {} frames from {}", frames.len(), dir.display());
        Ok(Self {
            label,
            frames,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&mut self) -> Result<RgbImage> {
        let idx = self.next.min(self.frames.len().saturating_sub(1));
        let path = self.frames.get(idx).ok_or_else(|| VisionError::DeviceUnavailable {
            camera: self.label.clone(),
            reason: "no frames".to_string(),
        })?;
        self.next = (idx + 1).min(self.frames.len() - 1);
        // A bad file fails this read only; the device itself stays usable.
        let frame = image::open(path)
            .inspect_err(|e| log::warn!("{}: unreadable frame {}: {e}", self.label, path.display()))?
            .to_rgb8();
        Ok(frame)
    }
}

/// One camera's source plus its rectification pipeline.
pub struct CameraFeed {
    source: Box<dyn FrameSource>,
    pipeline: RectificationPipeline,
}

impl CameraFeed {
    pub fn new(source: Box<dyn FrameSource>, pipeline: RectificationPipeline) -> Self {
        Self { source, pipeline }
    }

    pub fn label(&self) -> &str {
        self.source.label()
    }

    /// Reads one frame and rectifies it.
    pub fn grab(&mut self) -> Result<RgbImage> {
        let start = Instant::now();
        let raw = self.source.read()?;
        let rectified = self.pipeline.process(&raw)?;
        log::trace!("{}: capture + rectify latency {:?}", self.label(), start.elapsed());
        Ok(rectified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homography::Homography;
    use crate::rectify::Rectifier;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn sequence_replays_then_holds_last_frame() {
        let dir = tempdir().unwrap();
        for (i, v) in [10u8, 20, 30].iter().enumerate() {
            RgbImage::from_pixel(4, 4, Rgb([*v, 0, 0]))
                .save(dir.path().join(format!("frame{i}.png")))
                .unwrap();
        }
        let mut src = ImageSequenceSource::open("Camera1", dir.path()).unwrap();
        assert_eq!(src.len(), 3);
        let reds: Vec<u8> = (0..5).map(|_| src.read().unwrap().get_pixel(0, 0)[0]).collect();
        assert_eq!(reds, [10, 20, 30, 30, 30]);
    }

    #[test]
    fn undecodable_frame_fails_the_read_not_the_device() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("frame0.png"), b"not a png").unwrap();
        RgbImage::from_pixel(4, 4, Rgb([40, 0, 0]))
            .save(dir.path().join("frame1.png"))
            .unwrap();
        let mut src = ImageSequenceSource::open("Camera1", dir.path()).unwrap();

        let err = src.read().unwrap_err();
        assert!(matches!(err, VisionError::Image(_)), "{err:?}");
        assert_eq!(src.read().unwrap().get_pixel(0, 0)[0], 40);
    }

    #[test]
    fn missing_or_empty_directory_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = ImageSequenceSource::open("Camera2", dir.path()).unwrap_err();
        assert!(matches!(err, VisionError::DeviceUnavailable { ref camera, .. } if camera == "Camera2"));
        let err = ImageSequenceSource::open("Camera3", &dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, VisionError::DeviceUnavailable { .. }));
    }

    #[test]
    fn feed_rectifies_to_canvas_size() {
        let dir = tempdir().unwrap();
        RgbImage::from_pixel(64, 48, Rgb([50, 60, 70]))
            .save(dir.path().join("f.png"))
            .unwrap();
        let src = ImageSequenceSource::open("Camera1", dir.path()).unwrap();
        let pipeline = RectificationPipeline::new(Rectifier::new(None, Homography::identity(), 32), false);
        let mut feed = CameraFeed::new(Box::new(src), pipeline);
        let frame = feed.grab().unwrap();
        assert_eq!(frame.dimensions(), (32, 32));
        assert_eq!(feed.label(), "Camera1");
    }
}
