//! Presence classifier facade.
//! The engine only sees the `PresenceClassifier` trait; the HTTP client in
//! `classifier_http` is the one shipped implementation.
//! Models expect a 512x512 grayscale input, prepared here.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

use crate::config::ClassifierSettings;
use crate::error::{Result, VisionError};

pub const MODEL_INPUT_SIZE: u32 = 512;
/// Confidence above which a dart counts as present.
pub const PRESENCE_CONFIDENCE: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Presence {
    pub detected: bool,
    /// In [0, 1].
    pub confidence: f32,
}

impl Presence {
    pub fn is_present(&self) -> bool {
        self.confidence > PRESENCE_CONFIDENCE
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.is_present() { "dart present" } else { "no dart" };
        write!(f, "{verdict} (confidence {:.2})", self.confidence)
    }
}

pub type ClassifyFuture<'a> = Pin<Box<dyn Future<Output = Result<Presence>> + Send + 'a>>;

pub trait PresenceClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn classify<'a>(&'a self, image: &'a RgbImage) -> ClassifyFuture<'a>;
}

/// Downscales and converts to the model's input format.
pub fn prepare_input(image: &RgbImage) -> GrayImage {
    let gray = image::imageops::grayscale(image);
    if gray.dimensions() == (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE) {
        return gray;
    }
    image::imageops::resize(&gray, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Triangle)
}

/// Builds the configured classifier, if any.
pub fn from_settings(settings: &ClassifierSettings) -> Result<Option<crate::classifier_http::HttpPresenceClassifier>> {
    let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
        return Ok(None);
    };
    crate::classifier_http::HttpPresenceClassifier::new(endpoint, settings.timeout_secs, settings.max_retries)
        .map(Some)
        .map_err(|e| VisionError::Classifier(format!("{e:#}")))
}

/// Loads `path` off the async runtime and classifies it.
pub async fn classify_file(classifier: &dyn PresenceClassifier, path: &Path) -> Result<Presence> {
    let owned = path.to_path_buf();
    let image = tokio::task::spawn_blocking(move || image::open(owned).map(|i| i.to_rgb8()))
        .await
        .map_err(|e| VisionError::Classifier(format!("image load task failed: {e}")))??;
    let presence = classifier.classify(&image).await?;
    log::info!("{}: {} -> {presence}", classifier.name(), path.display());
    Ok(presence)
}
