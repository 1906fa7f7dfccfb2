//! Change detection engine.
//! One loop drives every camera: each cycle samples all cameras in parallel
//! (start staggered per camera), joins them, then runs the consensus step on
//! the complete set. Baseline replacement, confirmed saves and the operator
//! prompt all run behind a single save gate.
//! Latency per cycle: sample window + loop interval (default 500ms + 10ms).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::baseline::{category_for, BaselineKind, BaselineRepository, CameraBaselines};
use crate::capture::{CameraFeed, FrameSource};
use crate::classifier::{Presence, PresenceClassifier};
use crate::config::DetectionSettings;
use crate::consensus::{decide, Decision, SaveCycleState, SAVE_CYCLE_LIMIT};
use crate::diff::difference_or_zero;
use crate::error::{Result, VisionError};
use crate::rectify::{RectificationPipeline, Rectifier};
use crate::store::CalibrationStore;

// *************** Events & Collaborators ***************

/// One-way notifications for whatever presents the engine's state.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Sample { camera: String, difference: f64 },
    Decision(Decision),
    BaselineUpdated {
        camera: String,
        kind: BaselineKind,
        /// `None` when only the in-memory copy could be updated.
        path: Option<PathBuf>,
    },
    SaveCounter(u8),
    Saved { camera: String, path: PathBuf },
    Presence { camera: String, presence: Presence },
    CameraDropped { camera: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveChoice {
    Save { name: String, category: String },
    Skip,
}

pub trait SaveConfirmer: Send + Sync {
    /// Runs on a blocking thread and may wait on the operator.
    fn confirm(&self, overall: f64, suggested_category: &str) -> SaveChoice;
}

/// Flips the shared running flag; the loop exits at the next iteration.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// *************** Engine ***************

type SharedFeed = Arc<Mutex<CameraFeed>>;

struct CameraSlot {
    /// 1-based, used in file names.
    number: usize,
    label: String,
    feed: SharedFeed,
    threshold: f64,
    baselines: CameraBaselines,
    last_frame: Option<Arc<RgbImage>>,
}

struct CycleResult {
    means: Vec<f64>,
    thresholds: Vec<f64>,
    complete: bool,
}

pub struct ChangeDetectionEngine {
    cameras: Vec<CameraSlot>,
    settings: DetectionSettings,
    state: SaveCycleState,
    repository: Arc<BaselineRepository>,
    save_gate: Arc<tokio::sync::Mutex<()>>,
    confirmer: Arc<dyn SaveConfirmer>,
    classifier: Option<Arc<dyn PresenceClassifier>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    running: Arc<AtomicBool>,
}

impl ChangeDetectionEngine {
    pub fn new(
        settings: DetectionSettings,
        confirmer: Arc<dyn SaveConfirmer>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            cameras: Vec::new(),
            repository: Arc::new(BaselineRepository::new(&settings.output_directory)),
            settings,
            state: SaveCycleState::default(),
            save_gate: Arc::new(tokio::sync::Mutex::new(())),
            confirmer,
            classifier: None,
            events: tx,
            running: Arc::new(AtomicBool::new(true)),
        };
        (engine, rx)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PresenceClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Shares one save gate between engines so their saves queue.
    pub fn with_save_gate(mut self, gate: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.save_gate = gate;
        self
    }

    pub fn save_gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.save_gate.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    pub fn state(&self) -> SaveCycleState {
        self.state
    }

    pub fn repository(&self) -> &BaselineRepository {
        &self.repository
    }

    pub fn camera_labels(&self) -> Vec<&str> {
        self.cameras.iter().map(|c| c.label.as_str()).collect()
    }

    /// Current reference of the `idx`th active camera.
    pub fn baseline(&self, idx: usize, kind: BaselineKind) -> Option<Arc<RgbImage>> {
        self.cameras.get(idx).and_then(|c| c.baselines.get(kind))
    }

    pub fn add_camera(&mut self, feed: CameraFeed) {
        if self.cameras.len() >= self.settings.max_cameras {
            log::warn!("{}: camera limit {} reached, ignoring", feed.label(), self.settings.max_cameras);
            return;
        }
        let idx = self.cameras.len();
        let label = feed.label().to_string();
        log::info!("camera {} active as {label}", idx + 1);
        self.cameras.push(CameraSlot {
            number: idx + 1,
            label,
            feed: Arc::new(Mutex::new(feed)),
            threshold: self.settings.threshold_for(idx),
            baselines: CameraBaselines::default(),
            last_frame: None,
        });
    }

    /// Wires `source` to the rectifier its stored profile describes.
    pub fn add_source(&mut self, source: Box<dyn FrameSource>, store: &dyn CalibrationStore) -> Result<()> {
        let profile = store.camera_profile(source.label())?;
        let canonical = store.canonical_points()?;
        let rectifier = Rectifier::from_profile(&profile, canonical.as_ref(), store.canvas_size())?;
        let pipeline = RectificationPipeline::new(rectifier, self.settings.crop_to_perimeter);
        self.add_camera(CameraFeed::new(source, pipeline));
        Ok(())
    }

    /// Adds a camera whose source opened and whose stored profile builds a
    /// rectifier. Any failure leaves only that camera out; returns whether it
    /// was added.
    pub fn admit(
        &mut self,
        camera: &str,
        source: Result<Box<dyn FrameSource>>,
        store: &dyn CalibrationStore,
    ) -> bool {
        match source.and_then(|s| self.add_source(s, store)) {
            Ok(()) => true,
            Err(e) => {
                self.exclude(camera, &e);
                false
            }
        }
    }

    /// Logs a camera that could not be set up and leaves it out.
    pub fn exclude(&self, camera: &str, error: &VisionError) {
        let (camera, reason) = match error {
            VisionError::DeviceUnavailable { camera, reason } => (camera.clone(), reason.clone()),
            other => (camera.to_string(), other.to_string()),
        };
        log::warn!("{camera} excluded: {reason}");
        self.emit(EngineEvent::CameraDropped { camera, reason });
    }

    // *************** Public API ***************

    /// Runs until stopped. Establishes baselines first if none exist.
    pub async fn run(&mut self) -> Result<()> {
        if self.cameras.iter().all(|c| c.baselines.is_empty()) {
            if let Err(e) = self.set_baseline().await {
                log::warn!("initial baseline incomplete: {e}");
            }
        }
        let pause = Duration::from_millis(self.settings.loop_interval_ms);

        while self.running.load(Ordering::SeqCst) {
            if self.cameras.is_empty() {
                return Err(VisionError::DeviceUnavailable {
                    camera: "all".to_string(),
                    reason: "no active cameras".to_string(),
                });
            }
            self.evaluate_cycle().await;
            tokio::time::sleep(pause).await;
        }
        log::info!("capture loop stopped");
        Ok(())
    }

    /// One sampling window over all cameras followed by the consensus step
    /// and its side effects.
    pub async fn evaluate_cycle(&mut self) -> Decision {
        let kind = self.active_kind();
        let result = self.sample_cameras(self.sample_count(), kind).await;
        if !result.complete {
            log::debug!("cycle skipped, not every camera delivered a sample");
            return Decision::NoAction { overall: 0.0 };
        }

        let decision = decide(
            &result.means,
            &result.thresholds,
            self.settings.global_threshold,
            &self.state,
        );
        log::debug!("decision: {decision}");
        self.emit(EngineEvent::Decision(decision));
        self.apply(decision).await;
        decision
    }

    /// Clones every camera's current frame into both baselines and persists
    /// them. The first storage error is returned after all cameras ran.
    pub async fn set_baseline(&mut self) -> Result<()> {
        let _gate = self.save_gate.clone().lock_owned().await;
        self.sample_cameras(1, self.active_kind()).await;
        if self.cameras.iter().all(|c| c.last_frame.is_none()) {
            return Err(VisionError::DeviceUnavailable {
                camera: "all".to_string(),
                reason: "no frames captured".to_string(),
            });
        }
        self.refresh_baselines(&[BaselineKind::Running, BaselineKind::Calibrated])
            .await
    }

    /// Operator-triggered capture; same prompt and save path as a confirmed
    /// change. Nothing happens once the save cycle is full.
    pub async fn capture(&mut self) -> SaveChoice {
        if !self.state.prompts_allowed() {
            log::info!("save cycle complete, capture ignored until reset");
            return SaveChoice::Skip;
        }
        let result = self.sample_cameras(1, self.active_kind()).await;
        let overall = mean(&result.means);
        self.confirm_and_save(overall).await
    }

    // *************** Internal Functions ***************

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            log::trace!("no event listener");
        }
    }

    fn active_kind(&self) -> BaselineKind {
        if self.state.uses_calibrated_baseline() {
            BaselineKind::Calibrated
        } else {
            BaselineKind::Running
        }
    }

    fn sample_count(&self) -> u32 {
        match self.settings.sample_interval_ms {
            0 => 1,
            i => (self.settings.sample_window_ms / i).max(1) as u32,
        }
    }

    /// Fork-join over all cameras. Cameras that report `DeviceUnavailable`
    /// are dropped from the active set; any other failure marks the cycle
    /// incomplete.
    async fn sample_cameras(&mut self, samples: u32, kind: BaselineKind) -> CycleResult {
        let interval = Duration::from_millis(self.settings.sample_interval_ms);
        let stagger = self.settings.camera_stagger_ms;
        let pixel_threshold = self.settings.pixel_threshold;

        let mut tasks = JoinSet::new();
        for (idx, slot) in self.cameras.iter().enumerate() {
            let feed = slot.feed.clone();
            let label = slot.label.clone();
            let reference = slot.baselines.get(kind);
            let delay = Duration::from_millis(stagger * idx as u64);
            tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                let sampled = sample_camera(feed, label, reference, samples, interval, pixel_threshold).await;
                (idx, sampled)
            });
        }

        let mut results = Vec::with_capacity(self.cameras.len());
        let mut complete = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => {
                    log::warn!("camera task failed: {e}");
                    complete = false;
                }
            }
        }
        results.sort_by_key(|(idx, _)| *idx);

        let mut means = Vec::new();
        let mut thresholds = Vec::new();
        let mut dropped = Vec::new();
        for (idx, sampled) in results {
            let slot = &mut self.cameras[idx];
            match sampled {
                Ok((frame, difference)) => {
                    slot.last_frame = Some(Arc::new(frame));
                    means.push(difference);
                    thresholds.push(slot.threshold);
                    log::debug!("{}: {difference:.2}% vs {:?}", slot.label, kind);
                    let camera = slot.label.clone();
                    self.emit(EngineEvent::Sample { camera, difference });
                }
                Err(VisionError::DeviceUnavailable { camera, reason }) => {
                    log::warn!("{camera} dropped: {reason}");
                    dropped.push(slot.number);
                    self.emit(EngineEvent::CameraDropped { camera, reason });
                }
                Err(e) => {
                    log::warn!("{}: sample failed: {e}", slot.label);
                    complete = false;
                }
            }
        }
        if !dropped.is_empty() {
            self.cameras.retain(|c| !dropped.contains(&c.number));
        }

        CycleResult {
            means,
            thresholds,
            complete,
        }
    }

    async fn apply(&mut self, decision: Decision) {
        let outcome = match decision {
            Decision::ConfirmChange { overall } => {
                self.confirm_and_save(overall).await;
                Ok(())
            }
            Decision::ResetCycle { .. } => {
                let _gate = self.save_gate.clone().lock_owned().await;
                let refreshed = self
                    .refresh_baselines(&[BaselineKind::Running, BaselineKind::Calibrated])
                    .await;
                self.state.reset();
                self.emit(EngineEvent::SaveCounter(0));
                log::info!("save cycle reset, comparing against running baselines again");
                refreshed
            }
            Decision::DriftUpdate { .. } => {
                let _gate = self.save_gate.clone().lock_owned().await;
                self.refresh_baselines(&[BaselineKind::Running]).await
            }
            Decision::NoAction { .. } => Ok(()),
        };
        if let Err(e) = outcome {
            log::warn!("{decision}: baselines only updated in memory: {e}");
        }
    }

    async fn confirm_and_save(&mut self, overall: f64) -> SaveChoice {
        let _gate = self.save_gate.clone().lock_owned().await;
        if !self.state.prompts_allowed() {
            return SaveChoice::Skip;
        }

        let suggested = category_for(self.state.save_count() + 1);
        let confirmer = self.confirmer.clone();
        let choice = tokio::task::spawn_blocking(move || confirmer.confirm(overall, suggested))
            .await
            .unwrap_or_else(|e| {
                log::warn!("save prompt failed: {e}");
                SaveChoice::Skip
            });

        match &choice {
            SaveChoice::Save { name, category } => {
                let count = self.state.record_save();
                self.emit(EngineEvent::SaveCounter(count));
                let category = if category.trim().is_empty() { suggested } else { category.as_str() };
                self.save_frames(name, category).await;

                if count < SAVE_CYCLE_LIMIT {
                    if let Err(e) = self.refresh_baselines(&[BaselineKind::Running]).await {
                        log::warn!("running baselines only updated in memory: {e}");
                    }
                } else {
                    log::info!("{count} saves, comparing against calibrated baselines");
                }
                self.classify_first_frame().await;
            }
            SaveChoice::Skip => {
                if let Err(e) = self.refresh_baselines(&[BaselineKind::Running]).await {
                    log::warn!("running baselines only updated in memory: {e}");
                }
            }
        }
        choice
    }

    async fn save_frames(&self, name: &str, category: &str) {
        for slot in &self.cameras {
            let Some(frame) = slot.last_frame.clone() else {
                continue;
            };
            let repo = self.repository.clone();
            let (name, category, number) = (name.to_string(), category.to_string(), slot.number);
            let saved = tokio::task::spawn_blocking(move || repo.save_capture(&name, &category, number, &frame))
                .await
                .unwrap_or_else(|e| Err(VisionError::Io(std::io::Error::other(e))));
            match saved {
                Ok(path) => {
                    log::info!("{}: saved {}", slot.label, path.display());
                    self.emit(EngineEvent::Saved {
                        camera: slot.label.clone(),
                        path,
                    });
                }
                Err(e) => log::warn!("{}: capture not saved: {e}", slot.label),
            }
        }
    }

    async fn classify_first_frame(&self) {
        let Some(classifier) = self.classifier.clone() else {
            return;
        };
        let Some(slot) = self.cameras.first() else {
            return;
        };
        let Some(frame) = slot.last_frame.clone() else {
            return;
        };
        match classifier.classify(&frame).await {
            Ok(presence) => {
                log::info!("{}: {presence}", slot.label);
                self.emit(EngineEvent::Presence {
                    camera: slot.label.clone(),
                    presence,
                });
            }
            Err(e) => log::warn!("{}: {e}", slot.label),
        }
    }

    /// Replaces the given baselines of every camera with its last frame.
    async fn refresh_baselines(&mut self, kinds: &[BaselineKind]) -> Result<()> {
        let mut first_error = None;
        for idx in 0..self.cameras.len() {
            let Some(frame) = self.cameras[idx].last_frame.clone() else {
                continue;
            };
            for kind in kinds {
                if let Err(e) = self.replace_baseline(idx, *kind, frame.clone()).await {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Swaps the in-memory reference, then persists it. A failed write
    /// leaves the new reference in place.
    async fn replace_baseline(&mut self, idx: usize, kind: BaselineKind, frame: Arc<RgbImage>) -> Result<PathBuf> {
        let slot = &mut self.cameras[idx];
        slot.baselines.replace(kind, frame.clone());
        let (number, camera) = (slot.number, slot.label.clone());

        let repo = self.repository.clone();
        let persisted = tokio::task::spawn_blocking(move || repo.persist(kind, number, &frame))
            .await
            .unwrap_or_else(|e| Err(VisionError::Io(std::io::Error::other(e))));
        let path = persisted.as_ref().ok().cloned();
        self.emit(EngineEvent::BaselineUpdated { camera, kind, path });
        persisted
    }
}

async fn sample_camera(
    feed: SharedFeed,
    label: String,
    reference: Option<Arc<RgbImage>>,
    samples: u32,
    interval: Duration,
    pixel_threshold: u8,
) -> Result<(RgbImage, f64)> {
    let mut total = 0.0;
    let mut last = None;
    for i in 0..samples {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let feed = feed.clone();
        let reference = reference.clone();
        let (frame, difference) = tokio::task::spawn_blocking(move || {
            let frame = feed.lock().unwrap_or_else(|e| e.into_inner()).grab()?;
            let difference = difference_or_zero(Some(&frame), reference.as_deref(), pixel_threshold);
            Ok::<_, VisionError>((frame, difference))
        })
        .await
        .map_err(|e| VisionError::DeviceUnavailable {
            camera: label.clone(),
            reason: e.to_string(),
        })??;
        total += difference;
        last = Some(frame);
    }
    let frame = last.ok_or_else(|| VisionError::DeviceUnavailable {
        camera: label,
        reason: "no samples taken".to_string(),
    })?;
    Ok((frame, total / samples.max(1) as f64))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// *************** Tests ***************

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyFuture;
    use crate::homography::Homography;
    use crate::store::JsonCalibrationStore;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use nalgebra::Point2;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    const SIZE: u32 = 64;

    type Scene = Arc<Mutex<RgbImage>>;

    struct SceneSource {
        label: String,
        scene: Scene,
    }

    impl FrameSource for SceneSource {
        fn label(&self) -> &str {
            &self.label
        }

        fn read(&mut self) -> Result<RgbImage> {
            Ok(self.scene.lock().unwrap().clone())
        }
    }

    struct DeadSource;

    impl FrameSource for DeadSource {
        fn label(&self) -> &str {
            "Camera9"
        }

        fn read(&mut self) -> Result<RgbImage> {
            Err(VisionError::DeviceUnavailable {
                camera: "Camera9".to_string(),
                reason: "unplugged".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct ScriptedConfirmer {
        skips: Mutex<VecDeque<bool>>,
        suggested: Mutex<Vec<String>>,
    }

    impl SaveConfirmer for ScriptedConfirmer {
        fn confirm(&self, _overall: f64, suggested_category: &str) -> SaveChoice {
            self.suggested.lock().unwrap().push(suggested_category.to_string());
            if self.skips.lock().unwrap().pop_front().unwrap_or(false) {
                SaveChoice::Skip
            } else {
                SaveChoice::Save {
                    name: "throw".to_string(),
                    category: suggested_category.to_string(),
                }
            }
        }
    }

    struct AlwaysDart;

    impl PresenceClassifier for AlwaysDart {
        fn name(&self) -> &str {
            "always"
        }

        fn classify<'a>(&'a self, _image: &'a RgbImage) -> ClassifyFuture<'a> {
            Box::pin(async {
                Ok(Presence {
                    detected: true,
                    confidence: 0.9,
                })
            })
        }
    }

    fn settings(out: &Path) -> DetectionSettings {
        DetectionSettings {
            global_threshold: 5.0,
            camera_thresholds: vec![10.0, 10.0],
            sample_window_ms: 0,
            sample_interval_ms: 0,
            loop_interval_ms: 0,
            camera_stagger_ms: 0,
            pixel_threshold: 25,
            crop_to_perimeter: false,
            output_directory: out.to_string_lossy().into_owned(),
            ..DetectionSettings::default()
        }
    }

    fn feed(source: impl FrameSource + 'static) -> CameraFeed {
        let rectifier = Rectifier::new(None, Homography::identity(), SIZE);
        CameraFeed::new(Box::new(source), RectificationPipeline::new(rectifier, false))
    }

    struct Rig {
        engine: ChangeDetectionEngine,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        scenes: Vec<Scene>,
        confirmer: Arc<ScriptedConfirmer>,
        out: TempDir,
    }

    fn rig(cameras: usize) -> Rig {
        let out = tempdir().unwrap();
        let confirmer = Arc::new(ScriptedConfirmer::default());
        let (mut engine, events) = ChangeDetectionEngine::new(settings(out.path()), confirmer.clone());
        let mut scenes = Vec::new();
        for i in 0..cameras {
            let scene: Scene = Arc::new(Mutex::new(RgbImage::new(SIZE, SIZE)));
            engine.add_camera(feed(SceneSource {
                label: format!("Camera{}", i + 1),
                scene: scene.clone(),
            }));
            scenes.push(scene);
        }
        Rig {
            engine,
            events,
            scenes,
            confirmer,
            out,
        }
    }

    /// Paints a white horizontal band into every scene.
    fn throw_dart(scenes: &[Scene], band: u32) {
        for scene in scenes {
            let mut img = scene.lock().unwrap();
            draw_filled_rect_mut(
                &mut *img,
                Rect::at(0, (band * 16) as i32).of_size(SIZE, 16),
                Rgb([255, 255, 255]),
            );
        }
    }

    fn clear(scenes: &[Scene]) {
        for scene in scenes {
            *scene.lock().unwrap() = RgbImage::new(SIZE, SIZE);
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn bad_profile_excludes_only_that_camera() {
        let out = tempdir().unwrap();
        let store = JsonCalibrationStore::open(out.path().join("appsettings.json")).unwrap();
        let square = [
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 100.0),
            Point2::new(0.0, 100.0),
        ];
        let collinear = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(20.0, 0.0),
            Point2::new(5.0, 40.0),
        ];
        store.save_canonical_points(&square).unwrap();
        store.save_source_points("Camera1", &collinear).unwrap();
        store.save_source_points("Camera2", &square).unwrap();

        let (mut engine, mut events) =
            ChangeDetectionEngine::new(settings(out.path()), Arc::new(ScriptedConfirmer::default()));
        let scene: Scene = Arc::new(Mutex::new(RgbImage::new(SIZE, SIZE)));
        for name in ["Camera1", "Camera2"] {
            let source: Box<dyn FrameSource> = Box::new(SceneSource {
                label: name.to_string(),
                scene: scene.clone(),
            });
            engine.admit(name, Ok(source), &store);
        }
        let unplugged = Err(VisionError::DeviceUnavailable {
            camera: "Camera3".to_string(),
            reason: "no frames".to_string(),
        });
        assert!(!engine.admit("Camera3", unplugged, &store));

        assert_eq!(engine.camera_labels(), ["Camera2"]);
        let dropped: Vec<String> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::CameraDropped { camera, .. } => Some(camera),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, ["Camera1", "Camera3"]);
    }

    #[tokio::test]
    async fn set_baseline_persists_both_kinds() {
        let mut rig = rig(2);
        rig.engine.set_baseline().await.unwrap();
        assert_eq!(count_files(&rig.out.path().join("Baseline")), 2);
        assert_eq!(count_files(&rig.out.path().join("CalibratedBaseline")), 2);
        assert!(rig.engine.baseline(1, BaselineKind::Calibrated).is_some());

        // a second set replaces rather than accumulates
        rig.engine.set_baseline().await.unwrap();
        assert_eq!(count_files(&rig.out.path().join("Baseline")), 2);

        let updates = drain(&mut rig.events)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::BaselineUpdated { path: Some(_), .. }))
            .count();
        assert_eq!(updates, 8);
    }

    /// Holds the prompt open for a while and records overlapping calls.
    #[derive(Default)]
    struct SlowConfirmer {
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        prompts: AtomicUsize,
    }

    impl SaveConfirmer for SlowConfirmer {
        fn confirm(&self, _overall: f64, _suggested_category: &str) -> SaveChoice {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(80));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.prompts.fetch_add(1, Ordering::SeqCst);
            SaveChoice::Save {
                name: "throw".to_string(),
                category: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn engines_sharing_a_gate_never_prompt_at_once() {
        let confirmer = Arc::new(SlowConfirmer::default());
        let (out_a, out_b) = (tempdir().unwrap(), tempdir().unwrap());
        let scene_a: Scene = Arc::new(Mutex::new(RgbImage::new(SIZE, SIZE)));
        let scene_b: Scene = Arc::new(Mutex::new(RgbImage::new(SIZE, SIZE)));

        let (mut a, _events_a) = ChangeDetectionEngine::new(settings(out_a.path()), confirmer.clone());
        let (b, _events_b) = ChangeDetectionEngine::new(settings(out_b.path()), confirmer.clone());
        let mut b = b.with_save_gate(a.save_gate());
        assert!(Arc::ptr_eq(&a.save_gate(), &b.save_gate()));
        a.add_camera(feed(SceneSource {
            label: "Camera1".to_string(),
            scene: scene_a.clone(),
        }));
        b.add_camera(feed(SceneSource {
            label: "Camera1".to_string(),
            scene: scene_b.clone(),
        }));
        a.set_baseline().await.unwrap();
        b.set_baseline().await.unwrap();

        throw_dart(&[scene_a, scene_b], 0);
        let (da, db) = tokio::join!(a.evaluate_cycle(), b.evaluate_cycle());

        assert!(matches!(da, Decision::ConfirmChange { .. }), "{da:?}");
        assert!(matches!(db, Decision::ConfirmChange { .. }), "{db:?}");
        assert_eq!(confirmer.prompts.load(Ordering::SeqCst), 2);
        assert!(!confirmer.overlapped.load(Ordering::SeqCst));
        assert_eq!(count_files(&out_a.path().join("1Dart")), 1);
        assert_eq!(count_files(&out_b.path().join("1Dart")), 1);
    }

    #[tokio::test]
    async fn full_save_cycle_switches_to_calibrated_and_resets() {
        let mut rig = rig(2);
        rig.engine.set_baseline().await.unwrap();

        for band in 0..3 {
            throw_dart(&rig.scenes, band);
            let d = rig.engine.evaluate_cycle().await;
            assert!(matches!(d, Decision::ConfirmChange { .. }), "dart {band}: {d:?}");
        }
        let state = rig.engine.state();
        assert_eq!(state.save_count(), 3);
        assert!(state.uses_calibrated_baseline());
        assert_eq!(*rig.confirmer.suggested.lock().unwrap(), ["1Dart", "2Darts", "3Darts"]);
        for category in ["1Dart", "2Darts", "3Darts"] {
            assert_eq!(count_files(&rig.out.path().join(category)), 2, "{category}");
        }

        // third save is not promoted: running baseline still shows two darts
        let running = rig.engine.baseline(0, BaselineKind::Running).unwrap();
        assert!(running.get_pixel(5, 40)[0] < 50);
        assert!(running.get_pixel(5, 20)[0] > 200);

        // darts still in the board: large difference but no more prompts
        let d = rig.engine.evaluate_cycle().await;
        assert!(matches!(d, Decision::NoAction { .. }), "{d:?}");

        clear(&rig.scenes);
        let d = rig.engine.evaluate_cycle().await;
        assert!(matches!(d, Decision::ResetCycle { .. }), "{d:?}");
        assert_eq!(rig.engine.state(), SaveCycleState::default());

        let counters: Vec<u8> = drain(&mut rig.events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::SaveCounter(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(counters, [1, 2, 3, 0]);
    }

    #[tokio::test]
    async fn small_change_refreshes_running_baseline_only() {
        let mut rig = rig(2);
        rig.engine.set_baseline().await.unwrap();
        for scene in &rig.scenes {
            let mut img = scene.lock().unwrap();
            draw_filled_rect_mut(&mut *img, Rect::at(30, 30).of_size(4, 4), Rgb([255, 255, 255]));
        }
        let d = rig.engine.evaluate_cycle().await;
        assert!(matches!(d, Decision::DriftUpdate { .. }), "{d:?}");
        let running = rig.engine.baseline(0, BaselineKind::Running).unwrap();
        let calibrated = rig.engine.baseline(0, BaselineKind::Calibrated).unwrap();
        assert!(running.get_pixel(31, 31)[0] > 200);
        assert!(calibrated.get_pixel(31, 31)[0] < 50);
    }

    #[tokio::test]
    async fn skipped_save_only_moves_running_baseline() {
        let mut rig = rig(2);
        rig.confirmer.skips.lock().unwrap().push_back(true);
        rig.engine.set_baseline().await.unwrap();
        throw_dart(&rig.scenes, 1);

        let d = rig.engine.evaluate_cycle().await;
        assert!(matches!(d, Decision::ConfirmChange { .. }));
        assert_eq!(rig.engine.state().save_count(), 0);
        assert_eq!(count_files(&rig.out.path().join("1Dart")), 0);
        let running = rig.engine.baseline(0, BaselineKind::Running).unwrap();
        assert!(running.get_pixel(5, 20)[0] > 200);

        // same scene again is now quiet
        let d = rig.engine.evaluate_cycle().await;
        assert_eq!(d, Decision::NoAction { overall: 0.0 });
    }

    #[tokio::test]
    async fn one_quiet_camera_blocks_confirmation() {
        let mut rig = rig(2);
        rig.engine.set_baseline().await.unwrap();
        throw_dart(&rig.scenes[..1], 0);
        let d = rig.engine.evaluate_cycle().await;
        assert!(!matches!(d, Decision::ConfirmChange { .. }), "{d:?}");
        assert!(rig.confirmer.suggested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_camera_is_dropped_and_others_continue() {
        let mut rig = rig(1);
        rig.engine.add_camera(feed(DeadSource));
        assert_eq!(rig.engine.camera_labels(), ["Camera1", "Camera9"]);

        rig.engine.set_baseline().await.unwrap();
        assert_eq!(rig.engine.camera_labels(), ["Camera1"]);
        let dropped = drain(&mut rig.events)
            .into_iter()
            .any(|e| matches!(e, EngineEvent::CameraDropped { ref camera, .. } if camera == "Camera9"));
        assert!(dropped);

        throw_dart(&rig.scenes, 2);
        let d = rig.engine.evaluate_cycle().await;
        assert!(matches!(d, Decision::ConfirmChange { .. }), "{d:?}");
    }

    #[tokio::test]
    async fn confirmed_save_asks_classifier() {
        let out = tempdir().unwrap();
        let confirmer = Arc::new(ScriptedConfirmer::default());
        let (engine, mut events) = ChangeDetectionEngine::new(settings(out.path()), confirmer);
        let mut engine = engine.with_classifier(Arc::new(AlwaysDart));
        let scene: Scene = Arc::new(Mutex::new(RgbImage::new(SIZE, SIZE)));
        engine.add_camera(feed(SceneSource {
            label: "Camera1".to_string(),
            scene: scene.clone(),
        }));

        engine.set_baseline().await.unwrap();
        throw_dart(&[scene], 0);
        let choice = engine.capture().await;
        assert!(matches!(choice, SaveChoice::Save { .. }));
        assert_eq!(engine.state().save_count(), 1);

        let presence = drain(&mut events).into_iter().find_map(|e| match e {
            EngineEvent::Presence { presence, .. } => Some(presence),
            _ => None,
        });
        assert!(presence.is_some_and(|p| p.is_present()));
    }

    #[tokio::test]
    async fn camera_limit_is_enforced() {
        let mut rig = rig(4);
        rig.engine.add_camera(feed(DeadSource));
        assert_eq!(rig.engine.camera_labels().len(), 4);
    }

    #[tokio::test]
    async fn stop_handle_ends_the_loop() {
        let rig = rig(2);
        let mut engine = rig.engine;
        let stop = engine.stop_handle();
        assert!(stop.is_running());

        let task = tokio::spawn(async move { engine.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(count_files(&rig.out.path().join("Baseline")), 2);
    }

    #[tokio::test]
    async fn run_without_cameras_fails() {
        let out = tempdir().unwrap();
        let (mut engine, _events) =
            ChangeDetectionEngine::new(settings(out.path()), Arc::new(ScriptedConfirmer::default()));
        assert!(matches!(engine.run().await, Err(VisionError::DeviceUnavailable { .. })));
    }
}
