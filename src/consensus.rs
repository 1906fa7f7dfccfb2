//! Multi-camera consensus.
//! Turns one cycle of per-camera mean differences into a `Decision` and tracks
//! how many confirmed saves happened since the last reset.

use std::fmt;

use image::RgbImage;

use crate::diff::difference_or_zero;

/// Confirmed saves after which comparison switches to the calibrated baseline.
pub const SAVE_CYCLE_LIMIT: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveCycleState {
    save_count: u8,
    allow_prompt: bool,
}

impl Default for SaveCycleState {
    fn default() -> Self {
        Self {
            save_count: 0,
            allow_prompt: true,
        }
    }
}

impl SaveCycleState {
    pub fn save_count(&self) -> u8 {
        self.save_count
    }

    pub fn prompts_allowed(&self) -> bool {
        self.allow_prompt
    }

    pub fn uses_calibrated_baseline(&self) -> bool {
        self.save_count >= SAVE_CYCLE_LIMIT
    }

    /// Counts a confirmed save. Reaching the limit disables further prompts.
    pub fn record_save(&mut self) -> u8 {
        self.save_count = (self.save_count + 1).min(SAVE_CYCLE_LIMIT);
        if self.save_count >= SAVE_CYCLE_LIMIT {
            self.allow_prompt = false;
        }
        self.save_count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decision {
    /// Every camera agrees on a change above the global threshold.
    ConfirmChange { overall: f64 },
    /// Quiet again after a full save cycle: refresh both baselines.
    ResetCycle { overall: f64 },
    /// Small change below the global threshold: refresh running baselines.
    DriftUpdate { overall: f64 },
    NoAction { overall: f64 },
}

impl Decision {
    pub fn overall(&self) -> f64 {
        match *self {
            Decision::ConfirmChange { overall }
            | Decision::ResetCycle { overall }
            | Decision::DriftUpdate { overall }
            | Decision::NoAction { overall } => overall,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decision::ConfirmChange { .. } => "confirm change",
            Decision::ResetCycle { .. } => "reset cycle",
            Decision::DriftUpdate { .. } => "drift update",
            Decision::NoAction { .. } => "no action",
        };
        write!(f, "{name} ({:.2}%)", self.overall())
    }
}

/// A camera reports when its mean exceeds half its own threshold.
pub fn reported(mean: f64, threshold: f64) -> bool {
    mean > threshold / 2.0
}

/// Decides one cycle from per-camera means and thresholds (same order).
/// An empty camera set never acts.
pub fn decide(means: &[f64], thresholds: &[f64], global: f64, state: &SaveCycleState) -> Decision {
    if means.is_empty() {
        return Decision::NoAction { overall: 0.0 };
    }
    let all_reported = means
        .iter()
        .enumerate()
        .all(|(i, m)| reported(*m, thresholds.get(i).copied().unwrap_or(global)));
    let overall = means.iter().sum::<f64>() / means.len() as f64;

    if all_reported && overall > global && state.allow_prompt && state.save_count < SAVE_CYCLE_LIMIT {
        Decision::ConfirmChange { overall }
    } else if overall < global && state.save_count >= SAVE_CYCLE_LIMIT {
        Decision::ResetCycle { overall }
    } else if overall > 0.0 && overall < global {
        Decision::DriftUpdate { overall }
    } else {
        Decision::NoAction { overall }
    }
}

/// Single-snapshot cycle: each frame is compared against the running or the
/// calibrated baseline depending on `state`, then `decide` runs on the results.
pub fn evaluate_cycle(
    frames: &[Option<RgbImage>],
    baselines: &[Option<RgbImage>],
    calibrated: &[Option<RgbImage>],
    thresholds: &[f64],
    global: f64,
    state: &SaveCycleState,
    pixel_threshold: u8,
) -> Decision {
    let references = if state.uses_calibrated_baseline() {
        calibrated
    } else {
        baselines
    };
    let means: Vec<f64> = frames
        .iter()
        .enumerate()
        .map(|(i, frame)| {
            let reference = references.get(i).and_then(Option::as_ref);
            difference_or_zero(frame.as_ref(), reference, pixel_threshold)
        })
        .collect();
    decide(&means, thresholds, global, state)
}
