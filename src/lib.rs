//! Dartboard calibration and change detection.
//! Calibrates fixed cameras against a dartboard, rectifies their frames into a
//! shared canonical square, scores points on the board and watches for newly
//! landed darts by differencing frames against per-camera baselines.

pub mod baseline;
pub mod calibrate;
pub mod camera;
pub mod capture;
pub mod checkerboard;
pub mod classifier;
pub mod classifier_http;
pub mod config;
pub mod consensus;
pub mod diff;
pub mod engine;
pub mod error;
pub mod homography;
pub mod lens_solve;
pub mod perimeter;
pub mod rectify;
pub mod scoring;
pub mod store;

pub use error::{Result, VisionError};
