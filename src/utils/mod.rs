//! Histogram thresholding and running statistics

pub mod stats;
pub mod threshold;

pub use stats::RunningStats;
pub use threshold::{multi_otsu_thresholds, otsu_threshold};
