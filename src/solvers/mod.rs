//! Per-voxel non-linear least-squares fitting
//!
//! - `levenberg_marquardt`: bounded two-parameter LM on `(PD, ln T)` with an
//!   optional Huber loss

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{fit_voxel, VoxelFit};

use thiserror::Error;

/// Relaxation times are clamped below by this floor (single precision epsilon).
pub const MIN_RELAXATION_TIME: f64 = f32::EPSILON as f64;

/// Residual loss
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Loss {
    /// Plain sum of squared residuals
    SquaredError,
    /// Quadratic within `delta`, linear beyond; damps outlier samples
    Huber { delta: f64 },
}

/// Fitting configuration shared by every voxel of a run
#[derive(Clone, Debug, PartialEq)]
pub struct FitOptions {
    /// Cap on accepted-or-rejected outer LM iterations per voxel
    pub max_iterations: usize,
    /// Relative tolerance on cost decrease and parameter step
    pub tolerance: f64,
    /// Upper bound on the relaxation time (same unit as TI/TE)
    pub t_max: f64,
    pub loss: Loss,
    /// Worker count; `None` uses every available core
    pub num_threads: Option<usize>,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iterations: 100,
            tolerance: 1e-10,
            t_max: 5000.0,
            loss: Loss::SquaredError,
            num_threads: None,
        }
    }
}

impl FitOptions {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        use crate::RelaxError::Configuration;

        if self.max_iterations == 0 {
            return Err(Configuration("max_iterations must be at least 1".to_string()));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(Configuration(format!("invalid tolerance {}", self.tolerance)));
        }
        if !(self.t_max > MIN_RELAXATION_TIME && self.t_max.is_finite()) {
            return Err(Configuration(format!("invalid relaxation time bound {}", self.t_max)));
        }
        if let Loss::Huber { delta } = self.loss {
            if !(delta > 0.0 && delta.is_finite()) {
                return Err(Configuration(format!("invalid Huber delta {}", delta)));
            }
        }
        if self.num_threads == Some(0) {
            return Err(Configuration("num_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Why a voxel got the zero sentinel instead of a fit
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitFailure {
    /// All-zero or flat signal: nothing to fit
    #[error("degenerate voxel signal")]
    Degenerate,
    #[error("solver did not converge")]
    NonConvergence,
    /// NaN/inf in the signal or the solution
    #[error("non-finite signal or estimate")]
    NonFinite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(FitOptions::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let cases = [
            FitOptions {
                max_iterations: 0,
                ..FitOptions::default()
            },
            FitOptions {
                tolerance: 0.0,
                ..FitOptions::default()
            },
            FitOptions {
                t_max: f64::INFINITY,
                ..FitOptions::default()
            },
            FitOptions {
                loss: Loss::Huber { delta: -1.0 },
                ..FitOptions::default()
            },
            FitOptions {
                num_threads: Some(0),
                ..FitOptions::default()
            },
        ];
        for options in &cases {
            assert!(options.validate().is_err(), "{:?} should be rejected", options);
        }
    }
}
