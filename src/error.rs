//! Error taxonomy for relaxometry runs
//!
//! Configuration and data errors are fatal and raised before any voxel is
//! fitted. Per-voxel fit failures are not errors: they are recovered inside
//! the estimator (see [`crate::solvers::FitFailure`]) and only counted.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelaxError {
    /// Missing or mismatched acquisition parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Inconsistent volume shapes across the acquisition.
    #[error("Data error: {0}")]
    Data(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unsupported NIfTI content.
    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("Voxel sweep cancelled")]
    Cancelled,
}

impl RelaxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelaxError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelaxError>;
