//! Relaxometry-Core: voxel-wise T1/T2 and proton density mapping
//!
//! This crate fits closed-form MRI signal models to stacks of co-registered
//! volumes acquired at several inversion or echo times.
//!
//! # Modules
//! - `acquisition`: Mapping mode, acquisition parameters, validated volume stack
//! - `models`: T1 recovery and T2 decay signal equations
//! - `solvers`: Bounded Levenberg–Marquardt per-voxel fit
//! - `estimator`: Parallel voxel sweep producing relaxation and PD maps
//! - `pipeline`: Read / validate / estimate / write runs over a volume store
//! - `intensity`: Reference-volume intensity report (multi-Otsu, Welford)
//! - `utils`: Thresholding and running statistics
//! - `nifti_io`: NIfTI volume I/O with spatial metadata

pub mod error;

// Core modules
pub mod acquisition;
pub mod models;
pub mod solvers;
pub mod estimator;

// Analysis modules
pub mod intensity;
pub mod utils;

// I/O modules
pub mod nifti_io;
pub mod pipeline;

pub use acquisition::{Acquisition, AcquisitionParams, MappingMode};
pub use error::{RelaxError, Result};
pub use estimator::{
    estimate, estimate_cancellable, estimate_with_progress, FitSummary, RelaxometryMaps,
};
pub use nifti_io::{SpatialMetadata, Volume};
pub use solvers::{FitFailure, FitOptions, Loss};
