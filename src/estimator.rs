//! Voxel-wise relaxometry estimation
//!
//! Fits every voxel of an [`Acquisition`] independently and collects the
//! results into a relaxation time map and a proton density map. Voxels are
//! swept in z-slice blocks on the rayon pool: the stacked signal matrix is
//! shared read-only and each block owns a disjoint slice of both outputs, so
//! results do not depend on the number of workers.
//!
//! A voxel whose fit fails gets PD = 0 and T = 0 and is counted in the
//! [`FitSummary`]; it never aborts the sweep.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ndarray::Array2;
use rayon::prelude::*;

use crate::acquisition::{Acquisition, MappingMode};
use crate::error::{RelaxError, Result};
use crate::models::SignalModel;
use crate::nifti_io::Volume;
use crate::solvers::{fit_voxel, FitFailure, FitOptions};

/// Per-run voxel accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FitSummary {
    pub total_voxels: usize,
    pub fitted: usize,
    /// Outside the mask; not fitted and not a failure
    pub masked_out: usize,
    pub degenerate: usize,
    pub non_converged: usize,
    pub non_finite: usize,
}

impl FitSummary {
    /// Voxels that received the zero sentinel because their fit failed
    pub fn failed(&self) -> usize {
        self.degenerate + self.non_converged + self.non_finite
    }

    fn record_failure(&mut self, failure: FitFailure) {
        match failure {
            FitFailure::Degenerate => self.degenerate += 1,
            FitFailure::NonConvergence => self.non_converged += 1,
            FitFailure::NonFinite => self.non_finite += 1,
        }
    }

    fn merge(self, other: FitSummary) -> FitSummary {
        FitSummary {
            total_voxels: self.total_voxels + other.total_voxels,
            fitted: self.fitted + other.fitted,
            masked_out: self.masked_out + other.masked_out,
            degenerate: self.degenerate + other.degenerate,
            non_converged: self.non_converged + other.non_converged,
            non_finite: self.non_finite + other.non_finite,
        }
    }
}

/// Estimated maps, flattened in the same order as the input volumes
#[derive(Clone, Debug)]
pub struct RelaxometryMaps {
    pub mode: MappingMode,
    /// T1 or T2, in the unit of the acquisition times
    pub relaxation: Vec<f64>,
    pub pd: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub summary: FitSummary,
}

impl RelaxometryMaps {
    /// Wrap both maps as volumes carrying `reference`'s spatial metadata.
    ///
    /// Returns `(relaxation, pd)`.
    pub fn into_volumes(self, reference: &Volume) -> Result<(Volume, Volume)> {
        if reference.dims != self.dims {
            return Err(RelaxError::Data(format!(
                "reference volume shape {:?} does not match map shape {:?}",
                reference.dims,
                self.dims
            )));
        }
        Ok((reference.derived(self.relaxation)?, reference.derived(self.pd)?))
    }
}

/// Estimate relaxation time and PD maps
pub fn estimate(acquisition: &Acquisition, options: &FitOptions) -> Result<RelaxometryMaps> {
    estimate_with_progress(acquisition, options, |_, _| {})
}

/// [`estimate`] with a `(voxels_done, voxels_total)` progress callback
///
/// The callback is invoked from worker threads once per finished block.
pub fn estimate_with_progress<F>(
    acquisition: &Acquisition,
    options: &FitOptions,
    progress: F,
) -> Result<RelaxometryMaps>
where
    F: Fn(usize, usize) + Sync,
{
    let never = AtomicBool::new(false);
    estimate_cancellable(acquisition, options, &never, progress)
}

/// [`estimate_with_progress`] that stops when `cancel` is set
///
/// Cancellation is checked before each block; a cancelled sweep returns
/// [`RelaxError::Cancelled`] and its partial maps are dropped.
pub fn estimate_cancellable<F>(
    acquisition: &Acquisition,
    options: &FitOptions,
    cancel: &AtomicBool,
    progress: F,
) -> Result<RelaxometryMaps>
where
    F: Fn(usize, usize) + Sync,
{
    options.validate()?;

    let dims = acquisition.dims();
    let n_voxels = dims.0 * dims.1 * dims.2;
    let block = (dims.0 * dims.1).max(1);
    let signals = acquisition.signal_matrix();

    tracing::debug!(
        mode = %acquisition.mode(),
        voxels = n_voxels,
        acquisitions = acquisition.n_acquisitions(),
        threads = ?options.num_threads,
        "starting voxel sweep"
    );

    let mut relaxation = vec![0.0; n_voxels];
    let mut pd = vec![0.0; n_voxels];

    let sweep = Sweep {
        signals: &signals,
        model: acquisition.model(),
        mask: acquisition.mask(),
        options,
        cancel,
        progress: &progress,
        done: AtomicUsize::new(0),
        total: n_voxels,
        block,
    };

    let summary = match options.num_threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| {
                    RelaxError::Configuration(format!("failed to build worker pool: {}", e))
                })?;
            pool.install(|| sweep.run(&mut relaxation, &mut pd))?
        }
        None => sweep.run(&mut relaxation, &mut pd)?,
    };

    tracing::info!(
        mode = %acquisition.mode(),
        fitted = summary.fitted,
        masked_out = summary.masked_out,
        failed = summary.failed(),
        "voxel sweep finished"
    );
    if summary.failed() > 0 {
        tracing::warn!(
            degenerate = summary.degenerate,
            non_converged = summary.non_converged,
            non_finite = summary.non_finite,
            "{} voxels could not be fitted and were set to zero",
            summary.failed()
        );
    }

    Ok(RelaxometryMaps {
        mode: acquisition.mode(),
        relaxation,
        pd,
        dims,
        summary,
    })
}

struct Sweep<'a, F> {
    signals: &'a Array2<f64>,
    model: &'a SignalModel,
    mask: Option<&'a [u8]>,
    options: &'a FitOptions,
    cancel: &'a AtomicBool,
    progress: &'a F,
    done: AtomicUsize,
    total: usize,
    block: usize,
}

impl<F> Sweep<'_, F>
where
    F: Fn(usize, usize) + Sync,
{
    fn run(&self, relaxation: &mut [f64], pd: &mut [f64]) -> Result<FitSummary> {
        relaxation
            .par_chunks_mut(self.block)
            .zip(pd.par_chunks_mut(self.block))
            .enumerate()
            .map(|(b, (relax_out, pd_out))| self.fit_block(b * self.block, relax_out, pd_out))
            .try_reduce(FitSummary::default, |a, b| Ok(a.merge(b)))
    }

    fn fit_block(
        &self,
        start: usize,
        relax_out: &mut [f64],
        pd_out: &mut [f64],
    ) -> Result<FitSummary> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(RelaxError::Cancelled);
        }

        let mut summary = FitSummary {
            total_voxels: relax_out.len(),
            ..FitSummary::default()
        };

        for (offset, (r, p)) in relax_out.iter_mut().zip(pd_out.iter_mut()).enumerate() {
            let v = start + offset;
            if let Some(mask) = self.mask {
                if mask[v] == 0 {
                    summary.masked_out += 1;
                    continue;
                }
            }

            let row = self.signals.row(v);
            let owned;
            let signal = match row.as_slice() {
                Some(contiguous) => contiguous,
                None => {
                    owned = row.to_vec();
                    owned.as_slice()
                }
            };

            match fit_voxel(self.model, signal, self.options) {
                Ok(fit) => {
                    *r = fit.relaxation;
                    *p = fit.pd;
                    summary.fitted += 1;
                }
                Err(failure) => {
                    *r = 0.0;
                    *p = 0.0;
                    summary.record_failure(failure);
                }
            }
        }

        let finished = self.done.fetch_add(relax_out.len(), Ordering::Relaxed) + relax_out.len();
        (self.progress)(finished, self.total);
        Ok(summary)
    }
}
