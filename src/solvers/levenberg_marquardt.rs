//! Bounded Levenberg–Marquardt for two-parameter relaxometry fits
//!
//! Parameters are `θ = (PD, ln T)`. PD ≥ 0 is enforced by projection and
//! the log relaxation time is clamped to `[ln MIN_RELAXATION_TIME, ln t_max]`.
//! Damping follows Marquardt's diagonal scaling, so PD (hundreds to
//! thousands) and ln T (order one) need no manual rescaling.
//!
//! A Huber loss is handled by iteratively reweighting the normal equations.
//!
//! Reference:
//! Marquardt, D.W. (1963). "An Algorithm for Least-Squares Estimation of
//! Nonlinear Parameters." SIAM J. Appl. Math., 11(2):431-441.

use nalgebra::{Matrix2, Vector2};

use super::{FitFailure, FitOptions, Loss, MIN_RELAXATION_TIME};
use crate::models::SignalModel;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e12;

/// Converged estimate for one voxel
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelFit {
    pub pd: f64,
    pub relaxation: f64,
    /// Outer iterations used
    pub iterations: usize,
    /// Final loss value
    pub cost: f64,
}

#[inline]
fn loss_value(loss: Loss, r: f64) -> f64 {
    match loss {
        Loss::SquaredError => 0.5 * r * r,
        Loss::Huber { delta } => {
            let a = r.abs();
            if a <= delta {
                0.5 * r * r
            } else {
                delta * (a - 0.5 * delta)
            }
        }
    }
}

#[inline]
fn loss_weight(loss: Loss, r: f64) -> f64 {
    match loss {
        Loss::SquaredError => 1.0,
        Loss::Huber { delta } => {
            let a = r.abs();
            if a <= delta {
                1.0
            } else {
                delta / a
            }
        }
    }
}

struct Bounds {
    log_t_min: f64,
    log_t_max: f64,
}

impl Bounds {
    #[inline]
    fn project(&self, theta: Vector2<f64>) -> Vector2<f64> {
        Vector2::new(theta[0].max(0.0), theta[1].clamp(self.log_t_min, self.log_t_max))
    }
}

fn total_cost(model: &SignalModel, signal: &[f64], loss: Loss, theta: &Vector2<f64>) -> f64 {
    let t = theta[1].exp();
    signal
        .iter()
        .enumerate()
        .map(|(i, &s)| loss_value(loss, model.evaluate(i, theta[0], t) - s))
        .sum()
}

/// Fit PD and the relaxation time of one voxel
///
/// # Arguments
/// * `model` - Signal model holding the acquisition parameters
/// * `signal` - Observed intensities, one per acquisition
/// * `options` - Loss, tolerance, iteration cap and relaxation time bound
///
/// # Returns
/// The estimate, or the reason the voxel should receive the zero sentinel
pub fn fit_voxel(
    model: &SignalModel,
    signal: &[f64],
    options: &FitOptions,
) -> Result<VoxelFit, FitFailure> {
    if signal.len() != model.len() || signal.len() < 2 {
        return Err(FitFailure::Degenerate);
    }
    if signal.iter().any(|s| !s.is_finite()) {
        return Err(FitFailure::NonFinite);
    }

    let max_abs = signal.iter().fold(0.0f64, |m, &s| m.max(s.abs()));
    let min = signal.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_abs == 0.0 || max - min <= 1e-12 * max_abs {
        return Err(FitFailure::Degenerate);
    }

    let loss = options.loss;
    let tol = options.tolerance;
    let bounds = Bounds {
        log_t_min: MIN_RELAXATION_TIME.ln(),
        log_t_max: options.t_max.ln(),
    };
    // Cost this small is an exact fit up to rounding
    let exact_cost = 1e-28 * signal.iter().map(|s| s * s).sum::<f64>();

    let (pd0, t0) = model.initial_guess(signal);
    let mut theta = bounds.project(Vector2::new(pd0, t0.ln()));
    let mut cost = total_cost(model, signal, loss, &theta);
    if !cost.is_finite() {
        return Err(FitFailure::NonFinite);
    }
    let mut lambda = LAMBDA_INIT;

    for iteration in 1..=options.max_iterations {
        if cost <= exact_cost {
            return finish(theta, cost, iteration - 1);
        }

        let t = theta[1].exp();
        let mut h = Matrix2::<f64>::zeros();
        let mut g = Vector2::<f64>::zeros();
        for (i, &s) in signal.iter().enumerate() {
            let r = model.evaluate(i, theta[0], t) - s;
            let (d_pd, d_log_t) = model.gradient(i, theta[0], t);
            let j = Vector2::new(d_pd, d_log_t);
            let w = loss_weight(loss, r);
            h += w * (j * j.transpose());
            g += w * r * j;
        }

        let diag_floor = (1e-12 * (h[(0, 0)] + h[(1, 1)])).max(f64::MIN_POSITIVE);
        let damping = Vector2::new(h[(0, 0)].max(diag_floor), h[(1, 1)].max(diag_floor));

        let mut converged = false;
        loop {
            let mut a = h;
            a[(0, 0)] += lambda * damping[0];
            a[(1, 1)] += lambda * damping[1];

            let step = match a.lu().solve(&(-g)) {
                Some(step) if step[0].is_finite() && step[1].is_finite() => step,
                _ => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        converged = true;
                        break;
                    }
                    continue;
                }
            };

            let candidate = bounds.project(theta + step);
            let new_cost = total_cost(model, signal, loss, &candidate);
            if new_cost.is_finite() && new_cost < cost {
                let moved = candidate - theta;
                let small_step = moved[0].abs() <= tol * (candidate[0].abs() + tol)
                    && moved[1].abs() <= tol * (1.0 + candidate[1].abs());
                let small_drop = cost - new_cost <= tol * cost;

                theta = candidate;
                cost = new_cost;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                converged = small_step || small_drop;
                break;
            }

            // No descent even with heavy damping: stationary within the bounds
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                converged = true;
                break;
            }
        }

        if converged {
            return finish(theta, cost, iteration);
        }
    }

    if cost <= exact_cost {
        return finish(theta, cost, options.max_iterations);
    }
    Err(FitFailure::NonConvergence)
}

fn finish(theta: Vector2<f64>, cost: f64, iterations: usize) -> Result<VoxelFit, FitFailure> {
    let pd = theta[0];
    let relaxation = theta[1].exp();
    if !pd.is_finite() || !relaxation.is_finite() || !cost.is_finite() {
        return Err(FitFailure::NonFinite);
    }
    Ok(VoxelFit {
        pd,
        relaxation,
        iterations,
        cost,
    })
}
