//! Closed-form relaxometry signal models
//!
//! T1: `S(TI, α) = PD · (1 − (1 − cos α) · exp(−TI / T1))`
//!
//! With α = 180° this is inversion recovery, `PD · (1 − 2·exp(−TI/T1))`;
//! with α = 90° it reduces to saturation recovery, `PD · (1 − exp(−TI/T1))`.
//! No repetition-time term is modelled.
//!
//! T2: `S(TE) = PD · exp(−TE / T2)`
//!
//! The solver works on `(PD, ln T)`, so derivatives are taken with respect
//! to the log relaxation time.

use crate::acquisition::MappingMode;

#[derive(Clone, Debug, PartialEq)]
pub enum SignalModel {
    /// Flip angles in radians, one per inversion time.
    InversionRecovery {
        inversion_times: Vec<f64>,
        flip_angles: Vec<f64>,
    },
    MonoExponential {
        echo_times: Vec<f64>,
    },
}

impl SignalModel {
    pub fn mode(&self) -> MappingMode {
        match self {
            SignalModel::InversionRecovery { .. } => MappingMode::T1,
            SignalModel::MonoExponential { .. } => MappingMode::T2,
        }
    }

    /// Acquisition time per sample (TI or TE)
    pub fn times(&self) -> &[f64] {
        match self {
            SignalModel::InversionRecovery { inversion_times, .. } => inversion_times,
            SignalModel::MonoExponential { echo_times } => echo_times,
        }
    }

    pub fn len(&self) -> usize {
        self.times().len()
    }

    pub fn is_empty(&self) -> bool {
        self.times().is_empty()
    }

    /// Signal of sample `i` for proton density `pd` and relaxation time `t`
    #[inline]
    pub fn evaluate(&self, i: usize, pd: f64, t: f64) -> f64 {
        match self {
            SignalModel::InversionRecovery { inversion_times, flip_angles } => {
                let k = 1.0 - flip_angles[i].cos();
                pd * (1.0 - k * (-inversion_times[i] / t).exp())
            }
            SignalModel::MonoExponential { echo_times } => pd * (-echo_times[i] / t).exp(),
        }
    }

    /// Partial derivatives of sample `i` with respect to `pd` and `ln t`
    #[inline]
    pub fn gradient(&self, i: usize, pd: f64, t: f64) -> (f64, f64) {
        match self {
            SignalModel::InversionRecovery { inversion_times, flip_angles } => {
                let ti = inversion_times[i];
                let k = 1.0 - flip_angles[i].cos();
                let e = (-ti / t).exp();
                (1.0 - k * e, -pd * k * e * ti / t)
            }
            SignalModel::MonoExponential { echo_times } => {
                let te = echo_times[i];
                let e = (-te / t).exp();
                (e, pd * e * te / t)
            }
        }
    }

    /// Forward-simulate the whole signal vector
    pub fn simulate(&self, pd: f64, t: f64) -> Vec<f64> {
        (0..self.len()).map(|i| self.evaluate(i, pd, t)).collect()
    }

    /// Starting point for the fit: `(pd, t)`
    ///
    /// T1: PD starts at the largest observed magnitude and the relaxation
    /// time mid-range of TI. T2: a log-linear fit through the two shortest
    /// echoes, falling back to the shortest-echo intensity and mid-range TE
    /// when those samples do not decay.
    pub fn initial_guess(&self, signal: &[f64]) -> (f64, f64) {
        let times = self.times();
        let max_abs = signal.iter().fold(0.0f64, |m, &s| m.max(s.abs()));

        let t_min = times.iter().cloned().fold(f64::INFINITY, f64::min);
        let t_max = times.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut t0 = 0.5 * (t_min + t_max);
        if !(t0 > 0.0) {
            t0 = if t_max > 0.0 { t_max } else { 1.0 };
        }

        match self {
            SignalModel::InversionRecovery { .. } => (max_abs, t0),
            SignalModel::MonoExponential { echo_times } => {
                let mut order: Vec<usize> = (0..echo_times.len()).collect();
                order.sort_by(|&a, &b| {
                    echo_times[a]
                        .partial_cmp(&echo_times[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

                let first = order.first().map(|&i| signal[i]).unwrap_or(max_abs);
                if let Some(seed) = log_linear_seed(echo_times, signal, &order) {
                    return seed;
                }
                if first > 0.0 {
                    (first, t0)
                } else {
                    (max_abs, t0)
                }
            }
        }
    }
}

/// Exact mono-exponential through the two shortest echoes, if they decay
fn log_linear_seed(echo_times: &[f64], signal: &[f64], order: &[usize]) -> Option<(f64, f64)> {
    let (&a, &b) = (order.first()?, order.get(1)?);
    let (te_a, te_b) = (echo_times[a], echo_times[b]);
    let (s_a, s_b) = (signal[a], signal[b]);
    if !(te_b > te_a && s_b > 0.0 && s_a > s_b) {
        return None;
    }

    let t = (te_b - te_a) / (s_a / s_b).ln();
    let pd = s_a * (te_a / t).exp();
    if t > 0.0 && t.is_finite() && pd.is_finite() {
        Some((pd, t))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn ir(tis: &[f64], fa_deg: f64) -> SignalModel {
        SignalModel::InversionRecovery {
            inversion_times: tis.to_vec(),
            flip_angles: vec![fa_deg.to_radians(); tis.len()],
        }
    }

    #[test]
    fn test_inversion_recovery_limits() {
        let model = ir(&[0.0, 1e9], 180.0);
        // Fully inverted at TI = 0, fully recovered at TI -> inf
        assert!((model.evaluate(0, 1000.0, 800.0) + 1000.0).abs() < 1e-9);
        assert!((model.evaluate(1, 1000.0, 800.0) - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_saturation_recovery_form() {
        let model = ir(&[500.0], 90.0);
        let expected = 1000.0 * (1.0 - (-500.0f64 / 1000.0).exp());
        assert!((model.evaluate(0, 1000.0, 1000.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_inversion_recovery_null_point() {
        // Signal crosses zero at TI = T1 ln 2
        let t1 = 900.0;
        let model = ir(&[t1 * 2f64.ln()], 180.0);
        assert!(model.evaluate(0, 1.0, t1).abs() < 1e-12);
    }

    #[test]
    fn test_mono_exponential() {
        let model = SignalModel::MonoExponential {
            echo_times: vec![0.0, 50.0],
        };
        assert!((model.evaluate(0, 1000.0, 50.0) - 1000.0).abs() < 1e-12);
        assert!((model.evaluate(1, 1000.0, 50.0) - 1000.0 / std::f64::consts::E).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let models = [
            ir(&[100.0, 400.0, 1200.0], 160.0),
            SignalModel::MonoExponential {
                echo_times: vec![10.0, 30.0, 70.0],
            },
        ];
        let (pd, t) = (850.0, 420.0);
        let h = 1e-6;

        for model in &models {
            for i in 0..model.len() {
                let (d_pd, d_log_t) = model.gradient(i, pd, t);
                let fd_pd =
                    (model.evaluate(i, pd + h, t) - model.evaluate(i, pd - h, t)) / (2.0 * h);
                let u = t.ln();
                let fd_log_t = (model.evaluate(i, pd, (u + h).exp())
                    - model.evaluate(i, pd, (u - h).exp())) / (2.0 * h);
                assert!((d_pd - fd_pd).abs() < 1e-5, "d/dPD mismatch: {} vs {}", d_pd, fd_pd);
                assert!((d_log_t - fd_log_t).abs() < 1e-3 * (1.0 + fd_log_t.abs()),
                    "d/dlnT mismatch: {} vs {}", d_log_t, fd_log_t);
            }
        }
    }

    #[test]
    fn test_initial_guess_t2_log_linear_from_shortest_echoes() {
        let model = SignalModel::MonoExponential {
            echo_times: vec![30.0, 10.0, 50.0],
        };
        let (pd0, t0) = model.initial_guess(&[500.0, 800.0, 300.0]);
        let expected_t = 20.0 / 1.6f64.ln();
        assert!((t0 - expected_t).abs() < 1e-9, "t0 {}", t0);
        assert!((pd0 - 800.0 * (10.0 / expected_t).exp()).abs() < 1e-9, "pd0 {}", pd0);
    }

    #[test]
    fn test_initial_guess_t2_exact_for_short_t2() {
        // T2 far below the echo spacing: the seed already sits on the optimum
        let model = SignalModel::MonoExponential {
            echo_times: vec![10.0, 30.0, 50.0, 70.0],
        };
        let (pd0, t0) = model.initial_guess(&model.simulate(1000.0, 2.0));
        assert!((t0 - 2.0).abs() < 1e-9, "t0 {}", t0);
        assert!((pd0 - 1000.0).abs() < 1e-6, "pd0 {}", pd0);
    }

    #[test]
    fn test_initial_guess_t2_falls_back_without_decay() {
        let model = SignalModel::MonoExponential {
            echo_times: vec![10.0, 30.0, 50.0],
        };
        let (pd0, t0) = model.initial_guess(&[400.0, 600.0, 300.0]);
        assert_eq!(pd0, 400.0);
        assert_eq!(t0, 30.0);
    }

    #[test]
    fn test_initial_guess_t1_uses_max_magnitude() {
        let model = SignalModel::InversionRecovery {
            inversion_times: vec![100.0, 2100.0],
            flip_angles: vec![PI, PI],
        };
        let (pd0, t0) = model.initial_guess(&[-700.0, 650.0]);
        assert_eq!(pd0, 700.0);
        assert_eq!(t0, 1100.0);
    }
}
