//! Common test utilities for relaxometry-core integration tests

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use relaxometry_core::models::SignalModel;
use relaxometry_core::{SpatialMetadata, Volume};

/// Root-mean-square of `a - b` over voxels where `mask` is non-zero
pub fn masked_rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let (sum_sq, count) = a
        .iter()
        .zip(b)
        .zip(mask)
        .filter(|(_, &m)| m > 0)
        .fold((0.0, 0usize), |(sum, n), ((&x, &y), _)| (sum + (x - y) * (x - y), n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Mean of |a - b| / |b| within mask
pub fn mean_relative_error(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 && b[i] != 0.0 {
            sum += ((a[i] - b[i]) / b[i]).abs();
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    sum / count as f64
}

/// Largest |a - b| / |b| within mask
pub fn max_relative_error(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    a.iter()
        .zip(b)
        .zip(mask)
        .filter(|((_, &t), &m)| m > 0 && t != 0.0)
        .map(|((&x, &t), _)| ((x - t) / t).abs())
        .fold(0.0, f64::max)
}

/// Oblique-ish metadata so copies are easy to tell apart from the default
pub fn test_metadata() -> SpatialMetadata {
    SpatialMetadata {
        origin: [-12.5, 30.0, 4.25],
        spacing: [1.5, 1.5, 3.0],
        ..SpatialMetadata::default()
    }
}

/// Ground-truth maps with a smooth ramp of PD and relaxation time
///
/// Returns `(pd, t)` flattened in Fortran order.
pub fn ramp_maps(
    dims: (usize, usize, usize),
    pd_range: (f64, f64),
    t_range: (f64, f64),
) -> (Vec<f64>, Vec<f64>) {
    let (nx, ny, nz) = dims;
    let n = nx * ny * nz;
    let mut pd = vec![0.0; n];
    let mut t = vec![0.0; n];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let idx = i + j * nx + k * nx * ny;
                let u = i as f64 / (nx.max(2) - 1) as f64;
                let v = (j + k * ny) as f64 / ((ny * nz).max(2) - 1) as f64;
                pd[idx] = pd_range.0 + (pd_range.1 - pd_range.0) * u;
                t[idx] = t_range.0 + (t_range.1 - t_range.0) * v;
            }
        }
    }
    (pd, t)
}

/// Forward-simulate one volume per acquisition from the ground-truth maps
///
/// # Arguments
/// * `model` - Signal model with resolved times (and flip angles in radians)
/// * `pd`, `t` - Ground-truth maps
/// * `dims` - Volume dimensions
/// * `noise_sigma` - Standard deviation of additive Gaussian noise (0 for none)
/// * `seed` - RNG seed for reproducible noise
pub fn synthesize_volumes(
    model: &SignalModel,
    pd: &[f64],
    t: &[f64],
    dims: (usize, usize, usize),
    noise_sigma: f64,
    seed: u64,
) -> Vec<Volume> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_sigma.max(0.0)).unwrap();

    (0..model.len())
        .map(|a| {
            let data: Vec<f64> = pd
                .iter()
                .zip(t)
                .map(|(&p, &tv)| {
                    let clean = model.evaluate(a, p, tv);
                    if noise_sigma > 0.0 {
                        clean + noise.sample(&mut rng)
                    } else {
                        clean
                    }
                })
                .collect();
            Volume::new(data, dims, test_metadata()).unwrap()
        })
        .collect()
}

/// All-ones mask
pub fn full_mask(n: usize) -> Vec<u8> {
    vec![1u8; n]
}
