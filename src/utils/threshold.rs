//! Automatic thresholding algorithms
//!
//! Otsu's method and its multi-threshold generalisation on a fixed-width
//! histogram. Thresholds are returned as bin edges in data units.

/// Multi-level Otsu thresholds
///
/// Splits the histogram into `n_thresholds + 1` classes so that the
/// between-class variance is maximal, by exhaustive search over bin
/// boundaries. Practical for a few thresholds on a few hundred bins.
///
/// # Arguments
/// * `data` - Input intensities (e.g. a flattened 3D image)
/// * `num_bins` - Number of histogram bins (ITK uses 128)
/// * `n_thresholds` - Number of thresholds (2 gives three classes)
///
/// # Returns
/// Ascending thresholds; a value `v` belongs to class `c` when it lies above
/// exactly `c` of them. Empty input gives zeros; constant input gives the
/// constant.
pub fn multi_otsu_thresholds(data: &[f64], num_bins: usize, n_thresholds: usize) -> Vec<f64> {
    if n_thresholds == 0 {
        return Vec::new();
    }
    if data.is_empty() {
        return vec![0.0; n_thresholds];
    }

    let finite = data.iter().cloned().filter(|v| v.is_finite());
    let (min_val, max_val) =
        finite.fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min_val > max_val || (max_val - min_val).abs() < 1e-10 {
        let level = if min_val > max_val { 0.0 } else { min_val };
        return vec![level; n_thresholds];
    }

    let num_bins = num_bins.max(n_thresholds + 1);
    let bin_width = (max_val - min_val) / num_bins as f64;
    let mut histogram = vec![0usize; num_bins];
    for &v in data.iter().filter(|v| v.is_finite()) {
        let bin = ((v - min_val) / bin_width).floor() as usize;
        histogram[bin.min(num_bins - 1)] += 1;
    }

    // Prefix sums of counts and of bin-index moments
    let mut count_prefix = vec![0.0; num_bins + 1];
    let mut moment_prefix = vec![0.0; num_bins + 1];
    for (i, &c) in histogram.iter().enumerate() {
        count_prefix[i + 1] = count_prefix[i] + c as f64;
        moment_prefix[i + 1] = moment_prefix[i] + i as f64 * c as f64;
    }

    let search = ClassSearch {
        count_prefix: &count_prefix,
        moment_prefix: &moment_prefix,
        num_bins,
    };
    let mut boundaries = vec![0usize; n_thresholds];
    let mut best = vec![0usize; n_thresholds];
    let mut best_score = f64::NEG_INFINITY;
    search.recurse(0, 0, 0.0, &mut boundaries, &mut best, &mut best_score);

    best.iter().map(|&b| min_val + b as f64 * bin_width).collect()
}

struct ClassSearch<'a> {
    count_prefix: &'a [f64],
    moment_prefix: &'a [f64],
    num_bins: usize,
}

impl ClassSearch<'_> {
    /// Sum of squared class moments over class weights for bins `[lo, hi)`
    fn class_score(&self, lo: usize, hi: usize) -> f64 {
        let w = self.count_prefix[hi] - self.count_prefix[lo];
        if w <= 0.0 {
            return 0.0;
        }
        let m = self.moment_prefix[hi] - self.moment_prefix[lo];
        m * m / w
    }

    fn recurse(
        &self,
        depth: usize,
        lo: usize,
        partial: f64,
        boundaries: &mut [usize],
        best: &mut [usize],
        best_score: &mut f64,
    ) {
        let n = boundaries.len();
        if depth == n {
            let score = partial + self.class_score(lo, self.num_bins);
            if score > *best_score {
                *best_score = score;
                best.copy_from_slice(boundaries);
            }
            return;
        }

        // Leave at least one bin for each remaining class
        let remaining = n - depth;
        for b in (lo + 1)..=(self.num_bins - remaining) {
            boundaries[depth] = b;
            let score = partial + self.class_score(lo, b);
            self.recurse(depth + 1, b, score, boundaries, best, best_score);
        }
    }
}

/// Otsu's method for a single threshold
pub fn otsu_threshold(data: &[f64], num_bins: usize) -> f64 {
    multi_otsu_thresholds(data, num_bins, 1)[0]
}
