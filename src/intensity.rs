//! Reference-volume intensity report
//!
//! Global range, physical placement, and foreground statistics of a single
//! volume. The foreground is everything above the lower of two multi-Otsu
//! thresholds (three classes).

use std::fmt;

use crate::error::{RelaxError, Result};
use crate::nifti_io::Volume;
use crate::utils::{multi_otsu_thresholds, RunningStats};

/// Histogram resolution used for the multi-Otsu split
pub const INTENSITY_BINS: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub struct IntensityReport {
    pub dims: (usize, usize, usize),
    pub min: f64,
    pub max: f64,
    pub origin: [f64; 3],
    /// World coordinates of voxel (0, 0, 0)
    pub first_voxel_center: [f64; 3],
    pub thresholds: Vec<f64>,
    pub foreground: RunningStats,
}

/// Summarise the intensities of `volume`
///
/// Fails with a data error when the thresholds leave no foreground voxel.
pub fn analyze_intensity(volume: &Volume) -> Result<IntensityReport> {
    let finite: Vec<f64> = volume.data.iter().cloned().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return Err(RelaxError::Data("volume contains no finite intensities".to_string()));
    }
    let all: RunningStats = finite.iter().cloned().collect();

    let thresholds = multi_otsu_thresholds(&finite, INTENSITY_BINS, 2);
    let lower = thresholds[0];
    let foreground: RunningStats = finite.iter().cloned().filter(|&v| v > lower).collect();
    if foreground.count() == 0 {
        return Err(RelaxError::Data("Otsu thresholds found no foreground voxels".to_string()));
    }

    tracing::debug!(?thresholds, foreground = foreground.count(), "intensity thresholds");

    Ok(IntensityReport {
        dims: volume.dims,
        min: all.min(),
        max: all.max(),
        origin: volume.metadata.origin,
        first_voxel_center: volume.metadata.index_to_physical([0.0, 0.0, 0.0]),
        thresholds,
        foreground,
    })
}

impl fmt::Display for IntensityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dimensions: {}x{}x{}", self.dims.0, self.dims.1, self.dims.2)?;
        writeln!(
            f,
            "Origin: ({:.4}, {:.4}, {:.4})",
            self.origin[0],
            self.origin[1],
            self.origin[2]
        )?;
        writeln!(
            f,
            "Center of first voxel: ({:.4}, {:.4}, {:.4})",
            self.first_voxel_center[0],
            self.first_voxel_center[1],
            self.first_voxel_center[2]
        )?;
        writeln!(f, "minVal: {}", self.min)?;
        writeln!(f, "maxVal: {}", self.max)?;
        let thresholds: Vec<String> = self.thresholds.iter().map(|t| format!("{:.4}", t)).collect();
        writeln!(f, "Thresholds: {}", thresholds.join(", "))?;
        writeln!(
            f,
            "Foreground: {} voxels, mean {:.4}, variance {:.4}, std dev {:.4}",
            self.foreground.count(),
            self.foreground.mean(),
            self.foreground.variance(),
            self.foreground.std_dev()
        )?;
        write!(f, "Foreground range: [{}, {}]", self.foreground.min(), self.foreground.max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::SpatialMetadata;

    /// Background of zeros, a dim ring at 100, and a bright core at 400
    fn phantom() -> Volume {
        let dims = (8, 8, 2);
        let mut data = vec![0.0; 128];
        for k in 0..2 {
            for j in 0..8 {
                for i in 0..8 {
                    let idx = i + j * 8 + k * 64;
                    if (2..6).contains(&i) && (2..6).contains(&j) {
                        data[idx] = 400.0;
                    } else if (1..7).contains(&i) && (1..7).contains(&j) {
                        data[idx] = 100.0;
                    }
                }
            }
        }
        let metadata = SpatialMetadata {
            origin: [-4.0, -4.0, 10.0],
            spacing: [0.5, 0.5, 2.0],
            ..SpatialMetadata::default()
        };
        Volume::new(data, dims, metadata).unwrap()
    }

    #[test]
    fn test_analyze_phantom() {
        let report = analyze_intensity(&phantom()).unwrap();

        assert_eq!(report.min, 0.0);
        assert_eq!(report.max, 400.0);
        assert_eq!(report.thresholds.len(), 2);
        assert_eq!(report.first_voxel_center, [-4.0, -4.0, 10.0]);

        // Ring (20 per slice) + core (16 per slice)
        assert_eq!(report.foreground.count(), 72);
        let expected_mean = (40.0 * 100.0 + 32.0 * 400.0) / 72.0;
        assert!((report.foreground.mean() - expected_mean).abs() < 1e-9);
        assert_eq!(report.foreground.min(), 100.0);
    }

    #[test]
    fn test_constant_volume_has_no_foreground() {
        let volume = Volume::new(vec![3.0; 8], (2, 2, 2), SpatialMetadata::default()).unwrap();
        assert!(matches!(analyze_intensity(&volume), Err(RelaxError::Data(_))));
    }

    #[test]
    fn test_report_display() {
        let text = analyze_intensity(&phantom()).unwrap().to_string();
        assert!(text.contains("minVal: 0"));
        assert!(text.contains("maxVal: 400"));
        assert!(text.contains("Foreground: 72 voxels"));
    }
}
