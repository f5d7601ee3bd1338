//! Acquisition parameters and the validated volume stack
//!
//! Everything that can make a run fatal (missing parameters, count
//! mismatches, inconsistent shapes) is checked here, before a single voxel
//! is fitted.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;

use crate::error::{RelaxError, Result};
use crate::models::SignalModel;
use crate::nifti_io::Volume;

/// Which relaxation time is mapped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MappingMode {
    /// Inversion/saturation recovery over inversion times
    T1,
    /// Mono-exponential decay over echo times
    T2,
}

impl MappingMode {
    pub fn label(&self) -> &'static str {
        match self {
            MappingMode::T1 => "T1",
            MappingMode::T2 => "T2",
        }
    }
}

impl fmt::Display for MappingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MappingMode {
    type Err = RelaxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "T1" => Ok(MappingMode::T1),
            "T2" => Ok(MappingMode::T2),
            other => Err(RelaxError::Configuration(format!(
                "unknown mapping mode '{}', expected T1 or T2",
                other
            ))),
        }
    }
}

/// Parse a comma separated list of numbers, e.g. `"10, 30,50"`
pub fn parse_param_list(s: &str) -> Result<Vec<f64>> {
    let values = s
        .split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| {
                RelaxError::Configuration(format!("'{}' is not a number in list '{}'", tok, s))
            })
        })
        .collect::<Result<Vec<f64>>>()?;

    if values.is_empty() {
        return Err(RelaxError::Configuration(format!("empty parameter list '{}'", s)));
    }
    Ok(values)
}

/// Raw per-acquisition parameters, before they are matched to the volumes
///
/// Times share one unit (typically ms) and the fitted relaxation time comes
/// back in that unit. Flip angles are in degrees.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquisitionParams {
    T1 {
        inversion_times: Vec<f64>,
        flip_angles_deg: Vec<f64>,
    },
    T2 {
        echo_times: Vec<f64>,
    },
}

impl AcquisitionParams {
    pub fn t1(inversion_times: Vec<f64>, flip_angles_deg: Vec<f64>) -> Self {
        AcquisitionParams::T1 {
            inversion_times,
            flip_angles_deg,
        }
    }

    pub fn t2(echo_times: Vec<f64>) -> Self {
        AcquisitionParams::T2 { echo_times }
    }

    /// Build parameters from optional command-line style inputs
    ///
    /// T1 mapping needs inversion times and flip angles; T2 mapping needs
    /// echo times. Anything else is a configuration error.
    pub fn from_options(
        mode: Option<MappingMode>,
        inversion_times: Option<Vec<f64>>,
        echo_times: Option<Vec<f64>>,
        flip_angles_deg: Option<Vec<f64>>,
    ) -> Result<Self> {
        let mode = mode.ok_or_else(|| {
            RelaxError::Configuration("a mapping mode (T1 or T2) must be specified".to_string())
        })?;

        match mode {
            MappingMode::T1 => {
                let ti = inversion_times.ok_or_else(|| {
                    RelaxError::Configuration(
                        "T1 mapping requires inversion times (--TI)".to_string(),
                    )
                })?;
                let fa = flip_angles_deg.ok_or_else(|| {
                    RelaxError::Configuration(
                        "T1 mapping requires flip angles (--flip-angle)".to_string(),
                    )
                })?;
                if echo_times.is_some() {
                    tracing::warn!("echo times are ignored for T1 mapping");
                }
                Ok(AcquisitionParams::t1(ti, fa))
            }
            MappingMode::T2 => {
                let te = echo_times.ok_or_else(|| {
                    RelaxError::Configuration("T2 mapping requires echo times (--TE)".to_string())
                })?;
                if inversion_times.is_some() || flip_angles_deg.is_some() {
                    tracing::warn!("inversion times and flip angles are ignored for T2 mapping");
                }
                Ok(AcquisitionParams::t2(te))
            }
        }
    }

    pub fn mode(&self) -> MappingMode {
        match self {
            AcquisitionParams::T1 { .. } => MappingMode::T1,
            AcquisitionParams::T2 { .. } => MappingMode::T2,
        }
    }

    /// Match the parameters against `n` volumes and build the signal model
    ///
    /// A single flip angle is broadcast to all acquisitions.
    pub fn resolve(&self, n: usize) -> Result<SignalModel> {
        if n < 2 {
            return Err(RelaxError::Configuration(format!(
                "at least 2 acquisitions are needed to fit PD and {}, got {}",
                self.mode(),
                n
            )));
        }

        match self {
            AcquisitionParams::T1 {
                inversion_times,
                flip_angles_deg,
            } => {
                if inversion_times.len() != n {
                    return Err(RelaxError::Configuration(format!(
                        "{} inversion times given for {} volumes",
                        inversion_times.len(),
                        n
                    )));
                }
                let flip_angles_deg = match flip_angles_deg.len() {
                    1 => vec![flip_angles_deg[0]; n],
                    len if len == n => flip_angles_deg.clone(),
                    len => {
                        return Err(RelaxError::Configuration(format!(
                            "{} flip angles given for {} volumes (expected 1 or {})",
                            len,
                            n,
                            n
                        )))
                    }
                };
                check_times("inversion time", inversion_times)?;
                if let Some(bad) = flip_angles_deg.iter().find(|a| !a.is_finite()) {
                    return Err(RelaxError::Configuration(format!("invalid flip angle {}", bad)));
                }
                Ok(SignalModel::InversionRecovery {
                    inversion_times: inversion_times.clone(),
                    flip_angles: flip_angles_deg.iter().map(|a| a.to_radians()).collect(),
                })
            }
            AcquisitionParams::T2 { echo_times } => {
                if echo_times.len() != n {
                    return Err(RelaxError::Configuration(format!(
                        "{} echo times given for {} volumes",
                        echo_times.len(),
                        n
                    )));
                }
                check_times("echo time", echo_times)?;
                Ok(SignalModel::MonoExponential {
                    echo_times: echo_times.clone(),
                })
            }
        }
    }
}

fn check_times(what: &str, times: &[f64]) -> Result<()> {
    if let Some(bad) = times.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(RelaxError::Configuration(format!("invalid {} {}", what, bad)));
    }
    let min = times.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = times.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        return Err(RelaxError::Configuration(format!(
            "all {}s are equal ({}), nothing to fit", what, min
        )));
    }
    Ok(())
}

/// Binary mask from a label or probability volume (> 0.5 is inside)
pub fn mask_from_volume(volume: &Volume) -> Vec<u8> {
    volume.data.iter().map(|&v| if v > 0.5 { 1 } else { 0 }).collect()
}

/// A validated stack of co-registered volumes with matching parameters
#[derive(Debug)]
pub struct Acquisition {
    volumes: Vec<Volume>,
    model: SignalModel,
    mask: Option<Vec<u8>>,
}

impl Acquisition {
    /// Validate parameter counts first, then volume shapes.
    pub fn new(volumes: Vec<Volume>, params: AcquisitionParams) -> Result<Self> {
        let model = params.resolve(volumes.len())?;

        let reference = &volumes[0];
        for (i, volume) in volumes.iter().enumerate() {
            if volume.dims != reference.dims {
                return Err(RelaxError::Data(format!(
                    "volume {} has shape {:?}, expected {:?}",
                    i,
                    volume.dims,
                    reference.dims
                )));
            }
            if volume.data.len() != volume.n_voxels() {
                return Err(RelaxError::Data(format!(
                    "volume {} holds {} voxels but its shape {:?} needs {}",
                    i, volume.data.len(), volume.dims, volume.n_voxels()
                )));
            }
            if !metadata_close(volume, reference) {
                tracing::warn!(volume = i, "spatial metadata differs from the reference volume");
            }
        }

        Ok(Acquisition {
            volumes,
            model,
            mask: None,
        })
    }

    /// Restrict fitting to voxels where `mask` is non-zero
    pub fn with_mask(mut self, mask: Vec<u8>) -> Result<Self> {
        let n = self.volumes[0].n_voxels();
        if mask.len() != n {
            return Err(RelaxError::Data(format!(
                "mask has {} voxels, volumes have {}",
                mask.len(),
                n
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn mode(&self) -> MappingMode {
        self.model.mode()
    }

    pub fn model(&self) -> &SignalModel {
        &self.model
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// The first volume; outputs inherit its spatial metadata.
    pub fn reference(&self) -> &Volume {
        &self.volumes[0]
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.volumes[0].dims
    }

    pub fn n_acquisitions(&self) -> usize {
        self.volumes.len()
    }

    pub fn mask(&self) -> Option<&[u8]> {
        self.mask.as_deref()
    }

    /// Stack the volumes into one row per voxel: shape `(n_voxels, n_acquisitions)`
    pub fn signal_matrix(&self) -> Array2<f64> {
        let n_voxels = self.volumes[0].n_voxels();
        Array2::from_shape_fn((n_voxels, self.volumes.len()), |(v, a)| self.volumes[a].data[v])
    }
}

fn metadata_close(a: &Volume, b: &Volume) -> bool {
    const TOL: f64 = 1e-4;
    let (ma, mb) = (&a.metadata, &b.metadata);
    ma.origin.iter().zip(&mb.origin).all(|(x, y)| (x - y).abs() <= TOL * (1.0 + y.abs()))
        && ma.spacing.iter().zip(&mb.spacing).all(|(x, y)| (x - y).abs() <= TOL * (1.0 + y.abs()))
        && ma.direction.iter().zip(&mb.direction).all(|(x, y)| (x - y).abs() <= TOL)
}
