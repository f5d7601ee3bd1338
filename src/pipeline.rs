//! End-to-end mapping run: read, validate, estimate, write
//!
//! Every input (and the optional mask) is read and validated before fitting
//! starts, and outputs are written only after the sweep succeeds, so a
//! configuration or data error never leaves partial output files behind.

use std::path::{Path, PathBuf};

use crate::acquisition::{mask_from_volume, Acquisition, AcquisitionParams, MappingMode};
use crate::error::{RelaxError, Result};
use crate::estimator::{estimate_with_progress, FitSummary};
use crate::nifti_io::{self, Volume};
use crate::solvers::FitOptions;

/// Where volumes come from and go to
pub trait VolumeStore {
    fn read_volume(&self, path: &Path) -> Result<Volume>;
    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<()>;
}

/// NIfTI files on the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct NiftiStore;

impl VolumeStore for NiftiStore {
    fn read_volume(&self, path: &Path) -> Result<Volume> {
        nifti_io::read_volume(path)
    }

    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<()> {
        nifti_io::write_volume(volume, path)
    }
}

/// Destination of the two output maps
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub relaxation: PathBuf,
    pub pd: PathBuf,
}

impl OutputPaths {
    /// `<dir>/<prefix>T1map.nii.gz` (or `T2map`) and `<dir>/<prefix>PDmap.nii.gz`
    pub fn in_dir(dir: &Path, prefix: &str, mode: MappingMode) -> Self {
        OutputPaths {
            relaxation: dir.join(format!("{}{}map.nii.gz", prefix, mode.label())),
            pd: dir.join(format!("{}PDmap.nii.gz", prefix)),
        }
    }
}

/// One mapping run
#[derive(Clone, Debug)]
pub struct MappingJob {
    /// Inputs in acquisition order; the first is the spatial reference
    pub inputs: Vec<PathBuf>,
    pub params: AcquisitionParams,
    pub mask: Option<PathBuf>,
    pub options: FitOptions,
    pub outputs: OutputPaths,
}

/// Parameter counts and fit options, checked without touching any file
pub fn validate_job(job: &MappingJob) -> Result<()> {
    job.params.resolve(job.inputs.len())?;
    job.options.validate()
}

/// Run a mapping job against `store`
pub fn run_mapping<S, F>(store: &S, job: &MappingJob, progress: F) -> Result<FitSummary>
where
    S: VolumeStore + ?Sized,
    F: Fn(usize, usize) + Sync,
{
    validate_job(job)?;

    tracing::info!(
        mode = %job.params.mode(),
        inputs = job.inputs.len(),
        "reading acquisition"
    );
    let volumes = job
        .inputs
        .iter()
        .map(|path| {
            tracing::debug!(path = %path.display(), "reading volume");
            store.read_volume(path)
        })
        .collect::<Result<Vec<Volume>>>()?;

    let mut acquisition = Acquisition::new(volumes, job.params.clone())?;
    if let Some(mask_path) = &job.mask {
        let mask_volume = store.read_volume(mask_path)?;
        if mask_volume.dims != acquisition.dims() {
            return Err(RelaxError::Data(format!(
                "mask shape {:?} does not match volume shape {:?}",
                mask_volume.dims,
                acquisition.dims()
            )));
        }
        acquisition = acquisition.with_mask(mask_from_volume(&mask_volume))?;
    }

    let maps = estimate_with_progress(&acquisition, &job.options, progress)?;
    let summary = maps.summary;
    let (relaxation, pd) = maps.into_volumes(acquisition.reference())?;

    store.write_volume(&relaxation, &job.outputs.relaxation)?;
    store.write_volume(&pd, &job.outputs.pd)?;
    tracing::info!(
        relaxation = %job.outputs.relaxation.display(),
        pd = %job.outputs.pd.display(),
        "maps written"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalModel;
    use crate::nifti_io::SpatialMetadata;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        volumes: HashMap<PathBuf, Volume>,
        reads: RefCell<Vec<PathBuf>>,
        writes: RefCell<HashMap<PathBuf, Volume>>,
    }

    impl VolumeStore for MemoryStore {
        fn read_volume(&self, path: &Path) -> Result<Volume> {
            self.reads.borrow_mut().push(path.to_path_buf());
            self.volumes.get(path).cloned().ok_or_else(|| {
                RelaxError::io(path, std::io::Error::from(std::io::ErrorKind::NotFound))
            })
        }

        fn write_volume(&self, volume: &Volume, path: &Path) -> Result<()> {
            self.writes.borrow_mut().insert(path.to_path_buf(), volume.clone());
            Ok(())
        }
    }

    const TES: [f64; 3] = [10.0, 40.0, 80.0];

    fn reference_metadata() -> SpatialMetadata {
        SpatialMetadata {
            origin: [-10.0, 5.0, 2.5],
            spacing: [0.9, 0.9, 3.0],
            ..SpatialMetadata::default()
        }
    }

    fn store_with_echoes(dims: (usize, usize, usize)) -> (MemoryStore, Vec<PathBuf>) {
        let model = SignalModel::MonoExponential { echo_times: TES.to_vec() };
        let signal = model.simulate(700.0, 60.0);
        let n = dims.0 * dims.1 * dims.2;

        let mut store = MemoryStore::default();
        let mut inputs = Vec::new();
        for (e, &s) in signal.iter().enumerate() {
            let path = PathBuf::from(format!("echo-{}.nii", e + 1));
            let volume = Volume::new(vec![s; n], dims, reference_metadata()).unwrap();
            store.volumes.insert(path.clone(), volume);
            inputs.push(path);
        }
        (store, inputs)
    }

    fn job(inputs: Vec<PathBuf>, params: AcquisitionParams) -> MappingJob {
        MappingJob {
            inputs,
            params,
            mask: None,
            options: FitOptions::default(),
            outputs: OutputPaths::in_dir(Path::new("out"), "sub-01_", MappingMode::T2),
        }
    }

    #[test]
    fn test_output_paths() {
        let out = OutputPaths::in_dir(Path::new("/data"), "", MappingMode::T1);
        assert_eq!(out.relaxation, PathBuf::from("/data/T1map.nii.gz"));
        assert_eq!(out.pd, PathBuf::from("/data/PDmap.nii.gz"));
    }

    #[test]
    fn test_run_mapping_writes_both_maps() {
        let (store, inputs) = store_with_echoes((2, 2, 2));
        let job = job(inputs, AcquisitionParams::t2(TES.to_vec()));
        let summary = run_mapping(&store, &job, |_, _| {}).unwrap();

        assert_eq!(summary.fitted, 8);
        let writes = store.writes.borrow();
        assert_eq!(writes.len(), 2);

        let t2 = &writes[&PathBuf::from("out/sub-01_T2map.nii.gz")];
        let pd = &writes[&PathBuf::from("out/sub-01_PDmap.nii.gz")];
        assert_eq!(t2.metadata, reference_metadata());
        assert_eq!(pd.dims, (2, 2, 2));
        assert!(t2.data.iter().all(|&t| (t - 60.0).abs() < 1e-3 * 60.0));
        assert!(pd.data.iter().all(|&p| (p - 700.0).abs() < 1e-3 * 700.0));
    }

    #[test]
    fn test_count_mismatch_reads_and_writes_nothing() {
        let (store, inputs) = store_with_echoes((2, 2, 2));
        let params = AcquisitionParams::t2(vec![10.0, 40.0]);
        let err = run_mapping(&store, &job(inputs, params), |_, _| {}).unwrap_err();

        assert!(matches!(err, RelaxError::Configuration(_)));
        assert!(store.reads.borrow().is_empty());
        assert!(store.writes.borrow().is_empty());
    }

    #[test]
    fn test_validate_job() {
        let (_, inputs) = store_with_echoes((1, 1, 1));
        assert!(validate_job(&job(inputs.clone(), AcquisitionParams::t2(TES.to_vec()))).is_ok());

        let mismatched = job(inputs.clone(), AcquisitionParams::t2(vec![10.0, 40.0]));
        assert!(matches!(validate_job(&mismatched), Err(RelaxError::Configuration(_))));

        let mut bad_options = job(inputs, AcquisitionParams::t2(TES.to_vec()));
        bad_options.options.tolerance = 0.0;
        assert!(matches!(validate_job(&bad_options), Err(RelaxError::Configuration(_))));
    }

    #[test]
    fn test_shape_mismatch_writes_nothing() {
        let (mut store, inputs) = store_with_echoes((2, 2, 2));
        store.volumes.insert(
            inputs[1].clone(),
            Volume::new(vec![1.0; 12], (3, 2, 2), reference_metadata()).unwrap(),
        );
        let err = run_mapping(&store, &job(inputs, AcquisitionParams::t2(TES.to_vec())), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, RelaxError::Data(_)));
        assert!(store.writes.borrow().is_empty());
    }

    #[test]
    fn test_mask_applied() {
        let (mut store, inputs) = store_with_echoes((2, 1, 1));
        let mask_path = PathBuf::from("mask.nii");
        store.volumes.insert(
            mask_path.clone(),
            Volume::new(vec![1.0, 0.0], (2, 1, 1), reference_metadata()).unwrap(),
        );
        let mut job = job(inputs, AcquisitionParams::t2(TES.to_vec()));
        job.mask = Some(mask_path);

        let summary = run_mapping(&store, &job, |_, _| {}).unwrap();
        assert_eq!(summary.fitted, 1);
        assert_eq!(summary.masked_out, 1);

        let writes = store.writes.borrow();
        let t2 = &writes[&job.outputs.relaxation];
        assert!(t2.data[0] > 0.0);
        assert_eq!(t2.data[1], 0.0);
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let (mut store, inputs) = store_with_echoes((2, 1, 1));
        let mask_path = PathBuf::from("mask.nii");
        store.volumes.insert(
            mask_path.clone(),
            Volume::new(vec![1.0; 4], (4, 1, 1), reference_metadata()).unwrap(),
        );
        let mut job = job(inputs, AcquisitionParams::t2(TES.to_vec()));
        job.mask = Some(mask_path);

        assert!(matches!(run_mapping(&store, &job, |_, _| {}), Err(RelaxError::Data(_))));
        assert!(store.writes.borrow().is_empty());
    }
}
