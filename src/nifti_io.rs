//! NIfTI volume I/O
//!
//! Reads and writes single 3D volumes together with their spatial metadata
//! (origin, spacing, direction). Output maps are written as NIfTI-1 float32,
//! gzip compressed when the path ends in `.nii.gz`.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{RelaxError, Result};

/// Physical placement of a voxel grid
///
/// `direction` is a row-major 3x3 matrix whose columns are the unit vectors
/// of the x, y and z voxel axes in world space.
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialMetadata {
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
    pub direction: [f64; 9],
}

impl Default for SpatialMetadata {
    fn default() -> Self {
        SpatialMetadata {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl SpatialMetadata {
    /// Decompose a 4x4 row-major affine into origin, spacing and direction.
    pub fn from_affine(affine: &[f64; 16]) -> Self {
        let mut spacing = [1.0; 3];
        let mut direction = [0.0; 9];
        for j in 0..3 {
            let col = [affine[j], affine[4 + j], affine[8 + j]];
            let norm = (col[0] * col[0] + col[1] * col[1] + col[2] * col[2]).sqrt();
            if norm > 0.0 && norm.is_finite() {
                spacing[j] = norm;
                for r in 0..3 {
                    direction[r * 3 + j] = col[r] / norm;
                }
            } else {
                // Degenerate column: keep the axis unit so the record stays invertible
                direction[j * 3 + j] = 1.0;
            }
        }

        SpatialMetadata {
            origin: [affine[3], affine[7], affine[11]],
            spacing,
            direction,
        }
    }

    /// Recompose the 4x4 row-major affine (voxel index -> world).
    pub fn to_affine(&self) -> [f64; 16] {
        let mut affine = [0.0; 16];
        for r in 0..3 {
            for j in 0..3 {
                affine[r * 4 + j] = self.direction[r * 3 + j] * self.spacing[j];
            }
            affine[r * 4 + 3] = self.origin[r];
        }
        affine[15] = 1.0;
        affine
    }

    /// Map a (possibly fractional) voxel index to world coordinates.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let mut p = self.origin;
        for r in 0..3 {
            for j in 0..3 {
                p[r] += self.direction[r * 3 + j] * self.spacing[j] * index[j];
            }
        }
        p
    }
}

/// A 3D intensity volume in NIfTI (Fortran) order: `index = x + y*nx + z*nx*ny`
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub metadata: SpatialMetadata,
}

impl Volume {
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize),
        metadata: SpatialMetadata,
    ) -> Result<Self> {
        let expected = dims.0 * dims.1 * dims.2;
        if data.len() != expected {
            return Err(RelaxError::Data(format!(
                "volume data has {} voxels but dims {:?} require {}",
                data.len(),
                dims,
                expected
            )));
        }
        Ok(Volume {
            data,
            dims,
            metadata,
        })
    }

    /// New volume on the same grid, carrying this volume's metadata unchanged.
    pub fn derived(&self, data: Vec<f64>) -> Result<Self> {
        Volume::new(data, self.dims, self.metadata.clone())
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Short header summary used to enrich read errors
fn header_summary(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("{} bytes, too small for a NIfTI-1 header", bytes.len());
    }
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a NIfTI volume from bytes (`.nii` or `.nii.gz`, auto-detected)
///
/// 4D inputs contribute their first volume only.
pub fn load_nifti(bytes: &[u8]) -> Result<Volume> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let mut decompressed = Vec::new();
        GzDecoder::new(Cursor::new(bytes))
            .read_to_end(&mut decompressed)
            .map_err(|e| RelaxError::Nifti(format!("failed to decompress gzipped NIfTI: {}", e)))?;
        InMemNiftiObject::from_reader(Cursor::new(&decompressed)).map_err(|e| {
            RelaxError::Nifti(format!(
                "failed to read NIfTI: {} ({})",
                e,
                header_summary(&decompressed)
            ))
        })?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes)).map_err(|e| {
            RelaxError::Nifti(format!("failed to read NIfTI: {} ({})", e, header_summary(bytes)))
        })?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(RelaxError::Nifti(format!("expected at least a 3D volume, got {}D", ndim)));
    }
    let metadata = SpatialMetadata::from_affine(&header_affine(header));

    // Slope and intercept are applied by the conversion
    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| RelaxError::Nifti(format!("failed to convert volume: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(RelaxError::Nifti(format!(
            "expected at least a 3D array, got {}D",
            shape.len()
        )));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);

    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let value = if shape.len() == 3 {
                    array[[i, j, k]]
                } else {
                    let mut index = vec![0usize; shape.len()];
                    index[0] = i;
                    index[1] = j;
                    index[2] = k;
                    array[index.as_slice()]
                };
                data.push(value);
            }
        }
    }

    Volume::new(data, (nx, ny, nz), metadata)
}

/// Voxel-to-world affine from the header: sform, then qform, then pixdim.
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    let pixdim = [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ];

    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };

        let rot = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ];
        let scale = [pixdim[0], pixdim[1], pixdim[2] * qfac];
        let offset = [
            header.quatern_x as f64,
            header.quatern_y as f64,
            header.quatern_z as f64,
        ];

        let mut affine = [0.0; 16];
        for r in 0..3 {
            for j in 0..3 {
                affine[r * 4 + j] = rot[r][j] * scale[j];
            }
            affine[r * 4 + 3] = offset[r];
        }
        affine[15] = 1.0;
        affine
    } else {
        [
            pixdim[0], 0.0, 0.0, 0.0,
            0.0, pixdim[1], 0.0, 0.0,
            0.0, 0.0, pixdim[2], 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Encode a volume as uncompressed NIfTI-1 bytes (float32 payload)
pub fn save_nifti(volume: &Volume) -> Result<Vec<u8>> {
    let (nx, ny, nz) = volume.dims;
    for &d in &[nx, ny, nz] {
        if d == 0 || d > i16::MAX as usize {
            return Err(RelaxError::Nifti(format!(
                "dimension {} cannot be stored in a NIfTI-1 header", d
            )));
        }
    }
    let spacing = volume.metadata.spacing;
    let affine = volume.metadata.to_affine();

    let mut header = [0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // FLOAT32, 32 bits per voxel
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [
        1.0,
        spacing[0] as f32, spacing[1] as f32, spacing[2] as f32,
        1.0, 1.0, 1.0, 1.0,
    ];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // Header plus a 4-byte empty extension block
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for (row, base) in [280usize, 296, 312].iter().enumerate() {
        for i in 0..4 {
            let offset = base + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + volume.data.len() * 4);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    for &val in &volume.data {
        buffer.extend_from_slice(&(val as f32).to_le_bytes());
    }

    Ok(buffer)
}

/// Encode a volume as gzipped NIfTI-1 bytes (.nii.gz)
pub fn save_nifti_gz(volume: &Volume) -> Result<Vec<u8>> {
    let uncompressed = save_nifti(volume)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| RelaxError::Nifti(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| RelaxError::Nifti(format!("gzip finish failed: {}", e)))
}

fn is_nifti_path(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Read a NIfTI volume from disk
pub fn read_volume(path: &Path) -> Result<Volume> {
    let bytes = std::fs::read(path).map_err(|e| RelaxError::io(path, e))?;
    load_nifti(&bytes)
}

/// Write a volume to disk, gzip compressed when the path ends in `.nii.gz`
pub fn write_volume(volume: &Volume, path: &Path) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(volume)?
    } else {
        save_nifti(volume)?
    };
    std::fs::write(path, &bytes).map_err(|e| RelaxError::io(path, e))
}

/// NIfTI files directly inside `dir`, ordered by file name
pub fn list_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| RelaxError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| RelaxError::io(dir, e))?.path();
        if path.is_file() && is_nifti_path(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}
