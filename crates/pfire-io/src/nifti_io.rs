//! NIfTI-1 backend for volumetric images and map coefficients.
//!
//! Images round-trip as 3-D volumes; map coefficients are stored as a 4-D
//! volume (node grid × components) with a JSON sidecar carrying the node
//! spacing and component naming, since NIfTI has no attribute groups.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array3, Array4, ArrayD};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use pfire_core::Image;
use serde::Serialize;
use tracing::debug;

use crate::loader::ImageLoader;
use crate::writer::{ImageWriter, MapData};

/// Loader for `.nii` / `.nii.gz` volumes.
pub struct NiftiLoader {
    volume: ArrayD<f64>,
    shape: [usize; 3],
    ndim: usize,
}

impl NiftiLoader {
    pub fn open(path: &Path) -> Result<Self> {
        let obj = ReaderOptions::new()
            .read_file(path)
            .with_context(|| format!("failed to read NIfTI file {:?}", path))?;
        let volume = obj
            .into_volume()
            .into_ndarray::<f64>()
            .context("failed to convert NIfTI volume to array")?;
        let dims = volume.shape().to_vec();
        let (shape, ndim) = match dims.len() {
            2 => ([dims[0], dims[1], 1], 2),
            3 => (
                [dims[0], dims[1], dims[2]],
                if dims[2] == 1 { 2 } else { 3 },
            ),
            n => bail!("expected a 2D or 3D NIfTI volume, found {} dimensions", n),
        };
        Ok(Self {
            volume,
            shape,
            ndim,
        })
    }
}

impl ImageLoader for NiftiLoader {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn ndim(&self) -> usize {
        self.ndim
    }

    fn read_chunk(&mut self, offset: [usize; 3], extent: [usize; 3], out: &mut [f64]) -> Result<()> {
        check_chunk(self.shape, offset, extent, out.len())?;
        let flat = self.ndim == 2 && self.volume.ndim() == 2;
        for k in 0..extent[2] {
            for j in 0..extent[1] {
                for i in 0..extent[0] {
                    let (x, y, z) = (i + offset[0], j + offset[1], k + offset[2]);
                    let v = if flat {
                        self.volume[[x, y]]
                    } else {
                        self.volume[[x, y, z]]
                    };
                    out[i + extent[0] * (j + extent[1] * k)] = v;
                }
            }
        }
        Ok(())
    }
}

/// Writer for `.nii` volumes.
pub struct NiftiWriter {
    path: PathBuf,
}

impl NiftiWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[derive(Serialize)]
struct MapMetadata<'a> {
    group: &'a str,
    node_shape: [usize; 3],
    node_spacing: [f64; 3],
    ndim: usize,
    components: Vec<&'static str>,
}

impl ImageWriter for NiftiWriter {
    fn write_image(&mut self, image: &Image, group: &str) -> Result<()> {
        let [nx, ny, nz] = image.shape();
        let grid = image.grid().clone();
        let data = image.data();
        let array = Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| data[grid.idx(i, j, k)]);
        WriterOptions::new(&self.path)
            .write_nifti(&array)
            .map_err(|e| anyhow!("failed to write NIfTI file {:?}: {}", self.path, e))?;
        debug!(path = ?self.path, group, "wrote registered image dataset");
        Ok(())
    }

    fn write_map(&mut self, map: &MapData, group: &str) -> Result<()> {
        let [nx, ny, nz] = map.node_shape;
        let ncomp = map.components.len();
        if map.components.iter().any(|c| c.len() != nx * ny * nz) {
            bail!("map component length does not match node shape {:?}", map.node_shape);
        }
        let array = Array4::from_shape_fn((nx, ny, nz, ncomp), |(i, j, k, c)| {
            map.components[c][i + nx * (j + ny * k)]
        });
        WriterOptions::new(&self.path)
            .write_nifti(&array)
            .map_err(|e| anyhow!("failed to write NIfTI file {:?}: {}", self.path, e))?;

        let meta = MapMetadata {
            group,
            node_shape: map.node_shape,
            node_spacing: map.node_spacing,
            ndim: map.ndim,
            components: component_names(map.ndim),
        };
        let sidecar = self.path.with_extension("json");
        std::fs::write(&sidecar, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("failed to write map metadata {:?}", sidecar))?;
        debug!(path = ?self.path, group, "wrote map dataset");
        Ok(())
    }
}

fn component_names(ndim: usize) -> Vec<&'static str> {
    match ndim {
        2 => vec!["dx", "dy", "luminance"],
        _ => vec!["dx", "dy", "dz", "luminance"],
    }
}

fn check_chunk(shape: [usize; 3], offset: [usize; 3], extent: [usize; 3], out_len: usize) -> Result<()> {
    for d in 0..3 {
        if offset[d] + extent[d] > shape[d] {
            bail!(
                "chunk offset {:?} extent {:?} exceeds image shape {:?}",
                offset,
                extent,
                shape
            );
        }
    }
    if out_len != extent[0] * extent[1] * extent[2] {
        bail!("chunk buffer length {} does not match extent {:?}", out_len, extent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_image;
    use crate::writer::Destination;
    use tempfile::tempdir;

    #[test]
    fn test_image_write_read_cycle() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cycle.nii");

        let data: Vec<f64> = (0..4 * 3 * 2).map(|v| v as f64 * 0.5 + 1.0).collect();
        let image = Image::from_data(&[4, 3, 2], data.clone())?;

        let mut writer = NiftiWriter::new(&path);
        writer.write_image(&image, "/registered")?;

        let loaded = load_image(&path)?;
        assert_eq!(loaded.shape(), [4, 3, 2]);
        for idx in 0..loaded.size() {
            assert!((loaded.data()[idx] - data[idx]).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_map_written_as_4d_with_sidecar() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.nii");

        let node_size = 3 * 3 * 1;
        let map = MapData {
            node_shape: [3, 3, 1],
            node_spacing: [8.0, 8.0, 1.0],
            ndim: 2,
            components: vec![vec![0.25; node_size]; 3],
        };
        let dest = Destination::parse(&format!("{}:/map", path.display()))?;
        crate::writer::write_map(&dest, &map)?;

        let obj = ReaderOptions::new().read_file(&path)?;
        let vol = obj.into_volume().into_ndarray::<f64>()?;
        assert_eq!(vol.shape(), &[3, 3, 1, 3]);

        let sidecar = path.with_extension("json");
        let meta = std::fs::read_to_string(sidecar)?;
        assert!(meta.contains("node_spacing"));
        assert!(meta.contains("luminance"));
        Ok(())
    }

    #[test]
    fn test_chunk_bounds_checked() {
        let err = check_chunk([4, 4, 1], [2, 0, 0], [4, 4, 1], 16);
        assert!(err.is_err());
    }
}
