//! Displacement + luminance map on a regular node grid.
//!
//! The map owns the packed coefficient vector `a` (D displacement blocks and
//! one luminance block), the interpolation basis to the image grid, and the
//! node-grid Laplacian. It is rebuilt per generation; moving to a finer
//! spacing samples the current field at the new node positions.

use nalgebra::DVector;
use rayon::prelude::*;

use nalgebra_sparse::CsrMatrix;
use pfire_core::interpolation::trilinear;
use pfire_core::{CoreError, Image};

use crate::basis::build_basis_matrix;
use crate::error::{RegistrationError, Result};
use crate::laplacian::build_laplacian;

/// Node-grid coefficient field coupling the image pair.
#[derive(Debug, Clone)]
pub struct Map {
    img_shape: [usize; 3],
    node_shape: [usize; 3],
    spacing: [f64; 3],
    offsets: [f64; 3],
    ndim: usize,
    coefficients: DVector<f64>,
    basis: CsrMatrix<f64>,
    laplacian: CsrMatrix<f64>,
    tile_dim: usize,
    luminance_scale: f64,
}

impl Map {
    /// Create a zero map for `image` at the given per-dimension node spacing.
    pub fn new(
        image: &Image,
        nodespacing: &[f64],
        tile_dim: usize,
        luminance_scale: f64,
    ) -> Result<Self> {
        let ndim = image.ndim();
        if nodespacing.len() != ndim {
            return Err(RegistrationError::ShapeMismatch {
                expected: vec![ndim],
                actual: vec![nodespacing.len()],
            });
        }
        if nodespacing.iter().any(|&s| !(s > 0.0)) {
            return Err(RegistrationError::config(format!(
                "node spacing must be positive, got {:?}",
                nodespacing
            )));
        }

        let img_shape = image.shape();
        let mut spacing = [1.0f64; 3];
        spacing[..ndim].copy_from_slice(nodespacing);

        let mut node_shape = [1usize; 3];
        let mut offsets = [0.0f64; 3];
        for d in 0..ndim {
            // One node more than the cover, centred so every voxel has
            // trilinear support inside the grid.
            node_shape[d] = (img_shape[d] as f64 / spacing[d]).ceil() as usize + 1;
            let span = (node_shape[d] - 1) as f64 * spacing[d];
            offsets[d] = -(span - (img_shape[d] - 1) as f64) / 2.0;
        }

        let basis = build_basis_matrix(img_shape, node_shape, spacing, offsets, ndim, tile_dim);
        let laplacian = build_laplacian(node_shape, ndim, luminance_scale);
        let node_size = node_shape[0] * node_shape[1] * node_shape[2];

        Ok(Self {
            img_shape,
            node_shape,
            spacing,
            offsets,
            ndim,
            coefficients: DVector::zeros((ndim + 1) * node_size),
            basis,
            laplacian,
            tile_dim,
            luminance_scale,
        })
    }

    /// Node grid shape.
    pub fn node_shape(&self) -> [usize; 3] {
        self.node_shape
    }

    /// Node spacing in image coordinates.
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// Image-coordinate position of node (0,0,0).
    pub fn offsets(&self) -> [f64; 3] {
        self.offsets
    }

    /// Spatial dimensionality.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Number of nodes |N|.
    pub fn size(&self) -> usize {
        self.node_shape[0] * self.node_shape[1] * self.node_shape[2]
    }

    /// Number of coefficient components (D spatial + luminance).
    pub fn num_components(&self) -> usize {
        self.ndim + 1
    }

    /// Packed coefficient vector of length `(D+1)·|N|`.
    pub fn coefficients(&self) -> &DVector<f64> {
        &self.coefficients
    }

    /// Interpolation basis to the image grid.
    pub fn basis(&self) -> &CsrMatrix<f64> {
        &self.basis
    }

    /// Node-grid smoothness operator.
    pub fn laplacian(&self) -> &CsrMatrix<f64> {
        &self.laplacian
    }

    /// Per-component coefficient fields in block order.
    pub fn components(&self) -> Vec<Vec<f64>> {
        let node_size = self.size();
        (0..self.num_components())
            .map(|b| self.coefficients.as_slice()[b * node_size..(b + 1) * node_size].to_vec())
            .collect()
    }

    /// Apply a coefficient update: `a ← a + δa`.
    pub fn update(&mut self, delta: &DVector<f64>) -> Result<()> {
        if delta.len() != self.coefficients.len() {
            return Err(CoreError::invalid_argument(format!(
                "coefficient update of length {} incompatible with map of length {}",
                delta.len(),
                self.coefficients.len()
            ))
            .into());
        }
        self.coefficients += delta;
        Ok(())
    }

    /// Warp an image through the current map.
    ///
    /// Each voxel samples `image` at `x + d(x)` by clamped trilinear
    /// interpolation and adds the luminance component `β(x)`; `d` and `β`
    /// come from the per-block products of the basis with `a`.
    pub fn warp(&self, image: &Image) -> Result<Image> {
        if image.shape() != self.img_shape {
            return Err(RegistrationError::ShapeMismatch {
                expected: self.img_shape.to_vec(),
                actual: image.shape().to_vec(),
            });
        }
        let node_size = self.size();
        let ndim = self.ndim;
        let shape = self.img_shape;
        let src = image.data().as_slice();
        let coeff = self.coefficients.as_slice();
        let (offsets, cols, vals) = self.basis.csr_data();

        let values: Vec<f64> = (0..image.size())
            .into_par_iter()
            .map(|row| {
                let mut comp = [0.0f64; 4];
                for e in offsets[row]..offsets[row + 1] {
                    let c = cols[e];
                    comp[c / node_size] += vals[e] * coeff[c];
                }
                let i = row % shape[0];
                let rest = row / shape[0];
                let mut pos = [
                    i as f64,
                    (rest % shape[1]) as f64,
                    (rest / shape[1]) as f64,
                ];
                for d in 0..ndim {
                    pos[d] += comp[d];
                }
                trilinear(src, shape, pos) + comp[ndim]
            })
            .collect();

        Ok(Image::from_data(&shape, values)?)
    }

    /// Resample this map onto a finer node grid.
    ///
    /// The new coefficients sample the current displacement and luminance
    /// fields (linear in node space) at the new node positions.
    pub fn interpolate(&self, image: &Image, new_spacing: &[f64]) -> Result<Map> {
        let mut fine = Map::new(image, new_spacing, self.tile_dim, self.luminance_scale)?;
        let fine_size = fine.size();
        let coarse_size = self.size();
        let coarse = self.coefficients.as_slice();

        for block in 0..self.num_components() {
            let field = &coarse[block * coarse_size..(block + 1) * coarse_size];
            for node in 0..fine_size {
                let i = node % fine.node_shape[0];
                let rest = node / fine.node_shape[0];
                let idx = [i, rest % fine.node_shape[1], rest / fine.node_shape[1]];
                let mut pos = [0.0f64; 3];
                for d in 0..3 {
                    let image_coord = fine.offsets[d] + idx[d] as f64 * fine.spacing[d];
                    pos[d] = (image_coord - self.offsets[d]) / self.spacing[d];
                }
                fine.coefficients[block * fine_size + node] =
                    trilinear(field, self.node_shape, pos);
            }
        }
        Ok(fine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_image(shape: &[usize]) -> Image {
        let img = Image::new(shape).unwrap();
        let grid = img.grid().clone();
        let size = img.size();
        let mut img = img;
        for idx in 0..size {
            let [i, j, k] = grid.coords(idx);
            img.data_mut()[idx] = 1.0 + 0.5 * i as f64 + 0.25 * j as f64 + 0.125 * k as f64;
        }
        img
    }

    #[test]
    fn test_coefficient_vector_length_invariant() {
        let image = Image::new(&[16, 16, 16]).unwrap();
        let map = Map::new(&image, &[8.0, 8.0, 8.0], 32, 1.0).unwrap();
        assert_eq!(map.coefficients().len(), map.num_components() * map.size());
        assert_eq!(map.num_components(), 4);
    }

    #[test]
    fn test_2d_map_has_three_components() {
        let image = Image::new(&[16, 16]).unwrap();
        let map = Map::new(&image, &[8.0, 8.0], 32, 1.0).unwrap();
        assert_eq!(map.ndim(), 2);
        assert_eq!(map.num_components(), 3);
        assert_eq!(map.node_shape()[2], 1);
    }

    #[test]
    fn test_spacing_rank_must_match_image() {
        let image = Image::new(&[16, 16, 16]).unwrap();
        assert!(Map::new(&image, &[8.0, 8.0], 32, 1.0).is_err());
    }

    #[test]
    fn test_zero_map_warp_is_identity() {
        let image = ramp_image(&[12, 10, 6]);
        let map = Map::new(&image, &[4.0, 4.0, 4.0], 32, 1.0).unwrap();
        let warped = map.warp(&image).unwrap();
        for idx in 0..image.size() {
            assert!((warped.data()[idx] - image.data()[idx]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_uniform_luminance_shift() {
        let image = ramp_image(&[8, 8, 1]);
        let mut map = Map::new(&image, &[4.0, 4.0], 32, 1.0).unwrap();
        let node_size = map.size();
        let mut delta = DVector::zeros(map.coefficients().len());
        for n in 0..node_size {
            delta[2 * node_size + n] = -0.5;
        }
        map.update(&delta).unwrap();
        let warped = map.warp(&image).unwrap();
        for idx in 0..image.size() {
            assert!((warped.data()[idx] - (image.data()[idx] - 0.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_uniform_translation_shifts_samples() {
        let image = ramp_image(&[12, 12, 1]);
        let mut map = Map::new(&image, &[4.0, 4.0], 32, 1.0).unwrap();
        let node_size = map.size();
        let mut delta = DVector::zeros(map.coefficients().len());
        for n in 0..node_size {
            delta[n] = 2.0; // uniform +2 in x
        }
        map.update(&delta).unwrap();
        let warped = map.warp(&image).unwrap();
        // Interior voxels read the ramp two voxels to the right.
        let grid = image.grid().clone();
        for j in 2..10 {
            for i in 2..9 {
                let idx = grid.idx(i, j, 0);
                let expect = image.data()[grid.idx(i + 2, j, 0)];
                assert!((warped.data()[idx] - expect).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_update_length_checked() {
        let image = Image::new(&[8, 8]).unwrap();
        let mut map = Map::new(&image, &[4.0, 4.0], 32, 1.0).unwrap();
        assert!(map.update(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn test_interpolate_preserves_linear_field() {
        let image = Image::new(&[16, 16, 1]).unwrap();
        let mut map = Map::new(&image, &[8.0, 8.0], 32, 1.0).unwrap();
        let node_size = map.size();
        let shape = map.node_shape();
        // Linear-in-node-space displacement field: exactly representable
        // after resampling at any finer spacing.
        let mut delta = DVector::zeros(map.coefficients().len());
        for n in 0..node_size {
            let i = n % shape[0];
            let j = (n / shape[0]) % shape[1];
            delta[n] = 0.5 * (map.offsets()[0] + i as f64 * map.spacing()[0]);
            delta[node_size + n] = 0.1 * (map.offsets()[1] + j as f64 * map.spacing()[1]);
        }
        map.update(&delta).unwrap();

        let fine = map.interpolate(&image, &[4.0, 4.0]).unwrap();
        let fine_size = fine.size();
        let fshape = fine.node_shape();
        for n in 0..fine_size {
            let i = n % fshape[0];
            let j = (n / fshape[0]) % fshape[1];
            let x = fine.offsets()[0] + i as f64 * fine.spacing()[0];
            let y = fine.offsets()[1] + j as f64 * fine.spacing()[1];
            // Positions inside the coarse node hull reproduce the field.
            let px = (x - map.offsets()[0]) / map.spacing()[0];
            let py = (y - map.offsets()[1]) / map.spacing()[1];
            if px < 0.0
                || py < 0.0
                || px > (shape[0] - 1) as f64
                || py > (shape[1] - 1) as f64
            {
                continue;
            }
            assert!(
                (fine.coefficients()[n] - 0.5 * x).abs() < 1e-9,
                "dx at fine node ({i},{j})"
            );
            assert!((fine.coefficients()[fine_size + n] - 0.1 * y).abs() < 1e-9);
        }
    }
}
