//! Regular 3-D grid descriptors and ghosted local fields.
//!
//! A [`Grid`] describes a structured voxel or node grid and owns the index
//! arithmetic for the x-fastest global ordering used throughout the crate.
//! Global state lives in dense vectors sized `grid.size()`; stencil code
//! works on a [`LocalField`], a ghosted copy with a one-cell halo filled by
//! the mirror boundary policy (edge values repeat into the ghost layer).

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{CoreError, Result};

/// Width of the ghost layer around a local field.
const STENCIL_WIDTH: usize = 1;

/// Descriptor for a structured 3-D grid.
///
/// Cheap to share; holders keep it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    shape: [usize; 3],
}

impl Grid {
    /// Create a grid with the given shape. All extents must be nonzero.
    pub fn new(shape: [usize; 3]) -> Result<Self> {
        if shape.iter().any(|&s| s == 0) {
            return Err(CoreError::invalid_argument(format!(
                "grid extents must be nonzero, got {:?}",
                shape
            )));
        }
        Ok(Self { shape })
    }

    /// Grid shape.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Total number of grid points.
    pub fn size(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Flat index of a grid point, x fastest.
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.shape[0] && j < self.shape[1] && k < self.shape[2]);
        i + self.shape[0] * (j + self.shape[1] * k)
    }

    /// Grid coordinates of a flat index.
    #[inline]
    pub fn coords(&self, idx: usize) -> [usize; 3] {
        let i = idx % self.shape[0];
        let rest = idx / self.shape[0];
        [i, rest % self.shape[1], rest / self.shape[1]]
    }

    /// Owned region as (offset, extent).
    ///
    /// With a single partition the offset is the origin and the extent is the
    /// full shape; loaders and writers address chunks through this query
    /// rather than assuming whole-domain ownership.
    pub fn corners(&self) -> ([usize; 3], [usize; 3]) {
        ([0, 0, 0], self.shape)
    }

    /// Build a ghosted local copy of a global vector.
    ///
    /// The halo is filled with the mirror policy: each ghost cell takes the
    /// value of the nearest interior cell. Fails with `InvalidArgument` when
    /// the vector length does not match the grid.
    pub fn local_field(&self, global: &DVector<f64>) -> Result<LocalField> {
        if global.len() != self.size() {
            return Err(CoreError::invalid_argument(format!(
                "global vector of length {} incompatible with grid {:?}",
                global.len(),
                self.shape
            )));
        }
        let [nx, ny, nz] = self.shape;
        let ex = nx + 2 * STENCIL_WIDTH;
        let ey = ny + 2 * STENCIL_WIDTH;
        let ez = nz + 2 * STENCIL_WIDTH;
        let src = global.as_slice();

        let data: Vec<f64> = (0..ex * ey * ez)
            .into_par_iter()
            .map(|flat| {
                let li = flat % ex;
                let lj = (flat / ex) % ey;
                let lk = flat / (ex * ey);
                let i = (li as isize - STENCIL_WIDTH as isize).clamp(0, nx as isize - 1) as usize;
                let j = (lj as isize - STENCIL_WIDTH as isize).clamp(0, ny as isize - 1) as usize;
                let k = (lk as isize - STENCIL_WIDTH as isize).clamp(0, nz as isize - 1) as usize;
                src[self.idx(i, j, k)]
            })
            .collect();

        Ok(LocalField {
            shape: self.shape,
            data,
        })
    }
}

/// Ghosted local copy of a global vector on a [`Grid`].
///
/// Interior indices run over the grid shape; accessors accept indices in
/// `-1..=extent` along each axis so stencils can read straight through the
/// halo.
#[derive(Debug, Clone)]
pub struct LocalField {
    shape: [usize; 3],
    data: Vec<f64>,
}

impl LocalField {
    /// Shape of the interior region (matches the owning grid).
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Whether this field was built for `grid`.
    pub fn compatible_with(&self, grid: &Grid) -> bool {
        self.shape == grid.shape()
    }

    /// Read a value, ghost cells included.
    #[inline]
    pub fn get(&self, i: isize, j: isize, k: isize) -> f64 {
        let w = STENCIL_WIDTH as isize;
        debug_assert!(i >= -w && i < self.shape[0] as isize + w);
        debug_assert!(j >= -w && j < self.shape[1] as isize + w);
        debug_assert!(k >= -w && k < self.shape[2] as isize + w);
        let ex = self.shape[0] + 2 * STENCIL_WIDTH;
        let ey = self.shape[1] + 2 * STENCIL_WIDTH;
        let li = (i + w) as usize;
        let lj = (j + w) as usize;
        let lk = (k + w) as usize;
        self.data[li + ex * (lj + ey * lk)]
    }
}
