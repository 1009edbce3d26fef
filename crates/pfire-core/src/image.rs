//! Image type: a scalar voxel field on a shared grid.
//!
//! Images are 2-D or 3-D; 2-D inputs are promoted to depth-1 3-D and report
//! `ndim() == 2`. Intensity lives in one global vector; stencil consumers
//! request a ghosted local copy on demand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::DVector;

use crate::error::{CoreError, Result};
use crate::fd;
use crate::grid::{Grid, LocalField};

static INSTANCE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scalar voxel field with a shared grid descriptor.
#[derive(Debug, Clone)]
pub struct Image {
    grid: Arc<Grid>,
    data: DVector<f64>,
    ndim: usize,
    instance_id: usize,
}

impl Image {
    /// Create a zero-filled image. `shape` may be 2-D or 3-D; 2-D shapes are
    /// promoted to depth 1.
    pub fn new(shape: &[usize]) -> Result<Self> {
        let full = promote_shape(shape)?;
        let grid = Arc::new(Grid::new(full)?);
        let size = grid.size();
        Ok(Self {
            grid,
            data: DVector::zeros(size),
            ndim: if full[2] == 1 { 2 } else { 3 },
            instance_id: INSTANCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Create an image from raw x-fastest voxel data.
    pub fn from_data(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let mut img = Self::new(shape)?;
        if data.len() != img.size() {
            return Err(CoreError::ShapeMismatch {
                expected: img.shape().to_vec(),
                actual: vec![data.len()],
            });
        }
        img.data = DVector::from_vec(data);
        Ok(img)
    }

    /// Grid shape, always 3-D.
    pub fn shape(&self) -> [usize; 3] {
        self.grid.shape()
    }

    /// Spatial dimensionality: 2 for depth-1 images, otherwise 3.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Number of voxels.
    pub fn size(&self) -> usize {
        self.grid.size()
    }

    /// Shared grid descriptor.
    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    /// Global intensity vector.
    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    /// Mutable global intensity vector.
    pub fn data_mut(&mut self) -> &mut DVector<f64> {
        &mut self.data
    }

    /// Stable per-process id, used in diagnostics.
    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    /// New zero-filled image sharing this image's grid.
    pub fn duplicate(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            data: DVector::zeros(self.size()),
            ndim: self.ndim,
            instance_id: INSTANCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Deep copy with a fresh instance id.
    pub fn copy(&self) -> Self {
        Self {
            grid: Arc::clone(&self.grid),
            data: self.data.clone(),
            ndim: self.ndim,
            instance_id: INSTANCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Ghosted local copy of the intensity field.
    pub fn to_local(&self) -> Result<LocalField> {
        self.grid.local_field(&self.data)
    }

    /// Central-difference gradient along `dim`, returned as a global vector.
    pub fn gradient(&self, dim: usize) -> Result<DVector<f64>> {
        let local = self.to_local()?;
        fd::gradient_to_global(&self.grid, &local, dim)
    }

    /// Scale intensities so their sum equals the voxel count.
    ///
    /// Returns the applied scale factor. Fails when the current sum is zero
    /// or non-finite.
    pub fn normalize(&mut self) -> Result<f64> {
        self.normalize_masked(None)
    }

    /// Normalize over a mask region.
    ///
    /// The mask hook is reserved; passing `Some` is currently rejected.
    pub fn normalize_masked(&mut self, mask: Option<&Image>) -> Result<f64> {
        if mask.is_some() {
            return Err(CoreError::invalid_argument(
                "masked normalization is not yet supported",
            ));
        }
        let sum: f64 = self.data.iter().sum();
        if !sum.is_finite() || sum.abs() < f64::EPSILON {
            return Err(CoreError::NotNormalizable(format!(
                "intensity sum is {}",
                sum
            )));
        }
        let scale = self.size() as f64 / sum;
        self.data *= scale;
        Ok(scale)
    }
}

fn promote_shape(shape: &[usize]) -> Result<[usize; 3]> {
    match shape.len() {
        2 => Ok([shape[0], shape[1], 1]),
        3 => Ok([shape[0], shape[1], shape[2]]),
        n => Err(CoreError::invalid_argument(format!(
            "image shape should be 2D or 3D, got rank {}",
            n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_2d_promotion() {
        let img = Image::new(&[8, 6]).unwrap();
        assert_eq!(img.shape(), [8, 6, 1]);
        assert_eq!(img.ndim(), 2);
        assert_eq!(img.size(), 48);
    }

    #[test]
    fn test_depth_one_3d_reports_2d() {
        let img = Image::new(&[8, 6, 1]).unwrap();
        assert_eq!(img.ndim(), 2);
    }

    #[test]
    fn test_rank_validation() {
        assert!(Image::new(&[8]).is_err());
        assert!(Image::new(&[2, 2, 2, 2]).is_err());
    }

    #[test]
    fn test_normalize_sum_equals_size() {
        let mut img = Image::from_data(&[4, 4], (0..16).map(|v| (v + 1) as f64).collect()).unwrap();
        img.normalize().unwrap();
        let sum: f64 = img.data().iter().sum();
        assert!((sum - img.size() as f64).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_idempotent() {
        let mut img = Image::from_data(&[4, 4], (0..16).map(|v| (v + 1) as f64).collect()).unwrap();
        img.normalize().unwrap();
        let first = img.data().clone();
        let scale = img.normalize().unwrap();
        assert!((scale - 1.0).abs() < 1e-12);
        assert!((img.data() - &first).amax() < 1e-12);
    }

    #[test]
    fn test_normalize_rejects_zero_field() {
        let mut img = Image::new(&[4, 4]).unwrap();
        assert!(matches!(
            img.normalize(),
            Err(CoreError::NotNormalizable(_))
        ));
    }

    #[test]
    fn test_mask_hook_rejected() {
        let mut img = Image::from_data(&[2, 2], vec![1.0; 4]).unwrap();
        let mask = img.copy();
        assert!(img.normalize_masked(Some(&mask)).is_err());
    }

    #[test]
    fn test_instance_ids_are_distinct() {
        let a = Image::new(&[2, 2]).unwrap();
        let b = a.duplicate();
        let c = a.copy();
        assert_ne!(a.instance_id(), b.instance_id());
        assert_ne!(b.instance_id(), c.instance_id());
    }
}
