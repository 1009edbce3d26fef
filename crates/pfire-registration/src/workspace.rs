//! Per-generation scratch storage for the registration driver.
//!
//! Holds the D gradient globals, the length-`D·image_size` stacked vector
//! they scatter into, the shared intensity temporary, and the ephemeral
//! coefficient-sized vectors (δa, rhs) that are reallocated whenever the map
//! generation changes.

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use pfire_core::Image;

use crate::map::Map;

/// Scratch vectors shared by the inner-loop steps.
#[derive(Debug)]
pub struct WorkSpace {
    /// Per-dimension gradient fields, concatenated stripe by stripe.
    pub stacked: DVector<f64>,
    /// Per-dimension gradient globals (inputs to the stacked scatter).
    pub grads: Vec<DVector<f64>>,
    /// Shared image-sized temporary: holds `½(F+M')` during gradient
    /// assembly, then the luminance coupling `1 − ½(F+M')`.
    pub intensity: DVector<f64>,
    /// Coefficient update from the last solve.
    pub delta_a: DVector<f64>,
    /// Normal-equation right-hand side.
    pub rhs: DVector<f64>,
    image_size: usize,
    ndim: usize,
}

impl WorkSpace {
    /// Allocate scratch for an image/map pairing.
    pub fn new(image: &Image, map: &Map) -> Self {
        let image_size = image.size();
        let ndim = image.ndim();
        let coeff_len = map.num_components() * map.size();
        Self {
            stacked: DVector::zeros(ndim * image_size),
            grads: vec![DVector::zeros(image_size); ndim],
            intensity: DVector::zeros(image_size),
            delta_a: DVector::zeros(coeff_len),
            rhs: DVector::zeros(coeff_len),
            image_size,
            ndim,
        }
    }

    /// Resize the coefficient-sized vectors for a new map generation.
    pub fn reallocate_ephemeral_workspace(&mut self, map: &Map) {
        let coeff_len = map.num_components() * map.size();
        self.delta_a = DVector::zeros(coeff_len);
        self.rhs = DVector::zeros(coeff_len);
    }

    /// Copy every gradient global into its stripe of the stacked vector.
    pub fn scatter_grads_to_stacked(&mut self) {
        let size = self.image_size;
        let stacked = self.stacked.as_mut_slice();
        for (d, grad) in self.grads.iter().enumerate() {
            stacked[d * size..(d + 1) * size].copy_from_slice(grad.as_slice());
        }
    }

    /// Replicate a single gradient global into every stripe.
    ///
    /// Used to stage the residual: all stripes carry identical copies today;
    /// per-stripe weighting is where mask support would attach.
    pub fn duplicate_single_grad_to_stacked(&mut self, index: usize) {
        assert!(index < self.ndim, "gradient index out of range");
        let size = self.image_size;
        let src = self.grads[index].as_slice();
        let stacked = self.stacked.as_mut_slice();
        for d in 0..self.ndim {
            stacked[d * size..(d + 1) * size].copy_from_slice(src);
        }
    }

    /// Form the normal-equation rhs `Tᵀ·r` from the staged stacked residual.
    ///
    /// `t_transpose` has one row per coefficient; the stripe matching each
    /// coefficient block supplies the residual samples (the luminance block
    /// reads the last stripe, which holds the same replicated values).
    pub fn rhs_from_stacked(&mut self, t_transpose: &CsrMatrix<f64>, num_nodes: usize) {
        let size = self.image_size;
        let ndim = self.ndim;
        let stacked = self.stacked.as_slice();
        let (offsets, cols, vals) = t_transpose.csr_data();

        let rhs: Vec<f64> = (0..t_transpose.nrows())
            .into_par_iter()
            .map(|coeff| {
                let stripe = (coeff / num_nodes).min(ndim - 1);
                let base = stripe * size;
                let mut acc = 0.0;
                for e in offsets[coeff]..offsets[coeff + 1] {
                    acc += vals[e] * stacked[base + cols[e]];
                }
                acc
            })
            .collect();
        self.rhs = DVector::from_vec(rhs);
    }
}
