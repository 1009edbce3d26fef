//! Coarse-to-fine elastic registration driver.
//!
//! Runs a Gauss–Newton-like iteration per node-spacing generation: assemble
//! the row-scaled basis T, form the normal equations with block
//! preconditioning and Laplacian regularization, solve for the coefficient
//! update, apply it to the map, and re-warp the moved image. Generations
//! step from the coarsest spacing down to the user target; a generation that
//! exhausts its iteration budget is reported but does not abort the run.

use nalgebra_sparse::CsrMatrix;
use tracing::{debug, info, warn};

use pfire_core::{fd, solver, Image};

use crate::config::RegistrationConfig;
use crate::error::{RegistrationError, Result};
use crate::map::Map;
use crate::workspace::WorkSpace;

/// Observer invoked after every inner step with the current registered
/// image; installed by callers that persist debug frames.
pub type FrameCallback = Box<dyn FnMut(usize, usize, &Image)>;

/// Outcome of one generation of the inner loop.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Node spacing of this generation.
    pub spacing: [f64; 3],
    /// Inner iterations executed.
    pub iterations: usize,
    /// Whether the coefficient update dropped below the threshold.
    pub converged: bool,
    /// Infinity norm of the final coefficient update.
    pub final_update_max: f64,
}

/// Outcome of a full coarse-to-fine run.
#[derive(Debug, Clone)]
pub struct RegistrationSummary {
    pub generations: Vec<GenerationResult>,
    /// Total inner iterations across all generations.
    pub total_iterations: usize,
}

impl RegistrationSummary {
    /// Whether the final generation converged.
    pub fn converged(&self) -> bool {
        self.generations.last().is_some_and(|g| g.converged)
    }
}

/// Elastic registration of a moved image onto a fixed reference.
pub struct Elastic {
    config: RegistrationConfig,
    lambda: f64,
    fixed: Image,
    moved: Image,
    registered: Image,
    map: Map,
    workspace: WorkSpace,
    schedule: Vec<[f64; 3]>,
    iterations_total: usize,
    frame_callback: Option<FrameCallback>,
}

impl Elastic {
    /// Set up a registration problem.
    ///
    /// Both images must share a shape and `nodespacing` must carry one entry
    /// per spatial dimension; violations fail here, before any solver work.
    pub fn new(
        fixed: Image,
        moved: Image,
        nodespacing: &[f64],
        config: RegistrationConfig,
    ) -> Result<Self> {
        if fixed.shape() != moved.shape() {
            return Err(RegistrationError::ShapeMismatch {
                expected: fixed.shape().to_vec(),
                actual: moved.shape().to_vec(),
            });
        }
        if nodespacing.len() != fixed.ndim() {
            return Err(RegistrationError::ShapeMismatch {
                expected: vec![fixed.ndim()],
                actual: vec![nodespacing.len()],
            });
        }
        config.validate()?;

        let schedule = calculate_node_spacings(fixed.shape(), fixed.ndim(), nodespacing)?;
        info!(
            generations = schedule.len(),
            coarsest = ?schedule[0],
            target = ?schedule[schedule.len() - 1],
            "node spacing schedule computed"
        );

        let map = Map::new(
            &fixed,
            &schedule[0][..fixed.ndim()],
            config.tile_dim,
            config.lambda_luminance_scale,
        )?;
        let workspace = WorkSpace::new(&fixed, &map);
        let registered = map.warp(&moved)?;

        Ok(Self {
            lambda: config.lambda,
            config,
            fixed,
            moved,
            registered,
            map,
            workspace,
            schedule,
            iterations_total: 0,
            frame_callback: None,
        })
    }

    /// Install a debug-frame observer.
    pub fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.frame_callback = Some(callback);
    }

    /// The current registered image M'.
    pub fn registered(&self) -> &Image {
        &self.registered
    }

    /// The current map.
    pub fn map(&self) -> &Map {
        &self.map
    }

    /// The node-spacing schedule, coarsest first.
    pub fn schedule(&self) -> &[[f64; 3]] {
        &self.schedule
    }

    /// Run the full coarse-to-fine registration.
    pub fn autoregister(&mut self) -> Result<RegistrationSummary> {
        let mut generations = Vec::with_capacity(self.schedule.len());
        for generation in 0..self.schedule.len() {
            info!(generation, spacing = ?self.schedule[generation], "starting generation");
            let result = self.innerloop(generation)?;
            info!(
                generation,
                iterations = result.iterations,
                converged = result.converged,
                "generation finished"
            );
            generations.push(result);

            if generation + 1 < self.schedule.len() {
                let next = self.schedule[generation + 1];
                let ndim = self.fixed.ndim();
                self.map = self.map.interpolate(&self.fixed, &next[..ndim])?;
                self.workspace.reallocate_ephemeral_workspace(&self.map);
                self.registered = self.map.warp(&self.moved)?;
                self.registered.normalize()?;
            }
        }
        Ok(RegistrationSummary {
            generations,
            total_iterations: self.iterations_total,
        })
    }

    fn innerloop(&mut self, outer_count: usize) -> Result<GenerationResult> {
        let mut converged = false;
        let mut a_max = f64::INFINITY;
        let mut iterations = 0;

        for inum in 0..self.config.max_iterations {
            a_max = self.innerstep(self.lambda)?;
            iterations = inum + 1;
            self.iterations_total += 1;
            info!(
                generation = outer_count,
                iteration = inum,
                update_max = a_max,
                "inner step complete"
            );
            if let Some(callback) = self.frame_callback.as_mut() {
                callback(outer_count, inum, &self.registered);
            }
            if a_max < self.config.convergence_threshold {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                generation = outer_count,
                update_max = a_max,
                threshold = self.config.convergence_threshold,
                "generation did not converge within iteration budget"
            );
        }
        Ok(GenerationResult {
            spacing: self.schedule[outer_count],
            iterations,
            converged,
            final_update_max: a_max,
        })
    }

    /// One Gauss–Newton-like iteration at fixed λ.
    ///
    /// Returns the infinity norm of the applied coefficient update.
    fn innerstep(&mut self, lambda: f64) -> Result<f64> {
        let ndim = self.fixed.ndim();
        let num_nodes = self.map.size();

        // ½(F + M'): the gradient source of the linearized intensity model.
        {
            let fixed = self.fixed.data().as_slice();
            let moved = self.registered.data().as_slice();
            self.workspace
                .intensity
                .as_mut_slice()
                .iter_mut()
                .zip(fixed.iter().zip(moved))
                .for_each(|(out, (f, m))| *out = 0.5 * (f + m));
        }
        let local = self.fixed.grid().local_field(&self.workspace.intensity)?;
        for dim in 0..ndim {
            self.workspace.grads[dim] =
                fd::gradient_to_global(self.fixed.grid(), &local, dim)?;
        }
        // Luminance coupling: 1 − ½(F + M'), reusing the same temporary.
        self.workspace
            .intensity
            .as_mut_slice()
            .iter_mut()
            .for_each(|v| *v = 1.0 - *v);
        self.workspace.scatter_grads_to_stacked();

        let mut tmat = self.map.basis().clone();
        scale_tmat(
            &mut tmat,
            self.workspace.stacked.as_slice(),
            self.workspace.intensity.as_slice(),
            ndim,
            num_nodes,
        );
        let t_transpose = tmat.transpose();
        let mut nmat = &t_transpose * &tmat;

        let luminance_scale = block_precondition(&mut nmat, ndim, num_nodes);
        debug!(luminance_scale, "block preconditioning applied");

        let mut regularizer = self.map.laplacian().clone();
        regularizer
            .values_mut()
            .iter_mut()
            .for_each(|v| *v *= lambda);
        let nmat = &nmat + &regularizer;

        // Residual F − M', staged through the stacked vector.
        {
            let fixed = self.fixed.data().as_slice();
            let moved = self.registered.data().as_slice();
            self.workspace.grads[0]
                .as_mut_slice()
                .iter_mut()
                .zip(fixed.iter().zip(moved))
                .for_each(|(out, (f, m))| *out = f - m);
        }
        self.workspace.duplicate_single_grad_to_stacked(0);
        self.workspace.rhs_from_stacked(&t_transpose, num_nodes);
        // The luminance rows of the rhs carry the same scaling as the matrix
        // rows, so the preconditioner leaves the Gauss–Newton update intact.
        let n_spatial = ndim * num_nodes;
        self.workspace.rhs.as_mut_slice()[n_spatial..]
            .iter_mut()
            .for_each(|v| *v *= luminance_scale);

        // T is the dominant allocation of the step; release it before the solve.
        drop(tmat);
        drop(t_transpose);

        self.workspace.delta_a = solver::solve(&self.config.solver, &nmat, &self.workspace.rhs)?;
        drop(nmat);

        self.map.update(&self.workspace.delta_a)?;
        self.registered = self.map.warp(&self.moved)?;
        self.registered.normalize()?;

        Ok(self.workspace.delta_a.amax())
    }
}

/// Scale each row of T per column block: spatial block d by `g_d(x)`, the
/// luminance block by the coupling field.
fn scale_tmat(
    tmat: &mut CsrMatrix<f64>,
    stacked: &[f64],
    coupling: &[f64],
    ndim: usize,
    num_nodes: usize,
) {
    let image_size = coupling.len();
    let (offsets, cols, vals) = tmat.csr_data_mut();
    for row in 0..image_size {
        for e in offsets[row]..offsets[row + 1] {
            let block = cols[e] / num_nodes;
            vals[e] *= if block < ndim {
                stacked[block * image_size + row]
            } else {
                coupling[row]
            };
        }
    }
}

/// Rebalance the luminance block of the normal matrix.
///
/// Averages the diagonal over the spatial rows and over the luminance rows,
/// then left-scales the luminance rows by the ratio so both blocks present
/// comparable magnitudes to the Krylov solver. Returns the applied scale.
fn block_precondition(nmat: &mut CsrMatrix<f64>, ndim: usize, num_nodes: usize) -> f64 {
    let n_spatial = ndim * num_nodes;
    let mut sum_spatial = 0.0;
    let mut sum_luminance = 0.0;
    {
        let (offsets, cols, vals) = nmat.csr_data();
        for row in 0..nmat.nrows() {
            for e in offsets[row]..offsets[row + 1] {
                if cols[e] == row {
                    if row < n_spatial {
                        sum_spatial += vals[e];
                    } else {
                        sum_luminance += vals[e];
                    }
                    break;
                }
                if cols[e] > row {
                    break;
                }
            }
        }
    }
    let sigma_spatial = sum_spatial / n_spatial as f64;
    let sigma_luminance = sum_luminance / num_nodes as f64;
    let scale = if sigma_luminance.abs() > f64::EPSILON {
        sigma_spatial / sigma_luminance
    } else {
        1.0
    };

    let nrows = nmat.nrows();
    let (offsets, _cols, vals) = nmat.csr_data_mut();
    for row in n_spatial..nrows {
        for e in offsets[row]..offsets[row + 1] {
            vals[e] *= scale;
        }
    }
    scale
}

/// Node-spacing schedule, coarsest first.
///
/// Doubles upward from the user target while every dimension keeps more than
/// two node cells across the image; the target itself is always included.
pub fn calculate_node_spacings(
    img_shape: [usize; 3],
    ndim: usize,
    target: &[f64],
) -> Result<Vec<[f64; 3]>> {
    if target.len() != ndim {
        return Err(RegistrationError::ShapeMismatch {
            expected: vec![ndim],
            actual: vec![target.len()],
        });
    }
    if target.iter().any(|&s| !(s > 0.0)) {
        return Err(RegistrationError::config(format!(
            "node spacing must be positive, got {:?}",
            target
        )));
    }

    let mut spacing = [1.0f64; 3];
    spacing[..ndim].copy_from_slice(target);

    let mut schedule = vec![spacing];
    loop {
        let mut doubled = spacing;
        for d in 0..ndim {
            doubled[d] *= 2.0;
        }
        if (0..ndim).all(|d| img_shape[d] as f64 / doubled[d] > 2.0) {
            schedule.push(doubled);
            spacing = doubled;
        } else {
            break;
        }
    }
    schedule.reverse();
    Ok(schedule)
}
