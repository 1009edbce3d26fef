//! Iterative Krylov solvers over sparse CSR systems.
//!
//! Provides the linear-solve primitive used by the registration driver:
//! restarted GMRES by default (the normal matrix is left-scaled and not
//! symmetric) with conjugate gradients as a configurable alternative. Both
//! use Jacobi (diagonal) preconditioning. Solver selection and tolerances
//! come from [`SolverConfig`], which the CLI exposes as runtime options.

use std::str::FromStr;

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Which Krylov method to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    /// Restarted GMRES; handles the non-symmetric preconditioned system.
    Gmres,
    /// Conjugate gradients; valid for symmetric positive (semi-)definite systems.
    Cg,
}

impl FromStr for SolverKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gmres" => Ok(Self::Gmres),
            "cg" => Ok(Self::Cg),
            other => Err(CoreError::invalid_argument(format!(
                "unknown solver type '{}', expected 'gmres' or 'cg'",
                other
            ))),
        }
    }
}

/// Tolerances and iteration limits for the linear solve.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub kind: SolverKind,
    /// Relative decrease of the preconditioned residual norm.
    pub rtol: f64,
    /// Absolute residual floor.
    pub atol: f64,
    /// Total Krylov iteration budget.
    pub max_iterations: usize,
    /// GMRES restart length.
    pub restart: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            kind: SolverKind::Gmres,
            rtol: 1e-5,
            atol: 1e-50,
            max_iterations: 10_000,
            restart: 30,
        }
    }
}

impl SolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: SolverKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = restart;
        self
    }
}

/// Sparse matrix–vector product, parallel over rows.
pub fn spmv(mat: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    debug_assert_eq!(mat.ncols(), x.len());
    let (offsets, cols, vals) = mat.csr_data();
    let xs = x.as_slice();
    let y: Vec<f64> = (0..mat.nrows())
        .into_par_iter()
        .map(|r| {
            let mut acc = 0.0;
            for e in offsets[r]..offsets[r + 1] {
                acc += vals[e] * xs[cols[e]];
            }
            acc
        })
        .collect();
    DVector::from_vec(y)
}

/// Inverse-diagonal entries for Jacobi preconditioning.
///
/// Zero or absent diagonal entries map to 1 so that rank-deficient blocks
/// (e.g. λ = 0 with no intensity support) pass through unscaled instead of
/// poisoning the solve.
fn jacobi_inverse(mat: &CsrMatrix<f64>) -> DVector<f64> {
    let mut inv = DVector::from_element(mat.nrows(), 1.0);
    let (offsets, cols, vals) = mat.csr_data();
    for r in 0..mat.nrows() {
        for e in offsets[r]..offsets[r + 1] {
            if cols[e] == r && vals[e].abs() > f64::EPSILON {
                inv[r] = 1.0 / vals[e];
                break;
            }
        }
    }
    inv
}

#[inline]
fn precondition_in_place(v: &mut DVector<f64>, minv: &DVector<f64>) {
    v.as_mut_slice()
        .iter_mut()
        .zip(minv.iter())
        .for_each(|(x, &d)| *x *= d);
}

/// Solve `mat · x = rhs` with the configured Krylov method.
///
/// A solve that exhausts its iteration budget returns the best iterate with
/// a warning; NaN/Inf contamination or a structural breakdown is a
/// `Backend` error.
pub fn solve(config: &SolverConfig, mat: &CsrMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    if mat.nrows() != mat.ncols() {
        return Err(CoreError::invalid_argument(format!(
            "solver requires a square matrix, got {}x{}",
            mat.nrows(),
            mat.ncols()
        )));
    }
    if mat.nrows() != rhs.len() {
        return Err(CoreError::invalid_argument(format!(
            "matrix of size {} incompatible with rhs of length {}",
            mat.nrows(),
            rhs.len()
        )));
    }

    let x = match config.kind {
        SolverKind::Gmres => gmres(config, mat, rhs)?,
        SolverKind::Cg => cg(config, mat, rhs)?,
    };

    if x.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::backend("linear solve produced non-finite values"));
    }
    Ok(x)
}

fn gmres(config: &SolverConfig, mat: &CsrMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    let n = rhs.len();
    let minv = jacobi_inverse(mat);

    let mut pb = rhs.clone();
    precondition_in_place(&mut pb, &minv);
    let bnorm = pb.norm();
    if bnorm <= config.atol || bnorm == 0.0 {
        return Ok(DVector::zeros(n));
    }
    let tol = (config.rtol * bnorm).max(config.atol);

    let restart = config.restart.max(1);
    let mut x = DVector::zeros(n);
    let mut total_iters = 0usize;

    loop {
        let mut r = rhs - spmv(mat, &x);
        precondition_in_place(&mut r, &minv);
        let beta = r.norm();
        if !beta.is_finite() {
            return Err(CoreError::backend("GMRES residual diverged"));
        }
        if beta <= tol {
            debug!(iterations = total_iters, residual = beta, "gmres converged");
            return Ok(x);
        }
        if total_iters >= config.max_iterations {
            warn!(
                iterations = total_iters,
                residual = beta,
                tolerance = tol,
                "gmres reached iteration limit without convergence"
            );
            return Ok(x);
        }

        let m = restart.min(config.max_iterations - total_iters);
        let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
        basis.push(&r / beta);
        let mut h = vec![vec![0.0f64; m]; m + 1];
        let mut cs = vec![0.0f64; m];
        let mut sn = vec![0.0f64; m];
        let mut g = vec![0.0f64; m + 1];
        g[0] = beta;
        let mut cols_used = 0usize;
        let mut stagnated = false;

        for j in 0..m {
            let mut w = spmv(mat, &basis[j]);
            precondition_in_place(&mut w, &minv);
            for i in 0..=j {
                h[i][j] = w.dot(&basis[i]);
                w.axpy(-h[i][j], &basis[i], 1.0);
            }
            let hnext = w.norm();
            h[j + 1][j] = hnext;

            for i in 0..j {
                let tmp = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
                h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
                h[i][j] = tmp;
            }
            let denom = (h[j][j] * h[j][j] + h[j + 1][j] * h[j + 1][j]).sqrt();
            if !denom.is_finite() {
                return Err(CoreError::backend("GMRES rotation diverged"));
            }
            // Stagnation on a singular direction: keep the columns built so far.
            if denom == 0.0 {
                warn!(iteration = total_iters, "gmres stagnated on a singular direction");
                stagnated = true;
                break;
            }
            cs[j] = h[j][j] / denom;
            sn[j] = h[j + 1][j] / denom;
            h[j][j] = denom;
            h[j + 1][j] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];

            total_iters += 1;
            cols_used = j + 1;

            // Happy breakdown: the Krylov space is exhausted.
            if g[j + 1].abs() <= tol || hnext < 1e-14 || total_iters >= config.max_iterations {
                break;
            }
            basis.push(&w / hnext);
        }

        let mut y = vec![0.0f64; cols_used];
        for i in (0..cols_used).rev() {
            let mut s = g[i];
            for l in i + 1..cols_used {
                s -= h[i][l] * y[l];
            }
            if h[i][i] == 0.0 {
                return Err(CoreError::backend("GMRES back-substitution breakdown"));
            }
            y[i] = s / h[i][i];
        }
        for i in 0..cols_used {
            x.axpy(y[i], &basis[i], 1.0);
        }
        if stagnated {
            return Ok(x);
        }
    }
}

fn cg(config: &SolverConfig, mat: &CsrMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    let n = rhs.len();
    let minv = jacobi_inverse(mat);

    let mut x = DVector::zeros(n);
    let mut r = rhs.clone();
    let bnorm = r.norm();
    if bnorm <= config.atol || bnorm == 0.0 {
        return Ok(x);
    }
    let tol = (config.rtol * bnorm).max(config.atol);

    let mut z = r.clone();
    precondition_in_place(&mut z, &minv);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut converged = false;

    for it in 0..config.max_iterations {
        let ap = spmv(mat, &p);
        let pap = p.dot(&ap);
        if !pap.is_finite() {
            return Err(CoreError::backend("CG curvature diverged"));
        }
        // Semi-definite stagnation (e.g. λ = 0): keep the current iterate.
        if pap.abs() < f64::MIN_POSITIVE {
            warn!(iteration = it, "cg stagnated on a singular direction");
            break;
        }
        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);
        if r.norm() <= tol {
            debug!(iterations = it + 1, "cg converged");
            converged = true;
            break;
        }
        z.copy_from(&r);
        precondition_in_place(&mut z, &minv);
        let rz_new = r.dot(&z);
        let beta = rz_new / rz;
        rz = rz_new;
        p *= beta;
        p += &z;
    }

    if !converged && r.norm() > tol {
        warn!(
            residual = r.norm(),
            tolerance = tol,
            "cg reached iteration limit without convergence"
        );
    }
    Ok(x)
}
