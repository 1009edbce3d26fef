//! Finite-difference routines on grid fields.

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{CoreError, Result};
use crate::grid::{Grid, LocalField};

/// Central-difference gradient of a ghosted local field along one dimension.
///
/// Computes `g[x] = 0.5 * (u[x + e_d] - u[x - e_d])` over the owned region,
/// reading boundary neighbours from the ghost layer, and returns the result
/// as a global vector on the same grid.
///
/// Fails with `InvalidArgument` when the local field was not built for
/// `grid` or `dim` is out of range.
pub fn gradient_to_global(grid: &Grid, local: &LocalField, dim: usize) -> Result<DVector<f64>> {
    if dim >= 3 {
        return Err(CoreError::invalid_argument(format!(
            "gradient dimension {} out of range",
            dim
        )));
    }
    if !local.compatible_with(grid) {
        return Err(CoreError::invalid_argument(
            "provided local field invalid for given grid",
        ));
    }

    let mut ofs = [0isize; 3];
    ofs[dim] = 1;

    let values: Vec<f64> = (0..grid.size())
        .into_par_iter()
        .map(|flat| {
            let [i, j, k] = grid.coords(flat);
            let (i, j, k) = (i as isize, j as isize, k as isize);
            0.5 * (local.get(i + ofs[0], j + ofs[1], k + ofs[2])
                - local.get(i - ofs[0], j - ofs[1], k - ofs[2]))
        })
        .collect();

    Ok(DVector::from_vec(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_ramp(grid: &Grid, slope: [f64; 3]) -> DVector<f64> {
        DVector::from_fn(grid.size(), |r, _| {
            let [i, j, k] = grid.coords(r);
            slope[0] * i as f64 + slope[1] * j as f64 + slope[2] * k as f64
        })
    }

    #[test]
    fn test_gradient_of_linear_ramp() {
        let grid = Grid::new([6, 5, 4]).unwrap();
        let global = linear_ramp(&grid, [2.0, -1.0, 0.5]);
        let local = grid.local_field(&global).unwrap();

        let gx = gradient_to_global(&grid, &local, 0).unwrap();
        // Interior points see the exact slope; mirror ghosts halve it at the faces.
        assert!((gx[grid.idx(2, 2, 2)] - 2.0).abs() < 1e-12);
        assert!((gx[grid.idx(0, 2, 2)] - 1.0).abs() < 1e-12);

        let gy = gradient_to_global(&grid, &local, 1).unwrap();
        assert!((gy[grid.idx(3, 2, 1)] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_depth_one_z_is_zero() {
        let grid = Grid::new([8, 8, 1]).unwrap();
        let global = linear_ramp(&grid, [1.0, 1.0, 0.0]);
        let local = grid.local_field(&global).unwrap();
        let gz = gradient_to_global(&grid, &local, 2).unwrap();
        assert!(gz.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_gradient_rejects_mismatched_field() {
        let grid = Grid::new([4, 4, 4]).unwrap();
        let other = Grid::new([5, 4, 4]).unwrap();
        let local = other
            .local_field(&DVector::zeros(other.size()))
            .unwrap();
        assert!(gradient_to_global(&grid, &local, 0).is_err());
    }

    #[test]
    fn test_gradient_rejects_bad_dimension() {
        let grid = Grid::new([4, 4, 4]).unwrap();
        let local = grid.local_field(&DVector::zeros(grid.size())).unwrap();
        assert!(gradient_to_global(&grid, &local, 3).is_err());
    }
}
