//! Discrete Laplacian smoothness operator on the map node grid.
//!
//! Block-diagonal with one block per coefficient component. Each block is
//! the 7-point (5-point in 2-D) graph Laplacian: off-diagonal −1 per present
//! neighbour, diagonal equal to the neighbour count, so boundary diagonals
//! shrink by the number of missing neighbours. Symmetric positive
//! semi-definite with zero row sums.

use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Build the block-diagonal node-grid Laplacian.
///
/// `luminance_scale` weights the last block relative to the spatial blocks
/// (1.0 reproduces the equal-weight behaviour).
pub fn build_laplacian(node_shape: [usize; 3], ndim: usize, luminance_scale: f64) -> CsrMatrix<f64> {
    let node_size = node_shape[0] * node_shape[1] * node_shape[2];
    let ncomp = ndim + 1;
    let total = ncomp * node_size;

    let node_index =
        |i: usize, j: usize, k: usize| i + node_shape[0] * (j + node_shape[1] * k);

    let mut coo = CooMatrix::new(total, total);
    for block in 0..ncomp {
        let scale = if block == ndim { luminance_scale } else { 1.0 };
        let base = block * node_size;
        for node in 0..node_size {
            let i = node % node_shape[0];
            let rest = node / node_shape[0];
            let coords = [i, rest % node_shape[1], rest / node_shape[1]];

            let mut degree = 0.0;
            for d in 0..ndim {
                if node_shape[d] == 1 {
                    continue;
                }
                for step in [-1isize, 1] {
                    let n = coords[d] as isize + step;
                    if n < 0 || n >= node_shape[d] as isize {
                        continue;
                    }
                    let mut nb = coords;
                    nb[d] = n as usize;
                    coo.push(
                        base + node,
                        base + node_index(nb[0], nb[1], nb[2]),
                        -scale,
                    );
                    degree += 1.0;
                }
            }
            coo.push(base + node, base + node, scale * degree);
        }
    }
    CsrMatrix::from(&coo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mat: &CsrMatrix<f64>, r: usize, c: usize) -> f64 {
        let row = mat.row(r);
        row.col_indices()
            .iter()
            .zip(row.values())
            .find(|(&col, _)| col == c)
            .map(|(_, &v)| v)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_laplacian_is_symmetric() {
        let lap = build_laplacian([3, 3, 2], 3, 1.0);
        assert_eq!(lap.nrows(), lap.ncols());
        let t = lap.transpose();
        let (or, oc, ov) = lap.csr_data();
        let (tr, tc, tv) = t.csr_data();
        assert_eq!(or, tr);
        assert_eq!(oc, tc);
        for (a, b) in ov.iter().zip(tv) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn test_row_sums_are_zero() {
        let lap = build_laplacian([4, 3, 2], 3, 1.0);
        let (offsets, _, vals) = lap.csr_data();
        for r in 0..lap.nrows() {
            let sum: f64 = vals[offsets[r]..offsets[r + 1]].iter().sum();
            assert!(sum.abs() < 1e-12);
        }
    }

    #[test]
    fn test_boundary_diagonal_reduced() {
        let lap = build_laplacian([3, 3, 3], 3, 1.0);
        // Corner node (0,0,0): 3 neighbours; face-centre (1,1,0): 5; interior (1,1,1): 6.
        assert_eq!(entry(&lap, 0, 0), 3.0);
        let face = 1 + 3 * 1;
        assert_eq!(entry(&lap, face, face), 5.0);
        let interior = 1 + 3 * (1 + 3 * 1);
        assert_eq!(entry(&lap, interior, interior), 6.0);
    }

    #[test]
    fn test_2d_block_structure() {
        let lap = build_laplacian([3, 3, 1], 2, 1.0);
        assert_eq!(lap.nrows(), 3 * 9);
        // Centre node of a 3x3 grid has 4 neighbours in 2-D.
        let centre = 1 + 3 * 1;
        assert_eq!(entry(&lap, centre, centre), 4.0);
        // No coupling between component blocks.
        let (offsets, cols, _) = lap.csr_data();
        for r in 0..lap.nrows() {
            let block = r / 9;
            for e in offsets[r]..offsets[r + 1] {
                assert_eq!(cols[e] / 9, block);
            }
        }
    }

    #[test]
    fn test_luminance_scale_applies_to_last_block() {
        let lap = build_laplacian([3, 3, 1], 2, 0.5);
        let spatial_centre = 1 + 3 * 1;
        let lum_centre = 2 * 9 + spatial_centre;
        assert_eq!(entry(&lap, spatial_centre, spatial_centre), 4.0);
        assert_eq!(entry(&lap, lum_centre, lum_centre), 2.0);
    }
}
