//! Sparse interpolation basis from the map node grid to the image grid.
//!
//! The basis B has one row per image voxel and `(D+1)·|N|` columns: D
//! spatial blocks sharing the same trilinear weights, then a luminance block
//! with a single unit entry per row selecting the voxel's base node. Rows
//! whose support would leave the node grid clamp to the nearest valid node.

use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;

/// Trilinear corner weight: product over dimensions of `1 - |f_d - δ_d|`.
#[inline]
pub fn basis_coefficient(frac: &[f64], corner: usize, ndim: usize) -> f64 {
    let mut w = 1.0;
    for (d, f) in frac.iter().enumerate().take(ndim) {
        let delta = ((corner >> d) & 1) as f64;
        w *= 1.0 - (f - delta).abs();
    }
    w
}

/// Build the interpolation basis matrix.
///
/// `scalings` and `offsets` place the node grid in image coordinates:
/// a voxel at `x` has node-space position `(x_d - o_d) / σ_d`. Assembly is
/// batched into tiles of `tile_dim` image rows to bound temporary storage;
/// tiles are filled in parallel and merged in row order.
pub fn build_basis_matrix(
    img_shape: [usize; 3],
    node_shape: [usize; 3],
    scalings: [f64; 3],
    offsets: [f64; 3],
    ndim: usize,
    tile_dim: usize,
) -> CsrMatrix<f64> {
    let img_size = img_shape[0] * img_shape[1] * img_shape[2];
    let node_size = node_shape[0] * node_shape[1] * node_shape[2];
    let ncomp = ndim + 1;
    let corners = 1usize << ndim;

    let tile_rows = tile_dim.max(1) * img_shape[0];
    let num_tiles = img_size.div_ceil(tile_rows);

    let tiles: Vec<Vec<(usize, usize, f64)>> = (0..num_tiles)
        .into_par_iter()
        .map(|tile| {
            let start = tile * tile_rows;
            let end = (start + tile_rows).min(img_size);
            let mut entries = Vec::with_capacity((end - start) * (ndim * corners + 1));

            for row in start..end {
                let i = row % img_shape[0];
                let rest = row / img_shape[0];
                let voxel = [i, rest % img_shape[1], rest / img_shape[1]];

                let mut base = [0isize; 3];
                let mut frac = [0f64; 3];
                for d in 0..ndim {
                    let p = (voxel[d] as f64 - offsets[d]) / scalings[d];
                    let n = p.floor();
                    base[d] = n as isize;
                    frac[d] = p - n;
                }

                for corner in 0..corners {
                    let mut node = base;
                    for d in 0..ndim {
                        node[d] += ((corner >> d) & 1) as isize;
                    }
                    let col = clamped_node_index(node_shape, node);
                    let w = basis_coefficient(&frac, corner, ndim);
                    for block in 0..ndim {
                        entries.push((row, block * node_size + col, w));
                    }
                }
                // Luminance block: unit weight on the base node.
                let col = clamped_node_index(node_shape, base);
                entries.push((row, ndim * node_size + col, 1.0));
            }
            entries
        })
        .collect();

    let mut coo = CooMatrix::new(img_size, ncomp * node_size);
    for tile in tiles {
        for (r, c, v) in tile {
            coo.push(r, c, v);
        }
    }
    CsrMatrix::from(&coo)
}

#[inline]
fn clamped_node_index(node_shape: [usize; 3], node: [isize; 3]) -> usize {
    let i = node[0].clamp(0, node_shape[0] as isize - 1) as usize;
    let j = node[1].clamp(0, node_shape[1] as isize - 1) as usize;
    let k = node[2].clamp(0, node_shape[2] as isize - 1) as usize;
    i + node_shape[0] * (j + node_shape[1] * k)
}
