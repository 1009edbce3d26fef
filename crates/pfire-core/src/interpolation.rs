//! Clamped trilinear sampling.
//!
//! Works on any x-fastest value slice with an associated shape, so the same
//! routine samples image intensities and coefficient fields on node grids.
//! Out-of-domain positions clamp to the nearest valid sample.

/// Sample a field at a continuous position by trilinear interpolation.
///
/// `shape` describes the x-fastest layout of `values`; `pos` is in grid
/// coordinates. Positions outside the domain are clamped, so the result is
/// always a convex combination of stored samples.
pub fn trilinear(values: &[f64], shape: [usize; 3], pos: [f64; 3]) -> f64 {
    debug_assert_eq!(values.len(), shape[0] * shape[1] * shape[2]);

    let mut base = [0usize; 3];
    let mut frac = [0f64; 3];
    for d in 0..3 {
        let hi = (shape[d] - 1) as f64;
        let p = pos[d].clamp(0.0, hi);
        let n = p.floor().min(hi - 1.0).max(0.0);
        base[d] = n as usize;
        frac[d] = if shape[d] > 1 { p - n } else { 0.0 };
    }

    let at = |i: usize, j: usize, k: usize| values[i + shape[0] * (j + shape[1] * k)];

    let mut acc = 0.0;
    for dk in 0..2usize {
        let k = (base[2] + dk).min(shape[2] - 1);
        let wk = if dk == 0 { 1.0 - frac[2] } else { frac[2] };
        if wk == 0.0 {
            continue;
        }
        for dj in 0..2usize {
            let j = (base[1] + dj).min(shape[1] - 1);
            let wj = if dj == 0 { 1.0 - frac[1] } else { frac[1] };
            if wj == 0.0 {
                continue;
            }
            for di in 0..2usize {
                let i = (base[0] + di).min(shape[0] - 1);
                let wi = if di == 0 { 1.0 - frac[0] } else { frac[0] };
                if wi == 0.0 {
                    continue;
                }
                acc += wi * wj * wk * at(i, j, k);
            }
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_at_grid_points_is_exact() {
        let shape = [3, 2, 2];
        let values: Vec<f64> = (0..12).map(|v| v as f64 * 1.5).collect();
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..3 {
                    let got = trilinear(&values, shape, [i as f64, j as f64, k as f64]);
                    let want = values[i + 3 * (j + 2 * k)];
                    assert!((got - want).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_linear_field_reproduced() {
        let shape = [4, 4, 4];
        let values: Vec<f64> = (0..64)
            .map(|r| {
                let i = r % 4;
                let j = (r / 4) % 4;
                let k = r / 16;
                2.0 * i as f64 + 3.0 * j as f64 - k as f64
            })
            .collect();
        let got = trilinear(&values, shape, [1.25, 2.5, 0.75]);
        let want = 2.0 * 1.25 + 3.0 * 2.5 - 0.75;
        assert!((got - want).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_domain_clamps() {
        let shape = [2, 2, 1];
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert!((trilinear(&values, shape, [-5.0, 0.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!((trilinear(&values, shape, [10.0, 10.0, 3.0]) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_depth_one_ignores_z() {
        let shape = [2, 2, 1];
        let values = vec![0.0, 1.0, 2.0, 3.0];
        let a = trilinear(&values, shape, [0.5, 0.5, 0.0]);
        let b = trilinear(&values, shape, [0.5, 0.5, 0.9]);
        assert!((a - b).abs() < 1e-12);
        assert!((a - 1.5).abs() < 1e-12);
    }
}
