//! Cross-module checks on grids, images and gradients.

use nalgebra::DVector;
use pfire_core::interpolation::trilinear;
use pfire_core::{fd, Image};

#[test]
fn test_image_gradient_matches_fd_routine() {
    let mut img = Image::new(&[6, 6, 6]).unwrap();
    let grid = img.grid().clone();
    for idx in 0..img.size() {
        let [i, j, k] = grid.coords(idx);
        img.data_mut()[idx] = (i * i) as f64 + 2.0 * j as f64 + k as f64;
    }

    let via_image = img.gradient(0).unwrap();
    let local = img.to_local().unwrap();
    let via_fd = fd::gradient_to_global(img.grid(), &local, 0).unwrap();
    assert!((via_image - via_fd).amax() < 1e-15);
}

#[test]
fn test_quadratic_gradient_interior_values() {
    let mut img = Image::new(&[8, 4, 4]).unwrap();
    let grid = img.grid().clone();
    for idx in 0..img.size() {
        let [i, _, _] = grid.coords(idx);
        img.data_mut()[idx] = (i * i) as f64;
    }
    let g = img.gradient(0).unwrap();
    // Central difference of i² is exactly 2i away from the faces.
    for i in 1..7 {
        assert!((g[grid.idx(i, 2, 2)] - 2.0 * i as f64).abs() < 1e-12);
    }
}

#[test]
fn test_promoted_2d_image_has_zero_z_gradient() {
    let mut img = Image::new(&[10, 10]).unwrap();
    for idx in 0..img.size() {
        img.data_mut()[idx] = (idx % 7) as f64;
    }
    let gz = img.gradient(2).unwrap();
    assert_eq!(gz.amax(), 0.0);
}

#[test]
fn test_trilinear_on_image_grid() {
    let mut img = Image::new(&[4, 4, 4]).unwrap();
    let grid = img.grid().clone();
    for idx in 0..img.size() {
        let [i, j, k] = grid.coords(idx);
        img.data_mut()[idx] = i as f64 + 10.0 * j as f64 + 100.0 * k as f64;
    }
    let v = trilinear(img.data().as_slice(), img.shape(), [1.5, 2.0, 0.25]);
    assert!((v - (1.5 + 20.0 + 25.0)).abs() < 1e-12);
}

#[test]
fn test_local_field_round_trip_preserves_global() {
    let img = Image::from_data(
        &[5, 3, 2],
        (0..30).map(|v| v as f64 * 0.1).collect::<Vec<_>>(),
    )
    .unwrap();
    let local = img.to_local().unwrap();
    let grid = img.grid();
    let mut recovered = DVector::zeros(img.size());
    for idx in 0..img.size() {
        let [i, j, k] = grid.coords(idx);
        recovered[idx] = local.get(i as isize, j as isize, k as isize);
    }
    assert!((recovered - img.data()).amax() < 1e-15);
}
