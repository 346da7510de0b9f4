//! Long-range polar correction to the interpolated coupling.
//!
//! The short-range Wannier interpolation misses the macroscopic electric
//! field set up by longitudinal phonons in polar crystals. The correction
//! is a reciprocal-space Ewald-like sum over (q+G) vectors within a cutoff,
//! weighted by Born effective charges and atomic-position phases, combined
//! with the electronic band overlap. It is split in two parts: the per-mode
//! vector depends only on destination data and may be precomputed per
//! batch; the overlap combination closes over the source eigenvectors.

use crate::constants::{CHARGE_SQUARE, FOUR_PI};
use itertools::iproduct;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array3, ArrayView2};
use num_complex::Complex;

/// Cutoff on `(q+G)^T eps (q+G) / 4` for the reciprocal-vector sum
const G_MAX: f64 = 14.0;

/// The per-mode polar vector at a destination phonon wavevector.
///
/// `ev3` is the phonon eigenvector matrix, shape `(3 * num_atoms, modes)`;
/// `born_charges` has shape `(num_atoms, 3, 3)`. Terms with a non-positive
/// dielectric denominator are skipped; they are the separately-handled
/// zone-center divergence, not faults.
pub(crate) fn correction_part1_static(
    q3: Vector3<f64>,
    ev3: ArrayView2<'_, Complex<f64>>,
    volume: f64,
    reciprocal_cell: &Matrix3<f64>,
    epsilon: &Matrix3<f64>,
    born_charges: &ndarray::Array3<f64>,
    atomic_positions: &[Vector3<f64>],
    coarse_grid: [i32; 3],
) -> Array1<Complex<f64>> {
    let num_atoms = atomic_positions.len();
    let num_modes = ev3.ncols();
    let factor = Complex::new(0.0, CHARGE_SQUARE * FOUR_PI / volume);

    let mut x = Array1::<Complex<f64>>::zeros(num_modes);
    for (m1, m2, m3) in iproduct!(
        -coarse_grid[0]..=coarse_grid[0],
        -coarse_grid[1]..=coarse_grid[1],
        -coarse_grid[2]..=coarse_grid[2]
    ) {
        let g_vector = reciprocal_cell * Vector3::new(m1 as f64, m2 as f64, m3 as f64) + q3;
        let q_eps_q = (g_vector.transpose() * epsilon * g_vector)[(0, 0)];
        if q_eps_q <= 0.0 || q_eps_q / 4.0 >= G_MAX {
            continue;
        }
        let factor2 = factor * (-q_eps_q / 4.0).exp() / q_eps_q;
        for (atom, position) in atomic_positions.iter().enumerate() {
            let arg = -g_vector.dot(position);
            let factor3 = factor2 * Complex::new(arg.cos(), arg.sin());
            for polarization in 0..3 {
                let gq_dot_z: f64 = (0..3)
                    .map(|d| g_vector[d] * born_charges[(atom, d, polarization)])
                    .sum();
                let row = 3 * atom + polarization;
                for nu in 0..num_modes {
                    x[nu] += factor3 * gq_dot_z * ev3[(row, nu)];
                }
            }
        }
    }
    x
}

/// Combines the per-mode polar vector with the electronic band overlap.
///
/// The overlap is `ev2^dagger * ev1`, transposed to `(nb1, nb2)`; the
/// result has shape `(nb1, nb2, modes)`.
pub(crate) fn correction_part2(
    ev1: ArrayView2<'_, Complex<f64>>,
    ev2: ArrayView2<'_, Complex<f64>>,
    x: &Array1<Complex<f64>>,
) -> Array3<Complex<f64>> {
    let nb1 = ev1.ncols();
    let nb2 = ev2.ncols();
    let num_rows = ev1.nrows();
    let num_modes = x.len();

    let mut correction = Array3::<Complex<f64>>::zeros((nb1, nb2, num_modes));
    for ib1 in 0..nb1 {
        for ib2 in 0..nb2 {
            let mut overlap = Complex::new(0.0, 0.0);
            for row in 0..num_rows {
                overlap += ev2[(row, ib2)].conj() * ev1[(row, ib1)];
            }
            for nu in 0..num_modes {
                correction[(ib1, ib2, nu)] = x[nu] * overlap;
            }
        }
    }
    correction
}

#[cfg(test)]
mod test {
    use super::{correction_part1_static, correction_part2};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use ndarray::{Array1, Array2, Array3};
    use num_complex::Complex;

    #[test]
    fn vanishing_born_charges_give_no_correction() {
        let ev3 = Array2::from_elem((6, 6), Complex::new(0.5, 0.0));
        let x = correction_part1_static(
            Vector3::new(0.1, 0.0, 0.0),
            ev3.view(),
            1.0,
            &Matrix3::identity(),
            &Matrix3::identity(),
            &Array3::zeros((2, 3, 3)),
            &[Vector3::zeros(), Vector3::new(0.5, 0.5, 0.5)],
            [2, 2, 2],
        );
        for value in x.iter() {
            assert_relative_eq!(value.norm(), 0.0);
        }
    }

    #[test]
    fn zone_center_term_is_skipped_without_neighbors() {
        // with a zero coarse grid only q + 0 survives, and q = 0 has a
        // non-positive denominator, so the sum is empty
        let ev3 = Array2::from_elem((3, 3), Complex::new(1.0, 0.0));
        let x = correction_part1_static(
            Vector3::zeros(),
            ev3.view(),
            1.0,
            &Matrix3::identity(),
            &Matrix3::identity(),
            &Array3::ones((1, 3, 3)),
            &[Vector3::zeros()],
            [0, 0, 0],
        );
        for value in x.iter() {
            assert_relative_eq!(value.norm(), 0.0);
        }
    }

    #[test]
    fn overlap_combination_is_an_outer_product() {
        // identity eigenvectors make the overlap the identity matrix
        let ev = Array2::from_shape_fn((2, 2), |(i, j)| {
            Complex::new(if i == j { 1.0 } else { 0.0 }, 0.0)
        });
        let x = Array1::from(vec![Complex::new(2.0, 1.0), Complex::new(0.0, -1.0)]);
        let correction = correction_part2(ev.view(), ev.view(), &x);
        for ib1 in 0..2 {
            for ib2 in 0..2 {
                for nu in 0..2 {
                    let expected = if ib1 == ib2 { x[nu] } else { Complex::new(0.0, 0.0) };
                    assert_relative_eq!(
                        correction[(ib1, ib2, nu)].re,
                        expected.re,
                        max_relative = 1e-14
                    );
                    assert_relative_eq!(
                        correction[(ib1, ib2, nu)].im,
                        expected.im,
                        max_relative = 1e-14
                    );
                }
            }
        }
    }
}
