//! Deterministic fixtures for the elphscatter test suites: small crystals,
//! uniform coupling tensors, reference band structures and a trivial
//! Hamiltonian for the off-grid re-diagonalization path.

use crate::bandstructure::{BandStructure, HarmonicHamiltonian, MeshPoints};
use crate::crystal::{Crystal, DielectricModel};
use crate::statistics::Particle;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2, Array3, Array5};
use num_complex::Complex;
use rand::Rng;
use std::cell::Cell;

/// An identity eigenvector matrix of dimension `n`
pub fn identity_eigenvectors(n: usize) -> Array2<Complex<f64>> {
    Array2::from_shape_fn((n, n), |(i, j)| {
        Complex::new(if i == j { 1.0 } else { 0.0 }, 0.0)
    })
}

/// A cubic crystal with a single atom and an isotropic dielectric model;
/// the polar correction is inactive for it
pub fn one_atom_crystal() -> (Crystal, DielectricModel) {
    let crystal = Crystal::new(
        Matrix3::identity() * 5.0,
        vec![Vector3::zeros()],
        vec![0],
    )
    .expect("fixture cell is regular");
    let dielectric = DielectricModel::new(
        Matrix3::identity() * 4.0,
        Array3::ones((1, 3, 3)),
        [2, 2, 2],
    );
    (crystal, dielectric)
}

/// A rock-salt-like two-species crystal with opposite Born charges
pub fn two_atom_crystal() -> (Crystal, DielectricModel) {
    let crystal = Crystal::new(
        Matrix3::identity() * 5.0,
        vec![Vector3::zeros(), Vector3::new(2.5, 2.5, 2.5)],
        vec![0, 1],
    )
    .expect("fixture cell is regular");
    let mut born_charges = Array3::zeros((2, 3, 3));
    for d in 0..3 {
        born_charges[(0, d, d)] = 1.0;
        born_charges[(1, d, d)] = -1.0;
    }
    let dielectric = DielectricModel::new(Matrix3::identity() * 4.0, born_charges, [2, 2, 2]);
    (crystal, dielectric)
}

/// A uniform coupling tensor over lattice-vector lists generated from
/// `mesh`, together with the vector lists and unit degeneracies.
///
/// Both sublattices share the same vector set; the tensor holds `value`
/// in every entry and has shape
/// `(vectors, vectors, modes, wannier, wannier)`.
pub fn uniform_coupling(
    mesh: [usize; 3],
    num_wannier: usize,
    num_modes: usize,
    value: f64,
) -> (
    Array5<Complex<f64>>,
    Array2<f64>,
    Array1<f64>,
    Array2<f64>,
    Array1<f64>,
) {
    let count = mesh[0] * mesh[1] * mesh[2];
    let mut vectors = Array2::zeros((count, 3));
    let mut row = 0;
    for i in 0..mesh[0] {
        for j in 0..mesh[1] {
            for k in 0..mesh[2] {
                vectors[(row, 0)] = i as f64;
                vectors[(row, 1)] = j as f64;
                vectors[(row, 2)] = k as f64;
                row += 1;
            }
        }
    }
    let degeneracies = Array1::ones(count);
    let coupling = Array5::from_elem(
        (count, count, num_modes, num_wannier, num_wannier),
        Complex::new(value, 0.0),
    );
    (
        coupling,
        vectors.clone(),
        degeneracies.clone(),
        vectors,
        degeneracies,
    )
}

/// A bosonic band structure on `mesh` with strictly positive, banded,
/// weakly dispersive energies and identity eigenvectors
pub fn phonon_band_structure(mesh: [usize; 3], bands: usize) -> BandStructure {
    let points = MeshPoints::new(mesh, Matrix3::identity()).expect("fixture mesh is valid");
    let num_points = points.num_points();
    let mut energies = Array2::zeros((num_points, bands));
    let mut velocities = Array3::zeros((num_points, bands, 3));
    let mut eigenvectors = Array3::zeros((num_points, bands, bands));
    for iq in 0..num_points {
        for ib in 0..bands {
            energies[(iq, ib)] =
                0.01 * (1.0 + ib as f64) + 0.002 * (iq as f64 + 1.0) / num_points as f64;
            velocities[(iq, ib, 0)] = 0.1 * (ib as f64 + 1.0);
            velocities[(iq, ib, 1)] = 0.02 * iq as f64;
            eigenvectors[(iq, ib, ib)] = Complex::new(1.0, 0.0);
        }
    }
    BandStructure::new(Particle::Boson, points, energies, velocities, eigenvectors)
        .expect("fixture extents are consistent")
}

/// A Hamiltonian with wavevector-independent spectra, counting how often
/// the off-grid re-diagonalization path is taken
pub struct FixedHamiltonian {
    energies: Array1<f64>,
    calls: Cell<usize>,
}

impl FixedHamiltonian {
    /// A fixed spectrum with `bands` strictly positive energies
    pub fn new(bands: usize) -> Self {
        Self {
            energies: Array1::from_shape_fn(bands, |ib| 0.012 * (ib as f64 + 1.0)),
            calls: Cell::new(0),
        }
    }

    /// How many times the spectrum was requested
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl HarmonicHamiltonian for FixedHamiltonian {
    fn diagonalize_at(&self, _wavevector: Vector3<f64>) -> (Array1<f64>, Array2<Complex<f64>>) {
        self.calls.set(self.calls.get() + 1);
        (
            self.energies.clone(),
            identity_eigenvectors(self.energies.len()),
        )
    }
}

/// A reproducible random population vector, shape `(calculations, states)`
pub fn random_population(calculations: usize, states: usize, seed: u64) -> Array2<f64> {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((calculations, states), |_| rng.gen_range(0.0..1.0))
}
