//! The per-point band-structure container consumed by the scattering loop,
//! and the re-diagonalization seam for off-grid wavevectors.
//!
//! The container is deliberately thin: points, energies, group velocities
//! and eigenvectors with the index bookkeeping to map (point, band) pairs to
//! global state indices. Building it (Fourier interpolation of a Hamiltonian,
//! window filtering) is an external concern.

use crate::error::ConfigError;
use crate::statistics::Particle;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use num_complex::Complex;

/// A gamma-centered regular mesh of reciprocal-space points.
///
/// Points are indexed in row-major order over the three mesh directions;
/// fractional coordinates live on the grid `i / mesh[d]`.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshPoints {
    mesh: [usize; 3],
    reciprocal_cell: Matrix3<f64>,
}

impl MeshPoints {
    /// A mesh of `mesh[0] x mesh[1] x mesh[2]` points in the cell described
    /// by `reciprocal_cell` (reciprocal lattice vectors as columns)
    pub fn new(mesh: [usize; 3], reciprocal_cell: Matrix3<f64>) -> Result<Self, ConfigError> {
        if mesh.iter().any(|&m| m == 0) {
            return Err(ConfigError::Request(
                "mesh dimensions must be positive".to_string(),
            ));
        }
        Ok(Self {
            mesh,
            reciprocal_cell,
        })
    }

    /// Total number of mesh points
    pub fn num_points(&self) -> usize {
        self.mesh[0] * self.mesh[1] * self.mesh[2]
    }

    /// The mesh dimensions
    pub fn mesh(&self) -> [usize; 3] {
        self.mesh
    }

    /// The reciprocal cell the mesh spans
    pub fn reciprocal_cell(&self) -> &Matrix3<f64> {
        &self.reciprocal_cell
    }

    fn unravel(&self, index: usize) -> [usize; 3] {
        let [_, m1, m2] = self.mesh;
        [index / (m1 * m2), (index / m2) % m1, index % m2]
    }

    fn ravel(&self, indices: [usize; 3]) -> usize {
        let [_, m1, m2] = self.mesh;
        (indices[0] * m1 + indices[1]) * m2 + indices[2]
    }

    /// Fractional (crystal) coordinates of a point
    pub fn fractional(&self, index: usize) -> Vector3<f64> {
        let idx = self.unravel(index);
        Vector3::new(
            idx[0] as f64 / self.mesh[0] as f64,
            idx[1] as f64 / self.mesh[1] as f64,
            idx[2] as f64 / self.mesh[2] as f64,
        )
    }

    /// Cartesian coordinates of a point
    pub fn cartesian(&self, index: usize) -> Vector3<f64> {
        self.reciprocal_cell * self.fractional(index)
    }

    /// The mesh index of a fractional coordinate, if it lies on the grid
    pub fn fold(&self, fractional: Vector3<f64>) -> Option<usize> {
        let mut indices = [0usize; 3];
        for d in 0..3 {
            let scaled = fractional[d] * self.mesh[d] as f64;
            let rounded = scaled.round();
            if (scaled - rounded).abs() > 1.0e-6 {
                return None;
            }
            indices[d] = (rounded as i64).rem_euclid(self.mesh[d] as i64) as usize;
        }
        Some(self.ravel(indices))
    }

    /// The on-grid index of `p1 +/- p2`, exact in integer arithmetic
    pub fn combine(&self, p1: usize, p2: usize, sign: i8) -> usize {
        let a = self.unravel(p1);
        let b = self.unravel(p2);
        let mut out = [0usize; 3];
        for d in 0..3 {
            let m = self.mesh[d] as i64;
            let s = a[d] as i64 + sign as i64 * b[d] as i64;
            out[d] = s.rem_euclid(m) as usize;
        }
        self.ravel(out)
    }

    /// The index of the reversed point `-p`
    pub fn reversed(&self, index: usize) -> usize {
        let idx = self.unravel(index);
        let mut out = [0usize; 3];
        for d in 0..3 {
            let m = self.mesh[d] as i64;
            out[d] = (-(idx[d] as i64)).rem_euclid(m) as usize;
        }
        self.ravel(out)
    }
}

/// Energies, group velocities and eigenvectors on a mesh, with the
/// (point, band) to global-state index mapping.
#[derive(Clone, Debug)]
pub struct BandStructure {
    particle: Particle,
    points: MeshPoints,
    num_bands: usize,
    energies: Array2<f64>,
    velocities: Array3<f64>,
    eigenvectors: Array3<Complex<f64>>,
}

impl BandStructure {
    /// Assembles a band structure; extents are validated against the mesh.
    ///
    /// `energies` has shape `(num_points, num_bands)`, `velocities`
    /// `(num_points, num_bands, 3)` and `eigenvectors`
    /// `(num_points, rows, num_bands)` where `rows` is the orbital/mode
    /// dimension of the diagonalized Hamiltonian.
    pub fn new(
        particle: Particle,
        points: MeshPoints,
        energies: Array2<f64>,
        velocities: Array3<f64>,
        eigenvectors: Array3<Complex<f64>>,
    ) -> Result<Self, ConfigError> {
        let num_points = points.num_points();
        let num_bands = energies.dim().1;
        if energies.dim().0 != num_points {
            return Err(ConfigError::Dimension {
                name: "energies",
                expected: num_points,
                found: energies.dim().0,
            });
        }
        if velocities.dim() != (num_points, num_bands, 3) {
            return Err(ConfigError::Dimension {
                name: "velocities",
                expected: num_points * num_bands * 3,
                found: velocities.len(),
            });
        }
        if eigenvectors.dim().0 != num_points || eigenvectors.dim().2 != num_bands {
            return Err(ConfigError::Dimension {
                name: "eigenvectors",
                expected: num_points * num_bands,
                found: eigenvectors.dim().0 * eigenvectors.dim().2,
            });
        }
        Ok(Self {
            particle,
            points,
            num_bands,
            energies,
            velocities,
            eigenvectors,
        })
    }

    /// The particle statistics of these states
    pub fn particle(&self) -> Particle {
        self.particle
    }

    /// The underlying mesh
    pub fn points(&self) -> &MeshPoints {
        &self.points
    }

    /// Number of mesh points
    pub fn num_points(&self) -> usize {
        self.points.num_points()
    }

    /// Bands per point
    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    /// Total number of states
    pub fn num_states(&self) -> usize {
        self.num_points() * self.num_bands
    }

    /// Global state index of `(point, band)`
    pub fn global_index(&self, point: usize, band: usize) -> usize {
        point * self.num_bands + band
    }

    /// Inverse of [`BandStructure::global_index`]
    pub fn point_and_band(&self, state: usize) -> (usize, usize) {
        (state / self.num_bands, state % self.num_bands)
    }

    /// Energy of one state
    pub fn energy(&self, point: usize, band: usize) -> f64 {
        self.energies[(point, band)]
    }

    /// All band energies at a point
    pub fn energies_at(&self, point: usize) -> ArrayView1<'_, f64> {
        self.energies.row(point)
    }

    /// Group velocity of one state
    pub fn velocity(&self, point: usize, band: usize) -> Vector3<f64> {
        Vector3::new(
            self.velocities[(point, band, 0)],
            self.velocities[(point, band, 1)],
            self.velocities[(point, band, 2)],
        )
    }

    /// The eigenvector matrix at a point, shape `(rows, num_bands)`
    pub fn eigenvectors_at(&self, point: usize) -> ArrayView2<'_, Complex<f64>> {
        self.eigenvectors.index_axis(ndarray::Axis(0), point)
    }

    /// Cartesian wavevector of a point
    pub fn wavevector(&self, point: usize) -> Vector3<f64> {
        self.points.cartesian(point)
    }

    /// Whether two band structures live on the same grid with the same bands
    pub fn same_grid_as(&self, other: &BandStructure) -> bool {
        self.points == other.points && self.num_bands == other.num_bands
    }
}

/// The re-diagonalization callback for wavevectors that fall off the mesh.
///
/// Implementors diagonalize the underlying Hamiltonian at an exact cartesian
/// wavevector, returning the band energies and the eigenvector matrix with
/// bands along the columns.
pub trait HarmonicHamiltonian {
    /// Energies and eigenvectors at `wavevector`
    fn diagonalize_at(&self, wavevector: Vector3<f64>) -> (Array1<f64>, Array2<Complex<f64>>);
}
