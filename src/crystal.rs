//! Crystal structure and dielectric response, consumed as input data.
//!
//! Both are assembled by external collaborators (file readers, Hamiltonian
//! setup); this core only reads them, chiefly inside the long-range polar
//! correction of the coupling interpolation.

use crate::error::ConfigError;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

/// The unit cell: lattice, atomic positions and species assignment.
///
/// Positions and lattice vectors are cartesian, in Bohr.
#[derive(Clone, Debug)]
pub struct Crystal {
    direct_cell: Matrix3<f64>,
    reciprocal_cell: Matrix3<f64>,
    volume: f64,
    atomic_positions: Vec<Vector3<f64>>,
    species: Vec<usize>,
    num_species: usize,
}

impl Crystal {
    /// Builds a crystal from the direct cell (lattice vectors as columns),
    /// the cartesian atomic positions and the species index of each atom.
    pub fn new(
        direct_cell: Matrix3<f64>,
        atomic_positions: Vec<Vector3<f64>>,
        species: Vec<usize>,
    ) -> Result<Self, ConfigError> {
        if species.len() != atomic_positions.len() {
            return Err(ConfigError::Dimension {
                name: "species assignment",
                expected: atomic_positions.len(),
                found: species.len(),
            });
        }
        let volume = direct_cell.determinant().abs();
        if volume == 0.0 {
            return Err(ConfigError::Request(
                "direct unit cell is singular".to_string(),
            ));
        }
        let reciprocal_cell = direct_cell
            .try_inverse()
            .map(|inv| inv.transpose() * 2.0 * std::f64::consts::PI)
            .ok_or_else(|| ConfigError::Request("direct unit cell is singular".to_string()))?;
        let num_species = species.iter().copied().max().map_or(0, |s| s + 1);
        Ok(Self {
            direct_cell,
            reciprocal_cell,
            volume,
            atomic_positions,
            species,
            num_species,
        })
    }

    /// Lattice vectors as the columns of a 3x3 matrix
    pub fn direct_cell(&self) -> &Matrix3<f64> {
        &self.direct_cell
    }

    /// Reciprocal lattice vectors as the columns of a 3x3 matrix
    pub fn reciprocal_cell(&self) -> &Matrix3<f64> {
        &self.reciprocal_cell
    }

    /// Unit-cell volume in Bohr^3
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Cartesian atomic positions
    pub fn atomic_positions(&self) -> &[Vector3<f64>] {
        &self.atomic_positions
    }

    /// Number of atoms in the cell
    pub fn num_atoms(&self) -> usize {
        self.atomic_positions.len()
    }

    /// Species index of each atom
    pub fn species(&self) -> &[usize] {
        &self.species
    }

    /// Number of distinct atomic species
    pub fn num_species(&self) -> usize {
        self.num_species
    }
}

/// Dielectric response of the lattice: the dielectric tensor, Born effective
/// charges and the coarse grid the response was computed on.
#[derive(Clone, Debug)]
pub struct DielectricModel {
    epsilon: Matrix3<f64>,
    born_charges: Array3<f64>,
    coarse_grid: [i32; 3],
}

impl DielectricModel {
    /// Builds the model; `born_charges` has shape `(num_atoms, 3, 3)`.
    pub fn new(
        epsilon: Matrix3<f64>,
        born_charges: Array3<f64>,
        coarse_grid: [i32; 3],
    ) -> Self {
        Self {
            epsilon,
            born_charges,
            coarse_grid,
        }
    }

    /// The static dielectric tensor
    pub fn epsilon(&self) -> &Matrix3<f64> {
        &self.epsilon
    }

    /// Born effective charges, shape `(num_atoms, 3, 3)`
    pub fn born_charges(&self) -> &Array3<f64> {
        &self.born_charges
    }

    /// The coarse grid spanned by the reciprocal-vector sum
    pub fn coarse_grid(&self) -> [i32; 3] {
        self.coarse_grid
    }

    /// Whether the dielectric tensor is numerically absent, in which case
    /// the polar correction vanishes identically
    pub fn is_negligible(&self) -> bool {
        self.epsilon.norm_squared() < 1.0e-10
    }
}

#[cfg(test)]
mod test {
    use super::Crystal;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    #[test]
    fn cubic_cell_reciprocal_vectors() {
        let a = 2.5;
        let crystal = Crystal::new(
            Matrix3::identity() * a,
            vec![Vector3::zeros()],
            vec![0],
        )
        .unwrap();
        assert_relative_eq!(crystal.volume(), a * a * a);
        let b = crystal.reciprocal_cell();
        assert_relative_eq!(b[(0, 0)], 2.0 * std::f64::consts::PI / a);
        assert_relative_eq!(b[(0, 1)], 0.0);
    }

    #[test]
    fn species_count_mismatch_is_rejected() {
        let result = Crystal::new(
            Matrix3::identity(),
            vec![Vector3::zeros(), Vector3::new(0.5, 0.5, 0.5)],
            vec![0],
        );
        assert!(result.is_err());
    }
}
