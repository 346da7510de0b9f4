//! Energy-conservation weights.
//!
//! Exact conservation of energy in a three-particle process is replaced by a
//! numerical delta-function proxy: a fixed-width Gaussian, a Gaussian whose
//! width adapts to the local band dispersion, or linear-tetrahedron weights
//! on the mesh. Weights below threshold are reported as `None` so the
//! scattering kernels can skip the term silently; such skips are expected
//! physical occurrences, never errors.

use crate::bandstructure::BandStructure;
use itertools::iproduct;
use nalgebra::Vector3;
use ndarray::Array2;
use serde::Deserialize;

const SQRT_PI: f64 = 1.772_453_850_905_516;
/// Terms beyond this many widths from conservation are dropped
const WIDTH_CUTOFF: f64 = 6.0;

/// Delta-function scheme selection, read from configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Smearing {
    /// Fixed-width Gaussian broadening; `width` in energy units
    Gaussian {
        /// The broadening width
        width: f64,
    },
    /// Gaussian with a width set by the local group-velocity mismatch
    AdaptiveGaussian,
    /// Linear-tetrahedron integration weights on the inner mesh
    Tetrahedron,
}

/// A configured energy-conservation weight evaluator
pub enum DeltaFunction {
    /// Fixed-width Gaussian
    Gaussian(GaussianDelta),
    /// Velocity-adaptive Gaussian
    Adaptive(AdaptiveDelta),
    /// Linear-tetrahedron weights
    Tetrahedron(TetrahedronDelta),
}

/// Per-term context for the weight evaluation
pub struct DeltaContext {
    /// Mesh index of the inner-loop state
    pub inner_point: usize,
    /// Band index of the inner-loop state
    pub inner_band: usize,
    /// Energy of the inner-loop state
    pub inner_energy: f64,
    /// Group velocity of the inner-loop state
    pub velocity2: Vector3<f64>,
    /// Group velocity of the third state
    pub velocity3: Vector3<f64>,
}

impl DeltaFunction {
    /// Builds the evaluator for `smearing` against the inner band structure
    pub fn from_smearing(smearing: &Smearing, inner: &BandStructure) -> Self {
        match smearing {
            Smearing::Gaussian { width } => DeltaFunction::Gaussian(GaussianDelta {
                inverse_width: 1.0 / width,
            }),
            Smearing::AdaptiveGaussian => {
                let mesh = inner.points().mesh();
                let cell = *inner.points().reciprocal_cell();
                let mut spacings = [Vector3::zeros(); 3];
                for (d, spacing) in spacings.iter_mut().enumerate() {
                    *spacing = cell.column(d).into_owned() / mesh[d] as f64;
                }
                DeltaFunction::Adaptive(AdaptiveDelta { spacings })
            }
            Smearing::Tetrahedron => {
                DeltaFunction::Tetrahedron(TetrahedronDelta::from_band_structure(inner))
            }
        }
    }

    /// The weight of `delta(delta_energy)` for one term, `None` when the
    /// term is negligible and may be skipped
    pub fn weight(&self, delta_energy: f64, context: &DeltaContext) -> Option<f64> {
        match self {
            DeltaFunction::Gaussian(gaussian) => gaussian.weight(delta_energy),
            DeltaFunction::Adaptive(adaptive) => {
                adaptive.weight(delta_energy, context.velocity2, context.velocity3)
            }
            DeltaFunction::Tetrahedron(tetrahedron) => tetrahedron.weight(
                context.inner_energy + delta_energy,
                context.inner_point,
                context.inner_band,
            ),
        }
    }
}

/// Fixed-width Gaussian broadening
pub struct GaussianDelta {
    inverse_width: f64,
}

impl GaussianDelta {
    fn weight(&self, delta_energy: f64) -> Option<f64> {
        let x = delta_energy * self.inverse_width;
        if x.abs() > WIDTH_CUTOFF {
            return None;
        }
        Some((-x * x).exp() * self.inverse_width / SQRT_PI)
    }
}

/// Gaussian whose width follows the group-velocity mismatch of the two
/// states connected by the conservation rule, contracted with the mesh
/// spacing, so that flat and steep bands are resolved comparably.
pub struct AdaptiveDelta {
    spacings: [Vector3<f64>; 3],
}

impl AdaptiveDelta {
    fn width(&self, velocity2: Vector3<f64>, velocity3: Vector3<f64>) -> f64 {
        let dv = velocity2 - velocity3;
        let sigma2: f64 = self
            .spacings
            .iter()
            .map(|spacing| dv.dot(spacing).powi(2))
            .sum();
        (sigma2 / 12.0).sqrt()
    }

    fn weight(
        &self,
        delta_energy: f64,
        velocity2: Vector3<f64>,
        velocity3: Vector3<f64>,
    ) -> Option<f64> {
        let sigma = self.width(velocity2, velocity3);
        if sigma < 1.0e-10 {
            return None;
        }
        let x = delta_energy / sigma;
        if x.abs() > WIDTH_CUTOFF {
            return None;
        }
        Some((-x * x).exp() / (sigma * SQRT_PI))
    }
}

/// Linear-tetrahedron delta weights on the regular mesh.
///
/// Every mesh cube is split into six tetrahedra sharing its main diagonal.
/// The weight of a state is the energy derivative of the tetrahedron
/// occupation, distributed equally over the four corners and scaled so that
/// a mesh average of the weights integrates to one over energy.
pub struct TetrahedronDelta {
    energies: Array2<f64>,
    tetrahedra: Vec<[usize; 4]>,
    /// tetrahedra touching each mesh point
    incident: Vec<Vec<usize>>,
    volume_fraction: f64,
    num_points: usize,
}

/// Corner offsets of the six tetrahedra tiling one mesh cube
const CUBE_TETRAHEDRA: [[usize; 4]; 6] = [
    [0b000, 0b001, 0b011, 0b111],
    [0b000, 0b001, 0b101, 0b111],
    [0b000, 0b010, 0b011, 0b111],
    [0b000, 0b010, 0b110, 0b111],
    [0b000, 0b100, 0b101, 0b111],
    [0b000, 0b100, 0b110, 0b111],
];

impl TetrahedronDelta {
    fn from_band_structure(inner: &BandStructure) -> Self {
        let mesh = inner.points().mesh();
        let points = inner.points();
        let num_points = points.num_points();
        let mut tetrahedra = Vec::with_capacity(6 * num_points);
        let mut incident = vec![Vec::new(); num_points];

        let ravel = |i: usize, j: usize, k: usize| -> usize {
            ((i % mesh[0]) * mesh[1] + (j % mesh[1])) * mesh[2] + (k % mesh[2])
        };
        for (i, j, k) in iproduct!(0..mesh[0], 0..mesh[1], 0..mesh[2]) {
            let corners = [
                ravel(i, j, k),
                ravel(i, j, k + 1),
                ravel(i, j + 1, k),
                ravel(i, j + 1, k + 1),
                ravel(i + 1, j, k),
                ravel(i + 1, j, k + 1),
                ravel(i + 1, j + 1, k),
                ravel(i + 1, j + 1, k + 1),
            ];
            for tet in CUBE_TETRAHEDRA {
                let vertices = [
                    corners[tet[0]],
                    corners[tet[1]],
                    corners[tet[2]],
                    corners[tet[3]],
                ];
                let id = tetrahedra.len();
                tetrahedra.push(vertices);
                for vertex in vertices {
                    incident[vertex].push(id);
                }
            }
        }

        let mut energies = Array2::zeros((num_points, inner.num_bands()));
        for iq in 0..num_points {
            energies.row_mut(iq).assign(&inner.energies_at(iq));
        }

        Self {
            energies,
            volume_fraction: 1.0 / (6.0 * num_points as f64),
            tetrahedra,
            incident,
            num_points,
        }
    }

    /// The density contributed by one tetrahedron at `target`, normalized to
    /// integrate to one over energy. Degenerate tetrahedra contribute
    /// nothing.
    fn tetrahedron_density(sorted: [f64; 4], target: f64) -> f64 {
        let [e1, e2, e3, e4] = sorted;
        if target < e1 || target > e4 || e4 - e1 < 1.0e-12 {
            return 0.0;
        }
        let e21 = e2 - e1;
        let e31 = e3 - e1;
        let e41 = e4 - e1;
        let e32 = e3 - e2;
        let e42 = e4 - e2;
        let e43 = e4 - e3;
        if target < e2 {
            if e21 < 1.0e-12 {
                return 0.0;
            }
            3.0 * (target - e1).powi(2) / (e21 * e31 * e41)
        } else if target < e3 {
            if e32 < 1.0e-12 {
                return 0.0;
            }
            let de = target - e2;
            (3.0 * e21 + 6.0 * de - 3.0 * (e31 + e42) * de * de / (e32 * e42)) / (e31 * e41)
        } else {
            if e43 < 1.0e-12 {
                return 0.0;
            }
            3.0 * (e4 - target).powi(2) / (e41 * e42 * e43)
        }
    }

    fn weight(&self, target: f64, point: usize, band: usize) -> Option<f64> {
        let mut total = 0.0;
        for &tet in &self.incident[point] {
            let vertices = self.tetrahedra[tet];
            let mut corner_energies = [0.0; 4];
            for (slot, &vertex) in corner_energies.iter_mut().zip(vertices.iter()) {
                *slot = self.energies[(vertex, band)];
            }
            corner_energies.sort_by(|a, b| a.partial_cmp(b).expect("energies are finite"));
            total += Self::tetrahedron_density(corner_energies, target);
        }
        // equal split over four corners; rescale so a mesh average matches
        // the Gaussian normalization
        let weight = total * self.volume_fraction / 4.0 * self.num_points as f64;
        if weight < 1.0e-14 {
            None
        } else {
            Some(weight)
        }
    }
}
