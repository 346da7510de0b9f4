//! Wannier interpolation of the electron-phonon coupling.
//!
//! The real-space coupling tensor is tabulated on pairs of lattice vectors
//! and partitioned along the electron-lattice axis across the ranks of a
//! pool. Interpolating it to a reciprocal-space triplet runs in two stages.
//! The cache stage depends only on the source point: a Fourier sum over the
//! electron-lattice axis followed by a rotation with the source
//! eigenvectors, reduced across the pool so that each rank ends up owning
//! the cache for its own source point. The finalize stage then produces,
//! for a whole batch of destination points at once, the Fourier sum over
//! the phonon-lattice axis, the two destination-side rotations, the polar
//! correction and the squared modulus. All finalize iterations are
//! independent sum reductions and run data-parallel.

mod polar;

use crate::constants::WAVEVECTOR_CUTOFF;
use crate::crystal::{Crystal, DielectricModel};
use crate::error::{ConfigError, ResourceError, ScatteringError};
use crate::memory::{estimate_batch_count, CouplingDims};
use crate::parallel::{ProcessGroup, Scope};
use nalgebra::Vector3;
use ndarray::{Array1, Array2, Array3, Array4, Array5, ArrayView2, Axis, Zip};
use num_complex::Complex;
use num_traits::Zero;
use rayon::prelude::*;
use std::ops::Range;

/// The partial transform retained for one source point
struct SourceCache {
    /// Shape `(ph_vectors, modes, source_bands, wannier)`
    transform: Array4<Complex<f64>>,
    /// Source eigenvectors, shape `(wannier, source_bands)`; the polar
    /// overlap needs them again at finalize time
    eigenvectors: Array2<Complex<f64>>,
}

/// Destination-side data for one finalize call.
///
/// All vectors run over the destination points of the batch. Electronic
/// eigenvectors have shape `(wannier, bands)`, phonon eigenvectors
/// `(modes, modes)`. `polar_data` carries precomputed per-mode polar
/// vectors; when absent they are computed on the fly for polar crystals.
pub struct DestinationBatch {
    /// Phonon wavevectors, cartesian
    pub wavevectors: Vec<Vector3<f64>>,
    /// Electronic eigenvectors at the destination points
    pub eigenvectors2: Vec<Array2<Complex<f64>>>,
    /// Phonon eigenvectors at the destination points
    pub eigenvectors3: Vec<Array2<Complex<f64>>>,
    /// Precomputed polar vectors, one per destination
    pub polar_data: Option<Vec<Array1<Complex<f64>>>>,
}

/// Interpolates the Wannier coupling tensor onto arbitrary wavevectors.
pub struct ElPhInteraction {
    crystal: Crystal,
    dielectric: Option<DielectricModel>,
    /// Shape `(el_vectors_local, ph_vectors, modes, wannier, wannier)`
    coupling: Array5<Complex<f64>>,
    el_vectors: Array2<f64>,
    el_degeneracies: Array1<f64>,
    ph_vectors: Array2<f64>,
    ph_degeneracies: Array1<f64>,
    /// This rank's slab of the electron-lattice axis
    el_range: Range<usize>,
    num_wannier: usize,
    num_modes: usize,
    fixed_coupling: Option<f64>,
    use_polar: bool,
    cached: Option<SourceCache>,
}

impl ElPhInteraction {
    /// Builds the engine around this rank's partition of the coupling
    /// tensor.
    ///
    /// The partition must be the `divide_range` slab of the electron-lattice
    /// axis for this rank's intra-pool position; loaders that partition the
    /// tensor themselves are bound to the same formula. All extents are
    /// validated here, before any iteration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: &ProcessGroup,
        crystal: Crystal,
        dielectric: Option<DielectricModel>,
        coupling: Array5<Complex<f64>>,
        el_vectors: Array2<f64>,
        el_degeneracies: Array1<f64>,
        ph_vectors: Array2<f64>,
        ph_degeneracies: Array1<f64>,
    ) -> Result<Self, ConfigError> {
        let (el_local, n_ph, num_modes, n_w1, n_w2) = coupling.dim();
        let el_range = group.divide_range(el_vectors.nrows(), Scope::IntraPool);
        if el_local != el_range.len() {
            return Err(ConfigError::Dimension {
                name: "coupling tensor electron-lattice partition",
                expected: el_range.len(),
                found: el_local,
            });
        }
        if n_w1 != n_w2 {
            return Err(ConfigError::Dimension {
                name: "coupling tensor Wannier axes",
                expected: n_w1,
                found: n_w2,
            });
        }
        if el_degeneracies.len() != el_vectors.nrows() {
            return Err(ConfigError::Dimension {
                name: "electron-lattice degeneracies",
                expected: el_vectors.nrows(),
                found: el_degeneracies.len(),
            });
        }
        if ph_vectors.nrows() != n_ph || ph_degeneracies.len() != n_ph {
            return Err(ConfigError::Dimension {
                name: "phonon-lattice vectors",
                expected: n_ph,
                found: ph_vectors.nrows().min(ph_degeneracies.len()),
            });
        }

        let use_polar = match &dielectric {
            Some(model) => {
                if model.born_charges().dim().0 != crystal.num_atoms() {
                    return Err(ConfigError::Dimension {
                        name: "Born effective charges",
                        expected: crystal.num_atoms(),
                        found: model.born_charges().dim().0,
                    });
                }
                !model.is_negligible() && crystal.num_species() > 1
            }
            None => false,
        };

        tracing::debug!(
            el_local,
            n_ph,
            num_modes,
            n_w1,
            use_polar,
            "coupling tensor partition accepted"
        );

        Ok(Self {
            crystal,
            dielectric,
            coupling,
            el_vectors,
            el_degeneracies,
            ph_vectors,
            ph_degeneracies,
            el_range,
            num_wannier: n_w1,
            num_modes,
            fixed_coupling: None,
            use_polar,
            cached: None,
        })
    }

    /// A degenerate engine returning `constant` for every coupling.
    ///
    /// Both interpolation stages are skipped entirely; this is a
    /// short-circuit for testing and crude approximations, not a numerical
    /// computation.
    pub fn with_fixed_coupling(
        crystal: Crystal,
        constant: f64,
        num_bands: usize,
        num_modes: usize,
    ) -> Self {
        Self {
            crystal,
            dielectric: None,
            coupling: Array5::zeros((0, 0, 0, 0, 0)),
            el_vectors: Array2::zeros((0, 3)),
            el_degeneracies: Array1::zeros(0),
            ph_vectors: Array2::zeros((0, 3)),
            ph_degeneracies: Array1::zeros(0),
            el_range: 0..0,
            num_wannier: num_bands,
            num_modes,
            fixed_coupling: Some(constant),
            use_polar: false,
            cached: None,
        }
    }

    /// The five extents of the (local) coupling tensor
    pub fn coupling_dimensions(&self) -> [usize; 5] {
        let (a, b, c, d, e) = self.coupling.dim();
        [a, b, c, d, e]
    }

    /// Number of Wannier bands
    pub fn num_wannier(&self) -> usize {
        self.num_wannier
    }

    /// Number of vibrational modes
    pub fn num_modes(&self) -> usize {
        self.num_modes
    }

    /// Whether the polar correction participates in the interpolation
    pub fn uses_polar_correction(&self) -> bool {
        self.use_polar
    }

    /// Whether a source point is currently cached
    pub fn has_cached_source(&self) -> bool {
        self.cached.is_some()
    }

    /// How many batches the destination loop must use to respect
    /// `budget_bytes` (see [`crate::memory`])
    pub fn estimate_num_batches(
        &self,
        destination_count: usize,
        source_bands: usize,
        budget_bytes: u64,
    ) -> Result<usize, ResourceError> {
        if self.fixed_coupling.is_some() {
            return Ok(1);
        }
        let dims = CouplingDims {
            el_vectors: self.el_range.len() as u64,
            ph_vectors: self.ph_vectors.nrows() as u64,
            modes: self.num_modes as u64,
            wannier: self.num_wannier as u64,
        };
        estimate_batch_count(destination_count, source_bands, &dims, budget_bytes)
    }

    /// Runs the cache stage for one source point.
    ///
    /// Each pool rank takes a turn as the owner: its wavevector and
    /// eigenvectors are broadcast over the pool, every rank contracts its
    /// tensor slab against the phases, and the partial sums are combined
    /// with an intra-pool reduction whose result only the owner keeps.
    /// Calling this again fully replaces the cached state.
    pub fn cache_for_source(
        &mut self,
        group: &ProcessGroup,
        source_wavevector: Vector3<f64>,
        source_eigenvectors: ArrayView2<'_, Complex<f64>>,
    ) -> Result<(), ScatteringError> {
        if self.fixed_coupling.is_some() {
            return Ok(());
        }
        let num_wannier = self.num_wannier;
        if source_eigenvectors.nrows() != num_wannier {
            return Err(ConfigError::Dimension {
                name: "source eigenvectors",
                expected: num_wannier,
                found: source_eigenvectors.nrows(),
            }
            .into());
        }
        let num_modes = self.num_modes;
        let n_ph = self.ph_vectors.nrows();
        let pool_size = group.size(Scope::IntraPool);
        let pool_rank = group.rank(Scope::IntraPool);

        for owner in 0..pool_size {
            let mine = owner == pool_rank;

            // the owner first announces its band count, wavevector and
            // eigenvectors to the pool
            let mut nb1_buf = [if mine {
                source_eigenvectors.ncols() as u64
            } else {
                0
            }];
            group.broadcast(&mut nb1_buf, owner, Scope::IntraPool)?;
            let nb1 = nb1_buf[0] as usize;

            let mut k_buf = [0.0; 3];
            if mine {
                k_buf.copy_from_slice(source_wavevector.as_slice());
            }
            group.broadcast(&mut k_buf, owner, Scope::IntraPool)?;
            let pool_k = Vector3::from_column_slice(&k_buf);

            let mut ev_buf = vec![Complex::zero(); num_wannier * nb1];
            if mine {
                for iw in 0..num_wannier {
                    for ib in 0..nb1 {
                        ev_buf[iw * nb1 + ib] = source_eigenvectors[(iw, ib)];
                    }
                }
            }
            group.broadcast(&mut ev_buf, owner, Scope::IntraPool)?;
            let pool_ev = Array2::from_shape_vec((num_wannier, nb1), ev_buf)
                .expect("broadcast buffer matches the announced shape");

            // phases over this rank's slab of the electron-lattice axis
            let phases: Vec<Complex<f64>> = self
                .el_range
                .clone()
                .map(|ir| {
                    let arg = pool_k[0] * self.el_vectors[(ir, 0)]
                        + pool_k[1] * self.el_vectors[(ir, 1)]
                        + pool_k[2] * self.el_vectors[(ir, 2)];
                    Complex::new(0.0, arg).exp() / self.el_degeneracies[ir]
                })
                .collect();

            // partial Fourier sum over the local slab
            let mut g1 = Array4::<Complex<f64>>::zeros((n_ph, num_modes, num_wannier, num_wannier));
            g1.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(ir_ph, mut g1_slab)| {
                    for (ir_el, &phase) in phases.iter().enumerate() {
                        let slab = self
                            .coupling
                            .index_axis(Axis(0), ir_el)
                            .index_axis_move(Axis(0), ir_ph);
                        Zip::from(&mut g1_slab).and(&slab).for_each(|g, &c| {
                            *g += c * phase;
                        });
                    }
                });

            // rotate the incoming electronic axis by the owner's eigenvectors
            let mut pool_cache =
                Array4::<Complex<f64>>::zeros((n_ph, num_modes, nb1, num_wannier));
            pool_cache
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(ir_ph, mut out)| {
                    let g1_slab = g1.index_axis(Axis(0), ir_ph);
                    for nu in 0..num_modes {
                        for ib1 in 0..nb1 {
                            for iw2 in 0..num_wannier {
                                let mut acc = Complex::new(0.0, 0.0);
                                for iw1 in 0..num_wannier {
                                    acc += g1_slab[(nu, iw1, iw2)] * pool_ev[(iw1, ib1)];
                                }
                                out[(nu, ib1, iw2)] = acc;
                            }
                        }
                    }
                });

            // combine the partial sums; only the owner keeps the result
            if pool_size > 1 {
                let buffer = pool_cache
                    .as_slice_mut()
                    .expect("cache tensor is contiguous");
                group.all_reduce_sum(buffer, Scope::IntraPool)?;
            }
            if mine {
                self.cached = Some(SourceCache {
                    transform: pool_cache,
                    eigenvectors: pool_ev,
                });
            }
        }
        Ok(())
    }

    /// Finalizes the interpolation for a batch of destination points,
    /// returning the squared coupling `(source band, destination band,
    /// mode)` for each point.
    pub fn finalize_for_destination_batch(
        &self,
        batch: &DestinationBatch,
    ) -> Result<Vec<Array3<f64>>, ScatteringError> {
        let num_destinations = batch.wavevectors.len();
        if let Some(constant) = self.fixed_coupling {
            let shape = (self.num_wannier, self.num_wannier, self.num_modes);
            return Ok(vec![Array3::from_elem(shape, constant); num_destinations]);
        }
        if batch.eigenvectors2.len() != num_destinations
            || batch.eigenvectors3.len() != num_destinations
        {
            return Err(ConfigError::Dimension {
                name: "destination eigenvector lists",
                expected: num_destinations,
                found: batch.eigenvectors2.len().min(batch.eigenvectors3.len()),
            }
            .into());
        }
        let cache = self.cached.as_ref().ok_or_else(|| {
            ConfigError::Request(
                "finalize called with no cached source point".to_string(),
            )
        })?;
        let (n_ph, num_modes, nb1, num_wannier) = cache.transform.dim();

        let couplings: Result<Vec<Array3<f64>>, ScatteringError> = (0..num_destinations)
            .into_par_iter()
            .map(|ik| {
                let q3 = batch.wavevectors[ik];
                let ev2 = &batch.eigenvectors2[ik];
                let ev3 = &batch.eigenvectors3[ik];
                if ev2.nrows() != num_wannier {
                    return Err(ConfigError::Dimension {
                        name: "destination electronic eigenvectors",
                        expected: num_wannier,
                        found: ev2.nrows(),
                    }
                    .into());
                }
                if ev3.dim() != (num_modes, num_modes) {
                    return Err(ConfigError::Dimension {
                        name: "destination phonon eigenvectors",
                        expected: num_modes,
                        found: ev3.nrows(),
                    }
                    .into());
                }
                let nb2 = ev2.ncols();

                // Fourier sum over the phonon-lattice axis
                let phases: Vec<Complex<f64>> = (0..n_ph)
                    .map(|ir| {
                        let arg = q3[0] * self.ph_vectors[(ir, 0)]
                            + q3[1] * self.ph_vectors[(ir, 1)]
                            + q3[2] * self.ph_vectors[(ir, 2)];
                        Complex::new(0.0, arg).exp() / self.ph_degeneracies[ir]
                    })
                    .collect();
                let mut g3 = Array3::<Complex<f64>>::zeros((num_modes, nb1, num_wannier));
                for (ir, &phase) in phases.iter().enumerate() {
                    let slab = cache.transform.index_axis(Axis(0), ir);
                    Zip::from(&mut g3).and(&slab).for_each(|g, &c| {
                        *g += c * phase;
                    });
                }

                // rotate the mode axis
                let mut g4 = Array3::<Complex<f64>>::zeros((num_modes, nb1, num_wannier));
                for nu2 in 0..num_modes {
                    for ib1 in 0..nb1 {
                        for iw2 in 0..num_wannier {
                            let mut acc = Complex::new(0.0, 0.0);
                            for nu in 0..num_modes {
                                acc += g3[(nu, ib1, iw2)] * ev3[(nu, nu2)];
                            }
                            g4[(nu2, ib1, iw2)] = acc;
                        }
                    }
                }
                drop(g3);

                // rotate the outgoing electronic axis
                let mut g_final = Array3::<Complex<f64>>::zeros((num_modes, nb1, nb2));
                for nu in 0..num_modes {
                    for ib1 in 0..nb1 {
                        for ib2 in 0..nb2 {
                            let mut acc = Complex::new(0.0, 0.0);
                            for iw2 in 0..num_wannier {
                                acc += ev2[(iw2, ib2)].conj() * g4[(nu, ib1, iw2)];
                            }
                            g_final[(nu, ib1, ib2)] = acc;
                        }
                    }
                }
                drop(g4);

                // add the long-range polar term before taking the modulus
                if self.use_polar && q3.norm() > WAVEVECTOR_CUTOFF {
                    let x = match &batch.polar_data {
                        Some(data) => data[ik].clone(),
                        None => self.polar_correction_part1(q3, ev3.view())?,
                    };
                    let correction =
                        polar::correction_part2(cache.eigenvectors.view(), ev2.view(), &x);
                    for nu in 0..num_modes {
                        for ib1 in 0..nb1 {
                            for ib2 in 0..nb2 {
                                g_final[(nu, ib1, ib2)] += correction[(ib1, ib2, nu)];
                            }
                        }
                    }
                }

                let mut coupling = Array3::<f64>::zeros((nb1, nb2, num_modes));
                for ib1 in 0..nb1 {
                    for ib2 in 0..nb2 {
                        for nu in 0..num_modes {
                            coupling[(ib1, ib2, nu)] = g_final[(nu, ib1, ib2)].norm_sqr();
                        }
                    }
                }
                Ok(coupling)
            })
            .collect();
        couplings
    }

    /// The per-mode polar vector for a destination wavevector, precomputable
    /// per batch. Fails when no dielectric model was supplied.
    pub fn polar_correction_part1(
        &self,
        q3: Vector3<f64>,
        ev3: ArrayView2<'_, Complex<f64>>,
    ) -> Result<Array1<Complex<f64>>, ScatteringError> {
        let model = self.dielectric.as_ref().ok_or_else(|| {
            ConfigError::Request("polar correction without a dielectric model".to_string())
        })?;
        Ok(polar::correction_part1_static(
            q3,
            ev3,
            self.crystal.volume(),
            self.crystal.reciprocal_cell(),
            model.epsilon(),
            model.born_charges(),
            self.crystal.atomic_positions(),
            model.coarse_grid(),
        ))
    }

    /// The full polar-correction tensor `(nb1, nb2, mode)` for a triplet of
    /// eigenvector matrices at a destination wavevector
    pub fn polar_correction(
        &self,
        q3: Vector3<f64>,
        ev1: ArrayView2<'_, Complex<f64>>,
        ev2: ArrayView2<'_, Complex<f64>>,
        ev3: ArrayView2<'_, Complex<f64>>,
    ) -> Result<Array3<Complex<f64>>, ScatteringError> {
        let x = self.polar_correction_part1(q3, ev3)?;
        Ok(polar::correction_part2(ev1, ev2, &x))
    }
}
