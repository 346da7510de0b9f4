//! Assembly of pairwise scattering rates into the transport operator.
//!
//! For every ordered pair of mesh points the third point of the triplet is
//! fixed by momentum conservation, the interpolated coupling scales the
//! energy-conservation weight and the thermal occupation factors, and the
//! signed contribution is routed into exactly one of three output shapes:
//! the full rate matrix with its row-sum diagonal, the action of the
//! unmaterialized matrix on a caller-supplied population, or the per-state
//! linewidths alone. One scalar kernel feeds all three shapes, so the
//! diagonal is identically the matrix row sum and the matrix-free action is
//! identically the matrix-vector product.
//!
//! The outer loop over source points is the unit of distributed work; each
//! process accumulates into its own buffers and the partial outputs are
//! summed across the world at the end.

use crate::bandstructure::{BandStructure, HarmonicHamiltonian};
use crate::constants::{DEFAULT_MEMORY_BUDGET, ENERGY_CUTOFF};
use crate::delta::{DeltaContext, DeltaFunction, Smearing};
use crate::error::{ConfigError, ScatteringError};
use crate::interaction::{DestinationBatch, ElPhInteraction};
use crate::memory::divide_into_batches;
use crate::parallel::{ProcessGroup, Scope};
use crate::statistics::StatisticsSweep;
use console::Term;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use nalgebra::Vector3;
use ndarray::{Array1, Array2};
use num_complex::Complex;

/// The requested output shape, selected once per call.
///
/// Exactly one variant is legal per invocation and each carries exactly the
/// data it needs; any other combination of outputs cannot be expressed.
pub enum Request<'a> {
    /// Materialize the full rate matrix and its row-sum diagonal
    Build,
    /// Contract the rates against `input` on the fly, shape
    /// `(calculations, states)`
    Apply {
        /// The population vector the unmaterialized matrix acts on
        input: &'a Array2<f64>,
    },
    /// Accumulate only the per-state linewidths
    DiagonalOnly,
}

/// The produced output, mirroring the request shape
pub enum RatesOutput {
    /// The full rate matrix and its row-sum diagonal
    Build {
        /// Pairwise rates, shape `(states, states)`
        matrix: Array2<f64>,
        /// Row sums, shape `(1, states)`
        diagonal: Array2<f64>,
    },
    /// The matrix-vector product, shape `(calculations, states)`
    Apply {
        /// The contracted output population
        output: Array2<f64>,
    },
    /// The linewidths, shape `(calculations, states)`
    DiagonalOnly {
        /// Per-state total rates
        diagonal: Array2<f64>,
    },
}

/// Configures a [`ScatteringRates`] accumulator
pub struct ScatteringRatesBuilder<'a, H> {
    group: Option<&'a ProcessGroup>,
    sweep: Option<&'a StatisticsSweep>,
    outer: Option<&'a BandStructure>,
    inner: Option<&'a BandStructure>,
    hamiltonian: Option<&'a H>,
    smearing: Smearing,
    memory_budget: u64,
}

impl<'a, H> Default for ScatteringRatesBuilder<'a, H> {
    fn default() -> Self {
        Self {
            group: None,
            sweep: None,
            outer: None,
            inner: None,
            hamiltonian: None,
            smearing: Smearing::Gaussian { width: 1.0e-3 },
            memory_budget: DEFAULT_MEMORY_BUDGET,
        }
    }
}

impl<'a, H: HarmonicHamiltonian> ScatteringRatesBuilder<'a, H> {
    /// An empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the process group
    pub fn with_process_group(mut self, group: &'a ProcessGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Attach the temperature sweep
    pub fn with_statistics_sweep(mut self, sweep: &'a StatisticsSweep) -> Self {
        self.sweep = Some(sweep);
        self
    }

    /// Attach the outer and inner band structures; they coincide in the
    /// common transport setup
    pub fn with_band_structures(
        mut self,
        outer: &'a BandStructure,
        inner: &'a BandStructure,
    ) -> Self {
        self.outer = Some(outer);
        self.inner = Some(inner);
        self
    }

    /// Attach the Hamiltonian used to re-diagonalize off-grid points
    pub fn with_hamiltonian(mut self, hamiltonian: &'a H) -> Self {
        self.hamiltonian = Some(hamiltonian);
        self
    }

    /// Select the energy-conservation scheme
    pub fn with_smearing(mut self, smearing: Smearing) -> Self {
        self.smearing = smearing;
        self
    }

    /// Bound the interpolation working set, in bytes
    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Validates the configuration and builds the accumulator
    pub fn build(self) -> Result<ScatteringRates<'a, H>, ConfigError> {
        let missing = |name: &str| ConfigError::Request(format!("{name} was not supplied"));
        let group = self.group.ok_or_else(|| missing("process group"))?;
        let sweep = self.sweep.ok_or_else(|| missing("statistics sweep"))?;
        let outer = self.outer.ok_or_else(|| missing("outer band structure"))?;
        let inner = self.inner.ok_or_else(|| missing("inner band structure"))?;
        let hamiltonian = self.hamiltonian.ok_or_else(|| missing("hamiltonian"))?;
        let delta = DeltaFunction::from_smearing(&self.smearing, inner);
        Ok(ScatteringRates {
            group,
            sweep,
            outer,
            inner,
            hamiltonian,
            delta,
            memory_budget: self.memory_budget,
        })
    }
}

/// Accumulates pairwise rates into the requested operator representation
pub struct ScatteringRates<'a, H> {
    group: &'a ProcessGroup,
    sweep: &'a StatisticsSweep,
    outer: &'a BandStructure,
    inner: &'a BandStructure,
    hamiltonian: &'a H,
    delta: DeltaFunction,
    memory_budget: u64,
}

/// The resolved third state of a triplet
struct ThirdState {
    energies: Array1<f64>,
    eigenvectors: Array2<Complex<f64>>,
    velocities: Vec<Vector3<f64>>,
    /// shape `(calculations, bands)`
    populations: Array2<f64>,
}

enum Accumulator<'a> {
    Build {
        matrix: Array2<f64>,
        diagonal: Array2<f64>,
    },
    Apply {
        input: &'a Array2<f64>,
        output: Array2<f64>,
    },
    Diagonal {
        diagonal: Array2<f64>,
    },
}

impl Accumulator<'_> {
    /// Routes one signed kernel contribution; `i1` indexes the outer state,
    /// `i2` the inner state, `calc` the sweep calculation.
    #[inline]
    fn push(&mut self, calc: usize, i1: usize, i2: usize, contribution: f64) {
        match self {
            Accumulator::Build { matrix, diagonal } => {
                matrix[(i1, i2)] += contribution;
                diagonal[(calc, i1)] += contribution;
            }
            Accumulator::Apply { input, output } => {
                output[(calc, i1)] += contribution * input[(calc, i2)];
            }
            Accumulator::Diagonal { diagonal } => {
                diagonal[(calc, i1)] += contribution;
            }
        }
    }
}

impl<'a, H: HarmonicHamiltonian> ScatteringRates<'a, H> {
    /// Runs the pair loop and assembles the requested output.
    ///
    /// The engine must hold the coupling tensor this run interpolates; its
    /// cached source is replaced point by point as the outer loop advances.
    pub fn compute(
        &self,
        engine: &mut ElPhInteraction,
        request: Request<'_>,
    ) -> Result<RatesOutput, ScatteringError> {
        let num_calcs = self.sweep.num_calculations();
        let n_outer = self.outer.num_states();
        let n_inner = self.inner.num_states();
        let same_grid = self.outer.same_grid_as(self.inner);

        // every call-shape fault is rejected here, before any iteration
        let mut accumulator = match request {
            Request::Build => {
                if !same_grid {
                    return Err(ConfigError::Request(
                        "matrix construction needs identical outer and inner grids".to_string(),
                    )
                    .into());
                }
                if num_calcs != 1 {
                    return Err(ConfigError::Request(format!(
                        "matrix construction resolves one calculation at a time, got {num_calcs}"
                    ))
                    .into());
                }
                Accumulator::Build {
                    matrix: Array2::zeros((n_outer, n_inner)),
                    diagonal: Array2::zeros((num_calcs, n_outer)),
                }
            }
            Request::Apply { input } => {
                if !same_grid {
                    return Err(ConfigError::Request(
                        "matrix application needs identical outer and inner grids".to_string(),
                    )
                    .into());
                }
                if input.dim() != (num_calcs, n_inner) {
                    return Err(ConfigError::Dimension {
                        name: "input population",
                        expected: num_calcs * n_inner,
                        found: input.len(),
                    }
                    .into());
                }
                Accumulator::Apply {
                    input,
                    output: Array2::zeros((num_calcs, n_outer)),
                }
            }
            Request::DiagonalOnly => Accumulator::Diagonal {
                diagonal: Array2::zeros((num_calcs, n_outer)),
            },
        };

        // equilibrium populations for every on-mesh state, once per sweep
        let populations = self.mesh_populations();

        let outer_range = self.group.divide_range(self.outer.num_points(), Scope::World);
        tracing::info!(
            points = outer_range.len(),
            calculations = num_calcs,
            "accumulating scattering rates"
        );
        let progress = self.progress_bar(outer_range.len() as u64);

        for p1 in outer_range {
            self.accumulate_source_point(engine, p1, &populations, &mut accumulator)?;
            progress.inc(1);
        }
        progress.finish_and_clear();

        // combine the per-process partial outputs
        match &mut accumulator {
            Accumulator::Build { matrix, diagonal } => {
                self.reduce_in_place(matrix)?;
                self.reduce_in_place(diagonal)?;
            }
            Accumulator::Apply { output, .. } => self.reduce_in_place(output)?,
            Accumulator::Diagonal { diagonal } => self.reduce_in_place(diagonal)?,
        }

        Ok(match accumulator {
            Accumulator::Build { matrix, diagonal } => RatesOutput::Build { matrix, diagonal },
            Accumulator::Apply { output, .. } => RatesOutput::Apply { output },
            Accumulator::Diagonal { diagonal } => RatesOutput::DiagonalOnly { diagonal },
        })
    }

    fn progress_bar(&self, length: u64) -> ProgressBar {
        if !self.group.is_head() {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .template(
                "{prefix:.bold.dim} {spinner} {msg} [{wide_bar:.cyan/blue}] {percent}% ({eta})",
            );
        let bar =
            ProgressBar::with_draw_target(length, ProgressDrawTarget::term(Term::stdout(), 60));
        bar.set_style(style);
        bar
    }

    fn mesh_populations(&self) -> Array2<f64> {
        let particle = self.inner.particle();
        let num_calcs = self.sweep.num_calculations();
        let mut populations = Array2::zeros((num_calcs, self.inner.num_states()));
        for (calc_index, calc) in self.sweep.iter().enumerate() {
            for point in 0..self.inner.num_points() {
                for band in 0..self.inner.num_bands() {
                    let state = self.inner.global_index(point, band);
                    populations[(calc_index, state)] = particle.population(
                        self.inner.energy(point, band),
                        calc.temperature,
                        calc.chemical_potential,
                    );
                }
            }
        }
        populations
    }

    /// Resolves the third state of a triplet: an on-grid lookup when the
    /// combined wavevector folds onto the inner mesh, otherwise a fresh
    /// diagonalization at the exact off-grid wavevector.
    fn resolve_third_state(
        &self,
        fractional: Vector3<f64>,
        cartesian: Vector3<f64>,
        populations: &Array2<f64>,
    ) -> ThirdState {
        let num_calcs = self.sweep.num_calculations();
        if let Some(p3) = self.inner.points().fold(fractional) {
            let bands = self.inner.num_bands();
            let mut pops = Array2::zeros((num_calcs, bands));
            for calc in 0..num_calcs {
                for band in 0..bands {
                    pops[(calc, band)] = populations[(calc, self.inner.global_index(p3, band))];
                }
            }
            ThirdState {
                energies: self.inner.energies_at(p3).to_owned(),
                eigenvectors: self.inner.eigenvectors_at(p3).to_owned(),
                velocities: (0..bands).map(|band| self.inner.velocity(p3, band)).collect(),
                populations: pops,
            }
        } else {
            let (energies, eigenvectors) = self.hamiltonian.diagonalize_at(cartesian);
            let particle = self.inner.particle();
            let bands = energies.len();
            let mut pops = Array2::zeros((num_calcs, bands));
            for (calc_index, calc) in self.sweep.iter().enumerate() {
                for band in 0..bands {
                    pops[(calc_index, band)] = particle.population(
                        energies[band],
                        calc.temperature,
                        calc.chemical_potential,
                    );
                }
            }
            ThirdState {
                energies,
                eigenvectors,
                velocities: vec![Vector3::zeros(); bands],
                populations: pops,
            }
        }
    }

    fn accumulate_source_point(
        &self,
        engine: &mut ElPhInteraction,
        p1: usize,
        populations: &Array2<f64>,
        accumulator: &mut Accumulator<'_>,
    ) -> Result<(), ScatteringError> {
        let quarter_pi = std::f64::consts::PI / 4.0;
        let bosonic = self.inner.particle() == crate::statistics::Particle::Boson;
        let num_calcs = self.sweep.num_calculations();
        let nb1 = self.outer.num_bands();
        let k1_frac = self.outer.points().fractional(p1);
        let k1 = self.outer.wavevector(p1);

        engine.cache_for_source(self.group, k1, self.outer.eigenvectors_at(p1))?;

        let n_inner_points = self.inner.num_points();
        let num_batches =
            engine.estimate_num_batches(n_inner_points, nb1, self.memory_budget)?;
        if num_batches > 1 {
            tracing::debug!(p1, num_batches, "destination loop is batched");
        }

        for batch_range in divide_into_batches(0..n_inner_points, num_batches) {
            let batch_points: Vec<usize> = batch_range.collect();

            // destination data for both processes of every pair: the decay
            // coupling is evaluated at the reversed inner point
            let mut plus = DestinationBatch {
                wavevectors: Vec::with_capacity(batch_points.len()),
                eigenvectors2: Vec::with_capacity(batch_points.len()),
                eigenvectors3: Vec::with_capacity(batch_points.len()),
                polar_data: None,
            };
            let mut minus = DestinationBatch {
                wavevectors: Vec::with_capacity(batch_points.len()),
                eigenvectors2: Vec::with_capacity(batch_points.len()),
                eigenvectors3: Vec::with_capacity(batch_points.len()),
                polar_data: None,
            };
            let mut thirds_plus = Vec::with_capacity(batch_points.len());
            let mut thirds_minus = Vec::with_capacity(batch_points.len());

            for &p2 in &batch_points {
                let p2_frac = self.inner.points().fractional(p2);
                let k2 = self.inner.wavevector(p2);
                let p2_reversed = self.inner.points().reversed(p2);

                let third_plus =
                    self.resolve_third_state(k1_frac + p2_frac, k1 + k2, populations);
                let third_minus =
                    self.resolve_third_state(k1_frac - p2_frac, k1 - k2, populations);

                plus.wavevectors.push(k1 + k2);
                plus.eigenvectors2
                    .push(self.inner.eigenvectors_at(p2_reversed).to_owned());
                plus.eigenvectors3.push(third_plus.eigenvectors.clone());

                minus.wavevectors.push(k1 - k2);
                minus
                    .eigenvectors2
                    .push(self.inner.eigenvectors_at(p2).to_owned());
                minus.eigenvectors3.push(third_minus.eigenvectors.clone());

                thirds_plus.push(third_plus);
                thirds_minus.push(third_minus);
            }

            let couplings_plus = engine.finalize_for_destination_batch(&plus)?;
            let couplings_minus = engine.finalize_for_destination_batch(&minus)?;
            drop(plus);
            drop(minus);

            for (local, &p2) in batch_points.iter().enumerate() {
                self.accumulate_pair(
                    p1,
                    p2,
                    &couplings_plus[local],
                    &couplings_minus[local],
                    &thirds_plus[local],
                    &thirds_minus[local],
                    populations,
                    accumulator,
                    quarter_pi,
                    bosonic,
                    num_calcs,
                )?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_pair(
        &self,
        p1: usize,
        p2: usize,
        coupling_plus: &ndarray::Array3<f64>,
        coupling_minus: &ndarray::Array3<f64>,
        third_plus: &ThirdState,
        third_minus: &ThirdState,
        populations: &Array2<f64>,
        accumulator: &mut Accumulator<'_>,
        quarter_pi: f64,
        bosonic: bool,
        num_calcs: usize,
    ) -> Result<(), ScatteringError> {
        let nb1 = self.outer.num_bands();
        let nb2 = self.inner.num_bands();
        let skip = |energy: f64| bosonic && energy < ENERGY_CUTOFF;

        for ib1 in 0..nb1 {
            let e1 = self.outer.energy(p1, ib1);
            if skip(e1) {
                continue;
            }
            let i1 = self.outer.global_index(p1, ib1);
            for ib2 in 0..nb2 {
                let e2 = self.inner.energy(p2, ib2);
                if skip(e2) {
                    continue;
                }
                let i2 = self.inner.global_index(p2, ib2);
                let v2 = self.inner.velocity(p2, ib2);

                // decay: the source state splits into the pair partners
                for (ib3, &e3) in third_plus.energies.iter().enumerate() {
                    if skip(e3) {
                        continue;
                    }
                    let context = DeltaContext {
                        inner_point: p2,
                        inner_band: ib2,
                        inner_energy: e2,
                        velocity2: v2,
                        velocity3: third_plus.velocities[ib3],
                    };
                    let Some(weight) = self.delta.weight(e1 - e2 - e3, &context) else {
                        continue;
                    };
                    let amplitude = coupling_plus[(ib1, ib2, ib3)];
                    for calc in 0..num_calcs {
                        let n1 = populations[(calc, i1)];
                        let n2 = populations[(calc, i2)];
                        let n3 = third_plus.populations[(calc, ib3)];
                        let rate_decay_out = quarter_pi * n3 * n1 * (n2 + 1.0) * amplitude * weight;
                        let rate_decay_in = quarter_pi * n2 * n3 * (n1 + 1.0) * amplitude * weight;
                        accumulator.push(calc, i1, i2, -(rate_decay_out + rate_decay_in));
                    }
                }

                // coalescence: the source state merges with the inner state
                for (ib3, &e3) in third_minus.energies.iter().enumerate() {
                    if skip(e3) {
                        continue;
                    }
                    let context = DeltaContext {
                        inner_point: p2,
                        inner_band: ib2,
                        inner_energy: e2,
                        velocity2: v2,
                        velocity3: third_minus.velocities[ib3],
                    };
                    let Some(weight) = self.delta.weight(e1 + e2 - e3, &context) else {
                        continue;
                    };
                    let amplitude = coupling_minus[(ib1, ib2, ib3)];
                    for calc in 0..num_calcs {
                        let n1 = populations[(calc, i1)];
                        let n2 = populations[(calc, i2)];
                        let n3 = third_minus.populations[(calc, ib3)];
                        let rate = quarter_pi * n1 * n2 * (n3 + 1.0) * amplitude * weight;
                        accumulator.push(calc, i1, i2, rate);
                    }
                }
            }
        }
        Ok(())
    }

    fn reduce_in_place(&self, buffer: &mut Array2<f64>) -> Result<(), ScatteringError> {
        let slice = buffer
            .as_slice_mut()
            .expect("output buffers are contiguous");
        self.group.all_reduce_sum(slice, Scope::World)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Request, RatesOutput, ScatteringRatesBuilder};
    use crate::delta::Smearing;
    use crate::interaction::ElPhInteraction;
    use crate::parallel::ProcessGroup;
    use crate::statistics::StatisticsSweep;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use crate::fixtures::{
        phonon_band_structure, two_atom_crystal, uniform_coupling, FixedHamiltonian,
    };

    const SMEARING: Smearing = Smearing::Gaussian { width: 0.02 };

    fn engine() -> (ProcessGroup, ElPhInteraction) {
        let group = ProcessGroup::serial();
        let (crystal, _) = two_atom_crystal();
        let (coupling, el_vectors, el_deg, ph_vectors, ph_deg) =
            uniform_coupling([2, 2, 2], 3, 3, 1.0);
        let engine = ElPhInteraction::new(
            &group, crystal, None, coupling, el_vectors, el_deg, ph_vectors, ph_deg,
        )
        .unwrap();
        (group, engine)
    }

    #[test]
    fn apply_mode_reconstructs_the_built_matrix() {
        let (group, mut engine) = engine();
        let bands = phonon_band_structure([2, 2, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.025]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let built = rates.compute(&mut engine, Request::Build).unwrap();
        let RatesOutput::Build { matrix, diagonal } = built else {
            panic!("build request must produce the matrix output");
        };
        assert!(matrix.iter().any(|&v| v != 0.0), "no rates accumulated");

        // applying the unmaterialized matrix to each basis vector must
        // reproduce the corresponding matrix column
        let n = bands.num_states();
        for j in 0..n {
            let mut basis = Array2::zeros((1, n));
            basis[(0, j)] = 1.0;
            let applied = rates
                .compute(&mut engine, Request::Apply { input: &basis })
                .unwrap();
            let RatesOutput::Apply { output } = applied else {
                panic!("apply request must produce the applied output");
            };
            for i in 0..n {
                assert_relative_eq!(output[(0, i)], matrix[(i, j)], max_relative = 1e-10);
            }
        }

        // and the build-mode diagonal is the matrix row sum
        for i in 0..n {
            let row_sum: f64 = matrix.row(i).sum();
            assert_relative_eq!(diagonal[(0, i)], row_sum, max_relative = 1e-10);
        }
    }

    #[test]
    fn diagonal_only_matches_the_matrix_row_sums() {
        let (group, mut engine) = engine();
        let bands = phonon_band_structure([2, 2, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.025]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let RatesOutput::Build { matrix, .. } =
            rates.compute(&mut engine, Request::Build).unwrap()
        else {
            panic!("build request must produce the matrix output");
        };
        let RatesOutput::DiagonalOnly { diagonal } =
            rates.compute(&mut engine, Request::DiagonalOnly).unwrap()
        else {
            panic!("diagonal request must produce the diagonal output");
        };
        for i in 0..bands.num_states() {
            assert_relative_eq!(
                diagonal[(0, i)],
                matrix.row(i).sum(),
                max_relative = 1e-10
            );
        }
    }

    #[test]
    fn apply_contracts_an_arbitrary_population() {
        let (group, mut engine) = engine();
        let bands = phonon_band_structure([2, 1, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.025]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let RatesOutput::Build { matrix, .. } =
            rates.compute(&mut engine, Request::Build).unwrap()
        else {
            panic!("build request must produce the matrix output");
        };

        let n = bands.num_states();
        let input = crate::fixtures::random_population(1, n, 7);
        let RatesOutput::Apply { output } = rates
            .compute(&mut engine, Request::Apply { input: &input })
            .unwrap()
        else {
            panic!("apply request must produce the applied output");
        };
        for i in 0..n {
            let expected: f64 = (0..n).map(|j| matrix[(i, j)] * input[(0, j)]).sum();
            assert_relative_eq!(output[(0, i)], expected, max_relative = 1e-10);
        }
    }

    #[test]
    fn fixed_coupling_runs_without_touching_the_cache() {
        let group = ProcessGroup::serial();
        let (crystal, _) = two_atom_crystal();
        let mut engine = ElPhInteraction::with_fixed_coupling(crystal, 2.0, 3, 3);
        let bands = phonon_band_structure([2, 1, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.025]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let RatesOutput::DiagonalOnly { diagonal } =
            rates.compute(&mut engine, Request::DiagonalOnly).unwrap()
        else {
            panic!("diagonal request must produce the diagonal output");
        };
        assert!(!engine.has_cached_source());
        assert!(diagonal.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn malformed_call_shapes_are_rejected_before_iteration() {
        let (group, mut engine) = engine();
        let bands = phonon_band_structure([2, 1, 1], 3);
        let h0 = FixedHamiltonian::new(3);

        // matrix construction resolves a single calculation
        let sweep = StatisticsSweep::for_temperatures(&[0.02, 0.03]);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();
        assert!(rates.compute(&mut engine, Request::Build).is_err());

        // the input population must match (calculations, states)
        let input = Array2::zeros((1, bands.num_states()));
        assert!(rates
            .compute(&mut engine, Request::Apply { input: &input })
            .is_err());

        // mixed grids only support the diagonal
        let other = phonon_band_structure([2, 2, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.02]);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&other, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();
        assert!(rates.compute(&mut engine, Request::Build).is_err());
        let input = Array2::zeros((1, bands.num_states()));
        assert!(rates
            .compute(&mut engine, Request::Apply { input: &input })
            .is_err());
    }

    #[test]
    fn off_grid_third_states_are_rediagonalized() {
        // a finer outer path mesh pushes p1 +/- p2 off the inner grid, so
        // the third state must come from the Hamiltonian callback
        let (group, mut engine) = engine();
        let outer = phonon_band_structure([4, 1, 1], 3);
        let inner = phonon_band_structure([2, 1, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.025]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&outer, &inner)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let RatesOutput::DiagonalOnly { diagonal } =
            rates.compute(&mut engine, Request::DiagonalOnly).unwrap()
        else {
            panic!("diagonal request must produce the diagonal output");
        };
        assert!(h0.calls() > 0, "the off-grid path never fired");
        assert_eq!(diagonal.dim(), (1, outer.num_states()));
    }

    #[test]
    fn temperature_sweep_fills_every_calculation_row() {
        let (group, mut engine) = engine();
        let bands = phonon_band_structure([2, 1, 1], 3);
        let sweep = StatisticsSweep::for_temperatures(&[0.02, 0.04]);
        let h0 = FixedHamiltonian::new(3);
        let rates = ScatteringRatesBuilder::new()
            .with_process_group(&group)
            .with_statistics_sweep(&sweep)
            .with_band_structures(&bands, &bands)
            .with_hamiltonian(&h0)
            .with_smearing(SMEARING)
            .build()
            .unwrap();

        let RatesOutput::DiagonalOnly { diagonal } =
            rates.compute(&mut engine, Request::DiagonalOnly).unwrap()
        else {
            panic!("diagonal request must produce the diagonal output");
        };
        assert_eq!(diagonal.dim(), (2, bands.num_states()));
        for calc in 0..2 {
            assert!(diagonal.row(calc).iter().any(|&v| v != 0.0));
        }
        // hotter calculations scatter more
        let cold: f64 = diagonal.row(0).iter().map(|v| v.abs()).sum();
        let hot: f64 = diagonal.row(1).iter().map(|v| v.abs()).sum();
        assert!(hot > cold);
    }
}
